pub mod accumulator;
pub mod colormap;
pub mod frame;
pub mod morphology;
pub mod motion_segmenter;

// THEORY:
// Palette lookup for the accumulated motion image. A colormap is a pure function
// from an 8-bit intensity to a display colour, so it is precomputed once into a
// 256-entry table and applied per pixel. It never looks at frame content and has
// no state, which keeps `Accumulator::colorize` free of side effects.

pub mod colormap {
    use crate::settings::ColorMap;
    use image::{GrayImage, Rgb, RgbImage};

    pub type Palette = [Rgb<u8>; 256];

    /// Builds the lookup table for `map`.
    pub fn palette(map: ColorMap) -> Palette {
        let mut table = [Rgb([0, 0, 0]); 256];
        for (value, entry) in table.iter_mut().enumerate() {
            *entry = match map {
                ColorMap::Hot => hot(value as u8),
            };
        }
        table
    }

    /// Black to red over the first 3/8, red to yellow over the next 3/8, then
    /// yellow to white.
    pub fn hot(value: u8) -> Rgb<u8> {
        let t = value as f32 / 255.0;
        let ramp = |start: f32, width: f32| {
            (((t - start) / width).clamp(0.0, 1.0) * 255.0).round() as u8
        };
        Rgb([ramp(0.0, 0.375), ramp(0.375, 0.375), ramp(0.75, 0.25)])
    }

    /// Maps every pixel of `gray` through the palette.
    pub fn apply(map: ColorMap, gray: &GrayImage) -> RgbImage {
        let table = palette(map);
        let (width, height) = gray.dimensions();
        let mut out = RgbImage::new(width, height);
        for (dst, src) in out.pixels_mut().zip(gray.pixels()) {
            *dst = table[src[0] as usize];
        }
        out
    }
}

// THEORY:
// Morphological clean-up for foreground masks. Background subtraction produces
// salt-and-pepper noise: single pixels that flicker across the threshold because
// of sensor noise or compression artefacts. Erosion replaces every pixel with the
// minimum of its 3x3 neighbourhood, so any foreground region narrower than three
// pixels disappears after one pass, while larger regions shrink by one pixel per
// pass. Trading sensitivity for stability this way is a user choice
// (`erode_iterations`), and zero passes leaves the mask untouched.
//
// This is a stateless utility, like the other mask helpers: it takes a mask and
// returns a new one.

pub mod morphology {
    use image::GrayImage;
    use imageproc::morphology::{Mask, grayscale_erode};

    /// Applies `iterations` passes of 3x3 erosion to `mask`.
    ///
    /// Only neighbours inside the image are considered, so the image border does
    /// not erode on its own. The mask is treated as grayscale: each pixel takes
    /// the minimum of its neighbourhood, so shadow and heat levels survive.
    pub fn erode(mask: &GrayImage, iterations: u32) -> GrayImage {
        let kernel = Mask::square(1);
        let mut current = mask.clone();
        for _ in 0..iterations {
            current = grayscale_erode(&current, &kernel);
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::morphology::*;
    use image::{GrayImage, Luma};

    fn block(size: u32, x0: u32, y0: u32, side: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            let inside = (x0..x0 + side).contains(&x) && (y0..y0 + side).contains(&y);
            Luma([if inside { 255 } else { 0 }])
        })
    }

    #[test]
    fn isolated_pixel_is_removed() {
        let mut mask = GrayImage::new(7, 7);
        mask.put_pixel(3, 3, Luma([255]));
        let eroded = erode(&mask, 2);
        assert!(eroded.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn solid_block_shrinks_by_one_pixel_per_pass() {
        let mask = block(9, 2, 2, 5);
        let once = erode(&mask, 1);
        let survivors: Vec<(u32, u32)> = once
            .enumerate_pixels()
            .filter(|(_, _, p)| p[0] == 255)
            .map(|(x, y, _)| (x, y))
            .collect();
        assert_eq!(survivors.len(), 9);
        assert!(survivors.iter().all(|&(x, y)| (3..=5).contains(&x) && (3..=5).contains(&y)));

        let twice = erode(&mask, 2);
        assert_eq!(twice.pixels().filter(|p| p[0] == 255).count(), 1);
        assert_eq!(twice.get_pixel(4, 4)[0], 255);
    }

    #[test]
    fn zero_iterations_is_identity() {
        let mask = block(5, 1, 1, 2);
        assert_eq!(erode(&mask, 0), mask);
    }

    #[test]
    fn grey_levels_take_the_neighbourhood_minimum() {
        let mut mask = GrayImage::from_pixel(5, 5, Luma([200]));
        mask.put_pixel(0, 0, Luma([127]));
        let eroded = erode(&mask, 1);
        assert_eq!(eroded.get_pixel(1, 1)[0], 127);
        assert_eq!(eroded.get_pixel(2, 2)[0], 200);
        assert_eq!(eroded.get_pixel(4, 4)[0], 200);
    }

    #[test]
    fn full_mask_survives_at_the_border() {
        let mask = GrayImage::from_pixel(4, 3, Luma([255]));
        assert_eq!(erode(&mask, 3), mask);
    }
}

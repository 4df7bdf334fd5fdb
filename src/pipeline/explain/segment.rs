//! Image segmentation into superpixels and boundary marking.

use image::{Rgb, RgbImage};

/// Boundary colour drawn around highlighted regions.
pub const BOUNDARY_COLOR: Rgb<u8> = Rgb([255, 255, 0]);

/// Segment label per pixel, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    width: u32,
    height: u32,
    labels: Vec<usize>,
    count: usize,
}

impl Segmentation {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn label_at(&self, x: u32, y: u32) -> usize {
        self.labels[(y * self.width + x) as usize]
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Copy of `base` with every pixel of an inactive segment set to `hide`.
    pub fn perturb(&self, base: &RgbImage, active: &[bool], hide: Rgb<u8>) -> RgbImage {
        let mut out = base.clone();
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            if !active[self.label_at(x, y)] {
                *pixel = hide;
            }
        }
        out
    }

    /// Outline the union of `selected` segments on a copy of `base`.
    ///
    /// A pixel is marked when it and one of its 4-neighbours fall on opposite
    /// sides of the mask.
    pub fn mark_boundaries(&self, base: &RgbImage, selected: &[usize]) -> RgbImage {
        let mut in_mask = vec![false; self.count];
        for &s in selected {
            if let Some(flag) = in_mask.get_mut(s) {
                *flag = true;
            }
        }
        let inside = |x: u32, y: u32| in_mask[self.label_at(x, y)];

        let mut out = base.clone();
        for y in 0..self.height {
            for x in 0..self.width {
                let here = inside(x, y);
                let differs = (x > 0 && inside(x - 1, y) != here)
                    || (x + 1 < self.width && inside(x + 1, y) != here)
                    || (y > 0 && inside(x, y - 1) != here)
                    || (y + 1 < self.height && inside(x, y + 1) != here);
                if differs {
                    out.put_pixel(x, y, BOUNDARY_COLOR);
                }
            }
        }
        out
    }
}

/// Splits the image into a regular `cells × cells` grid.
#[derive(Debug, Clone, Copy)]
pub struct GridSegmenter {
    cells: u32,
}

impl Default for GridSegmenter {
    fn default() -> Self {
        Self { cells: 8 }
    }
}

impl GridSegmenter {
    pub fn new(cells: u32) -> Self {
        Self {
            cells: cells.max(1),
        }
    }

    pub fn segment(&self, image: &RgbImage) -> Segmentation {
        let (width, height) = image.dimensions();
        let cols = self.cells.min(width.max(1));
        let rows = self.cells.min(height.max(1));

        let mut labels = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            let row = y * rows / height;
            for x in 0..width {
                let col = x * cols / width;
                labels.push((row * cols + col) as usize);
            }
        }

        Segmentation {
            width,
            height,
            labels,
            count: (rows * cols) as usize,
        }
    }
}

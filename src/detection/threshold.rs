//! Local-mean adaptive thresholding.

use image::GrayImage;

/// Binary mask, row-major, `true` where the pixel is darker than its
/// surroundings.
#[derive(Debug, Clone)]
pub struct DarkMask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<bool>,
}

impl DarkMask {
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> bool {
        self.data[(y * self.width + x) as usize]
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&d| d).count()
    }
}

/// Summed-area table with a zero row and column prepended.
struct IntegralImage {
    stride: usize,
    sums: Vec<u64>,
}

impl IntegralImage {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sums = vec![0u64; stride * (h + 1)];
        let raw = image.as_raw();
        for y in 0..h {
            let mut row = 0u64;
            for x in 0..w {
                row += raw[y * w + x] as u64;
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Self { stride, sums }
    }

    /// Sum over the inclusive rectangle `[x0, x1] x [y0, y1]`.
    fn sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> u64 {
        let s = self.stride;
        self.sums[(y1 + 1) * s + x1 + 1] + self.sums[y0 * s + x0]
            - self.sums[y0 * s + x1 + 1]
            - self.sums[(y1 + 1) * s + x0]
    }
}

/// Mark pixels more than `offset` gray levels below the mean of the
/// `(2 * radius + 1)^2` window around them.
pub fn adaptive_threshold(image: &GrayImage, radius: u32, offset: u8) -> DarkMask {
    let (width, height) = image.dimensions();
    let integral = IntegralImage::new(image);
    let r = radius as usize;
    let (w, h) = (width as usize, height as usize);
    let raw = image.as_raw();
    let mut data = vec![false; w * h];

    for y in 0..h {
        let y0 = y.saturating_sub(r);
        let y1 = (y + r).min(h.saturating_sub(1));
        for x in 0..w {
            let x0 = x.saturating_sub(r);
            let x1 = (x + r).min(w.saturating_sub(1));
            let area = ((x1 - x0 + 1) * (y1 - y0 + 1)) as u64;
            let sum = integral.sum(x0, y0, x1, y1);
            let pixel = raw[y * w + x] as u64;
            // pixel < mean - offset, in integer arithmetic
            data[y * w + x] = (pixel + offset as u64) * area < sum;
        }
    }

    DarkMask {
        width,
        height,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_uniform_image_has_no_dark_pixels() {
        let img = GrayImage::from_pixel(20, 20, Luma([128]));
        assert_eq!(adaptive_threshold(&img, 5, 7).count(), 0);
    }

    #[test]
    fn test_dark_square_on_white() {
        let img = GrayImage::from_fn(40, 40, |x, y| {
            if (15..25).contains(&x) && (15..25).contains(&y) {
                Luma([20])
            } else {
                Luma([230])
            }
        });
        let mask = adaptive_threshold(&img, 15, 7);
        assert!(mask.get(20, 20));
        assert!(mask.get(15, 15));
        assert!(!mask.get(5, 5));
        assert!(!mask.get(14, 20));
    }

    #[test]
    fn test_integral_sum() {
        let img = GrayImage::from_fn(4, 3, |x, y| Luma([(x + 4 * y) as u8]));
        let ii = IntegralImage::new(&img);
        assert_eq!(ii.sum(0, 0, 3, 2), (0..12).sum::<u64>());
        assert_eq!(ii.sum(1, 1, 2, 2), 5 + 6 + 9 + 10);
    }
}

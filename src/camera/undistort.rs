//! Precomputed undistortion remap for whole frames.

use super::model::CameraModel;
use crate::error::DetectionError;
use image::{GrayImage, Luma};
use nalgebra::Point2;

/// Bilinear sample with clamp-to-edge addressing.
pub fn sample_bilinear(image: &GrayImage, x: f64, y: f64) -> f64 {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }
    let x = x.clamp(0.0, (w - 1) as f64);
    let y = y.clamp(0.0, (h - 1) as f64);
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p = |xx: u32, yy: u32| image.get_pixel(xx, yy)[0] as f64;
    let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
    let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// For every pixel of the undistorted output, the location in the raw frame
/// it is sampled from.
#[derive(Debug, Clone)]
pub struct UndistortMap {
    width: u32,
    height: u32,
    source: Vec<[f32; 2]>,
    identity: bool,
}

impl UndistortMap {
    pub fn new(model: &CameraModel) -> Self {
        let (width, height) = model.image_size();
        let identity = model.distortion().is_zero();
        let mut source = Vec::with_capacity(if identity { 0 } else { (width * height) as usize });
        if !identity {
            for y in 0..height {
                for x in 0..width {
                    let d = model.distort(&Point2::new(x as f64, y as f64));
                    source.push([d.x as f32, d.y as f32]);
                }
            }
        }
        Self {
            width,
            height,
            source,
            identity,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Produce the undistorted frame.
    pub fn remap(&self, raw: &GrayImage) -> Result<GrayImage, DetectionError> {
        if raw.dimensions() != (self.width, self.height) {
            return Err(DetectionError::InvalidFrame(format!(
                "frame is {}x{}, undistort map expects {}x{}",
                raw.width(),
                raw.height(),
                self.width,
                self.height
            )));
        }
        if self.identity {
            return Ok(raw.clone());
        }
        let mut out = GrayImage::new(self.width, self.height);
        for (i, [sx, sy]) in self.source.iter().enumerate() {
            let x = i as u32 % self.width;
            let y = i as u32 / self.width;
            let v = sample_bilinear(raw, *sx as f64, *sy as f64);
            out.put_pixel(x, y, Luma([v.round().clamp(0.0, 255.0) as u8]));
        }
        Ok(out)
    }
}

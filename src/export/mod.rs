//! Export module for calibration data.

use crate::camera::{CameraModel, Frame, UndistortMap};
use crate::detection::Detection;
use crate::error::PersistenceError;
use crate::store::CalibrationBundle;
use image::{GrayImage, Luma};
use std::path::Path;

/// Export calibration data to user-chosen locations.
pub struct CalibrationExporter;

impl CalibrationExporter {
    /// Export a calibration bundle to JSON.
    pub fn export_json(bundle: &CalibrationBundle, path: &Path) -> Result<(), PersistenceError> {
        std::fs::write(path, bundle.to_json()?)?;
        log::info!("Exported calibration bundle: {}", path.display());
        Ok(())
    }

    /// Import a bundle exported with [`CalibrationExporter::export_json`].
    pub fn import_json(path: &Path) -> Result<CalibrationBundle, PersistenceError> {
        let json = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        CalibrationBundle::from_json(&json)
    }

    /// Export a frame after lens undistortion as 8-bit grayscale PNG image,
    /// for checking a camera calibration by eye.
    pub fn export_rectified_frame(
        camera: &CameraModel,
        frame: &Frame,
        path: &Path,
    ) -> std::io::Result<()> {
        let raw = frame
            .to_luma()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let rectified = UndistortMap::new(camera)
            .remap(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        rectified
            .save(path)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    /// Export an image with detected marker outlines drawn in black over a
    /// dimmed copy of `image`.
    pub fn export_detections(
        image: &GrayImage,
        detections: &[Detection],
        path: &Path,
    ) -> std::io::Result<()> {
        let mut out = GrayImage::from_fn(image.width(), image.height(), |x, y| {
            Luma([128 + image.get_pixel(x, y)[0] / 2])
        });
        for detection in detections {
            let points = &detection.corners().points;
            for i in 0..4 {
                draw_line(&mut out, points[i].x, points[i].y, points[(i + 1) % 4].x, points[(i + 1) % 4].y);
            }
        }

        out.save(path)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

fn draw_line(image: &mut GrayImage, x0: f64, y0: f64, x1: f64, y1: f64) {
    let steps = (x1 - x0).abs().max((y1 - y0).abs()).ceil().max(1.0) as usize;
    for s in 0..=steps {
        let t = s as f64 / steps as f64;
        let x = (x0 + (x1 - x0) * t).round();
        let y = (y0 + (y1 - y0) * t).round();
        if x >= 0.0 && y >= 0.0 && (x as u32) < image.width() && (y as u32) < image.height() {
            image.put_pixel(x as u32, y as u32, Luma([0]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::MarkerDetector;
    use crate::test_utils::{render_markers, sample_bundle, MarkerPlacement};

    #[test]
    fn test_export_import_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exported.json");
        let bundle = sample_bundle();
        CalibrationExporter::export_json(&bundle, &path).unwrap();
        assert_eq!(CalibrationExporter::import_json(&path).unwrap(), bundle);
    }

    #[test]
    fn test_import_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CalibrationExporter::import_json(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }

    #[test]
    fn test_export_rectified_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rectified.png");
        let bundle = sample_bundle();
        let (w, h) = bundle.camera().image_size();
        let frame = Frame::from_gray(GrayImage::from_pixel(w, h, Luma([90])));
        CalibrationExporter::export_rectified_frame(bundle.camera(), &frame, &path).unwrap();
        let back = image::open(&path).unwrap().to_luma8();
        assert_eq!(back.dimensions(), (w, h));
        assert_eq!(back.get_pixel(w / 2, h / 2)[0], 90);
    }

    #[test]
    fn test_export_detections_outlines_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detections.png");
        let img = render_markers(200, 160, &[MarkerPlacement::axis_aligned(9, 50.0, 40.0, 64.0)]);
        let detections = MarkerDetector::default().detect(&img);
        assert_eq!(detections.len(), 1);
        CalibrationExporter::export_detections(&img, &detections, &path).unwrap();
        let back = image::open(&path).unwrap().to_luma8();
        let corner = detections[0].corners().points[0];
        assert_eq!(back.get_pixel(corner.x.round() as u32, corner.y.round() as u32)[0], 0);
        // Background is dimmed, never black.
        assert!(back.get_pixel(5, 5)[0] >= 128);
    }
}

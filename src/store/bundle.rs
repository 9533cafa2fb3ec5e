//! The persisted calibration aggregate and its on-disk record.

use crate::calibration::Homography;
use crate::camera::{CameraModel, Distortion, Intrinsics};
use crate::error::{ConfigurationError, PersistenceError};
use crate::geometry::Pixel;
use crate::table::TableFrame;
use nalgebra::{Isometry3, Point2, Quaternion, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};

/// Current on-disk format.
pub const FORMAT_VERSION: u32 = 1;

/// Camera model located on the table, table-to-projector homography and
/// table frame. Always complete: the camera carries its table pose.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationBundle {
    camera: CameraModel,
    homography: Homography,
    table: TableFrame,
}

impl CalibrationBundle {
    pub fn new(
        camera: CameraModel,
        homography: Homography,
        table: TableFrame,
    ) -> Result<Self, ConfigurationError> {
        camera.require_extrinsics()?;
        Ok(Self {
            camera,
            homography,
            table,
        })
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    pub fn homography(&self) -> &Homography {
        &self.homography
    }

    pub fn table(&self) -> &TableFrame {
        &self.table
    }

    /// Table coordinates (mm) to projector pixels.
    pub fn table_to_projector(&self, table: &Point2<f64>) -> Option<Pixel> {
        self.homography.apply(table)
    }

    /// Projector pixels back to table coordinates.
    pub fn projector_to_table(&self, pixel: &Pixel) -> Option<Point2<f64>> {
        self.homography.apply_inverse(pixel)
    }

    pub fn to_json(&self) -> Result<String, PersistenceError> {
        Ok(serde_json::to_string_pretty(&BundleRecord::from(self))?)
    }

    /// Parse and validate a bundle. Anything structurally wrong is
    /// `CorruptBundle`; a partially valid bundle is never returned.
    pub fn from_json(json: &str) -> Result<Self, PersistenceError> {
        let record: BundleRecord = serde_json::from_str(json)
            .map_err(|e| PersistenceError::CorruptBundle(e.to_string()))?;
        record.into_bundle()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PoseRecord {
    /// Unit quaternion as `[i, j, k, w]`.
    rotation: [f64; 4],
    translation: [f64; 3],
}

#[derive(Debug, Serialize, Deserialize)]
struct CameraRecord {
    image_width: u32,
    image_height: u32,
    /// `[fx, fy, cx, cy]`
    intrinsics: [f64; 4],
    /// `[k1, k2, p1, p2, k3]`
    distortion: [f64; 5],
    /// Table-to-camera pose.
    extrinsics: PoseRecord,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableRecord {
    width_mm: f64,
    height_mm: f64,
    origin_mm: [f64; 2],
}

#[derive(Debug, Serialize, Deserialize)]
struct BundleRecord {
    format_version: u32,
    camera: CameraRecord,
    /// Table-to-projector homography, row-major.
    homography: [f64; 9],
    table: TableRecord,
}

impl From<&CalibrationBundle> for BundleRecord {
    fn from(bundle: &CalibrationBundle) -> Self {
        let camera = &bundle.camera;
        let (image_width, image_height) = camera.image_size();
        // Bundles are only constructed with extrinsics.
        let pose = camera.extrinsics().copied().unwrap_or_else(Isometry3::identity);
        let q = pose.rotation.quaternion().coords;
        let t = pose.translation.vector;
        let origin = bundle.table.origin();
        Self {
            format_version: FORMAT_VERSION,
            camera: CameraRecord {
                image_width,
                image_height,
                intrinsics: camera.intrinsics().to_array(),
                distortion: camera.distortion().to_array(),
                extrinsics: PoseRecord {
                    rotation: [q.x, q.y, q.z, q.w],
                    translation: [t.x, t.y, t.z],
                },
            },
            homography: bundle.homography.to_row_major(),
            table: TableRecord {
                width_mm: bundle.table.width(),
                height_mm: bundle.table.height(),
                origin_mm: [origin.x, origin.y],
            },
        }
    }
}

fn corrupt(what: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::CorruptBundle(what.to_string())
}

impl BundleRecord {
    fn into_bundle(self) -> Result<CalibrationBundle, PersistenceError> {
        if self.format_version != FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }

        let c = self.camera;
        let [i, j, k, w] = c.extrinsics.rotation;
        let norm = (i * i + j * j + k * k + w * w).sqrt();
        if !norm.is_finite() || (norm - 1.0).abs() > 1e-6 {
            return Err(corrupt(format!("rotation quaternion has norm {}", norm)));
        }
        let [tx, ty, tz] = c.extrinsics.translation;
        if ![tx, ty, tz].iter().all(|v| v.is_finite()) {
            return Err(corrupt("non-finite camera translation"));
        }
        // Stored values are kept bit-for-bit; the norm was checked above.
        let rotation = UnitQuaternion::new_unchecked(Quaternion::new(w, i, j, k));
        let pose = Isometry3::from_parts(Translation3::new(tx, ty, tz), rotation);

        let camera = CameraModel::new(
            Intrinsics::from_array(c.intrinsics),
            Distortion::from_array(c.distortion),
            c.image_width,
            c.image_height,
        )
        .map_err(corrupt)?
        .with_extrinsics(pose);

        let homography = Homography::from_row_major(self.homography).map_err(corrupt)?;
        let table = TableFrame::with_origin(
            self.table.width_mm,
            self.table.height_mm,
            Point2::new(self.table.origin_mm[0], self.table.origin_mm[1]),
        )
        .map_err(corrupt)?;

        CalibrationBundle::new(camera, homography, table).map_err(corrupt)
    }
}

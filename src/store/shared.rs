//! Versioned, atomically replaced calibration shared between the tracking
//! loop and the control surface.

use super::bundle::CalibrationBundle;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Default)]
struct Slot {
    version: u64,
    bundle: Option<Arc<CalibrationBundle>>,
}

/// Readers take a snapshot (an `Arc` to a whole bundle) and never see a
/// partially replaced calibration.
#[derive(Clone, Default)]
pub struct SharedCalibration {
    inner: Arc<RwLock<Slot>>,
}

impl SharedCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bundle(bundle: CalibrationBundle) -> Self {
        let shared = Self::new();
        shared.replace(bundle);
        shared
    }

    /// Install a new bundle. Returns the new version.
    pub fn replace(&self, bundle: CalibrationBundle) -> u64 {
        let mut slot = self.inner.write();
        slot.version += 1;
        slot.bundle = Some(Arc::new(bundle));
        log::info!("Calibration bundle installed (version {})", slot.version);
        slot.version
    }

    /// Drop the current bundle. Returns the new version.
    pub fn clear(&self) -> u64 {
        let mut slot = self.inner.write();
        slot.version += 1;
        slot.bundle = None;
        slot.version
    }

    pub fn snapshot(&self) -> Option<Arc<CalibrationBundle>> {
        self.inner.read().bundle.clone()
    }

    /// Snapshot together with the version it belongs to.
    pub fn versioned_snapshot(&self) -> (u64, Option<Arc<CalibrationBundle>>) {
        let slot = self.inner.read();
        (slot.version, slot.bundle.clone())
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    pub fn is_calibrated(&self) -> bool {
        self.inner.read().bundle.is_some()
    }
}

impl std::fmt::Debug for SharedCalibration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.inner.read();
        f.debug_struct("SharedCalibration")
            .field("version", &slot.version)
            .field("calibrated", &slot.bundle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{overhead_bundle, sample_bundle};

    #[test]
    fn test_versions_advance() {
        let shared = SharedCalibration::new();
        assert_eq!(shared.version(), 0);
        assert!(shared.snapshot().is_none());
        assert_eq!(shared.replace(sample_bundle()), 1);
        assert!(shared.is_calibrated());
        assert_eq!(shared.clear(), 2);
        assert!(!shared.is_calibrated());
    }

    #[test]
    fn test_snapshot_survives_replacement() {
        let shared = SharedCalibration::with_bundle(sample_bundle());
        let before = shared.snapshot().unwrap();
        shared.replace(overhead_bundle());
        let after = shared.snapshot().unwrap();
        assert_eq!(*before, sample_bundle());
        assert_eq!(*after, overhead_bundle());
    }

    #[test]
    fn test_readers_see_whole_bundles() {
        let shared = SharedCalibration::with_bundle(sample_bundle());
        let a = sample_bundle();
        let b = overhead_bundle();
        let reader = {
            let shared = shared.clone();
            let (a, b) = (a.clone(), b.clone());
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    let snap = shared.snapshot().unwrap();
                    assert!(*snap == a || *snap == b);
                }
            })
        };
        for i in 0..200 {
            shared.replace(if i % 2 == 0 { b.clone() } else { a.clone() });
        }
        reader.join().unwrap();
    }
}

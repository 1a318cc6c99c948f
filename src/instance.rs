//! Placements of a [`Geometry`] inside a [`Scene`](crate::Scene)

use crate::geometry::Geometry;
use crate::math::Affine3A;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Anything a scene can place: a geometry plus a transform and an enabled flag.
///
/// Scenes read all three on every commit, so implementations may change them between
/// commits. Instances are shared with the scene through `Arc`, which also hands the
/// same object back in query results.
pub trait Instance: Send + Sync {
    fn geometry(&self) -> &Arc<Geometry>;

    fn enabled(&self) -> bool {
        true
    }

    /// Object-to-world transform.
    fn transform(&self) -> Affine3A {
        Affine3A::IDENTITY
    }
}

/// Ready-made [`Instance`] with a movable transform and a visibility toggle.
#[derive(Debug)]
pub struct GeometryInstance {
    geometry: Arc<Geometry>,
    transform: Mutex<Affine3A>,
    enabled: AtomicBool,
}

impl GeometryInstance {
    pub fn new(geometry: Arc<Geometry>) -> Self {
        Self::with_transform(geometry, Affine3A::IDENTITY)
    }

    pub fn with_transform(geometry: Arc<Geometry>, transform: Affine3A) -> Self {
        Self {
            geometry,
            transform: Mutex::new(transform),
            enabled: AtomicBool::new(true),
        }
    }

    /// Takes effect on the next scene commit.
    pub fn set_transform(&self, transform: Affine3A) {
        *self.transform.lock() = transform;
    }

    /// Takes effect on the next scene commit.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

impl Instance for GeometryInstance {
    fn geometry(&self) -> &Arc<Geometry> {
        &self.geometry
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn transform(&self) -> Affine3A {
        *self.transform.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SceneDesc;
    use crate::device::Device;
    use crate::math::Vec3;

    #[test]
    fn test_instance_state() {
        let device = Device::create(false).unwrap();
        let geometry = Arc::new(Geometry::new(&device, SceneDesc::default()).unwrap());
        let instance = GeometryInstance::new(geometry.clone());
        assert!(instance.enabled());
        assert_eq!(instance.transform(), Affine3A::IDENTITY);
        assert!(Arc::ptr_eq(instance.geometry(), &geometry));

        let moved = Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0));
        instance.set_transform(moved);
        instance.set_enabled(false);
        assert_eq!(instance.transform(), moved);
        assert!(!instance.enabled());
    }
}

// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Camera pose and projection resolution for video frames.
//!
//! [`SpatialTransformResolver`] turns the spatial metadata a capture device
//! attaches to each frame into a camera-to-world matrix and a projection
//! matrix expressed in an application-chosen coordinate system.
//!
//! ## Strategies
//!
//! Two mutually exclusive calibration sources exist. The resolver picks one
//! when it is created and keeps it for its whole lifetime:
//!
//! - **Legacy**: the sample carries a view matrix, a projection matrix and a
//!   reference to the coordinate system the view is expressed in. The view is
//!   inverted and composed with the platform transform into the target space;
//!   the projection is passed through.
//! - **Dynamic node**: the sample carries pinhole intrinsics, calibrated
//!   extrinsics against a tracked node, and a device timestamp. The node is
//!   located at that timestamp and the projection is derived analytically.
//!
//! The platform side is reached through [`SpatialPlatform`] and
//! [`SpatialLocator`].

pub mod calibration;
pub mod math;

use std::sync::Arc;

use tracing::{debug, trace};
use uuid::Uuid;

pub use math::{Float4x4, Quaternion, Vec3};

use crate::{
    Error, Result,
    config::TransformStrategy,
    media::sample::{AttributeKey, MediaSample, Ticks},
    payload::{CameraTransform, PayloadEnvelope},
};
use calibration::{CameraExtrinsics, PinholeIntrinsics};

/// Opaque reference to a platform spatial coordinate system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CoordinateSystemRef(pub u64);

/// Pose of a located node in the requested coordinate system.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeLocation {
    /// Node position.
    pub position: Vec3,
    /// Node orientation.
    pub orientation: Quaternion,
}

impl NodeLocation {
    /// Node-to-target transform: rotation followed by translation.
    pub fn to_matrix(&self) -> Float4x4 {
        Float4x4::from_quaternion(self.orientation) * Float4x4::translation(self.position)
    }
}

/// Tracks one dynamic node over time.
pub trait SpatialLocator: Send + Sync {
    /// Locates the node at `device_timestamp` relative to `target`.
    fn try_locate_at(&self, device_timestamp: Ticks, target: CoordinateSystemRef) -> Option<NodeLocation>;
}

/// Spatial services of the platform.
pub trait SpatialPlatform: Send + Sync {
    /// Whether dynamic-node locators are available on this platform.
    fn supports_dynamic_nodes(&self) -> bool;

    /// Transform from `from` into `to`, if the two systems are related.
    fn transform_between(&self, from: CoordinateSystemRef, to: CoordinateSystemRef) -> Option<Float4x4>;

    /// Creates a locator for the node with the given calibration id.
    fn create_locator_for_node(&self, node_id: Uuid) -> Option<Arc<dyn SpatialLocator>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    Legacy,
    DynamicNode,
}

/// Resolves per-frame camera transforms.
///
/// Only the consumer callback uses a resolver, so it takes `&mut self` and
/// does no locking of its own.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use capture_media::{SpatialTransformResolver, config::TransformStrategy};
/// # use capture_media::transform::{CoordinateSystemRef, SpatialPlatform};
/// # use capture_media::media::sample::MediaSample;
/// # fn example(platform: Arc<dyn SpatialPlatform>, frame: &MediaSample) -> Result<(), capture_media::Error> {
/// let mut resolver = SpatialTransformResolver::new(platform, TransformStrategy::Auto);
/// let transform = resolver.resolve(frame, CoordinateSystemRef(1))?;
/// println!("camera at {:?}", transform.camera_to_world.m[3]);
/// # Ok(())
/// # }
/// ```
pub struct SpatialTransformResolver {
    platform: Arc<dyn SpatialPlatform>,
    strategy: Strategy,
    cached_locator: Option<(Uuid, Arc<dyn SpatialLocator>)>,
}

impl SpatialTransformResolver {
    /// Creates a resolver. [`TransformStrategy::Auto`] probes the platform
    /// exactly once, here.
    pub fn new(platform: Arc<dyn SpatialPlatform>, requested: TransformStrategy) -> Self {
        let strategy = match requested {
            TransformStrategy::Legacy => Strategy::Legacy,
            TransformStrategy::DynamicNode => Strategy::DynamicNode,
            TransformStrategy::Auto if platform.supports_dynamic_nodes() => Strategy::DynamicNode,
            TransformStrategy::Auto => Strategy::Legacy,
        };
        debug!("Spatial transform resolver using {:?} calibration", strategy);

        Self {
            platform,
            strategy,
            cached_locator: None,
        }
    }

    /// True if the dynamic-node strategy was selected.
    pub fn uses_dynamic_nodes(&self) -> bool {
        self.strategy == Strategy::DynamicNode
    }

    /// Computes camera-to-world and projection for `sample` in `target` space.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if required metadata is missing, the coordinate
    ///   systems are unrelated, or the node cannot be located
    /// - [`Error::InvalidArgument`] if a legacy matrix blob has the wrong size
    /// - [`Error::SingularTransform`] if the legacy view cannot be inverted
    /// - [`Error::InvalidCalibration`] if calibration blobs are malformed
    pub fn resolve(&mut self, sample: &MediaSample, target: CoordinateSystemRef) -> Result<CameraTransform> {
        match self.strategy {
            Strategy::Legacy => self.resolve_legacy(sample, target),
            Strategy::DynamicNode => self.resolve_dynamic_node(sample, target),
        }
    }

    /// Resolves the envelope's sample and stores the result on the envelope.
    pub fn apply(&mut self, envelope: &mut PayloadEnvelope, target: CoordinateSystemRef) -> Result<()> {
        let transform = self.resolve(envelope.sample(), target)?;
        envelope.set_transform(transform);
        Ok(())
    }

    /// Drops the cached locator.
    pub fn reset(&mut self) {
        self.cached_locator = None;
    }

    fn resolve_legacy(&self, sample: &MediaSample, target: CoordinateSystemRef) -> Result<CameraTransform> {
        let attributes = sample.attributes();
        let view = read_matrix(sample, AttributeKey::CameraViewTransform)?;
        let source = attributes
            .get_coordinate_system(&AttributeKey::CameraCoordinateSystem)
            .ok_or_else(|| Error::NotFound("camera coordinate system".to_string()))?;
        let projection = read_matrix(sample, AttributeKey::CameraProjectionTransform)?;

        let camera_to_target = self
            .platform
            .transform_between(source, target)
            .ok_or_else(|| Error::NotFound(format!("transform from {source:?} to {target:?}")))?;

        let inverted_view = view.invert().ok_or(Error::SingularTransform)?;

        Ok(CameraTransform {
            camera_to_world: inverted_view * camera_to_target,
            projection,
        })
    }

    fn resolve_dynamic_node(&mut self, sample: &MediaSample, target: CoordinateSystemRef) -> Result<CameraTransform> {
        let attributes = sample.attributes();
        let intrinsics = attributes
            .get_blob(&AttributeKey::PinholeIntrinsics)
            .ok_or_else(|| Error::InvalidCalibration("missing intrinsics".to_string()))
            .and_then(PinholeIntrinsics::from_blob)?;
        let extrinsics = attributes
            .get_blob(&AttributeKey::CameraExtrinsics)
            .ok_or_else(|| Error::InvalidCalibration("missing extrinsics".to_string()))
            .and_then(CameraExtrinsics::from_blob)?;

        let locator = self.locator_for(extrinsics.calibration_id)?;
        let camera_to_node = extrinsics.camera_to_node();

        let timestamp = attributes
            .get_i64(&AttributeKey::DeviceTimestamp)
            .ok_or_else(|| Error::NotFound("device timestamp".to_string()))?;
        let location = locator
            .try_locate_at(timestamp, target)
            .ok_or_else(|| Error::NotFound(format!("node {} at {timestamp}", extrinsics.calibration_id)))?;

        Ok(CameraTransform {
            camera_to_world: camera_to_node * location.to_matrix(),
            projection: intrinsics.projection(),
        })
    }

    fn locator_for(&mut self, node_id: Uuid) -> Result<Arc<dyn SpatialLocator>> {
        if let Some((cached_id, locator)) = &self.cached_locator
            && *cached_id == node_id
        {
            return Ok(locator.clone());
        }

        trace!("Creating locator for node {}", node_id);
        let locator = self
            .platform
            .create_locator_for_node(node_id)
            .ok_or_else(|| Error::NotFound(format!("locator for node {node_id}")))?;
        self.cached_locator = Some((node_id, locator.clone()));
        Ok(locator)
    }
}

fn read_matrix(sample: &MediaSample, key: AttributeKey) -> Result<Float4x4> {
    let blob = sample
        .attributes()
        .get_blob(&key)
        .ok_or_else(|| Error::NotFound(format!("{key:?}")))?;
    Float4x4::from_blob(blob).ok_or_else(|| {
        Error::InvalidArgument(format!("{key:?} blob is {} bytes", blob.len()))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::media::sample::AttributeValue;
    use calibration::DEFAULT_PROJECTION;

    const WORLD: CoordinateSystemRef = CoordinateSystemRef(1);
    const CAMERA: CoordinateSystemRef = CoordinateSystemRef(2);

    struct FixedLocator(NodeLocation);

    impl SpatialLocator for FixedLocator {
        fn try_locate_at(&self, _: Ticks, target: CoordinateSystemRef) -> Option<NodeLocation> {
            (target == WORLD).then_some(self.0)
        }
    }

    #[derive(Default)]
    struct MockPlatform {
        dynamic_nodes: bool,
        camera_to_world: Option<Float4x4>,
        known_nodes: Mutex<Vec<Uuid>>,
        locators_created: AtomicUsize,
        probes: AtomicUsize,
    }

    impl SpatialPlatform for MockPlatform {
        fn supports_dynamic_nodes(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.dynamic_nodes
        }

        fn transform_between(&self, from: CoordinateSystemRef, to: CoordinateSystemRef) -> Option<Float4x4> {
            (from == CAMERA && to == WORLD).then_some(self.camera_to_world?)
        }

        fn create_locator_for_node(&self, node_id: Uuid) -> Option<Arc<dyn SpatialLocator>> {
            if !self.known_nodes.lock().unwrap().contains(&node_id) {
                return None;
            }
            self.locators_created.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(FixedLocator(NodeLocation {
                position: Vec3::new(0.0, 1.5, 0.0),
                orientation: Quaternion::IDENTITY,
            })))
        }
    }

    fn legacy_sample(view: Float4x4, projection: Float4x4) -> MediaSample {
        MediaSample::new(0, vec![0; 4])
            .with_attribute(AttributeKey::CameraViewTransform, AttributeValue::Blob(view.to_blob()))
            .with_attribute(
                AttributeKey::CameraProjectionTransform,
                AttributeValue::Blob(projection.to_blob()),
            )
            .with_attribute(AttributeKey::CameraCoordinateSystem, AttributeValue::CoordinateSystem(CAMERA))
    }

    fn dynamic_sample(node: Uuid) -> MediaSample {
        let intrinsics = PinholeIntrinsics {
            width: 1280,
            height: 720,
            focal_length: [1280.0, 720.0],
            principal_point: [0.0, 0.0],
            distortion: [0.0; 5],
        };
        let extrinsics = CameraExtrinsics {
            calibration_id: node,
            position: Vec3::new(0.1, 0.0, 0.0),
            orientation: Quaternion::IDENTITY,
        };
        MediaSample::new(0, vec![0; 4])
            .with_attribute(AttributeKey::PinholeIntrinsics, AttributeValue::Blob(intrinsics.to_blob()))
            .with_attribute(AttributeKey::CameraExtrinsics, AttributeValue::Blob(extrinsics.to_blob()))
            .with_attribute(AttributeKey::DeviceTimestamp, AttributeValue::U64(123_456))
    }

    #[test]
    fn legacy_identity_round_trips() {
        let platform = Arc::new(MockPlatform {
            camera_to_world: Some(Float4x4::IDENTITY),
            ..Default::default()
        });
        let mut resolver = SpatialTransformResolver::new(platform, TransformStrategy::Legacy);

        let transform = resolver
            .resolve(&legacy_sample(Float4x4::IDENTITY, Float4x4::IDENTITY), WORLD)
            .unwrap();

        assert_eq!(transform.camera_to_world, Float4x4::IDENTITY);
        assert_eq!(transform.projection, Float4x4::IDENTITY);
    }

    #[test]
    fn legacy_composes_inverted_view_with_platform_transform() {
        let platform = Arc::new(MockPlatform {
            camera_to_world: Some(Float4x4::translation(Vec3::new(0.0, 0.0, 2.0))),
            ..Default::default()
        });
        let mut resolver = SpatialTransformResolver::new(platform, TransformStrategy::Legacy);
        let view = Float4x4::translation(Vec3::new(1.0, 0.0, 0.0));

        let transform = resolver.resolve(&legacy_sample(view, DEFAULT_PROJECTION), WORLD).unwrap();

        let expected = Float4x4::translation(Vec3::new(-1.0, 0.0, 2.0));
        assert!(transform.camera_to_world.approx_eq(&expected, 1e-6));
        assert_eq!(transform.projection, DEFAULT_PROJECTION);
    }

    #[test]
    fn legacy_singular_view_fails() {
        let platform = Arc::new(MockPlatform {
            camera_to_world: Some(Float4x4::IDENTITY),
            ..Default::default()
        });
        let mut resolver = SpatialTransformResolver::new(platform, TransformStrategy::Legacy);
        let mut singular = Float4x4::IDENTITY;
        singular.m[1] = [0.0; 4];

        let result = resolver.resolve(&legacy_sample(singular, Float4x4::IDENTITY), WORLD);
        assert_eq!(result, Err(Error::SingularTransform));
    }

    #[test]
    fn legacy_unrelated_systems_are_not_found() {
        let platform = Arc::new(MockPlatform::default());
        let mut resolver = SpatialTransformResolver::new(platform, TransformStrategy::Legacy);
        let result = resolver.resolve(&legacy_sample(Float4x4::IDENTITY, Float4x4::IDENTITY), WORLD);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn auto_probes_once_at_construction() {
        let platform = Arc::new(MockPlatform {
            dynamic_nodes: true,
            ..Default::default()
        });
        let node = Uuid::new_v4();
        platform.known_nodes.lock().unwrap().push(node);

        let mut resolver = SpatialTransformResolver::new(platform.clone(), TransformStrategy::Auto);
        assert!(resolver.uses_dynamic_nodes());
        for _ in 0..3 {
            resolver.resolve(&dynamic_sample(node), WORLD).unwrap();
        }
        assert_eq!(platform.probes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dynamic_node_composes_extrinsics_with_location() {
        let platform = Arc::new(MockPlatform::default());
        let node = Uuid::new_v4();
        platform.known_nodes.lock().unwrap().push(node);
        let mut resolver = SpatialTransformResolver::new(platform, TransformStrategy::DynamicNode);

        let transform = resolver.resolve(&dynamic_sample(node), WORLD).unwrap();

        let expected = Float4x4::translation(Vec3::new(0.1, 1.5, 0.0));
        assert!(transform.camera_to_world.approx_eq(&expected, 1e-6));
        assert_eq!(transform.projection.m[0], [2.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn locator_is_cached_per_calibration_id() {
        let platform = Arc::new(MockPlatform::default());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        platform.known_nodes.lock().unwrap().extend([first, second]);
        let mut resolver = SpatialTransformResolver::new(platform.clone(), TransformStrategy::DynamicNode);

        resolver.resolve(&dynamic_sample(first), WORLD).unwrap();
        resolver.resolve(&dynamic_sample(first), WORLD).unwrap();
        assert_eq!(platform.locators_created.load(Ordering::SeqCst), 1);

        resolver.resolve(&dynamic_sample(second), WORLD).unwrap();
        assert_eq!(platform.locators_created.load(Ordering::SeqCst), 2);

        resolver.reset();
        resolver.resolve(&dynamic_sample(second), WORLD).unwrap();
        assert_eq!(platform.locators_created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unknown_node_and_unlocatable_node_are_not_found() {
        let platform = Arc::new(MockPlatform::default());
        let node = Uuid::new_v4();
        let mut resolver = SpatialTransformResolver::new(platform.clone(), TransformStrategy::DynamicNode);
        assert!(matches!(
            resolver.resolve(&dynamic_sample(node), WORLD),
            Err(Error::NotFound(_))
        ));

        platform.known_nodes.lock().unwrap().push(node);
        assert!(matches!(
            resolver.resolve(&dynamic_sample(node), CAMERA),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn missing_calibration_is_invalid() {
        let platform = Arc::new(MockPlatform::default());
        let mut resolver = SpatialTransformResolver::new(platform, TransformStrategy::DynamicNode);
        let result = resolver.resolve(&MediaSample::new(0, vec![1]), WORLD);
        assert!(matches!(result, Err(Error::InvalidCalibration(_))));
    }
}

// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Camera calibration blobs attached to video samples.
//!
//! Both blobs are fixed-size little-endian records with a leading entry count
//! followed by exactly one entry. A blob of any other size is rejected.
//!
//! ```text
//! intrinsics (48 bytes)              extrinsics (48 bytes)
//! ┌──────────────────────────┐       ┌──────────────────────────┐
//! │ u32  model count         │       │ u32  transform count     │
//! │ u32  width, u32 height   │       │ GUID calibration id (16) │
//! │ f32×2 focal length       │       │ f32×3 position           │
//! │ f32×2 principal point    │       │ f32×4 orientation (xyzw) │
//! │ f32×5 distortion         │       └──────────────────────────┘
//! └──────────────────────────┘
//! ```

use uuid::Uuid;

use super::math::{Float4x4, Quaternion, Vec3};
use crate::{Error, Result};

/// Byte size of an intrinsics blob.
pub const INTRINSICS_BLOB_SIZE: usize = 48;

/// Byte size of an extrinsics blob.
pub const EXTRINSICS_BLOB_SIZE: usize = 48;

/// Projection used when the camera affine is the identity: maps the unit
/// image square onto the `(-1, -1)..(1, 1)` viewport.
pub const DEFAULT_PROJECTION: Float4x4 = Float4x4::from_rows([
    [2.0, 0.0, 0.0, 0.0],
    [0.0, -2.0, 0.0, 0.0],
    [-1.0, 1.0, 1.0, 1.0],
    [0.0, 0.0, 0.0, 0.0],
]);

/// Pinhole camera intrinsics of the first (and only) model in the blob.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PinholeIntrinsics {
    /// Image width in pixels the model was calibrated for.
    pub width: u32,
    /// Image height in pixels the model was calibrated for.
    pub height: u32,
    /// Focal length in pixels.
    pub focal_length: [f32; 2],
    /// Principal point in pixels.
    pub principal_point: [f32; 2],
    /// Radial (k1, k2, k3) and tangential (p1, p2) distortion.
    pub distortion: [f32; 5],
}

impl PinholeIntrinsics {
    /// Parses an intrinsics blob.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCalibration`] if the blob has the wrong size,
    /// carries no model, or describes a zero-sized image.
    pub fn from_blob(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != INTRINSICS_BLOB_SIZE {
            return Err(Error::InvalidCalibration(format!(
                "intrinsics blob is {} bytes, expected {INTRINSICS_BLOB_SIZE}",
                bytes.len()
            )));
        }
        let mut reader = BlobReader::new(bytes);
        if reader.u32() == 0 {
            return Err(Error::InvalidCalibration("no intrinsic model".to_string()));
        }
        let intrinsics = Self {
            width: reader.u32(),
            height: reader.u32(),
            focal_length: [reader.f32(), reader.f32()],
            principal_point: [reader.f32(), reader.f32()],
            distortion: [
                reader.f32(),
                reader.f32(),
                reader.f32(),
                reader.f32(),
                reader.f32(),
            ],
        };
        if intrinsics.width == 0 || intrinsics.height == 0 {
            return Err(Error::InvalidCalibration(
                "intrinsic model has an empty image size".to_string(),
            ));
        }
        Ok(intrinsics)
    }

    /// Serializes into an intrinsics blob with a model count of one.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(INTRINSICS_BLOB_SIZE);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&self.width.to_le_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        for value in self
            .focal_length
            .iter()
            .chain(&self.principal_point)
            .chain(&self.distortion)
        {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Projection derived from focal length and principal point.
    ///
    /// The intrinsics are normalized by the image size, turned into a
    /// scale-and-flip camera affine, and composed with [`DEFAULT_PROJECTION`].
    pub fn projection(&self) -> Float4x4 {
        let width = self.width as f32;
        let height = self.height as f32;
        let fx = self.focal_length[0] / width;
        let fy = self.focal_length[1] / height;
        let px = self.principal_point[0] / width;
        let py = self.principal_point[1] / height;

        let camera_affine = Float4x4::from_rows([
            [fx, 0.0, 0.0, 0.0],
            [0.0, -fy, 0.0, 0.0],
            [-px, -py, -1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);

        camera_affine * DEFAULT_PROJECTION
    }
}

/// First calibrated transform of an extrinsics blob.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraExtrinsics {
    /// Identifier of the dynamic node the camera is calibrated against.
    pub calibration_id: Uuid,
    /// Camera position relative to the node.
    pub position: Vec3,
    /// Camera orientation relative to the node.
    pub orientation: Quaternion,
}

impl CameraExtrinsics {
    /// Parses an extrinsics blob.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCalibration`] if the blob has the wrong size or
    /// carries no calibrated transform.
    pub fn from_blob(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != EXTRINSICS_BLOB_SIZE {
            return Err(Error::InvalidCalibration(format!(
                "extrinsics blob is {} bytes, expected {EXTRINSICS_BLOB_SIZE}",
                bytes.len()
            )));
        }
        let mut reader = BlobReader::new(bytes);
        if reader.u32() == 0 {
            return Err(Error::InvalidCalibration(
                "no calibrated transform".to_string(),
            ));
        }
        Ok(Self {
            calibration_id: reader.guid(),
            position: Vec3::new(reader.f32(), reader.f32(), reader.f32()),
            orientation: Quaternion::new(reader.f32(), reader.f32(), reader.f32(), reader.f32()),
        })
    }

    /// Serializes into an extrinsics blob with a transform count of one.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(EXTRINSICS_BLOB_SIZE);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&self.calibration_id.to_bytes_le());
        let Vec3 { x, y, z } = self.position;
        let Quaternion { x: qx, y: qy, z: qz, w: qw } = self.orientation;
        for value in [x, y, z, qx, qy, qz, qw] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Camera-to-node transform: rotation followed by translation.
    pub fn camera_to_node(&self) -> Float4x4 {
        Float4x4::from_quaternion(self.orientation) * Float4x4::translation(self.position)
    }
}

/// Sequential little-endian reader over a blob whose size was checked up front.
struct BlobReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> BlobReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(slice) = self.bytes.get(self.offset..self.offset + N) {
            out.copy_from_slice(slice);
        }
        self.offset += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }

    fn guid(&mut self) -> Uuid {
        Uuid::from_bytes_le(self.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intrinsics(width: u32, height: u32, focal: [f32; 2], principal: [f32; 2]) -> PinholeIntrinsics {
        PinholeIntrinsics {
            width,
            height,
            focal_length: focal,
            principal_point: principal,
            distortion: [0.0; 5],
        }
    }

    #[test]
    fn unit_intrinsics_give_flipped_default_projection() {
        // fx = fy = 1 in normalized units and no principal point offset: the
        // camera affine only flips y and z, so the projection is the default
        // with its second and third rows negated.
        let projection = intrinsics(640, 480, [640.0, 480.0], [0.0, 0.0]).projection();
        let expected = Float4x4::from_rows([
            [2.0, 0.0, 0.0, 0.0],
            [0.0, 2.0, 0.0, 0.0],
            [1.0, -1.0, -1.0, -1.0],
            [0.0, 0.0, 0.0, 0.0],
        ]);
        assert_eq!(projection, expected);
    }

    #[test]
    fn principal_point_shifts_third_row() {
        let projection = intrinsics(100, 100, [100.0, 100.0], [50.0, 25.0]).projection();
        // -px * row0 - py * row1 - row2 of the default projection.
        let expected_row = [-1.0 + 1.0, 0.5 - 1.0, -1.0, -1.0];
        for (actual, expected) in projection.m[2].iter().zip(expected_row) {
            assert!((actual - expected).abs() < 1e-6, "{actual} != {expected}");
        }
    }

    #[test]
    fn intrinsics_blob_is_validated() {
        let blob = intrinsics(4, 4, [1.0, 1.0], [0.0, 0.0]).to_blob();
        assert_eq!(blob.len(), INTRINSICS_BLOB_SIZE);
        assert!(PinholeIntrinsics::from_blob(&blob).is_ok());
        assert!(matches!(
            PinholeIntrinsics::from_blob(&blob[..40]),
            Err(Error::InvalidCalibration(_))
        ));

        let mut no_models = blob.clone();
        no_models[..4].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            PinholeIntrinsics::from_blob(&no_models),
            Err(Error::InvalidCalibration(_))
        ));
    }

    #[test]
    fn extrinsics_require_a_transform() {
        let extrinsics = CameraExtrinsics {
            calibration_id: Uuid::new_v4(),
            position: Vec3::new(0.1, 0.2, 0.3),
            orientation: Quaternion::IDENTITY,
        };
        let blob = extrinsics.to_blob();
        assert_eq!(blob.len(), EXTRINSICS_BLOB_SIZE);
        assert_eq!(CameraExtrinsics::from_blob(&blob).unwrap(), extrinsics);

        let mut empty = blob;
        empty[..4].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            CameraExtrinsics::from_blob(&empty),
            Err(Error::InvalidCalibration(_))
        ));
    }

    #[test]
    fn camera_to_node_with_identity_rotation_is_translation() {
        let extrinsics = CameraExtrinsics {
            calibration_id: Uuid::nil(),
            position: Vec3::new(1.0, 2.0, 3.0),
            orientation: Quaternion::IDENTITY,
        };
        assert_eq!(
            extrinsics.camera_to_node(),
            Float4x4::translation(Vec3::new(1.0, 2.0, 3.0))
        );
    }
}

// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Media samples and their typed attributes.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::transform::CoordinateSystemRef;

/// Time in 100-nanosecond ticks, the unit used by the capture platform.
pub type Ticks = i64;

/// Keys of attributes a sample may carry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttributeKey {
    /// Decode timestamp; preferred over the presentation time for ordering.
    DecodeTimestamp,
    /// Marks the first sample after a gap.
    Discontinuity,
    /// Legacy camera view transform, a 64-byte row-major matrix blob.
    CameraViewTransform,
    /// Legacy camera projection transform, a 64-byte row-major matrix blob.
    CameraProjectionTransform,
    /// Coordinate system the legacy view transform is expressed in.
    CameraCoordinateSystem,
    /// Pinhole intrinsics blob.
    PinholeIntrinsics,
    /// Calibrated extrinsics blob.
    CameraExtrinsics,
    /// Device clock timestamp used to locate dynamic nodes, in ticks.
    DeviceTimestamp,
    /// Application-defined key.
    Custom(String),
}

/// Value of a sample attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// Signed 64-bit integer.
    I64(i64),
    /// Boolean flag.
    Bool(bool),
    /// Double precision float.
    Double(f64),
    /// GUID.
    Guid(Uuid),
    /// Opaque byte blob.
    Blob(Vec<u8>),
    /// Reference to a spatial coordinate system.
    CoordinateSystem(CoordinateSystemRef),
}

/// Ordered attribute store of a [`MediaSample`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleAttributes {
    values: BTreeMap<AttributeKey, AttributeValue>,
}

impl SampleAttributes {
    /// Sets `key`, replacing any previous value.
    pub fn set(&mut self, key: AttributeKey, value: AttributeValue) {
        self.values.insert(key, value);
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &AttributeKey) -> Option<&AttributeValue> {
        self.values.get(key)
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &AttributeKey) -> Option<AttributeValue> {
        self.values.remove(key)
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &AttributeKey) -> bool {
        self.values.contains_key(key)
    }

    /// Returns an integer attribute, widening unsigned values that fit.
    pub fn get_i64(&self, key: &AttributeKey) -> Option<i64> {
        match self.values.get(key)? {
            AttributeValue::I64(value) => Some(*value),
            AttributeValue::U64(value) => i64::try_from(*value).ok(),
            AttributeValue::U32(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    /// Returns an unsigned integer attribute.
    pub fn get_u64(&self, key: &AttributeKey) -> Option<u64> {
        match self.values.get(key)? {
            AttributeValue::U64(value) => Some(*value),
            AttributeValue::U32(value) => Some(u64::from(*value)),
            AttributeValue::I64(value) => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    /// Returns a boolean attribute.
    pub fn get_bool(&self, key: &AttributeKey) -> Option<bool> {
        match self.values.get(key)? {
            AttributeValue::Bool(value) => Some(*value),
            AttributeValue::U32(value) => Some(*value != 0),
            _ => None,
        }
    }

    /// Returns a blob attribute.
    pub fn get_blob(&self, key: &AttributeKey) -> Option<&[u8]> {
        match self.values.get(key)? {
            AttributeValue::Blob(bytes) => Some(bytes.as_slice()),
            _ => None,
        }
    }

    /// Returns a coordinate system attribute.
    pub fn get_coordinate_system(&self, key: &AttributeKey) -> Option<CoordinateSystemRef> {
        match self.values.get(key)? {
            AttributeValue::CoordinateSystem(system) => Some(*system),
            _ => None,
        }
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no attribute is set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&AttributeKey, &AttributeValue)> {
        self.values.iter()
    }
}

/// One media sample: timing, flags, attributes and payload bytes.
///
/// # Examples
///
/// ```
/// use capture_media::media::sample::{AttributeKey, AttributeValue, MediaSample};
///
/// let sample = MediaSample::new(1_000, vec![0u8; 16])
///     .with_duration(333_333)
///     .with_attribute(AttributeKey::DecodeTimestamp, AttributeValue::I64(900));
///
/// assert_eq!(sample.decode_timestamp(), Some(900));
/// assert_eq!(sample.total_length(), 16);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaSample {
    presentation_time: Ticks,
    duration: Ticks,
    flags: u32,
    attributes: SampleAttributes,
    buffer: Vec<u8>,
}

impl MediaSample {
    /// Creates a sample at `presentation_time` owning `buffer`.
    pub fn new(presentation_time: Ticks, buffer: Vec<u8>) -> Self {
        Self {
            presentation_time,
            buffer,
            ..Default::default()
        }
    }

    /// Sets the duration.
    pub fn with_duration(mut self, duration: Ticks) -> Self {
        self.duration = duration;
        self
    }

    /// Sets one attribute.
    pub fn with_attribute(mut self, key: AttributeKey, value: AttributeValue) -> Self {
        self.attributes.set(key, value);
        self
    }

    /// Presentation time in ticks.
    pub fn presentation_time(&self) -> Ticks {
        self.presentation_time
    }

    /// Rebases the presentation time.
    pub fn set_presentation_time(&mut self, time: Ticks) {
        self.presentation_time = time;
    }

    /// Duration in ticks.
    pub fn duration(&self) -> Ticks {
        self.duration
    }

    /// Sets the duration in ticks.
    pub fn set_duration(&mut self, duration: Ticks) {
        self.duration = duration;
    }

    /// Platform sample flags, carried through untouched.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Sets the platform sample flags.
    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    /// Decode timestamp, if the producer attached one.
    pub fn decode_timestamp(&self) -> Option<Ticks> {
        self.attributes.get_i64(&AttributeKey::DecodeTimestamp)
    }

    /// Returns true if the sample follows a gap in the stream.
    pub fn is_discontinuity(&self) -> bool {
        self.attributes
            .get_bool(&AttributeKey::Discontinuity)
            .unwrap_or(false)
    }

    /// Marks or clears the discontinuity flag.
    pub fn set_discontinuity(&mut self, discontinuity: bool) {
        self.attributes.set(
            AttributeKey::Discontinuity,
            AttributeValue::Bool(discontinuity),
        );
    }

    /// Attribute store.
    pub fn attributes(&self) -> &SampleAttributes {
        &self.attributes
    }

    /// Mutable attribute store.
    pub fn attributes_mut(&mut self) -> &mut SampleAttributes {
        &mut self.attributes
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable payload bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Payload length in bytes.
    pub fn total_length(&self) -> usize {
        self.buffer.len()
    }

    /// Copies attributes, timing, flags and payload from `source`.
    ///
    /// The existing payload allocation is reused when it is large enough.
    pub fn copy_from(&mut self, source: &MediaSample) {
        self.attributes.clone_from(&source.attributes);
        self.presentation_time = source.presentation_time;
        self.duration = source.duration;
        self.flags = source.flags;
        self.buffer.clear();
        self.buffer.extend_from_slice(&source.buffer);
    }

    /// Copies attributes, timing and flags from `source`, leaving the payload.
    pub fn copy_metadata_from(&mut self, source: &MediaSample) {
        self.attributes.clone_from(&source.attributes);
        self.presentation_time = source.presentation_time;
        self.duration = source.duration;
        self.flags = source.flags;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_from_reuses_allocation() {
        let source = MediaSample::new(10, vec![1, 2, 3])
            .with_duration(5)
            .with_attribute(AttributeKey::DeviceTimestamp, AttributeValue::U64(77));
        let mut target = MediaSample::new(0, Vec::with_capacity(64));
        let capacity = target.buffer.capacity();

        target.copy_from(&source);

        assert_eq!(target, source);
        assert_eq!(target.buffer.capacity(), capacity);
    }

    #[test]
    fn integer_attributes_widen() {
        let mut attributes = SampleAttributes::default();
        attributes.set(AttributeKey::DecodeTimestamp, AttributeValue::U32(42));
        attributes.set(AttributeKey::DeviceTimestamp, AttributeValue::I64(-1));

        assert_eq!(attributes.get_i64(&AttributeKey::DecodeTimestamp), Some(42));
        assert_eq!(attributes.get_u64(&AttributeKey::DeviceTimestamp), None);
    }

    #[test]
    fn discontinuity_defaults_to_false() {
        let mut sample = MediaSample::new(0, vec![0]);
        assert!(!sample.is_discontinuity());
        sample.set_discontinuity(true);
        assert!(sample.is_discontinuity());
    }
}

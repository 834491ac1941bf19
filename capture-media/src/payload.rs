// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! The envelope carrying one accepted sample from producer to consumer.

use std::sync::{Arc, Weak};

use crate::{
    media::{
        descriptor::{MediaDescriptor, MediaKind},
        properties::{self, PropertySet},
        sample::{MediaSample, Ticks},
    },
    transform::Float4x4,
};

/// Camera pose and projection resolved for one video frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraTransform {
    /// Camera space to target (world) space.
    pub camera_to_world: Float4x4,
    /// Camera projection.
    pub projection: Float4x4,
}

/// Receiver of returned sample-request credits.
///
/// `generation` identifies the start cycle the credit was issued in; a sink
/// ignores credits from an earlier cycle.
pub(crate) trait CreditSink: Send + Sync {
    fn return_credit(&self, generation: u64);
}

/// One in-flight credit. Returned to its stream when dropped.
pub(crate) struct CreditLease {
    sink: Weak<dyn CreditSink>,
    generation: u64,
}

impl CreditLease {
    pub(crate) fn new(sink: Weak<dyn CreditSink>, generation: u64) -> Self {
        Self { sink, generation }
    }
}

impl Drop for CreditLease {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.upgrade() {
            sink.return_credit(self.generation);
        }
    }
}

impl std::fmt::Debug for CreditLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditLease")
            .field("generation", &self.generation)
            .finish()
    }
}

/// One forwarded unit of media plus its metadata.
///
/// The envelope owns its sample exclusively. Once handed to the dispatch
/// queue the producer has no way back to it; the consumer reads it through a
/// shared reference and drops it after the last subscriber returns. Dropping
/// the envelope returns the producer credit it was issued under.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use capture_media::{
///     PayloadEnvelope,
///     media::{descriptor::{MediaDescriptor, MediaKind, VideoFormat}, sample::MediaSample},
/// };
///
/// let descriptor = Arc::new(MediaDescriptor::Video(VideoFormat::bgra8(2, 2)));
/// let envelope = PayloadEnvelope::new(1, descriptor, MediaSample::new(100, vec![0; 16]));
///
/// assert_eq!(envelope.kind(), MediaKind::Video);
/// assert_eq!(envelope.timestamp(), 100);
/// assert!(!envelope.has_transform());
/// ```
#[derive(Debug)]
pub struct PayloadEnvelope {
    kind: MediaKind,
    stream_id: u32,
    descriptor: Arc<MediaDescriptor>,
    sample: MediaSample,
    extended_properties: PropertySet,
    transform: Option<CameraTransform>,
    credit: Option<CreditLease>,
}

impl PayloadEnvelope {
    /// Wraps `sample`; the kind is taken from `descriptor` and never changes.
    pub fn new(stream_id: u32, descriptor: Arc<MediaDescriptor>, sample: MediaSample) -> Self {
        Self {
            kind: descriptor.kind(),
            stream_id,
            descriptor,
            sample,
            extended_properties: PropertySet::default(),
            transform: None,
            credit: None,
        }
    }

    pub(crate) fn with_credit(mut self, credit: CreditLease) -> Self {
        self.credit = Some(credit);
        self
    }

    /// Media kind derived from the descriptor at construction.
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Identifier of the stream that produced the sample.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Format of the stream that produced the sample.
    pub fn descriptor(&self) -> &MediaDescriptor {
        &self.descriptor
    }

    /// The carried sample.
    pub fn sample(&self) -> &MediaSample {
        &self.sample
    }

    /// Presentation time of the sample after offset correction.
    pub fn timestamp(&self) -> Ticks {
        self.sample.presentation_time()
    }

    /// Duration of the sample.
    pub fn duration(&self) -> Ticks {
        self.sample.duration()
    }

    /// Side metadata.
    pub fn extended_properties(&self) -> &PropertySet {
        &self.extended_properties
    }

    /// Mutable side metadata.
    pub fn extended_properties_mut(&mut self) -> &mut PropertySet {
        &mut self.extended_properties
    }

    /// True if this envelope follows one or more dropped samples.
    pub fn is_discontinuity(&self) -> bool {
        self.extended_properties
            .get_bool(properties::DISCONTINUITY)
            .unwrap_or(false)
    }

    /// Sets camera-to-world and projection together.
    pub fn set_transform(&mut self, transform: CameraTransform) {
        self.transform = Some(transform);
    }

    /// Camera matrices, if resolved.
    pub fn transform(&self) -> Option<&CameraTransform> {
        self.transform.as_ref()
    }

    /// True once both camera matrices are set.
    pub fn has_transform(&self) -> bool {
        self.transform.is_some()
    }

    /// Consumes the envelope and returns its sample. The credit is returned.
    pub fn into_sample(self) -> MediaSample {
        self.sample
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::media::descriptor::AudioFormat;

    #[derive(Default)]
    struct CountingSink(AtomicUsize);

    impl CreditSink for CountingSink {
        fn return_credit(&self, generation: u64) {
            assert_eq!(generation, 7);
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dropping_envelope_returns_credit() {
        let sink = Arc::new(CountingSink::default());
        let weak: Weak<dyn CreditSink> = Arc::downgrade(&(sink.clone() as Arc<dyn CreditSink>));
        let descriptor = Arc::new(MediaDescriptor::Audio(AudioFormat::float_stereo()));

        let envelope = PayloadEnvelope::new(0, descriptor, MediaSample::new(0, vec![1]))
            .with_credit(CreditLease::new(weak, 7));
        assert_eq!(sink.0.load(Ordering::SeqCst), 0);

        let sample = envelope.into_sample();
        assert_eq!(sample.data(), &[1]);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transform_is_set_as_a_pair() {
        let descriptor = Arc::new(MediaDescriptor::Audio(AudioFormat::float_stereo()));
        let mut envelope = PayloadEnvelope::new(0, descriptor, MediaSample::new(0, vec![1]));
        envelope.set_transform(CameraTransform {
            camera_to_world: Float4x4::IDENTITY,
            projection: Float4x4::IDENTITY,
        });
        assert!(envelope.has_transform());
        assert_eq!(envelope.transform().map(|t| t.projection), Some(Float4x4::IDENTITY));
    }
}

// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Per-stream admission control.
//!
//! A [`StreamEndpoint`] receives samples for one elementary stream from the
//! producer pipeline, decides which ones to forward, rebases their
//! timestamps, and hands the survivors to the [`PayloadRouter`] as
//! [`PayloadEnvelope`]s.
//!
//! ## Credits
//!
//! The producer may only deliver a sample after the endpoint asked for one
//! with [`StreamEvent::RequestSample`]. Every delivered sample consumes one
//! credit. A forwarded sample keeps its credit in flight until the consumer
//! releases the envelope; only then is a new request issued. Outstanding
//! requests plus in-flight envelopes never exceed the configured ceiling, so
//! a stalled consumer stalls the producer.
//!
//! ## Locking
//!
//! The endpoint lock is never held while submitting to the router or while
//! notifying the owning sink.

mod events;

use std::{
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

pub use events::{CreditUsage, MarkerType, SampleOutcome, StreamEvent, StreamState};

use crate::{
    Error, PayloadRouter, Result,
    config::PipelineConfig,
    media::{
        descriptor::{MediaDescriptor, MediaKind},
        properties::{self, PropertySet},
        sample::{MediaSample, Ticks},
    },
    payload::{CreditLease, CreditSink, PayloadEnvelope},
};

/// Receives end-of-stream notifications from its endpoints.
pub(crate) trait StreamOwner: Send + Sync {
    fn on_end_of_stream(&self) -> Result<()>;
}

struct EndpointInner {
    descriptor: Option<Arc<MediaDescriptor>>,
    owner: Option<Weak<dyn StreamOwner>>,
    router: Option<Arc<PayloadRouter>>,
    events: Option<Sender<StreamEvent>>,
    generation: u64,
    credits: u32,
    in_flight: u32,
    clock_start: Option<Ticks>,
    start_time_offset: Option<Ticks>,
    last_ordering_time: Option<Ticks>,
    pending_discontinuity: bool,
}

impl EndpointInner {
    fn emit(&self, event: StreamEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// State machine for one elementary stream.
///
/// ```text
/// Ready ──start──▶ Started ──stop──▶ Stopped ──start──▶ Started
///                   │  ▲
///              pause│  │restart          any ──shutdown──▶ Shutdown
///                   ▼  │
///                  Paused         Started ──end-of-segment──▶ Eos
/// ```
pub struct StreamEndpoint {
    stream_id: u32,
    kind: MediaKind,
    max_outstanding: u32,
    self_ref: Weak<StreamEndpoint>,
    state: AtomicU8,
    inner: Mutex<EndpointInner>,
    events: Receiver<StreamEvent>,
}

impl StreamEndpoint {
    /// Creates a standalone endpoint in [`StreamState::Ready`].
    pub fn new(stream_id: u32, descriptor: MediaDescriptor, config: &PipelineConfig) -> Arc<Self> {
        Self::create(stream_id, descriptor, config, None)
    }

    pub(crate) fn with_owner(
        stream_id: u32,
        descriptor: MediaDescriptor,
        config: &PipelineConfig,
        owner: Weak<dyn StreamOwner>,
    ) -> Arc<Self> {
        Self::create(stream_id, descriptor, config, Some(owner))
    }

    fn create(
        stream_id: u32,
        descriptor: MediaDescriptor,
        config: &PipelineConfig,
        owner: Option<Weak<dyn StreamOwner>>,
    ) -> Arc<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Arc::new_cyclic(|self_ref| Self {
            stream_id,
            kind: descriptor.kind(),
            max_outstanding: config.max_outstanding_requests,
            self_ref: self_ref.clone(),
            state: AtomicU8::new(StreamState::Ready as u8),
            inner: Mutex::new(EndpointInner {
                descriptor: Some(Arc::new(descriptor)),
                owner,
                router: None,
                events: Some(sender),
                generation: 0,
                credits: 0,
                in_flight: 0,
                clock_start: None,
                start_time_offset: None,
                last_ordering_time: None,
                pending_discontinuity: false,
            }),
            events: receiver,
        })
    }

    /// Identifier of this stream within its sink.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Current lifecycle state. Readable without taking the endpoint lock.
    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Consistent snapshot of the credit accounting.
    pub fn credit_usage(&self) -> CreditUsage {
        self.inner
            .lock()
            .map(|inner| CreditUsage {
                outstanding: inner.credits,
                in_flight: inner.in_flight,
            })
            .unwrap_or_default()
    }

    /// Starts the stream at `clock_offset` and issues the initial requests.
    ///
    /// Resets credit accounting and timestamp bookkeeping, so a restart after
    /// [`Self::stop`] begins a fresh sequence. The stream description is
    /// re-announced to the router.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutDown`] after [`Self::shutdown`].
    pub fn start(&self, clock_offset: Ticks) -> Result<()> {
        let announcement = {
            let mut inner = self.lock()?;
            self.ensure_live()?;

            inner.generation += 1;
            inner.credits = 0;
            inner.in_flight = 0;
            inner.clock_start = Some(clock_offset);
            inner.start_time_offset = None;
            inner.last_ordering_time = None;
            inner.pending_discontinuity = false;
            self.set_state(StreamState::Started);
            inner.emit(StreamEvent::Started);
            self.replenish(&mut inner);
            debug!("Stream {} started at {}", self.stream_id, clock_offset);

            inner.router.clone().zip(inner.descriptor.clone())
        };

        if let Some((router, descriptor)) = announcement
            && let Err(e) = router.submit_description(self.stream_id, descriptor)
        {
            debug!("Stream {} description not announced: {}", self.stream_id, e);
        }
        Ok(())
    }

    /// Stops the stream. Later samples are rejected until the next start.
    pub fn stop(&self) -> Result<()> {
        let inner = self.lock()?;
        self.ensure_live()?;
        self.set_state(StreamState::Stopped);
        inner.emit(StreamEvent::Stopped);
        debug!("Stream {} stopped", self.stream_id);
        Ok(())
    }

    /// Pauses a started stream. Other states are left alone.
    pub fn pause(&self) -> Result<()> {
        let inner = self.lock()?;
        self.ensure_live()?;
        if self.state() != StreamState::Started {
            trace!("Stream {} not started, pause ignored", self.stream_id);
            return Ok(());
        }
        self.set_state(StreamState::Paused);
        inner.emit(StreamEvent::Paused);
        Ok(())
    }

    /// Resumes a paused stream without resetting its bookkeeping.
    pub fn restart(&self) -> Result<()> {
        let mut inner = self.lock()?;
        self.ensure_live()?;
        if self.state() != StreamState::Paused {
            trace!("Stream {} not paused, restart ignored", self.stream_id);
            return Ok(());
        }
        self.set_state(StreamState::Started);
        inner.emit(StreamEvent::Started);
        self.replenish(&mut inner);
        Ok(())
    }

    /// Admits or drops one sample from the producer.
    ///
    /// An admitted sample has the start time offset subtracted from its
    /// presentation time (floored at zero). The first sample admitted after
    /// one or more drops carries the discontinuity flag.
    ///
    /// # Errors
    ///
    /// - [`Error::ShutDown`] after [`Self::shutdown`]
    /// - [`Error::InvalidState`] if the stream is not started
    /// - [`Error::NotAccepting`] if no sample request is outstanding
    pub fn accept_sample(&self, mut sample: MediaSample) -> Result<SampleOutcome> {
        let (envelope, router) = {
            let mut inner = self.lock()?;
            match self.state() {
                StreamState::Shutdown => return Err(Error::ShutDown),
                StreamState::Started | StreamState::Eos => {}
                other => {
                    return Err(Error::InvalidState(format!(
                        "stream {} is {:?}",
                        self.stream_id, other
                    )));
                }
            }

            if self.evaluate_drop(&mut inner, &sample)? {
                self.replenish(&mut inner);
                return Ok(SampleOutcome::Dropped);
            }

            let offset = inner.start_time_offset.unwrap_or(0);
            sample.set_presentation_time((sample.presentation_time() - offset).max(0));
            let discontinuity = std::mem::take(&mut inner.pending_discontinuity);
            if discontinuity {
                sample.set_discontinuity(true);
            }

            let descriptor = inner.descriptor.clone().ok_or(Error::ShutDown)?;
            let mut envelope = PayloadEnvelope::new(self.stream_id, descriptor, sample);
            if discontinuity {
                envelope
                    .extended_properties_mut()
                    .insert(properties::DISCONTINUITY, true);
            }
            inner.in_flight += 1;
            let lease = CreditLease::new(self.self_ref.clone(), inner.generation);
            (envelope.with_credit(lease), inner.router.clone())
        };

        // Any envelope dropped below returns its credit, which takes the lock.
        let Some(router) = router else {
            debug!("Stream {} has no router, sample released", self.stream_id);
            drop(envelope);
            self.mark_discontinuity();
            return Ok(SampleOutcome::Dropped);
        };
        if let Err(e) = router.submit(envelope) {
            debug!("Stream {} sample not forwarded: {}", self.stream_id, e);
            self.mark_discontinuity();
            return Ok(SampleOutcome::Dropped);
        }
        Ok(SampleOutcome::Forwarded)
    }

    /// Runs the admission policy on `sample` without forwarding it.
    ///
    /// Consumes a credit and updates the timestamp bookkeeping exactly like
    /// [`Self::accept_sample`]; the credit is reissued at once since nothing
    /// stays in flight.
    ///
    /// # Errors
    ///
    /// Same as [`Self::accept_sample`].
    pub fn should_drop(&self, sample: &MediaSample) -> Result<bool> {
        let mut inner = self.lock()?;
        self.ensure_live()?;
        let drop = self.evaluate_drop(&mut inner, sample)?;
        self.replenish(&mut inner);
        Ok(drop)
    }

    /// Places a marker in the stream.
    ///
    /// The marker is forwarded to the router as metadata. An end-of-segment
    /// marker moves the stream to [`StreamState::Eos`] and tells the owning
    /// sink, which stops the clock once every stream has ended. A tick value
    /// is forwarded with the start time offset subtracted (floored at zero).
    ///
    /// # Errors
    ///
    /// - [`Error::ShutDown`] after [`Self::shutdown`]
    /// - [`Error::InvalidState`] while the stream is stopped or paused
    pub fn place_marker(&self, marker: MarkerType, context: Option<Ticks>) -> Result<()> {
        let (router, owner, metadata) = {
            let mut inner = self.lock()?;
            self.ensure_live()?;
            let state = self.state();
            if matches!(state, StreamState::Stopped | StreamState::Paused) {
                return Err(Error::InvalidState(format!(
                    "stream {} is {:?}",
                    self.stream_id, state
                )));
            }

            let mut context = context;
            match marker {
                MarkerType::EndOfSegment => self.set_state(StreamState::Eos),
                MarkerType::Tick => {
                    if let Some(value) = context {
                        if inner.start_time_offset.is_none() {
                            let clock_start = inner.clock_start.unwrap_or(0);
                            if value >= clock_start {
                                inner.start_time_offset = Some(value - clock_start);
                            }
                        }
                        // Tick values are rebased like sample times.
                        if let Some(offset) = inner.start_time_offset {
                            context = Some((value - offset).max(0));
                        }
                    }
                }
                MarkerType::Default | MarkerType::Event => {}
            }
            inner.emit(StreamEvent::MarkerPlaced(context));

            let mut metadata = PropertySet::default();
            metadata.insert(properties::MARKER_TYPE, marker.as_str());
            if let Some(value) = context {
                metadata.insert(properties::MARKER_VALUE, value);
            }
            metadata.insert(properties::STREAM_ID, self.stream_id);

            let owner = match marker {
                MarkerType::EndOfSegment => inner.owner.clone(),
                _ => None,
            };
            (inner.router.clone(), owner, metadata)
        };

        if let Some(router) = router
            && let Err(e) = router.submit_metadata(metadata)
        {
            debug!("Stream {} marker not forwarded: {}", self.stream_id, e);
        }
        if let Some(owner) = owner.and_then(|owner| owner.upgrade())
            && let Err(e) = owner.on_end_of_stream()
        {
            debug!("Stream {} end of stream not propagated: {}", self.stream_id, e);
        }
        Ok(())
    }

    /// Accepted for completeness; the endpoint holds no queued samples.
    pub fn flush(&self) -> Result<()> {
        let _inner = self.lock()?;
        self.ensure_live()
    }

    /// Shuts the stream down. Calling it again is a no-op.
    ///
    /// Releases the format, the owner, the router, and the event queue.
    /// Credits still in flight are ignored when they come back.
    pub fn shutdown(&self) -> Result<()> {
        let router = {
            let mut inner = self.lock()?;
            if self.state() == StreamState::Shutdown {
                return Ok(());
            }
            self.set_state(StreamState::Shutdown);
            inner.generation += 1;
            inner.credits = 0;
            inner.in_flight = 0;
            inner.clock_start = None;
            inner.start_time_offset = None;
            inner.last_ordering_time = None;
            inner.descriptor = None;
            inner.owner = None;
            inner.events = None;
            inner.router.take()
        };
        // The last router reference joins the dispatch worker, which may be
        // returning a credit to this endpoint.
        drop(router);
        debug!("Stream {} shut down", self.stream_id);
        Ok(())
    }

    /// The stream's current format.
    pub fn current_media_type(&self) -> Result<Arc<MediaDescriptor>> {
        let inner = self.lock()?;
        self.ensure_live()?;
        inner.descriptor.clone().ok_or(Error::ShutDown)
    }

    /// Replaces the format with a compatible one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMediaType`] if the major type or subtype differ.
    pub fn set_current_media_type(&self, descriptor: MediaDescriptor) -> Result<()> {
        let mut inner = self.lock()?;
        self.ensure_live()?;
        let current = inner.descriptor.as_ref().ok_or(Error::ShutDown)?;
        current.verify_compatible(&descriptor)?;
        inner.descriptor = Some(Arc::new(descriptor));
        inner.emit(StreamEvent::FormatChanged);
        Ok(())
    }

    /// True if `descriptor` matches the stream's major type and subtype.
    pub fn is_media_type_supported(&self, descriptor: &MediaDescriptor) -> Result<bool> {
        let inner = self.lock()?;
        self.ensure_live()?;
        let current = inner.descriptor.as_ref().ok_or(Error::ShutDown)?;
        Ok(current.verify_compatible(descriptor).is_ok())
    }

    /// Number of supported formats. Always one.
    pub fn media_type_count(&self) -> Result<usize> {
        self.ensure_live()?;
        Ok(1)
    }

    /// Supported format at `index`; only index zero exists.
    pub fn media_type_by_index(&self, index: usize) -> Result<Arc<MediaDescriptor>> {
        if index != 0 {
            self.ensure_live()?;
            return Err(Error::InvalidIndex(index));
        }
        self.current_media_type()
    }

    /// Major kind of the stream's format.
    pub fn major_kind(&self) -> Result<MediaKind> {
        self.ensure_live()?;
        Ok(self.kind)
    }

    /// Waits up to `timeout` for the next producer notification.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if nothing arrived in time
    /// - [`Error::ShutDown`] once the stream is shut down and drained
    pub fn next_event(&self, timeout: Duration) -> Result<StreamEvent> {
        self.events.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout,
            RecvTimeoutError::Disconnected => Error::ShutDown,
        })
    }

    /// Returns the next producer notification if one is queued.
    pub fn try_next_event(&self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    pub(crate) fn set_router(&self, router: Option<Arc<PayloadRouter>>) -> Result<()> {
        let previous = {
            let mut inner = self.lock()?;
            self.ensure_live()?;
            std::mem::replace(&mut inner.router, router)
        };
        drop(previous);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, EndpointInner>> {
        self.inner.lock().map_err(|_| Error::poisoned("stream endpoint"))
    }

    fn ensure_live(&self) -> Result<()> {
        match self.state() {
            StreamState::Shutdown => Err(Error::ShutDown),
            _ => Ok(()),
        }
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn mark_discontinuity(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.pending_discontinuity = true;
        }
    }

    /// Tops credits up to the ceiling while started, one request per credit.
    fn replenish(&self, inner: &mut EndpointInner) {
        if self.state() != StreamState::Started {
            return;
        }
        while inner.credits + inner.in_flight < self.max_outstanding {
            inner.credits += 1;
            inner.emit(StreamEvent::RequestSample);
        }
    }

    fn evaluate_drop(&self, inner: &mut EndpointInner, sample: &MediaSample) -> Result<bool> {
        if self.state() == StreamState::Eos {
            trace!("Stream {} at end of stream, dropping sample", self.stream_id);
            inner.pending_discontinuity = true;
            return Ok(true);
        }
        if inner.credits == 0 {
            inner.pending_discontinuity = true;
            return Err(Error::NotAccepting);
        }
        inner.credits -= 1;

        let presentation_time = sample.presentation_time();
        let ordering_time = sample.decode_timestamp().unwrap_or(presentation_time);
        let stale = inner
            .last_ordering_time
            .is_some_and(|last| ordering_time <= last);
        if stale || sample.total_length() == 0 {
            trace!(
                "Stream {} dropping sample at {} (last {:?}, {} bytes)",
                self.stream_id,
                ordering_time,
                inner.last_ordering_time,
                sample.total_length()
            );
            inner.pending_discontinuity = true;
            return Ok(true);
        }

        if inner.start_time_offset.is_none() {
            let clock_start = inner.clock_start.unwrap_or(0);
            if presentation_time < clock_start {
                trace!(
                    "Stream {} dropping sample at {} before clock start {}",
                    self.stream_id, presentation_time, clock_start
                );
                inner.pending_discontinuity = true;
                return Ok(true);
            }
            inner.start_time_offset = Some(presentation_time - clock_start);
        }
        inner.last_ordering_time = Some(ordering_time);
        Ok(false)
    }
}

impl CreditSink for StreamEndpoint {
    fn return_credit(&self, generation: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.generation != generation {
            trace!("Stream {} ignoring credit from an earlier start", self.stream_id);
            return;
        }
        inner.in_flight = inner.in_flight.saturating_sub(1);
        self.replenish(&mut inner);
    }
}

impl std::fmt::Debug for StreamEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEndpoint")
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! The media sink: a set of stream endpoints under one presentation clock.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info, warn};

use crate::{
    Error, PayloadRouter, Result,
    config::PipelineConfig,
    media::{
        descriptor::{EncodingProfile, MediaDescriptor},
        sample::Ticks,
    },
    stream::{StreamEndpoint, StreamOwner, StreamState},
};

/// State of a presentation clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockState {
    /// The clock has no time source or was torn down.
    Invalid,
    /// Running.
    Running,
    /// Stopped.
    Stopped,
    /// Paused.
    Paused,
}

/// The clock driving a sink.
pub trait PresentationClock: Send + Sync {
    /// Current clock state.
    fn state(&self) -> ClockState;

    /// Stops the clock.
    fn stop(&self) -> Result<()>;
}

/// Lifecycle state of a [`SinkAggregate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkState {
    /// Created, clock never started.
    Ready,
    /// Clock running.
    Started,
    /// Clock stopped.
    Stopped,
    /// Clock paused.
    Paused,
    /// Terminal.
    Shutdown,
}

/// Static properties of a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkCharacteristics {
    /// The sink does not pace samples to the clock rate.
    pub rateless: bool,
    /// The producer may not add or remove streams on its own.
    pub fixed_streams: bool,
}

struct SinkInner {
    state: SinkState,
    profile: EncodingProfile,
    streams: Vec<Arc<StreamEndpoint>>,
    clock: Option<Arc<dyn PresentationClock>>,
    router: Option<Arc<PayloadRouter>>,
    profile_announced: bool,
}

/// Owns the stream endpoints of one capture session.
///
/// Clock transitions are fanned out to every endpoint, end of stream is
/// fanned in from them. Endpoints are kept sorted by stream id.
///
/// # Examples
///
/// ```
/// use capture_media::{
///     SinkAggregate,
///     config::PipelineConfig,
///     media::descriptor::{AudioFormat, EncodingProfile, VideoFormat},
/// };
///
/// # fn main() -> Result<(), capture_media::Error> {
/// let profile = EncodingProfile {
///     audio: Some(AudioFormat::float_stereo()),
///     video: Some(VideoFormat::bgra8(1280, 720)),
///     container: None,
/// };
/// let sink = SinkAggregate::new(profile, PipelineConfig::default())?;
///
/// assert_eq!(sink.stream_count()?, 2);
/// sink.on_clock_start(0)?;
/// sink.shutdown()?;
/// # Ok(())
/// # }
/// ```
pub struct SinkAggregate {
    config: PipelineConfig,
    self_ref: Weak<SinkAggregate>,
    inner: Mutex<SinkInner>,
}

impl SinkAggregate {
    /// Creates one endpoint per stream of `profile`.
    ///
    /// With both audio and video, audio gets id 0 and video id 1; a single
    /// stream gets id 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the configuration is invalid or
    /// the profile has no stream.
    pub fn new(profile: EncodingProfile, config: PipelineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let descriptors = profile.stream_descriptors();
        if descriptors.is_empty() {
            return Err(Error::InvalidArgument(
                "encoding profile has no audio or video stream".to_string(),
            ));
        }

        Ok(Arc::new_cyclic(|self_ref: &Weak<SinkAggregate>| {
            let owner: Weak<dyn StreamOwner> = self_ref.clone();
            let streams = descriptors
                .into_iter()
                .zip(0u32..)
                .map(|(descriptor, stream_id)| {
                    StreamEndpoint::with_owner(stream_id, descriptor, &config, owner.clone())
                })
                .collect();
            debug!("Sink created for profile {:?}", profile);

            Self {
                self_ref: self_ref.clone(),
                inner: Mutex::new(SinkInner {
                    state: SinkState::Ready,
                    profile,
                    streams,
                    clock: None,
                    router: None,
                    profile_announced: false,
                }),
                config,
            }
        }))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SinkState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(SinkState::Shutdown)
    }

    /// Static sink properties.
    pub fn characteristics(&self) -> Result<SinkCharacteristics> {
        self.lock_live()?;
        Ok(SinkCharacteristics {
            rateless: true,
            fixed_streams: true,
        })
    }

    /// Adds an endpoint under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] if `stream_id` is taken.
    pub fn add_stream(&self, stream_id: u32, descriptor: MediaDescriptor) -> Result<Arc<StreamEndpoint>> {
        let mut inner = self.lock_live()?;
        let position = match inner
            .streams
            .binary_search_by_key(&stream_id, |stream| stream.stream_id())
        {
            Ok(_) => return Err(Error::AlreadyExists(stream_id)),
            Err(position) => position,
        };

        let owner: Weak<dyn StreamOwner> = self.self_ref.clone();
        let stream = StreamEndpoint::with_owner(stream_id, descriptor, &self.config, owner);
        stream.set_router(inner.router.clone())?;
        inner.streams.insert(position, stream.clone());
        debug!("Added stream {}", stream_id);
        Ok(stream)
    }

    /// Shuts down and removes the endpoint with `stream_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStreamNumber`] if no such stream exists.
    pub fn remove_stream(&self, stream_id: u32) -> Result<()> {
        let removed = {
            let mut inner = self.lock_live()?;
            let position = inner
                .streams
                .iter()
                .position(|stream| stream.stream_id() == stream_id)
                .ok_or(Error::InvalidStreamNumber(stream_id))?;
            inner.streams.remove(position)
        };
        removed.shutdown()?;
        debug!("Removed stream {}", stream_id);
        Ok(())
    }

    /// Number of endpoints.
    pub fn stream_count(&self) -> Result<usize> {
        Ok(self.lock_live()?.streams.len())
    }

    /// Endpoint at `index` in stream-id order.
    pub fn stream_by_index(&self, index: usize) -> Result<Arc<StreamEndpoint>> {
        self.lock_live()?
            .streams
            .get(index)
            .cloned()
            .ok_or(Error::InvalidIndex(index))
    }

    /// Endpoint with `stream_id`.
    pub fn stream_by_id(&self, stream_id: u32) -> Result<Arc<StreamEndpoint>> {
        self.lock_live()?
            .streams
            .iter()
            .find(|stream| stream.stream_id() == stream_id)
            .cloned()
            .ok_or(Error::InvalidStreamNumber(stream_id))
    }

    /// Attaches or detaches the presentation clock.
    pub fn set_presentation_clock(&self, clock: Option<Arc<dyn PresentationClock>>) -> Result<()> {
        self.lock_live()?.clock = clock;
        Ok(())
    }

    /// The attached presentation clock.
    pub fn presentation_clock(&self) -> Result<Option<Arc<dyn PresentationClock>>> {
        Ok(self.lock_live()?.clock.clone())
    }

    /// Stores `router` and pushes it down to every endpoint.
    ///
    /// Samples dropped for lack of a router are not replayed.
    pub fn set_router(&self, router: Option<Arc<PayloadRouter>>) -> Result<()> {
        let (streams, previous) = {
            let mut inner = self.lock_live()?;
            let previous = std::mem::replace(&mut inner.router, router.clone());
            (inner.streams.clone(), previous)
        };
        for stream in &streams {
            stream.set_router(router.clone())?;
        }
        drop(previous);
        Ok(())
    }

    /// The attached router.
    pub fn router(&self) -> Result<Option<Arc<PayloadRouter>>> {
        Ok(self.lock_live()?.router.clone())
    }

    /// Starts every endpoint at `clock_offset`.
    ///
    /// The first start also announces the encoding profile to the router.
    pub fn on_clock_start(&self, clock_offset: Ticks) -> Result<()> {
        let streams = self.transition(SinkState::Started)?;
        for stream in &streams {
            stream.start(clock_offset)?;
        }
        self.announce_profile()
    }

    /// Stops every endpoint.
    pub fn on_clock_stop(&self) -> Result<()> {
        for stream in &self.transition(SinkState::Stopped)? {
            stream.stop()?;
        }
        Ok(())
    }

    /// Pauses every endpoint.
    pub fn on_clock_pause(&self) -> Result<()> {
        for stream in &self.transition(SinkState::Paused)? {
            stream.pause()?;
        }
        Ok(())
    }

    /// Resumes every endpoint.
    pub fn on_clock_restart(&self) -> Result<()> {
        for stream in &self.transition(SinkState::Started)? {
            stream.restart()?;
        }
        Ok(())
    }

    /// Rate changes are accepted and ignored; the sink is rateless.
    pub fn on_clock_set_rate(&self, rate: f32) -> Result<()> {
        self.lock_live()?;
        debug!("Clock rate set to {}", rate);
        Ok(())
    }

    /// Stops the presentation clock once every endpoint reached end of stream.
    ///
    /// Errors from the clock are logged and ignored.
    pub fn on_end_of_stream(&self) -> Result<()> {
        let (streams, clock) = {
            let inner = self.lock_live()?;
            (inner.streams.clone(), inner.clock.clone())
        };
        if streams.is_empty() || streams.iter().any(|stream| stream.state() != StreamState::Eos) {
            return Ok(());
        }

        info!("All {} streams reached end of stream", streams.len());
        if let Some(clock) = clock
            && clock.state() != ClockState::Invalid
            && let Err(e) = clock.stop()
        {
            warn!("Failed to stop presentation clock: {}", e);
        }
        Ok(())
    }

    /// Shuts down every endpoint and releases the clock and router.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        let (streams, clock, router) = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| Error::poisoned("sink aggregate"))?;
            if inner.state == SinkState::Shutdown {
                return Ok(());
            }
            inner.state = SinkState::Shutdown;
            (
                std::mem::take(&mut inner.streams),
                inner.clock.take(),
                inner.router.take(),
            )
        };

        for stream in &streams {
            if let Err(e) = stream.shutdown() {
                warn!("Stream {} failed to shut down: {}", stream.stream_id(), e);
            }
        }
        drop(clock);
        drop(router);
        debug!("Sink shut down");
        Ok(())
    }

    fn lock_live(&self) -> Result<MutexGuard<'_, SinkInner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::poisoned("sink aggregate"))?;
        if inner.state == SinkState::Shutdown {
            return Err(Error::ShutDown);
        }
        Ok(inner)
    }

    /// Records `state` and returns the endpoints to fan out to.
    fn transition(&self, state: SinkState) -> Result<Vec<Arc<StreamEndpoint>>> {
        let mut inner = self.lock_live()?;
        debug!("Sink {:?} -> {:?}", inner.state, state);
        inner.state = state;
        Ok(inner.streams.clone())
    }

    fn announce_profile(&self) -> Result<()> {
        let (router, profile) = {
            let inner = self.lock_live()?;
            if inner.profile_announced {
                return Ok(());
            }
            (inner.router.clone(), inner.profile.clone())
        };
        let Some(router) = router else {
            return Ok(());
        };

        match router.submit_profile(profile) {
            Ok(()) => self.lock_live()?.profile_announced = true,
            Err(e) => debug!("Profile not announced: {}", e),
        }
        Ok(())
    }
}

impl StreamOwner for SinkAggregate {
    fn on_end_of_stream(&self) -> Result<()> {
        SinkAggregate::on_end_of_stream(self)
    }
}

impl Drop for SinkAggregate {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Sink shutdown on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        media::descriptor::{AudioFormat, MediaKind, VideoFormat},
        stream::MarkerType,
    };

    struct CountingClock {
        state: ClockState,
        stops: AtomicUsize,
    }

    impl CountingClock {
        fn new(state: ClockState) -> Arc<Self> {
            Arc::new(Self {
                state,
                stops: AtomicUsize::new(0),
            })
        }
    }

    impl PresentationClock for CountingClock {
        fn state(&self) -> ClockState {
            self.state
        }

        fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Err(Error::Other("already stopping".to_string()))
        }
    }

    fn av_profile() -> EncodingProfile {
        EncodingProfile {
            audio: Some(AudioFormat::float_stereo()),
            video: Some(VideoFormat::bgra8(64, 32)),
            container: None,
        }
    }

    fn video_only() -> EncodingProfile {
        EncodingProfile {
            video: Some(VideoFormat::bgra8(64, 32)),
            ..Default::default()
        }
    }

    #[test]
    fn stream_ids_follow_the_profile() {
        let sink = SinkAggregate::new(av_profile(), PipelineConfig::default()).unwrap();
        assert_eq!(sink.stream_count().unwrap(), 2);
        assert_eq!(sink.stream_by_id(0).unwrap().major_kind().unwrap(), MediaKind::Audio);
        assert_eq!(sink.stream_by_id(1).unwrap().major_kind().unwrap(), MediaKind::Video);

        let single = SinkAggregate::new(video_only(), PipelineConfig::default()).unwrap();
        assert_eq!(single.stream_by_index(0).unwrap().stream_id(), 0);
        assert_eq!(single.stream_by_index(1).unwrap_err(), Error::InvalidIndex(1));
    }

    #[test]
    fn empty_profile_is_rejected() {
        let result = SinkAggregate::new(EncodingProfile::default(), PipelineConfig::default());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn streams_stay_sorted_and_unique() {
        let sink = SinkAggregate::new(video_only(), PipelineConfig::default()).unwrap();
        let descriptor = MediaDescriptor::Video(VideoFormat::bgra8(8, 8));
        sink.add_stream(7, descriptor.clone()).unwrap();
        sink.add_stream(3, descriptor.clone()).unwrap();
        assert_eq!(sink.add_stream(3, descriptor).unwrap_err(), Error::AlreadyExists(3));

        let ids: Vec<u32> = (0..sink.stream_count().unwrap())
            .map(|index| sink.stream_by_index(index).unwrap().stream_id())
            .collect();
        assert_eq!(ids, vec![0, 3, 7]);

        let removed = sink.stream_by_id(3).unwrap();
        sink.remove_stream(3).unwrap();
        assert_eq!(removed.state(), StreamState::Shutdown);
        assert_eq!(sink.remove_stream(3), Err(Error::InvalidStreamNumber(3)));
        assert_eq!(sink.stream_count().unwrap(), 2);
    }

    #[test]
    fn clock_transitions_fan_out() {
        let sink = SinkAggregate::new(av_profile(), PipelineConfig::default()).unwrap();
        let audio = sink.stream_by_id(0).unwrap();
        let video = sink.stream_by_id(1).unwrap();

        sink.on_clock_start(0).unwrap();
        assert_eq!(sink.state(), SinkState::Started);
        assert_eq!(audio.state(), StreamState::Started);
        assert_eq!(video.state(), StreamState::Started);

        sink.on_clock_pause().unwrap();
        assert_eq!(video.state(), StreamState::Paused);
        sink.on_clock_restart().unwrap();
        assert_eq!(video.state(), StreamState::Started);
        sink.on_clock_set_rate(2.0).unwrap();

        sink.on_clock_stop().unwrap();
        assert_eq!(sink.state(), SinkState::Stopped);
        assert_eq!(audio.state(), StreamState::Stopped);
    }

    #[test]
    fn clock_stops_only_when_every_stream_ended() {
        let sink = SinkAggregate::new(av_profile(), PipelineConfig::default()).unwrap();
        let clock = CountingClock::new(ClockState::Running);
        sink.set_presentation_clock(Some(clock.clone())).unwrap();
        sink.on_clock_start(0).unwrap();

        sink.stream_by_id(0)
            .unwrap()
            .place_marker(MarkerType::EndOfSegment, None)
            .unwrap();
        assert_eq!(clock.stops.load(Ordering::SeqCst), 0);

        sink.stream_by_id(1)
            .unwrap()
            .place_marker(MarkerType::EndOfSegment, None)
            .unwrap();
        assert_eq!(clock.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_clock_is_not_stopped() {
        let sink = SinkAggregate::new(video_only(), PipelineConfig::default()).unwrap();
        let clock = CountingClock::new(ClockState::Invalid);
        sink.set_presentation_clock(Some(clock.clone())).unwrap();
        sink.on_clock_start(0).unwrap();
        sink.stream_by_id(0)
            .unwrap()
            .place_marker(MarkerType::EndOfSegment, None)
            .unwrap();
        assert_eq!(clock.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn profile_is_announced_once() {
        let sink = SinkAggregate::new(video_only(), PipelineConfig::default()).unwrap();
        let router = Arc::new(PayloadRouter::new(&PipelineConfig::default()).unwrap());
        let profiles = Arc::new(AtomicUsize::new(0));
        let counter = profiles.clone();
        router.subscribe(move |event| {
            if let crate::RouterEvent::ProfileChanged(_) = event {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        sink.on_clock_start(0).unwrap();
        sink.set_router(Some(router.clone())).unwrap();
        sink.on_clock_start(0).unwrap();
        sink.on_clock_stop().unwrap();
        sink.on_clock_start(0).unwrap();
        router.close();

        assert_eq!(profiles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let sink = SinkAggregate::new(av_profile(), PipelineConfig::default()).unwrap();
        let audio = sink.stream_by_id(0).unwrap();
        sink.set_presentation_clock(Some(CountingClock::new(ClockState::Running)))
            .unwrap();

        sink.shutdown().unwrap();
        sink.shutdown().unwrap();

        assert_eq!(sink.state(), SinkState::Shutdown);
        assert_eq!(audio.state(), StreamState::Shutdown);
        assert_eq!(sink.on_clock_start(0), Err(Error::ShutDown));
        assert!(matches!(sink.stream_count(), Err(Error::ShutDown)));
        assert!(matches!(sink.presentation_clock(), Err(Error::ShutDown)));
    }
}

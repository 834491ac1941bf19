// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Capture Engine Implementation
//!
//! ## Locking
//! - `settings`: the last preview request
//! - `context`: in-flight operations and the live session. It is held only
//!   to inspect or swap entries, never across a wait, a callback, or a
//!   session teardown
//! - `media`: frame handling state, locked by the dispatch worker for the
//!   duration of one payload
//!
//! Host callbacks are always raised with no lock held.
//!
//! ## Operations
//! Start and stop run as [`Operation`]s. A start first builds the whole
//! session in the background, then re-takes `context` to publish it. If the
//! start was cancelled or the engine shut down in between, the start tears
//! its own session down and reports nothing.

use std::sync::{
    Arc, Mutex, MutexGuard, Weak,
    atomic::{AtomicBool, Ordering},
};

use capture_media::{
    Error, PayloadRouter, Result, RouterEvent, SinkAggregate, SpatialTransformResolver,
    config::PipelineConfig,
    media::descriptor::{AudioFormat, EncodingProfile, MediaKind, VideoFormat},
    transform::CoordinateSystemRef,
};
use tracing::{debug, info, trace, warn};

use super::{
    CallbackState, CaptureEvent, StateCallback,
    operation::{CancelToken, Operation},
    render_audio, render_video,
    state::{Context, EngineDevices, LiveSession, MediaState, Settings},
};
use crate::platform::{CaptureSession, CaptureSessionFactory, DeviceResources};

/// Drives one camera preview for one host instance.
///
/// Created behind an [`Arc`]; [`CaptureEngine::shutdown`] must be called to
/// release the session and device resources.
pub struct CaptureEngine {
    self_ref: Weak<CaptureEngine>,
    config: PipelineConfig,
    callback: StateCallback,
    device_resources: Weak<dyn DeviceResources>,
    sessions: Arc<dyn CaptureSessionFactory>,
    is_shutdown: AtomicBool,
    settings: Mutex<Settings>,
    context: Mutex<Context>,
    media: Mutex<MediaState>,
}

impl CaptureEngine {
    /// Creates an engine reporting to `callback`.
    ///
    /// `device_resources` is held weakly; once the host's graphics device is
    /// gone, starting a preview fails with [`Error::NotFound`].
    pub fn new(
        config: PipelineConfig,
        device_resources: Weak<dyn DeviceResources>,
        sessions: Arc<dyn CaptureSessionFactory>,
        resolver: SpatialTransformResolver,
        callback: StateCallback,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|self_ref| CaptureEngine {
            self_ref: self_ref.clone(),
            config,
            callback,
            device_resources,
            sessions,
            is_shutdown: AtomicBool::new(false),
            settings: Mutex::new(Settings::default()),
            context: Mutex::new(Context::default()),
            media: Mutex::new(MediaState::new(resolver)),
        }))
    }

    /// The most recent preview request.
    pub fn settings(&self) -> Result<Settings> {
        Ok(*self.settings.lock().map_err(|_| poisoned("settings"))?)
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    /// Whether a preview session is live.
    pub fn is_previewing(&self) -> bool {
        self.lock_context().is_ok_and(|context| context.session.is_some())
    }

    /// Starts a preview in the background.
    ///
    /// The outcome arrives later as exactly one
    /// [`CaptureEvent::PreviewStarted`] or one [`CallbackState::Failed`]. A
    /// start cancelled by [`CaptureEngine::stop_preview`] or
    /// [`CaptureEngine::shutdown`] reports nothing.
    ///
    /// # Errors
    ///
    /// - [`Error::ShutDown`] after shutdown
    /// - [`Error::InvalidState`] while another start is in flight or a
    ///   preview is already live
    pub fn start_preview(&self, width: u32, height: u32, enable_audio: bool, enable_mrc: bool) -> Result<()> {
        self.check_shutdown()?;
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!("preview size {width}x{height}")));
        }
        let request = Settings {
            width,
            height,
            enable_audio,
            enable_mrc,
        };
        let engine = self.strong()?;

        let mut context = self.lock_context()?;
        if context.start_op.as_ref().is_some_and(Operation::is_running) {
            return Err(Error::InvalidState("preview start already in progress".to_string()));
        }
        if context.session.is_some() {
            return Err(Error::InvalidState("preview already started".to_string()));
        }
        *self.settings.lock().map_err(|_| poisoned("settings"))? = request;

        info!(
            "Starting preview {}x{} (audio: {}, effects: {})",
            width, height, enable_audio, enable_mrc
        );
        context.start_op = Some(Operation::spawn("capture-start", move |cancel| {
            engine.run_start(cancel, request)
        })?);
        Ok(())
    }

    /// Stops the preview in the background.
    ///
    /// An in-flight start is cancelled and awaited first. The outcome arrives
    /// as one [`CaptureEvent::PreviewStopped`] or one
    /// [`CallbackState::Failed`]. With nothing started this is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::ShutDown`] after shutdown
    /// - [`Error::InvalidState`] while another stop is in flight
    pub fn stop_preview(&self) -> Result<()> {
        self.check_shutdown()?;
        let engine = self.strong()?;

        let mut context = self.lock_context()?;
        if context.stop_op.as_ref().is_some_and(Operation::is_running) {
            return Err(Error::InvalidState("preview stop already in progress".to_string()));
        }
        let pending_start = context
            .start_op
            .take()
            .filter(Operation::is_running);
        if pending_start.is_none() && context.session.is_none() {
            debug!("Stop requested with no preview running");
            return Ok(());
        }

        info!("Stopping preview");
        context.stop_op = Some(Operation::spawn("capture-stop", move |cancel| {
            engine.run_stop(cancel, pending_start)
        })?);
        Ok(())
    }

    /// Sets or clears the coordinate system camera matrices are expressed
    /// in. Without one, video frames carry no transform.
    pub fn set_coordinate_system(&self, coordinate_system: Option<CoordinateSystemRef>) -> Result<()> {
        let mut media = self.media.lock().map_err(|_| poisoned("media state"))?;
        if media.coordinate_system != coordinate_system {
            debug!("Application coordinate system set to {:?}", coordinate_system);
            media.coordinate_system = coordinate_system;
        }
        Ok(())
    }

    pub fn coordinate_system(&self) -> Result<Option<CoordinateSystemRef>> {
        Ok(self.media.lock().map_err(|_| poisoned("media state"))?.coordinate_system)
    }

    /// Render thread notification. Frames are copied on arrival, so there is
    /// nothing to do here.
    pub fn on_render_event(&self, frame_id: u16) {
        trace!("Render event for frame {}", frame_id);
    }

    /// Cancels pending operations, stops a live preview and releases device
    /// resources.
    ///
    /// Every wait is bounded by the configured shutdown timeout; a wait that
    /// times out is logged and resources are released regardless. Calling
    /// it again is a no-op.
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down capture engine");
        let timeout = self.config.shutdown_timeout();

        let (start_op, stop_op, session) = match self.context.lock() {
            Ok(mut context) => (
                context.start_op.take(),
                context.stop_op.take(),
                context.session.take(),
            ),
            Err(_) => {
                warn!("Capture context lock poisoned during shutdown");
                (None, None, None)
            }
        };

        for mut operation in [start_op, stop_op].into_iter().flatten() {
            operation.cancel();
            if let Err(e) = operation.wait(timeout) {
                warn!("{:?} did not finish during shutdown: {}", operation, e);
            }
        }

        if let Some(session) = session {
            let stop = Operation::spawn("capture-shutdown", move |_| {
                if let Err(e) = session.teardown() {
                    warn!("Preview stop failed during shutdown: {}", e);
                }
            });
            match stop {
                Ok(mut stop) => {
                    if let Err(e) = stop.wait(timeout) {
                        warn!("Preview stop did not finish during shutdown: {}", e);
                    }
                }
                Err(e) => warn!("Could not stop preview during shutdown: {}", e),
            }
        }

        match self.media.lock() {
            Ok(mut media) => media.release_devices(),
            Err(_) => warn!("Media state lock poisoned, device resources leaked"),
        }
    }

    fn run_start(&self, cancel: CancelToken, request: Settings) {
        let result = self.build_session(&cancel, request);

        let session = match result {
            Ok(session) => session,
            Err(_) if cancel.is_canceled() => {
                debug!("Preview start cancelled");
                return;
            }
            Err(e) => {
                warn!("Preview start failed: {}", e);
                self.notify(CallbackState::Failed { code: e.code() });
                return;
            }
        };

        // Publish unless shutdown or a stop overtook this start.
        let rejected = match self.context.lock() {
            Ok(mut context) if !cancel.is_canceled() && !self.is_shutdown() => {
                context.session = Some(session);
                None
            }
            _ => Some(session),
        };
        if let Some(session) = rejected {
            debug!("Preview start superseded, releasing its session");
            if let Err(e) = session.teardown() {
                warn!("Releasing superseded preview failed: {}", e);
            }
            return;
        }

        info!("Preview started");
        self.notify(CallbackState::Capture(CaptureEvent::PreviewStarted));
    }

    /// Background phase of a start: opens the camera and wires it to a new
    /// sink and router.
    fn build_session(&self, cancel: &CancelToken, request: Settings) -> Result<LiveSession> {
        cancel.check()?;
        let devices = self.ensure_devices()?;

        let session = self
            .sessions
            .create_session(devices.manager.clone(), request.enable_audio)?;
        match self.wire_session(cancel, request, session.clone()) {
            Ok(live) => Ok(live),
            Err(e) => {
                session.close();
                Err(e)
            }
        }
    }

    fn wire_session(
        &self,
        cancel: &CancelToken,
        request: Settings,
        session: Arc<dyn CaptureSession>,
    ) -> Result<LiveSession> {
        cancel.check()?;
        let (width, height) = session.configure_preview(request.width, request.height)?;
        debug!("Capture device negotiated {}x{}", width, height);

        let profile = EncodingProfile {
            audio: request.enable_audio.then(AudioFormat::float_stereo),
            video: Some(VideoFormat::bgra8(width, height)),
            container: None,
        };
        let sink = SinkAggregate::new(profile.clone(), self.config.clone())?;
        let router = Arc::new(PayloadRouter::new(&self.config)?);

        let engine = self.self_ref.clone();
        let token = router.subscribe(move |event| {
            if let RouterEvent::PayloadReceived(envelope) = event
                && let Some(engine) = engine.upgrade()
            {
                engine.on_payload(envelope);
            }
        });

        let mut live = LiveSession {
            session: session.clone(),
            sink: sink.clone(),
            router: router.clone(),
            token,
            started: false,
        };
        let result = (|| -> Result<()> {
            sink.set_router(Some(router))?;

            if request.enable_mrc
                && let Err(e) = session.add_effects(request.enable_audio)
            {
                warn!("Failed to add capture effects: {}", e);
            }

            cancel.check()?;
            session.start_preview(&profile, sink.clone())?;
            live.started = true;

            let engine = self.self_ref.clone();
            session.set_failed_handler(Some(Box::new(move |code, message| {
                if let Some(engine) = engine.upgrade() {
                    engine.on_session_failed(code, message);
                }
            })));
            Ok(())
        })();

        match result {
            Ok(()) => Ok(live),
            Err(e) => {
                // The caller closes the session.
                live.session.set_failed_handler(None);
                if live.started
                    && let Err(stop) = live.session.stop_preview()
                {
                    warn!("Failed to stop partially started preview: {}", stop);
                }
                if let Err(detach) = live.sink.set_router(None) {
                    warn!("Failed to detach router from sink: {}", detach);
                }
                live.router.close();
                if let Err(shutdown) = live.sink.shutdown() {
                    warn!("Failed to shut down sink: {}", shutdown);
                }
                Err(e)
            }
        }
    }

    fn run_stop(&self, cancel: CancelToken, pending_start: Option<Operation>) {
        if let Some(mut start) = pending_start {
            start.cancel();
            if let Err(e) = start.wait(self.config.shutdown_timeout()) {
                warn!("Pending preview start did not finish: {}", e);
            }
        }

        let session = match self.context.lock() {
            Ok(mut context) => context.session.take(),
            Err(_) => {
                self.notify(CallbackState::Failed {
                    code: poisoned("capture context").code(),
                });
                return;
            }
        };
        let result = session.map_or(Ok(()), LiveSession::teardown);

        if cancel.is_canceled() {
            return;
        }
        match result {
            Ok(()) => {
                info!("Preview stopped");
                self.notify(CallbackState::Capture(CaptureEvent::PreviewStopped));
            }
            Err(e) => {
                warn!("Preview stop failed: {}", e);
                self.notify(CallbackState::Failed { code: e.code() });
            }
        }
    }

    /// Creates the engine's media device on first use.
    fn ensure_devices(&self) -> Result<EngineDevices> {
        let mut media = self.media.lock().map_err(|_| poisoned("media state"))?;
        if let Some(devices) = &media.devices {
            return Ok(devices.clone());
        }

        let resources = self
            .device_resources
            .upgrade()
            .ok_or_else(|| Error::NotFound("graphics device resources".to_string()))?;
        let devices = EngineDevices {
            render_device: resources.render_device(),
            manager: resources.create_device_manager()?,
        };
        media.devices = Some(devices.clone());
        Ok(devices)
    }

    /// Dispatch worker entry for every payload of the live session.
    fn on_payload(&self, envelope: &capture_media::PayloadEnvelope) {
        let callback = {
            let Ok(mut media) = self.media.lock() else {
                warn!("Media state lock poisoned, payload dropped");
                return;
            };
            match envelope.kind() {
                MediaKind::Audio => render_audio::audio(&mut media, envelope).map(Some),
                MediaKind::Video => render_video::video(&mut media, envelope),
                other => {
                    trace!("Ignoring {:?} payload", other);
                    Ok(None)
                }
            }
        };

        match callback {
            Ok(Some(state)) => self.notify(state),
            Ok(None) => {}
            Err(e) => warn!(
                "Failed to handle {:?} payload at {}: {}",
                envelope.kind(),
                envelope.timestamp(),
                e
            ),
        }
    }

    fn on_session_failed(&self, code: i32, message: &str) {
        let error = Error::from_status(code)
            .err()
            .unwrap_or_else(|| Error::Other(format!("session failed with status {code:#x}")));
        warn!("Capture session failed ({}): {}", error, message);
        self.notify(CallbackState::Failed { code: error.code() });
    }

    fn notify(&self, state: CallbackState) {
        (self.callback)(state);
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    fn strong(&self) -> Result<Arc<CaptureEngine>> {
        self.self_ref.upgrade().ok_or(Error::ShutDown)
    }

    fn lock_context(&self) -> Result<MutexGuard<'_, Context>> {
        self.context.lock().map_err(|_| poisoned("capture context"))
    }
}

impl std::fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("is_shutdown", &self.is_shutdown())
            .field("is_previewing", &self.is_previewing())
            .finish()
    }
}

fn poisoned(what: &str) -> Error {
    Error::Other(format!("{what} lock poisoned"))
}

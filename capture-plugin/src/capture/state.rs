// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! State Management for the Capture Engine
//!
//! ## Key Types
//! - `Settings`: The most recent preview request (size, audio, effects)
//! - `Context`: In-flight operations and the live session, guarded by the
//!   engine's operation lock
//! - `LiveSession`: Everything a running preview owns, torn down as a unit
//! - `MediaState`: Frame handling state touched from the dispatch worker

use std::sync::Arc;

use capture_media::{
    PayloadRouter, Result, SinkAggregate, SpatialTransformResolver, SubscriptionToken,
    media::sample::MediaSample,
    texture::{DeviceManager, FrameBufferCache, RenderDevice},
    transform::CoordinateSystemRef,
};
use tracing::warn;

use super::operation::Operation;
use crate::platform::CaptureSession;

/// Default requested preview width.
pub const DEFAULT_WIDTH: u32 = 1280;

/// Default requested preview height.
pub const DEFAULT_HEIGHT: u32 = 720;

/// Default for capturing audio alongside video.
pub const DEFAULT_ENABLE_AUDIO: bool = false;

/// Default for attaching mixed reality capture effects.
pub const DEFAULT_ENABLE_MRC: bool = false;

/// Preview request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Requested preview width; the device may pick a close match.
    pub width: u32,

    /// Requested preview height.
    pub height: u32,

    pub enable_audio: bool,

    pub enable_mrc: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            enable_audio: DEFAULT_ENABLE_AUDIO,
            enable_mrc: DEFAULT_ENABLE_MRC,
        }
    }
}

/// Operation bookkeeping. Only ever locked briefly; never held across a wait.
#[derive(Default)]
pub(crate) struct Context {
    pub start_op: Option<Operation>,
    pub stop_op: Option<Operation>,
    pub session: Option<LiveSession>,
}

/// A running preview.
pub(crate) struct LiveSession {
    pub session: Arc<dyn CaptureSession>,
    pub sink: Arc<SinkAggregate>,
    pub router: Arc<PayloadRouter>,
    pub token: SubscriptionToken,
    /// Set once the session delivers into the sink.
    pub started: bool,
}

impl LiveSession {
    /// Detaches the router, stops and closes the session, and shuts the
    /// sink down. Every step runs even if an earlier one failed; the first
    /// failure is returned.
    pub(crate) fn teardown(self) -> Result<()> {
        let detach = self.sink.set_router(None);
        self.router.unsubscribe(self.token);
        self.router.close();

        self.session.set_failed_handler(None);
        let stop = if self.started {
            self.session.stop_preview()
        } else {
            Ok(())
        };
        if let Err(e) = self.session.remove_effects() {
            warn!("Failed to remove capture effects: {}", e);
        }
        self.session.close();

        let shutdown = self.sink.shutdown();
        detach.and(stop).and(shutdown)
    }
}

/// Media device and manager created on the host's adapter.
#[derive(Clone)]
pub(crate) struct EngineDevices {
    pub render_device: Arc<dyn RenderDevice>,
    pub manager: Arc<dyn DeviceManager>,
}

/// Frame handling state.
pub(crate) struct MediaState {
    pub devices: Option<EngineDevices>,
    pub frames: Option<FrameBufferCache>,
    pub audio_sample: Option<MediaSample>,
    pub resolver: SpatialTransformResolver,
    pub coordinate_system: Option<CoordinateSystemRef>,
}

impl MediaState {
    pub(crate) fn new(resolver: SpatialTransformResolver) -> Self {
        Self {
            devices: None,
            frames: None,
            audio_sample: None,
            resolver,
            coordinate_system: None,
        }
    }

    /// Drops the frame buffer, the audio sample and the media device.
    pub(crate) fn release_devices(&mut self) {
        if let Some(mut frames) = self.frames.take() {
            frames.reset();
        }
        self.audio_sample = None;
        self.devices = None;
        self.resolver.reset();
    }
}

// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Capture Engine
//!
//! One capture engine exists per host instance. It opens a camera through the
//! embedder's [`crate::platform::CaptureSession`], feeds the session into a
//! [`capture_media::SinkAggregate`] and turns the payloads that come out of
//! the router into host callbacks.
//!
//! ## Responsibilities
//! - Start and stop preview as background operations, reporting exactly one
//!   outcome per request
//! - Copy audio payloads into a reusable sample
//! - Copy video payloads into a shared texture and attach camera matrices
//!   when the application supplied a coordinate system
//! - Release every device resource on shutdown, even when a stop stalls
//!
//! ## Callbacks
//! Outcomes are reported as [`CallbackState`] values. The export layer
//! converts them to the host's packed [`capture_sys::CallbackState`].

use std::{ffi::c_void, sync::Arc};

use capture_media::{CameraTransform, texture::ShaderViewHandle, transform::Float4x4};
use capture_sys as sys;

/// Core implementation (operations, session lifecycle, frame handling)
mod imp;

/// Background operations with cancellation and bounded waits
mod operation;

/// Audio payload handling
mod render_audio;

/// Video payload handling
mod render_video;

/// Settings, operation context and per-session state
mod state;


pub use imp::CaptureEngine;
pub use state::{DEFAULT_ENABLE_AUDIO, DEFAULT_ENABLE_MRC, DEFAULT_HEIGHT, DEFAULT_WIDTH, Settings};

/// Receives every state change of one engine.
pub type StateCallback = Arc<dyn Fn(CallbackState) + Send + Sync>;

/// What an engine reports to its host.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CallbackState {
    /// An operation or the capture session failed.
    Failed {
        /// Host status code of the failure.
        code: i32,
    },
    /// A capture state change or a new frame.
    Capture(CaptureEvent),
}

/// Capture state changes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CaptureEvent {
    PreviewStarted,
    PreviewStopped,
    /// An audio frame was copied into the engine's audio sample.
    AudioFrame,
    /// The shared texture changed, or new camera matrices are available.
    VideoFrame {
        width: u32,
        height: u32,
        /// Shader view of the shared texture.
        texture: Option<ShaderViewHandle>,
        /// Camera pose and projection for this frame.
        transform: Option<CameraTransform>,
    },
}

fn to_sys_matrix(matrix: &Float4x4) -> sys::Float4x4 {
    sys::Float4x4 { m: matrix.m }
}

impl From<&CallbackState> for sys::CallbackState {
    fn from(state: &CallbackState) -> Self {
        let event = match state {
            CallbackState::Failed { code } => return sys::CallbackState::failed(*code),
            CallbackState::Capture(event) => event,
        };
        let capture = match event {
            CaptureEvent::PreviewStarted => sys::CaptureState {
                state_type: sys::CaptureStateType::PreviewStarted,
                ..Default::default()
            },
            CaptureEvent::PreviewStopped => sys::CaptureState {
                state_type: sys::CaptureStateType::PreviewStopped,
                ..Default::default()
            },
            CaptureEvent::AudioFrame => sys::CaptureState {
                state_type: sys::CaptureStateType::PreviewAudioFrame,
                ..Default::default()
            },
            CaptureEvent::VideoFrame {
                width,
                height,
                texture,
                transform,
            } => {
                let mut capture = sys::CaptureState {
                    state_type: sys::CaptureStateType::PreviewVideoFrame,
                    width: *width as i32,
                    height: *height as i32,
                    texture_ptr: texture.map_or(std::ptr::null_mut(), |view| view.0 as usize as *mut c_void),
                    ..Default::default()
                };
                if let Some(transform) = transform {
                    capture.world_matrix = to_sys_matrix(&transform.camera_to_world);
                    capture.projection_matrix = to_sys_matrix(&transform.projection);
                }
                capture
            }
        };
        sys::CallbackState::capture(capture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_state_carries_the_code() {
        let raw = sys::CallbackState::from(&CallbackState::Failed { code: -42 });
        assert_eq!({ raw.callback_type }, sys::CallbackType::Failed);
        assert_eq!(unsafe { raw.value.failed_state }.hresult, -42);
    }

    #[test]
    fn video_frame_exposes_texture_and_matrices() {
        let mut projection = Float4x4::IDENTITY;
        projection.m[0][0] = 2.0;
        let raw = sys::CallbackState::from(&CallbackState::Capture(CaptureEvent::VideoFrame {
            width: 1280,
            height: 720,
            texture: Some(ShaderViewHandle(0x40)),
            transform: Some(CameraTransform {
                camera_to_world: Float4x4::IDENTITY,
                projection,
            }),
        }));

        assert_eq!({ raw.callback_type }, sys::CallbackType::Capture);
        let capture = unsafe { raw.value.capture_state };
        assert_eq!(capture.state_type, sys::CaptureStateType::PreviewVideoFrame);
        assert_eq!((capture.width, capture.height), (1280, 720));
        assert_eq!(capture.texture_ptr as usize, 0x40);
        assert_eq!(capture.world_matrix, sys::Float4x4::IDENTITY);
        assert_eq!(capture.projection_matrix.m[0][0], 2.0);
    }

    #[test]
    fn frame_without_transform_reports_identity() {
        let raw = sys::CallbackState::from(&CallbackState::Capture(CaptureEvent::VideoFrame {
            width: 2,
            height: 2,
            texture: None,
            transform: None,
        }));
        let capture = unsafe { raw.value.capture_state };
        assert!(capture.texture_ptr.is_null());
        assert_eq!(capture.projection_matrix, sys::Float4x4::IDENTITY);
    }
}

// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! # capture-sys: Raw host ABI of the capture bridge plugin
//!
//! Plain `#[repr(C)]` types exchanged with the host engine across the
//! plugin's `extern "C"` surface. The layouts match the host's C headers
//! byte for byte.
//!
//! ## Usage
//!
//! **Most users should NOT use this crate directly.** The `capture-plugin`
//! crate builds these values from safe Rust types at the export boundary.
//!
//! ## Safety
//!
//! - [`CallbackState::value`] is a union; read only the member selected by
//!   [`CallbackState::callback_type`]
//! - [`CaptureState::texture_ptr`] is a shader resource view owned by the
//!   plugin and valid until the next video frame callback of the same
//!   instance
//! - Callbacks may be invoked from plugin worker threads

use std::ffi::c_void;

/// Handle of a plugin instance as seen by the host.
pub type InstanceHandle = i32;

/// Never handed out; returned alongside failures.
pub const INSTANCE_HANDLE_INVALID: InstanceHandle = 0x0bad;

/// First handle a freshly loaded plugin hands out.
pub const INSTANCE_HANDLE_START: InstanceHandle = 0x0bae;

/// Success status for `i32` returning exports.
pub const S_OK: i32 = 0;

/// Status returned for invalid arguments, including a null user pointer.
pub const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;

/// Discriminates the members of [`CallbackValue`].
#[repr(i32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CallbackType {
    #[default]
    None = 0,
    Failed = 1,
    Capture = 2,
}

/// Payload of a [`CallbackType::Failed`] callback.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FailedState {
    /// Host status code of the failure.
    pub hresult: i32,
}

/// Kind of a [`CallbackType::Capture`] callback.
#[repr(i32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureStateType {
    #[default]
    None = 0,
    PreviewStarted = 1,
    PreviewStopped = 2,
    PreviewAudioFrame = 3,
    PreviewVideoFrame = 4,
}

/// Row-major 4x4 matrix with the host's numerics layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Float4x4 {
    pub m: [[f32; 4]; 4],
}

impl Float4x4 {
    pub const IDENTITY: Float4x4 = Float4x4 {
        m: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };
}

/// Payload of a [`CallbackType::Capture`] callback.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureState {
    pub state_type: CaptureStateType,
    pub width: i32,
    pub height: i32,
    pub texture_ptr: *mut c_void,
    pub world_matrix: Float4x4,
    pub projection_matrix: Float4x4,
}

impl Default for CaptureState {
    fn default() -> Self {
        CaptureState {
            state_type: CaptureStateType::None,
            width: 0,
            height: 0,
            texture_ptr: std::ptr::null_mut(),
            world_matrix: Float4x4::IDENTITY,
            projection_matrix: Float4x4::IDENTITY,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union CallbackValue {
    pub failed_state: FailedState,
    pub capture_state: CaptureState,
}

/// Argument of [`StateChangedCallback`].
#[repr(C, packed(4))]
#[derive(Clone, Copy)]
pub struct CallbackState {
    pub callback_type: CallbackType,
    pub value: CallbackValue,
}

impl CallbackState {
    pub fn failed(hresult: i32) -> Self {
        CallbackState {
            callback_type: CallbackType::Failed,
            value: CallbackValue {
                failed_state: FailedState { hresult },
            },
        }
    }

    pub fn capture(state: CaptureState) -> Self {
        CallbackState {
            callback_type: CallbackType::Capture,
            value: CallbackValue {
                capture_state: state,
            },
        }
    }
}

impl std::fmt::Debug for CallbackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let callback_type = self.callback_type;
        let mut out = f.debug_struct("CallbackState");
        out.field("callback_type", &callback_type);
        // SAFETY: the member read is the one selected by `callback_type`.
        match callback_type {
            CallbackType::Failed => {
                let failed = unsafe { self.value.failed_state };
                out.field("failed_state", &failed);
            }
            CallbackType::Capture => {
                let capture = unsafe { self.value.capture_state };
                out.field("capture_state", &capture);
            }
            CallbackType::None => {}
        }
        out.finish()
    }
}

/// Host callback receiving the user pointer given to `CreateCapture`.
pub type StateChangedCallback = unsafe extern "system" fn(user_data: *mut c_void, state: CallbackState);

/// Render thread callback returned by `GetRenderEventFunc`.
pub type RenderingEvent = unsafe extern "system" fn(event_id: i32);

/// Graphics device lifecycle notification from the host.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEventType {
    Initialize = 0,
    Shutdown = 1,
    BeforeReset = 2,
    AfterReset = 3,
}

impl DeviceEventType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(DeviceEventType::Initialize),
            1 => Some(DeviceEventType::Shutdown),
            2 => Some(DeviceEventType::BeforeReset),
            3 => Some(DeviceEventType::AfterReset),
            _ => None,
        }
    }
}

// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

use capture_media::{Error, PayloadEnvelope, Result, texture::FrameBufferCache};
use tracing::{debug, trace};

use super::{CallbackState, CaptureEvent, state::MediaState};

/// Copies a video payload into the shared texture.
///
/// Returns a callback when the texture was (re)allocated or camera matrices
/// were resolved for this frame, and `None` otherwise.
pub(crate) fn video(state: &mut MediaState, envelope: &PayloadEnvelope) -> Result<Option<CallbackState>> {
    let (width, height) = envelope
        .descriptor()
        .video_size()
        .ok_or(Error::InvalidMediaType)?;

    let devices = state
        .devices
        .as_ref()
        .ok_or_else(|| Error::NotFound("media device".to_string()))?;
    let frames = state
        .frames
        .get_or_insert_with(|| FrameBufferCache::new(devices.render_device.clone(), devices.manager.clone()));

    let (buffer, mut changed) = frames.ensure(width, height)?;
    buffer.copy_in(envelope.sample())?;
    if changed {
        debug!("Shared frame buffer reallocated at {}x{}", width, height);
    }

    let mut transform = None;
    if let Some(target) = state.coordinate_system {
        match state.resolver.resolve(envelope.sample(), target) {
            Ok(resolved) => {
                transform = Some(resolved);
                changed = true;
            }
            Err(e) => trace!("No camera transform for frame {}: {}", envelope.timestamp(), e),
        }
    }

    Ok(changed.then_some(CallbackState::Capture(CaptureEvent::VideoFrame {
        width,
        height,
        texture: buffer.shader_view(),
        transform,
    })))
}

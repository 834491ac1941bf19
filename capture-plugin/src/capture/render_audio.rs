// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

use capture_media::{PayloadEnvelope, Result, media::sample::MediaSample};
use tracing::trace;

use super::{CallbackState, CaptureEvent, state::MediaState};

pub(crate) fn audio(state: &mut MediaState, envelope: &PayloadEnvelope) -> Result<CallbackState> {
    let source = envelope.sample();
    let sample = state
        .audio_sample
        .get_or_insert_with(|| MediaSample::new(0, Vec::with_capacity(source.total_length())));
    sample.copy_from(source);

    trace!("Copied {} bytes of audio at {}", source.total_length(), envelope.timestamp());
    Ok(CallbackState::Capture(CaptureEvent::AudioFrame))
}

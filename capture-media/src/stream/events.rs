// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

use crate::media::sample::Ticks;

/// Lifecycle state of a [`super::StreamEndpoint`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamState {
    /// Created, never started.
    Ready = 0,
    /// Accepting samples.
    Started = 1,
    /// Stopped by the clock; rejects samples.
    Stopped = 2,
    /// Paused by the clock; rejects samples.
    Paused = 3,
    /// End of segment reached; samples are dropped silently.
    Eos = 4,
    /// Terminal.
    Shutdown = 5,
}

impl StreamState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamState::Ready,
            1 => StreamState::Started,
            2 => StreamState::Stopped,
            3 => StreamState::Paused,
            4 => StreamState::Eos,
            _ => StreamState::Shutdown,
        }
    }
}

/// Marker a producer can place in a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MarkerType {
    /// Generic marker, forwarded only.
    Default,
    /// End of the current segment. The stream moves to [`StreamState::Eos`].
    EndOfSegment,
    /// Periodic tick. Its value can establish the start time offset when no
    /// sample has done so yet.
    Tick,
    /// Application event, forwarded only.
    Event,
}

impl MarkerType {
    /// Name used in forwarded marker metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerType::Default => "default",
            MarkerType::EndOfSegment => "end-of-segment",
            MarkerType::Tick => "tick",
            MarkerType::Event => "event",
        }
    }
}

/// Notification from a stream endpoint to its producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream started or restarted.
    Started,
    /// The stream stopped.
    Stopped,
    /// The stream paused.
    Paused,
    /// The producer may deliver one more sample.
    RequestSample,
    /// A marker was processed; carries the marker's context value.
    MarkerPlaced(Option<Ticks>),
    /// The current media type changed.
    FormatChanged,
}

/// What happened to a sample handed to [`super::StreamEndpoint::accept_sample`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Wrapped in an envelope and queued for the consumer.
    Forwarded,
    /// Dropped by the admission policy.
    Dropped,
}

/// Credit accounting of a stream at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CreditUsage {
    /// Sample requests issued and not yet answered by a sample.
    pub outstanding: u32,
    /// Forwarded envelopes the consumer has not released yet.
    pub in_flight: u32,
}

impl CreditUsage {
    /// Credits currently committed, requested or in flight.
    pub fn total(&self) -> u32 {
        self.outstanding + self.in_flight
    }
}

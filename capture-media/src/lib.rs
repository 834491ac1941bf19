// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! # Capture media pipeline
//!
//! The media-sink half of the capture bridge: it receives samples pushed by a
//! platform media pipeline, decides which ones to keep, marshals them across
//! a background work queue to a consumer, and turns consumed video frames
//! into a shared GPU texture plus camera matrices.
//!
//! ## Overview
//!
//! ### Key Concepts
//!
//! - **Sink**: a [`SinkAggregate`] owning one [`StreamEndpoint`] per
//!   elementary stream and driven by the presentation clock
//! - **Credit**: permission for the producer to deliver one more sample,
//!   issued as [`StreamEvent::RequestSample`]
//! - **Envelope**: a [`PayloadEnvelope`], one accepted sample with its
//!   metadata on its way to the consumer
//! - **Router**: the [`PayloadRouter`], which runs subscribers on its
//!   [`AsyncDispatchQueue`] worker
//! - **Shared frame**: a [`texture::SharedFrameBuffer`] visible on both the
//!   render and the media device
//!
//! ## Architecture
//!
//! ```text
//! producer ──accept_sample──► StreamEndpoint ──envelope──► PayloadRouter
//!     ▲                            │                        │ (dispatch worker)
//!     └──── RequestSample ◄── credit returned ◄── envelope released
//!                                                           ▼
//!                                             subscriber: FrameBufferCache
//!                                                   + SpatialTransformResolver
//! ```
//!
//! ## Examples
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use capture_media::{
//!     PayloadRouter, RouterEvent, SinkAggregate, StreamEvent,
//!     config::PipelineConfig,
//!     media::{descriptor::{EncodingProfile, VideoFormat}, sample::MediaSample},
//! };
//!
//! # fn main() -> Result<(), capture_media::Error> {
//! let config = PipelineConfig::default();
//! let profile = EncodingProfile { video: Some(VideoFormat::bgra8(2, 2)), ..Default::default() };
//! let sink = SinkAggregate::new(profile, config.clone())?;
//! let router = Arc::new(PayloadRouter::new(&config)?);
//!
//! let frames = Arc::new(Mutex::new(Vec::new()));
//! let seen = frames.clone();
//! router.subscribe(move |event| {
//!     if let RouterEvent::PayloadReceived(envelope) = event {
//!         seen.lock().unwrap().push(envelope.timestamp());
//!     }
//! });
//! sink.set_router(Some(router.clone()))?;
//! sink.on_clock_start(0)?;
//!
//! let video = sink.stream_by_id(0)?;
//! assert_eq!(video.try_next_event(), Some(StreamEvent::Started));
//! video.accept_sample(MediaSample::new(0, vec![0; 16]))?;
//!
//! router.close();
//! assert_eq!(*frames.lock().unwrap(), vec![0]);
//! sink.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - Sinks, endpoints and routers are `Send + Sync` and shared through `Arc`
//! - Subscribers run on the dispatch worker and must not block indefinitely
//! - [`SpatialTransformResolver`] and [`texture::FrameBufferCache`] take
//!   `&mut self` and belong to the consumer

mod dispatch;
mod error;
mod payload;
mod router;
mod sink;
mod stream;

pub mod config;
pub mod media;
pub mod texture;
pub mod transform;

pub use dispatch::AsyncDispatchQueue;
pub use error::{Error, Result, STATUS_OK};
pub use payload::{CameraTransform, PayloadEnvelope};
pub use router::{DispatchItem, PayloadRouter, RouterEvent, SubscriptionToken};
pub use sink::{ClockState, PresentationClock, SinkAggregate, SinkCharacteristics, SinkState};
pub use stream::{CreditUsage, MarkerType, SampleOutcome, StreamEndpoint, StreamEvent, StreamState};
pub use transform::SpatialTransformResolver;

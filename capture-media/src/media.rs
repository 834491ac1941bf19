// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Media value types shared by every pipeline stage.
//!
//! Samples, formats and side metadata are plain owned values. A sample is
//! moved from the producer into a [`crate::PayloadEnvelope`] and from there to
//! the consumer; nothing is reference counted unless a platform seam needs
//! shared lifetime.
//!
//! # Key Types
//!
//! - [`MediaDescriptor`]: tagged format description; its variant decides the
//!   [`MediaKind`]
//! - [`EncodingProfile`]: the optional audio/video/container formats of a session
//! - [`MediaSample`]: timestamps, attributes and payload bytes of one sample
//! - [`PropertySet`]: string-keyed side metadata attached to envelopes

pub mod descriptor;
pub mod properties;
pub mod sample;

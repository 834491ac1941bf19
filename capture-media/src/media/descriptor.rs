// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Format descriptors and encoding profiles.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Well-known subtype names.
pub mod subtypes {
    /// 32-bit BGRA video, the format handed to the host renderer.
    pub const BGRA8: &str = "BGRA8";
    /// Planar 4:2:0 video as delivered by most capture devices.
    pub const NV12: &str = "NV12";
    /// 32-bit float interleaved audio.
    pub const FLOAT: &str = "Float";
    /// Integer PCM audio.
    pub const PCM: &str = "PCM";
    /// MPEG-4 container.
    pub const MPEG4: &str = "MPEG4";
}

/// Major media kind of a descriptor or envelope.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Audio samples.
    Audio,
    /// Video frames.
    Video,
    /// Container or data payloads.
    Container,
    /// Anything the pipeline does not recognise.
    Unknown,
}

/// Frame rate as a rational number.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ratio {
    /// Numerator.
    pub numerator: u32,
    /// Denominator.
    pub denominator: u32,
}

impl Default for Ratio {
    fn default() -> Self {
        Self {
            numerator: 30,
            denominator: 1,
        }
    }
}

/// Audio stream format.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    /// Subtype, for example [`subtypes::FLOAT`].
    pub subtype: String,
    /// Samples per second.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u32,
    /// Bits per sample.
    pub bits_per_sample: u32,
}

impl AudioFormat {
    /// Stereo 48 kHz float audio.
    pub fn float_stereo() -> Self {
        Self {
            subtype: subtypes::FLOAT.to_owned(),
            sample_rate: 48_000,
            channels: 2,
            bits_per_sample: 32,
        }
    }
}

/// Video stream format.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct VideoFormat {
    /// Subtype, for example [`subtypes::BGRA8`].
    pub subtype: String,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Nominal frame rate.
    #[serde(default)]
    pub frame_rate: Ratio,
}

impl VideoFormat {
    /// BGRA8 video at the given size and 30 fps.
    pub fn bgra8(width: u32, height: u32) -> Self {
        Self {
            subtype: subtypes::BGRA8.to_owned(),
            width,
            height,
            frame_rate: Ratio::default(),
        }
    }
}

/// Container format.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ContainerFormat {
    /// Subtype, for example [`subtypes::MPEG4`].
    pub subtype: String,
}

/// Description of one elementary stream's format.
///
/// The variant is the major type; [`MediaDescriptor::kind`] never needs to
/// inspect anything else.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaDescriptor {
    /// Audio stream.
    Audio(AudioFormat),
    /// Video stream.
    Video(VideoFormat),
    /// Container or data stream.
    Container(ContainerFormat),
    /// A format the pipeline passes through without interpreting.
    Unknown {
        /// Opaque subtype name.
        subtype: String,
    },
}

impl MediaDescriptor {
    /// Returns the major kind of this descriptor.
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaDescriptor::Audio(_) => MediaKind::Audio,
            MediaDescriptor::Video(_) => MediaKind::Video,
            MediaDescriptor::Container(_) => MediaKind::Container,
            MediaDescriptor::Unknown { .. } => MediaKind::Unknown,
        }
    }

    /// Returns the subtype name.
    pub fn subtype(&self) -> &str {
        match self {
            MediaDescriptor::Audio(format) => &format.subtype,
            MediaDescriptor::Video(format) => &format.subtype,
            MediaDescriptor::Container(format) => &format.subtype,
            MediaDescriptor::Unknown { subtype } => subtype,
        }
    }

    /// Returns `(width, height)` for video descriptors.
    pub fn video_size(&self) -> Option<(u32, u32)> {
        match self {
            MediaDescriptor::Video(format) => Some((format.width, format.height)),
            _ => None,
        }
    }

    /// Checks that `other` has the same major type and subtype.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMediaType`] on any mismatch.
    pub fn verify_compatible(&self, other: &MediaDescriptor) -> Result<()> {
        if self.kind() != other.kind() || !self.subtype().eq_ignore_ascii_case(other.subtype()) {
            return Err(Error::InvalidMediaType);
        }
        Ok(())
    }
}

/// The formats a capture session produces.
///
/// Each present sub-format becomes one stream of the sink.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodingProfile {
    /// Audio format, if audio is captured.
    pub audio: Option<AudioFormat>,
    /// Video format, if video is captured.
    pub video: Option<VideoFormat>,
    /// Container format; capture to a custom sink leaves this empty.
    pub container: Option<ContainerFormat>,
}

impl EncodingProfile {
    /// Returns the stream descriptors in stream-id order: audio first, then video.
    pub fn stream_descriptors(&self) -> Vec<MediaDescriptor> {
        let mut descriptors = Vec::with_capacity(2);
        if let Some(audio) = &self.audio {
            descriptors.push(MediaDescriptor::Audio(audio.clone()));
        }
        if let Some(video) = &self.video {
            descriptors.push(MediaDescriptor::Video(video.clone()));
        }
        descriptors
    }
}

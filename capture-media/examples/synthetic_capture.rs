// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Drives a sink with synthetic video frames, and optionally audio, and logs
//! what the consumer sees.
//!
//! ```bash
//! cargo run --example synthetic_capture -- --frames 120 --width 640 --height 360 --audio
//! ```

mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use capture_media::{
    ClockState, MarkerType, PayloadRouter, PresentationClock, RouterEvent, SampleOutcome,
    SinkAggregate, StreamEvent,
    config::PipelineConfig,
    media::{
        descriptor::{AudioFormat, EncodingProfile, VideoFormat},
        sample::{MediaSample, Ticks},
    },
};
use clap::Parser;
use tracing::{info, warn};

/// One frame at 30 fps in 100 ns ticks.
const FRAME_TICKS: Ticks = 333_333;

#[derive(Debug, Parser)]
#[command(version, about = "Pushes synthetic frames through a capture sink")]
struct Opts {
    /// Number of frames to produce.
    #[arg(long, default_value_t = 60)]
    frames: u32,

    #[arg(long, default_value_t = 320)]
    width: u32,

    #[arg(long, default_value_t = 240)]
    height: u32,

    /// Adds a 48 kHz stereo float audio stream.
    #[arg(long)]
    audio: bool,

    /// Pipeline configuration as a JSON file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

struct LoggingClock;

impl PresentationClock for LoggingClock {
    fn state(&self) -> ClockState {
        ClockState::Running
    }

    fn stop(&self) -> capture_media::Result<()> {
        info!("Presentation clock stopped");
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::setup_logging();
    let opts = Opts::parse();

    let config = match &opts.config {
        Some(path) => PipelineConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => PipelineConfig::default(),
    };
    let audio_format = opts.audio.then(AudioFormat::float_stereo);
    // Audio bytes covering one video frame.
    let audio_chunk = audio_format.as_ref().map_or(0, |format| {
        (format.sample_rate / 30 * format.channels * format.bits_per_sample / 8) as usize
    });
    let profile = EncodingProfile {
        audio: audio_format,
        video: Some(VideoFormat::bgra8(opts.width, opts.height)),
        ..Default::default()
    };

    let sink = SinkAggregate::new(profile, config.clone())?;
    let router = Arc::new(PayloadRouter::new(&config)?);
    let received = Arc::new(AtomicU64::new(0));
    let counter = received.clone();
    router.subscribe(move |event| match event {
        RouterEvent::ProfileChanged(_) => info!("Encoding profile announced"),
        RouterEvent::PayloadReceived(envelope) => {
            counter.fetch_add(1, Ordering::Relaxed);
            if envelope.is_discontinuity() {
                warn!("Discontinuity at {}", envelope.timestamp());
            }
        }
        RouterEvent::MetadataReceived(properties) => info!("Metadata: {:?}", properties),
        RouterEvent::DescriptionChanged { stream_id, .. } => {
            info!("Stream {} description changed", stream_id)
        }
    });
    sink.set_router(Some(router.clone()))?;
    sink.set_presentation_clock(Some(Arc::new(LoggingClock)))?;
    sink.on_clock_start(0)?;

    // Audio takes the first stream id when present.
    let audio = opts.audio.then(|| sink.stream_by_id(0)).transpose()?;
    let video = sink.stream_by_id(u32::from(opts.audio))?;
    let frame_size = (opts.width * opts.height * 4) as usize;
    let mut produced = 0;
    let mut dropped = 0;
    while produced < opts.frames {
        match video.next_event(Duration::from_secs(1))? {
            StreamEvent::RequestSample => {
                let timestamp = Ticks::from(produced) * FRAME_TICKS;
                let sample = MediaSample::new(timestamp, vec![(produced % 256) as u8; frame_size])
                    .with_duration(FRAME_TICKS);
                if video.accept_sample(sample)? == SampleOutcome::Dropped {
                    dropped += 1;
                }
                if let Some(audio) = &audio {
                    while let Some(event) = audio.try_next_event() {
                        if event == StreamEvent::RequestSample {
                            let sample = MediaSample::new(timestamp, vec![0; audio_chunk])
                                .with_duration(FRAME_TICKS);
                            audio.accept_sample(sample)?;
                        }
                    }
                }
                produced += 1;
            }
            other => info!("Stream event: {:?}", other),
        }
    }
    video.place_marker(MarkerType::EndOfSegment, None)?;
    if let Some(audio) = &audio {
        audio.place_marker(MarkerType::EndOfSegment, None)?;
    }

    router.close();
    info!(
        "Produced {} frames, dropped {}, consumer received {}",
        produced,
        dropped,
        received.load(Ordering::Relaxed)
    );
    sink.shutdown()?;
    Ok(())
}

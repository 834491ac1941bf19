// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration for the capture pipeline.
//!
//! [`PipelineConfig`] is plain data. It can be built in code, deserialized
//! from JSON, or left at its defaults. Call [`PipelineConfig::validate`] before
//! handing a hand-written configuration to the pipeline; the JSON loader does
//! it for you.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default number of sample requests a stream keeps outstanding.
pub const DEFAULT_MAX_OUTSTANDING_REQUESTS: u32 = 4;

/// Upper bound accepted for [`PipelineConfig::max_outstanding_requests`].
pub const MAX_OUTSTANDING_REQUESTS_LIMIT: u32 = 64;

/// Default bounded wait used while shutting down in-flight operations.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Default name of the payload dispatch worker thread.
pub const DEFAULT_DISPATCH_THREAD_NAME: &str = "capture-dispatch";

/// Which calibration source the transform resolver reads.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransformStrategy {
    /// Probe the platform once when the resolver is created.
    #[default]
    Auto,
    /// Fixed view/projection blobs plus a coordinate system reference.
    Legacy,
    /// Intrinsics/extrinsics blobs and a dynamic-node locator.
    DynamicNode,
}

/// Pipeline-wide tuning knobs.
///
/// # Examples
///
/// ```
/// use capture_media::config::PipelineConfig;
///
/// let config = PipelineConfig::from_json(r#"{ "max_outstanding_requests": 8 }"#).unwrap();
/// assert_eq!(config.max_outstanding_requests, 8);
/// assert_eq!(config.shutdown_timeout_ms, 5_000);
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Credit ceiling per stream: the most sample requests outstanding at once.
    pub max_outstanding_requests: u32,
    /// Name given to dispatch worker threads.
    pub dispatch_thread_name: String,
    /// Bounded wait for start/stop operations during shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Calibration source for camera transforms.
    pub transform_strategy: TransformStrategy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_outstanding_requests: DEFAULT_MAX_OUTSTANDING_REQUESTS,
            dispatch_thread_name: DEFAULT_DISPATCH_THREAD_NAME.to_owned(),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            transform_strategy: TransformStrategy::default(),
        }
    }
}

impl PipelineConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the JSON is malformed or a value
    /// is out of range.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidArgument(format!("pipeline config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is within its accepted range.
    pub fn validate(&self) -> Result<()> {
        if self.max_outstanding_requests == 0
            || self.max_outstanding_requests > MAX_OUTSTANDING_REQUESTS_LIMIT
        {
            return Err(Error::InvalidArgument(format!(
                "max_outstanding_requests must be within 1..={MAX_OUTSTANDING_REQUESTS_LIMIT}, got {}",
                self.max_outstanding_requests
            )));
        }
        if self.dispatch_thread_name.is_empty() {
            return Err(Error::InvalidArgument(
                "dispatch_thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the shutdown wait as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

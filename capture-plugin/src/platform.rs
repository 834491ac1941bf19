// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Platform services the embedding application provides.
//!
//! The plugin never talks to a camera, a GPU or a perception stack directly.
//! An embedder implements [`Platform`] and hands it to
//! [`crate::install_platform`] before the host creates capture instances.

use std::sync::Arc;

use capture_media::{
    Result, SinkAggregate,
    config::PipelineConfig,
    media::descriptor::EncodingProfile,
    texture::{DeviceManager, RenderDevice},
    transform::{CoordinateSystemRef, SpatialPlatform},
};
use capture_sys::DeviceEventType;

/// Receives capture session failures as `(status code, message)`.
pub type FailedHandler = Box<dyn Fn(i32, &str) + Send + Sync>;

/// Entry point to the embedder's platform services.
pub trait Platform: Send + Sync {
    /// Creates the resources bound to the host's graphics device.
    ///
    /// Called when the host reports [`DeviceEventType::Initialize`].
    fn create_device_resources(&self) -> Result<Arc<dyn DeviceResources>>;

    /// Factory for camera capture sessions.
    fn capture_sessions(&self) -> Arc<dyn CaptureSessionFactory>;

    /// Spatial services used to place camera frames in the application's
    /// coordinate system.
    fn spatial(&self) -> Arc<dyn SpatialPlatform>;

    /// Translates the host's coordinate system object into a reference.
    ///
    /// `raw` is the pointer value passed to `CaptureSetCoordinateSystem`;
    /// zero clears the coordinate system.
    fn coordinate_system(&self, raw: usize) -> Result<Option<CoordinateSystemRef>> {
        Ok((raw != 0).then_some(CoordinateSystemRef(raw as u64)))
    }

    /// Pipeline tuning for new capture instances.
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::default()
    }
}

/// Graphics resources shared by every capture instance.
pub trait DeviceResources: Send + Sync {
    /// The host's render device, on which shared frame textures are created.
    fn render_device(&self) -> Arc<dyn RenderDevice>;

    /// Creates a media device on the render device's adapter and a manager
    /// for it.
    fn create_device_manager(&self) -> Result<Arc<dyn DeviceManager>>;

    /// Forwards a graphics device lifecycle event.
    fn on_device_event(&self, event: DeviceEventType) {
        let _ = event;
    }
}

/// Creates capture sessions.
pub trait CaptureSessionFactory: Send + Sync {
    /// Opens the first video capture device, and the first audio capture
    /// device when `enable_audio` is set, with exclusive control.
    fn create_session(
        &self,
        device_manager: Arc<dyn DeviceManager>,
        enable_audio: bool,
    ) -> Result<Arc<dyn CaptureSession>>;
}

/// One open camera capture session.
pub trait CaptureSession: Send + Sync {
    /// Selects the preview format closest to `width` x `height` and returns
    /// the size the device will deliver.
    fn configure_preview(&self, width: u32, height: u32) -> Result<(u32, u32)>;

    /// Attaches mixed reality capture effects.
    fn add_effects(&self, enable_audio: bool) -> Result<()>;

    /// Detaches every effect added by [`CaptureSession::add_effects`].
    fn remove_effects(&self) -> Result<()>;

    /// Starts delivering preview samples into `sink`.
    fn start_preview(&self, profile: &EncodingProfile, sink: Arc<SinkAggregate>) -> Result<()>;

    /// Stops delivering samples.
    fn stop_preview(&self) -> Result<()>;

    /// Installs or clears the handler for asynchronous session failures.
    fn set_failed_handler(&self, handler: Option<FailedHandler>);

    /// Releases the capture devices.
    fn close(&self);
}

// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Camera Capture Plugin for Real-Time Host Engines
//!
//! This crate builds the shared library a host engine loads to stream camera
//! preview frames into GPU textures, together with the camera pose and
//! projection of each frame.
//!
//! ## Host Surface
//! The host drives the plugin through a flat `extern "system"` table:
//!
//! - **Lifecycle**: `UnityPluginLoad`, `UnityPluginUnload`,
//!   `OnGraphicsDeviceEvent`, `GetRenderEventFunc`
//! - **Instances**: `CreateCapture`, `ReleaseInstance`
//! - **Capture**: `CaptureStartPreview`, `CaptureStopPreview`,
//!   `CaptureSetCoordinateSystem`
//!
//! Every `i32` return is a host status code; zero is success and failures
//! are negative. Asynchronous outcomes arrive through the
//! [`capture_sys::StateChangedCallback`] passed to `CreateCapture`.
//!
//! ## Embedding
//! Cameras, GPU devices and spatial tracking are supplied by the embedding
//! application through [`platform::Platform`], installed once with
//! [`install_platform`] before the host creates instances.
//!
//! ## Concepts (for developers new to the host ABI)
//! - **Instance handle**: a small integer the host uses to address one
//!   capture engine. Handles start at [`capture_sys::INSTANCE_HANDLE_START`]
//! - **Render event**: an integer the host passes to the render thread
//!   callback; the low 16 bits carry the instance handle and the high 16
//!   bits a frame id

#![allow(non_snake_case)]

use std::{
    ffi::c_void,
    sync::{Arc, LazyLock, Mutex, MutexGuard},
};

use capture_media::{Error, Result, STATUS_OK, SpatialTransformResolver};
use capture_sys::{
    DeviceEventType, E_INVALIDARG, INSTANCE_HANDLE_INVALID, InstanceHandle, RenderingEvent,
    StateChangedCallback,
};
use tracing::{debug, info, warn};

/// Capture engine (preview operations, frame handling, callbacks)
pub mod capture;

/// Platform services supplied by the embedder
pub mod platform;

/// Instance handles and render event ids
pub mod registry;

use capture::{CallbackState, CaptureEngine};
use platform::{DeviceResources, Platform};
use registry::InstanceRegistry;

/// Process-wide plugin state.
struct PluginState {
    platform: Option<Arc<dyn Platform>>,
    device_resources: Option<Arc<dyn DeviceResources>>,
    device_initialized: bool,
    instances: InstanceRegistry<CaptureEngine>,
}

static PLUGIN: LazyLock<Mutex<PluginState>> = LazyLock::new(|| {
    Mutex::new(PluginState {
        platform: None,
        device_resources: None,
        device_initialized: false,
        instances: InstanceRegistry::new(),
    })
});

fn plugin() -> Result<MutexGuard<'static, PluginState>> {
    PLUGIN
        .lock()
        .map_err(|_| Error::Other("plugin state lock poisoned".to_string()))
}

fn status(result: Result<()>) -> i32 {
    match result {
        Ok(()) => STATUS_OK,
        Err(e) => {
            debug!("Host call failed: {}", e);
            e.code()
        }
    }
}

/// Installs the platform services used by every subsequently created
/// instance.
///
/// If the host already reported its graphics device, device resources are
/// created right away. Instances can only be created once device resources
/// exist.
///
/// # Errors
///
/// Propagates failures creating the device resources.
pub fn install_platform(platform: Arc<dyn Platform>) -> Result<()> {
    let mut state = plugin()?;
    if state.platform.replace(platform.clone()).is_some() {
        debug!("Replacing installed platform");
    }
    if state.device_resources.is_none() && state.device_initialized {
        state.device_resources = Some(platform.create_device_resources()?);
    }
    Ok(())
}

/// Looks up a live instance.
pub fn instance(handle: InstanceHandle) -> Result<Arc<CaptureEngine>> {
    plugin()?.instances.get(handle)
}

fn create_capture(callback: StateChangedCallback, user_data: usize) -> Result<InstanceHandle> {
    let mut state = plugin()?;
    let platform = state
        .platform
        .clone()
        .ok_or_else(|| Error::InvalidState("no platform installed".to_string()))?;
    let device_resources = state
        .device_resources
        .as_ref()
        .map(Arc::downgrade)
        .ok_or_else(|| Error::NotFound("graphics device resources".to_string()))?;

    let config = platform.pipeline_config();
    let resolver = SpatialTransformResolver::new(platform.spatial(), config.transform_strategy);
    let engine = CaptureEngine::new(
        config,
        device_resources,
        platform.capture_sessions(),
        resolver,
        Arc::new(move |event: CallbackState| {
            let raw = capture_sys::CallbackState::from(&event);
            // SAFETY: the host keeps the callback and its user pointer valid
            // until the instance is released.
            unsafe { callback(user_data as *mut c_void, raw) }
        }),
    )?;

    let handle = state.instances.insert(engine.clone()).inspect_err(|_| engine.shutdown())?;
    info!(
        "Created capture instance {:#x} ({} live)",
        handle,
        state.instances.len()
    );
    Ok(handle)
}

fn handle_device_event(event: DeviceEventType) -> Result<()> {
    let mut state = plugin()?;
    if event == DeviceEventType::Initialize {
        state.device_initialized = true;
        if let Some(platform) = state.platform.clone() {
            state.device_resources = Some(platform.create_device_resources()?);
        } else {
            warn!("Graphics device initialized before a platform was installed");
        }
    }

    if let Some(resources) = &state.device_resources {
        resources.on_device_event(event);
    }

    if event == DeviceEventType::Shutdown {
        state.device_initialized = false;
        state.device_resources = None;
    }
    Ok(())
}

/// Host entry point when the library is loaded.
///
/// # Safety
///
/// `interfaces` is the host's interface registry. It is not dereferenced.
#[unsafe(no_mangle)]
pub unsafe extern "system" fn UnityPluginLoad(interfaces: *mut c_void) {
    #[cfg(feature = "tracing")]
    {
        use tracing_subscriber::filter::LevelFilter;
        use tracing_subscriber::util::SubscriberInitExt;

        let _ = tracing_subscriber::fmt()
            .compact()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(false)
            .with_max_level(LevelFilter::DEBUG)
            .with_ansi(false)
            .finish()
            .try_init();
    }

    debug!("Plugin loaded (host interfaces at {:p})", interfaces);
    match plugin() {
        Ok(mut state) => {
            for engine in state.instances.reset() {
                engine.shutdown();
            }
        }
        Err(e) => warn!("Plugin load: {}", e),
    }

    // The host does not replay the initialize event for a device that
    // already exists.
    if let Err(e) = handle_device_event(DeviceEventType::Initialize) {
        warn!("Failed to initialize device resources: {}", e);
    }
}

/// Host entry point before the library is unloaded. Shuts every instance
/// down.
#[unsafe(no_mangle)]
pub extern "system" fn UnityPluginUnload() {
    let engines = match plugin() {
        Ok(mut state) => state.instances.reset(),
        Err(e) => {
            warn!("Plugin unload: {}", e);
            return;
        }
    };
    for engine in engines {
        engine.shutdown();
    }
    if let Err(e) = handle_device_event(DeviceEventType::Shutdown) {
        warn!("Failed to release device resources: {}", e);
    }
    info!("Plugin unloaded");
}

/// Host graphics device lifecycle notification.
#[unsafe(no_mangle)]
pub extern "system" fn OnGraphicsDeviceEvent(event_type: i32) {
    let Some(event) = DeviceEventType::from_raw(event_type) else {
        debug!("Ignoring unknown device event {}", event_type);
        return;
    };
    if let Err(e) = handle_device_event(event) {
        warn!("Device event {:?} failed: {}", event, e);
    }
}

extern "system" fn on_render_event(event_id: i32) {
    let (handle, frame_id) = registry::split_render_event(event_id);
    if let Ok(engine) = instance(handle) {
        engine.on_render_event(frame_id);
    }
}

/// Returns the render thread callback the host invokes with render event
/// ids.
#[unsafe(no_mangle)]
pub extern "system" fn GetRenderEventFunc() -> RenderingEvent {
    on_render_event
}

/// Shuts an instance down and forgets its handle. Unknown handles are
/// ignored.
#[unsafe(no_mangle)]
pub extern "system" fn ReleaseInstance(handle: InstanceHandle) {
    let engine = match plugin().and_then(|mut state| state.instances.remove(handle)) {
        Ok(engine) => engine,
        Err(e) => {
            debug!("Release of {:#x} ignored: {}", handle, e);
            return;
        }
    };
    engine.shutdown();
    info!("Released capture instance {:#x}", handle);
}

/// Creates a capture instance and writes its handle to `handle_out`.
///
/// Returns `E_INVALIDARG` when `user_data` or `handle_out` is null or the
/// callback is missing. On failure `handle_out` receives
/// [`INSTANCE_HANDLE_INVALID`].
///
/// # Safety
///
/// `handle_out` must be null or valid for writes. `callback` must stay
/// callable with `user_data` until the instance is released.
#[unsafe(no_mangle)]
pub unsafe extern "system" fn CreateCapture(
    callback: Option<StateChangedCallback>,
    user_data: *mut c_void,
    handle_out: *mut InstanceHandle,
) -> i32 {
    if handle_out.is_null() {
        return E_INVALIDARG;
    }
    // SAFETY: checked non-null; the caller guarantees it is writable.
    unsafe { handle_out.write(INSTANCE_HANDLE_INVALID) };

    let Some(callback) = callback else {
        return E_INVALIDARG;
    };
    if user_data.is_null() {
        return E_INVALIDARG;
    }

    match create_capture(callback, user_data as usize) {
        Ok(handle) => {
            // SAFETY: as above.
            unsafe { handle_out.write(handle) };
            STATUS_OK
        }
        Err(e) => {
            warn!("CreateCapture failed: {}", e);
            e.code()
        }
    }
}

/// Starts the preview of an instance. Non-zero booleans are true.
#[unsafe(no_mangle)]
pub extern "system" fn CaptureStartPreview(
    handle: InstanceHandle,
    width: u32,
    height: u32,
    enable_audio: u8,
    enable_mrc: u8,
) -> i32 {
    status(instance(handle).and_then(|engine| {
        engine.start_preview(width, height, enable_audio != 0, enable_mrc != 0)
    }))
}

/// Stops the preview of an instance.
#[unsafe(no_mangle)]
pub extern "system" fn CaptureStopPreview(handle: InstanceHandle) -> i32 {
    status(instance(handle).and_then(|engine| engine.stop_preview()))
}

/// Sets the application's coordinate system. Null clears it.
#[unsafe(no_mangle)]
pub extern "system" fn CaptureSetCoordinateSystem(handle: InstanceHandle, coordinate_system: *mut c_void) -> i32 {
    status((|| {
        let engine = instance(handle)?;
        let platform = plugin()?
            .platform
            .clone()
            .ok_or_else(|| Error::InvalidState("no platform installed".to_string()))?;
        engine.set_coordinate_system(platform.coordinate_system(coordinate_system as usize)?)
    })())
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "system" fn ignore(_: *mut c_void, _: capture_sys::CallbackState) {}

    #[test]
    fn create_rejects_null_arguments() {
        let mut handle = 0;
        let mut user_data = 0u8;
        let user_data = &mut user_data as *mut u8 as *mut c_void;

        unsafe {
            assert_eq!(
                CreateCapture(Some(ignore), std::ptr::null_mut(), &mut handle),
                E_INVALIDARG
            );
            assert_eq!(handle, INSTANCE_HANDLE_INVALID);
            assert_eq!(CreateCapture(None, user_data, &mut handle), E_INVALIDARG);
            assert_eq!(
                CreateCapture(Some(ignore), user_data, std::ptr::null_mut()),
                E_INVALIDARG
            );
        }
    }

    #[test]
    fn calls_on_unknown_handles_fail_without_side_effects() {
        let unknown = 0x7000;
        assert_eq!(
            CaptureStopPreview(INSTANCE_HANDLE_INVALID),
            Error::InvalidArgument(String::new()).code()
        );
        assert_eq!(
            CaptureStartPreview(unknown, 640, 480, 0, 0),
            Error::NotFound(String::new()).code()
        );
        ReleaseInstance(unknown);

        let render = GetRenderEventFunc();
        unsafe { render(registry::render_event_id(unknown, 1)) };
    }
}

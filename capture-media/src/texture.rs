// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Cross-device shared GPU textures.
//!
//! A [`SharedFrameBuffer`] allocates a shareable texture on the render
//! device (the one the host draws with), exports an OS shared handle for it,
//! and re-opens that handle on the media device that drives capture. Frames
//! are copied into the media side and read by the host from the render side.
//!
//! ## Device lock
//!
//! Opening the shared handle on the media device requires the device
//! manager's lock. [`DeviceLock`] holds it for exactly one scope and releases
//! it on every exit path.
//!
//! ## Reallocation
//!
//! A buffer has a fixed size. [`FrameBufferCache::ensure`] replaces it
//! whenever the requested size differs, closing the previous shared handle
//! before the new one is created.

use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::{Error, Result, media::sample::MediaSample};

/// OS-level handle that lets a texture be opened on another device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SharedHandle(pub u64);

/// A texture owned by one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// A shader-readable view of a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderViewHandle(pub u64);

/// Handle of an opened media device inside its [`DeviceManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// The device the host renders with.
pub trait RenderDevice: Send + Sync {
    /// Creates a BGRA texture that can be shared with other devices.
    fn create_shared_texture(&self, width: u32, height: u32) -> Result<TextureHandle>;

    /// Creates a shader-readable view of `texture`.
    fn create_shader_view(&self, texture: TextureHandle) -> Result<ShaderViewHandle>;

    /// Exports an OS shared handle for `texture`.
    fn export_shared_handle(&self, texture: TextureHandle) -> Result<SharedHandle>;

    /// Closes a handle returned by [`Self::export_shared_handle`].
    fn close_shared_handle(&self, handle: SharedHandle);

    /// Releases a shader view.
    fn release_shader_view(&self, view: ShaderViewHandle);

    /// Releases a texture.
    fn release_texture(&self, texture: TextureHandle);
}

/// The device that drives capture and decode.
pub trait MediaDevice: Send + Sync {
    /// Opens a texture exported by another device.
    fn open_shared_texture(&self, handle: SharedHandle) -> Result<TextureHandle>;

    /// Copies the pixels of `source` into `target`.
    fn copy_sample_to_texture(&self, source: &MediaSample, target: TextureHandle) -> Result<()>;

    /// Releases a texture opened by [`Self::open_shared_texture`].
    fn release_texture(&self, texture: TextureHandle);
}

/// Arbitrates access to the media device between its users.
pub trait DeviceManager: Send + Sync {
    /// Opens a handle to the managed device.
    fn open_device_handle(&self) -> Result<DeviceHandle>;

    /// Locks the device, blocking its other users, and returns it.
    fn lock_device(&self, handle: DeviceHandle) -> Result<Arc<dyn MediaDevice>>;

    /// Releases a lock taken with [`Self::lock_device`].
    fn unlock_device(&self, handle: DeviceHandle);

    /// Closes a handle returned by [`Self::open_device_handle`].
    fn close_device_handle(&self, handle: DeviceHandle);
}

/// Scoped lock on the media device.
///
/// Dropping the guard unlocks the device and closes its handle.
pub struct DeviceLock<'a> {
    manager: &'a dyn DeviceManager,
    handle: DeviceHandle,
    device: Arc<dyn MediaDevice>,
}

impl<'a> DeviceLock<'a> {
    /// Opens a device handle and locks the device.
    ///
    /// # Errors
    ///
    /// Propagates device manager failures. The handle is closed again if
    /// the lock cannot be taken.
    pub fn acquire(manager: &'a dyn DeviceManager) -> Result<Self> {
        let handle = manager.open_device_handle()?;
        match manager.lock_device(handle) {
            Ok(device) => Ok(Self {
                manager,
                handle,
                device,
            }),
            Err(e) => {
                manager.close_device_handle(handle);
                Err(e)
            }
        }
    }

    /// The locked device. The returned reference outlives the lock.
    pub fn device(&self) -> Arc<dyn MediaDevice> {
        self.device.clone()
    }
}

impl Drop for DeviceLock<'_> {
    fn drop(&mut self) {
        self.manager.unlock_device(self.handle);
        self.manager.close_device_handle(self.handle);
        trace!("Media device {:?} unlocked", self.handle);
    }
}

/// One shared texture, visible on both devices.
pub struct SharedFrameBuffer {
    width: u32,
    height: u32,
    render_device: Arc<dyn RenderDevice>,
    texture: Option<TextureHandle>,
    shader_view: Option<ShaderViewHandle>,
    shared_handle: Option<SharedHandle>,
    media_device: Option<Arc<dyn MediaDevice>>,
    media_texture: Option<TextureHandle>,
    media_sample: MediaSample,
}

impl SharedFrameBuffer {
    /// Allocates a `width`×`height` shared texture.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a zero size and propagates
    /// device failures. Whatever was allocated before a failure is released,
    /// and the device lock is never left held.
    pub fn create(
        render_device: Arc<dyn RenderDevice>,
        manager: &dyn DeviceManager,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!(
                "frame buffer size {width}x{height}"
            )));
        }

        // Partially built buffers release their resources on drop.
        let mut buffer = Self {
            width,
            height,
            render_device,
            texture: None,
            shader_view: None,
            shared_handle: None,
            media_device: None,
            media_texture: None,
            media_sample: MediaSample::default(),
        };

        let texture = buffer.render_device.create_shared_texture(width, height)?;
        buffer.texture = Some(texture);
        buffer.shader_view = Some(buffer.render_device.create_shader_view(texture)?);
        let shared_handle = buffer.render_device.export_shared_handle(texture)?;
        buffer.shared_handle = Some(shared_handle);

        {
            let lock = DeviceLock::acquire(manager)?;
            let device = lock.device();
            buffer.media_texture = Some(device.open_shared_texture(shared_handle)?);
            buffer.media_device = Some(device);
        }

        debug!(
            "Shared frame buffer {}x{} created with handle {:?}",
            width, height, shared_handle
        );
        Ok(buffer)
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// True if the buffer has exactly this size.
    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    /// True until [`Self::reset`].
    pub fn is_allocated(&self) -> bool {
        self.shared_handle.is_some()
    }

    /// The render-side texture handed to the host.
    pub fn texture(&self) -> Option<TextureHandle> {
        self.texture
    }

    /// Shader view of the render-side texture.
    pub fn shader_view(&self) -> Option<ShaderViewHandle> {
        self.shader_view
    }

    /// The exported OS handle.
    pub fn shared_handle(&self) -> Option<SharedHandle> {
        self.shared_handle
    }

    /// The media-side sample; carries the metadata of the last copied frame.
    pub fn media_sample(&self) -> &MediaSample {
        &self.media_sample
    }

    /// Copies `source` into the media-side texture. Never reallocates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] after [`Self::reset`] and propagates
    /// copy failures.
    pub fn copy_in(&mut self, source: &MediaSample) -> Result<()> {
        let (Some(device), Some(target)) = (&self.media_device, self.media_texture) else {
            return Err(Error::InvalidState("frame buffer was reset".to_string()));
        };
        device.copy_sample_to_texture(source, target)?;
        self.media_sample.copy_metadata_from(source);
        Ok(())
    }

    /// Closes the shared handle and releases every resource.
    /// Calling it again is a no-op.
    pub fn reset(&mut self) {
        if let (Some(device), Some(texture)) = (self.media_device.take(), self.media_texture.take()) {
            device.release_texture(texture);
        }
        if let Some(handle) = self.shared_handle.take() {
            self.render_device.close_shared_handle(handle);
            trace!("Closed shared handle {:?}", handle);
        }
        if let Some(view) = self.shader_view.take() {
            self.render_device.release_shader_view(view);
        }
        if let Some(texture) = self.texture.take() {
            self.render_device.release_texture(texture);
        }
        self.media_sample = MediaSample::default();
    }
}

impl Drop for SharedFrameBuffer {
    fn drop(&mut self) {
        self.reset();
    }
}

impl std::fmt::Debug for SharedFrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFrameBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("shared_handle", &self.shared_handle)
            .finish()
    }
}

/// Holds the current frame buffer and reallocates it on size change.
pub struct FrameBufferCache {
    render_device: Arc<dyn RenderDevice>,
    manager: Arc<dyn DeviceManager>,
    current: Option<SharedFrameBuffer>,
}

impl FrameBufferCache {
    /// Creates an empty cache.
    pub fn new(render_device: Arc<dyn RenderDevice>, manager: Arc<dyn DeviceManager>) -> Self {
        Self {
            render_device,
            manager,
            current: None,
        }
    }

    /// Returns a buffer of the requested size and whether it was (re)created.
    ///
    /// A buffer of a different size is reset before the replacement is
    /// allocated. If allocation fails the cache is left empty.
    pub fn ensure(&mut self, width: u32, height: u32) -> Result<(&mut SharedFrameBuffer, bool)> {
        let reusable = self
            .current
            .as_ref()
            .is_some_and(|buffer| buffer.is_allocated() && buffer.matches(width, height));

        if !reusable {
            if let Some(mut previous) = self.current.take() {
                previous.reset();
            }
            let buffer = SharedFrameBuffer::create(
                self.render_device.clone(),
                self.manager.as_ref(),
                width,
                height,
            )
            .inspect_err(|e| error!("Failed to allocate {}x{} frame buffer: {}", width, height, e))?;
            self.current = Some(buffer);
        }

        let buffer = self
            .current
            .as_mut()
            .ok_or_else(|| Error::Other("frame buffer missing after allocation".to_string()))?;
        Ok((buffer, !reusable))
    }

    /// The current buffer, if any.
    pub fn current(&self) -> Option<&SharedFrameBuffer> {
        self.current.as_ref()
    }

    /// Releases the current buffer.
    pub fn reset(&mut self) {
        if let Some(mut buffer) = self.current.take() {
            buffer.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicU64, Ordering},
        },
    };

    use super::*;

    /// Handle table shared by the mock devices.
    #[derive(Default)]
    struct HandleTable {
        next: AtomicU64,
        closed: Mutex<HashMap<u64, usize>>,
        exported: Mutex<Vec<u64>>,
        textures_live: Mutex<i64>,
        locks_held: Mutex<i64>,
        fail_open_shared: Mutex<bool>,
    }

    impl HandleTable {
        fn next(&self) -> u64 {
            self.next.fetch_add(1, Ordering::SeqCst) + 1
        }

        fn close_count(&self, handle: SharedHandle) -> usize {
            self.closed.lock().unwrap().get(&handle.0).copied().unwrap_or(0)
        }
    }

    struct MockRender(Arc<HandleTable>);

    impl RenderDevice for MockRender {
        fn create_shared_texture(&self, _: u32, _: u32) -> Result<TextureHandle> {
            *self.0.textures_live.lock().unwrap() += 1;
            Ok(TextureHandle(self.0.next()))
        }

        fn create_shader_view(&self, _: TextureHandle) -> Result<ShaderViewHandle> {
            Ok(ShaderViewHandle(self.0.next()))
        }

        fn export_shared_handle(&self, _: TextureHandle) -> Result<SharedHandle> {
            let handle = self.0.next();
            self.0.exported.lock().unwrap().push(handle);
            Ok(SharedHandle(handle))
        }

        fn close_shared_handle(&self, handle: SharedHandle) {
            *self.0.closed.lock().unwrap().entry(handle.0).or_default() += 1;
        }

        fn release_shader_view(&self, _: ShaderViewHandle) {}

        fn release_texture(&self, _: TextureHandle) {
            *self.0.textures_live.lock().unwrap() -= 1;
        }
    }

    struct MockMedia(Arc<HandleTable>);

    impl MediaDevice for MockMedia {
        fn open_shared_texture(&self, _: SharedHandle) -> Result<TextureHandle> {
            if *self.0.fail_open_shared.lock().unwrap() {
                return Err(Error::Platform {
                    code: -1,
                    message: "open failed".to_string(),
                });
            }
            *self.0.textures_live.lock().unwrap() += 1;
            Ok(TextureHandle(self.0.next()))
        }

        fn copy_sample_to_texture(&self, _: &MediaSample, _: TextureHandle) -> Result<()> {
            Ok(())
        }

        fn release_texture(&self, _: TextureHandle) {
            *self.0.textures_live.lock().unwrap() -= 1;
        }
    }

    struct MockManager(Arc<HandleTable>);

    impl DeviceManager for MockManager {
        fn open_device_handle(&self) -> Result<DeviceHandle> {
            Ok(DeviceHandle(self.0.next()))
        }

        fn lock_device(&self, _: DeviceHandle) -> Result<Arc<dyn MediaDevice>> {
            *self.0.locks_held.lock().unwrap() += 1;
            Ok(Arc::new(MockMedia(self.0.clone())))
        }

        fn unlock_device(&self, _: DeviceHandle) {
            *self.0.locks_held.lock().unwrap() -= 1;
        }

        fn close_device_handle(&self, _: DeviceHandle) {}
    }

    fn cache() -> (FrameBufferCache, Arc<HandleTable>) {
        let table = Arc::new(HandleTable::default());
        let cache = FrameBufferCache::new(
            Arc::new(MockRender(table.clone())),
            Arc::new(MockManager(table.clone())),
        );
        (cache, table)
    }

    #[test]
    fn same_size_reuses_the_buffer() {
        let (mut cache, table) = cache();
        let first = {
            let (buffer, changed) = cache.ensure(640, 480).unwrap();
            assert!(changed);
            buffer.shared_handle()
        };
        let (buffer, changed) = cache.ensure(640, 480).unwrap();
        assert!(!changed);
        assert_eq!(buffer.shared_handle(), first);
        assert_eq!(table.exported.lock().unwrap().len(), 1);
    }

    #[test]
    fn size_change_closes_old_handle_exactly_once() {
        let (mut cache, table) = cache();
        let old = cache.ensure(640, 480).unwrap().0.shared_handle().unwrap();
        let (buffer, changed) = cache.ensure(1280, 720).unwrap();
        assert!(changed);
        let new = buffer.shared_handle().unwrap();
        assert_ne!(old, new);
        assert_eq!(table.close_count(old), 1);
        assert_eq!(table.close_count(new), 0);

        cache.ensure(1280, 480).unwrap();
        cache.reset();
        cache.reset();
        for handle in table.exported.lock().unwrap().iter() {
            assert_eq!(table.close_count(SharedHandle(*handle)), 1);
        }
        assert_eq!(*table.textures_live.lock().unwrap(), 0);
    }

    #[test]
    fn failed_creation_releases_lock_and_handle() {
        let (mut cache, table) = cache();
        *table.fail_open_shared.lock().unwrap() = true;

        assert!(matches!(
            cache.ensure(320, 240),
            Err(Error::Platform { code: -1, .. })
        ));
        assert!(cache.current().is_none());
        assert_eq!(*table.locks_held.lock().unwrap(), 0);
        let exported = table.exported.lock().unwrap().clone();
        assert_eq!(exported.len(), 1);
        assert_eq!(table.close_count(SharedHandle(exported[0])), 1);
        assert_eq!(*table.textures_live.lock().unwrap(), 0);
    }

    #[test]
    fn copy_in_keeps_metadata_and_fails_after_reset() {
        let (mut cache, table) = cache();
        let (buffer, _) = cache.ensure(4, 4).unwrap();
        assert_eq!(*table.locks_held.lock().unwrap(), 0);

        buffer.copy_in(&MediaSample::new(77, vec![0; 64])).unwrap();
        assert_eq!(buffer.media_sample().presentation_time(), 77);

        buffer.reset();
        buffer.reset();
        assert!(!buffer.is_allocated());
        assert!(matches!(
            buffer.copy_in(&MediaSample::new(78, vec![0; 64])),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn zero_size_is_rejected() {
        let (mut cache, _) = cache();
        assert!(matches!(cache.ensure(0, 10), Err(Error::InvalidArgument(_))));
    }
}

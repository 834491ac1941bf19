// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! Host handles for live plugin instances.
//!
//! Handles count up from [`INSTANCE_HANDLE_START`] and are never reused while
//! the plugin stays loaded. Render events carry the handle in their low 16
//! bits, so the registry refuses to hand out anything above
//! [`MAX_INSTANCE_HANDLE`].

use std::{collections::HashMap, sync::Arc};

use capture_media::{Error, Result};
use capture_sys::{INSTANCE_HANDLE_START, InstanceHandle};

/// Largest handle a render event can address.
pub const MAX_INSTANCE_HANDLE: InstanceHandle = 0xFFFF;

/// Maps host handles to instances.
pub(crate) struct InstanceRegistry<T: ?Sized> {
    next: InstanceHandle,
    instances: HashMap<InstanceHandle, Arc<T>>,
}

impl<T: ?Sized> InstanceRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            next: INSTANCE_HANDLE_START,
            instances: HashMap::new(),
        }
    }

    /// Tracks `instance` under the next free handle.
    pub(crate) fn insert(&mut self, instance: Arc<T>) -> Result<InstanceHandle> {
        if self.next > MAX_INSTANCE_HANDLE {
            return Err(Error::ResourceExhausted(format!(
                "instance handles above {MAX_INSTANCE_HANDLE:#x} are not addressable"
            )));
        }
        let handle = self.next;
        self.instances.insert(handle, instance);
        self.next += 1;
        Ok(handle)
    }

    pub(crate) fn get(&self, handle: InstanceHandle) -> Result<Arc<T>> {
        Self::check(handle)?;
        self.instances
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("instance {handle:#x}")))
    }

    pub(crate) fn remove(&mut self, handle: InstanceHandle) -> Result<Arc<T>> {
        Self::check(handle)?;
        self.instances
            .remove(&handle)
            .ok_or_else(|| Error::NotFound(format!("instance {handle:#x}")))
    }

    /// Removes every instance. Numbering continues, so handles issued
    /// before a reload stay invalid.
    pub(crate) fn reset(&mut self) -> Vec<Arc<T>> {
        self.instances.drain().map(|(_, instance)| instance).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.instances.len()
    }

    fn check(handle: InstanceHandle) -> Result<()> {
        if handle < INSTANCE_HANDLE_START {
            return Err(Error::InvalidArgument(format!("instance handle {handle:#x}")));
        }
        Ok(())
    }
}

/// Builds the render event id the host passes to the render callback.
pub fn render_event_id(handle: InstanceHandle, frame_id: u16) -> i32 {
    (((frame_id as u32) << 16) | (handle as u32 & 0xFFFF)) as i32
}

/// Splits a render event id into instance handle and frame id.
pub fn split_render_event(event_id: i32) -> (InstanceHandle, u16) {
    let raw = event_id as u32;
    ((raw & 0xFFFF) as InstanceHandle, (raw >> 16) as u16)
}

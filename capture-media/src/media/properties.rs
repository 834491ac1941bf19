// SPDX-FileCopyrightText: 2025 Contributors to the Capture Bridge project.
// SPDX-License-Identifier: Apache-2.0

//! String-keyed side metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Set on an envelope that follows one or more dropped samples.
pub const DISCONTINUITY: &str = "discontinuity";
/// Marker kind of a forwarded stream marker.
pub const MARKER_TYPE: &str = "marker-type";
/// Marker value (tick timestamp) of a forwarded stream marker.
pub const MARKER_VALUE: &str = "marker-value";
/// Stream identifier the metadata originated from.
pub const STREAM_ID: &str = "stream-id";

/// A single metadata value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point.
    Double(f64),
    /// Text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::Int(i64::from(value))
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_owned())
    }
}

/// Ordered map of metadata.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PropertySet {
    values: BTreeMap<String, PropertyValue>,
}

impl PropertySet {
    /// Inserts `value` under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Returns the value under `key`.
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.values.get(key)
    }

    /// Returns a boolean value, `None` if absent or not a boolean.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            PropertyValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns an integer value, `None` if absent or not an integer.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            PropertyValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns a text value, `None` if absent or not text.
    pub fn get_text(&self, key: &str) -> Option<&str> {
        match self.values.get(key)? {
            PropertyValue::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.values.iter()
    }
}

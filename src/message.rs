//! Application messages and their properties.
//!
//! Payload bytes are opaque to the core; serialization belongs to the
//! caller. Properties are validated against a process-wide registry of
//! reserved names that the service side interprets itself.

use std::collections::HashSet;
use std::sync::OnceLock;

use bytes::Bytes;

use crate::error::{LinkError, Result};

/// Property names interpreted by the hub. Applications cannot set these.
const RESERVED_NAMES: [&str; 16] = [
    "message-id",
    "correlation-id",
    "user-id",
    "to",
    "ack",
    "operation",
    "sequence-number",
    "lock-token",
    "enqueued-time",
    "creation-time-utc",
    "absolute-expiry-time",
    "content-type",
    "content-encoding",
    "connection-device-id",
    "connection-module-id",
    "input-name",
];

static RESERVED_SET: OnceLock<HashSet<&'static str>> = OnceLock::new();

fn reserved_set() -> &'static HashSet<&'static str> {
    RESERVED_SET.get_or_init(|| RESERVED_NAMES.iter().copied().collect())
}

/// A single name/value message property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperty {
    name: String,
    value: String,
}

impl MessageProperty {
    /// Create an application property.
    ///
    /// Rejects reserved names and non-ASCII content.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();

        if Self::is_reserved(&name) {
            return Err(LinkError::ReservedPropertyName(name));
        }
        if !name.is_ascii() || !value.is_ascii() {
            return Err(LinkError::NonAsciiProperty(name));
        }

        Ok(Self { name, value })
    }

    /// Whether `name` belongs to the reserved registry.
    pub fn is_reserved(name: &str) -> bool {
        reserved_set().contains(name)
    }

    /// The property name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The property value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Case-insensitive name comparison.
    pub fn has_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// An application message: opaque payload plus optional properties.
#[derive(Debug, Clone, Default)]
pub struct Message {
    payload: Bytes,
    properties: Vec<MessageProperty>,
}

impl Message {
    /// Create a message from an opaque payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            properties: Vec::new(),
        }
    }

    /// Attach an application property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        self.properties.push(MessageProperty::new(name, value)?);
        Ok(self)
    }

    /// The message payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Attached application properties.
    pub fn properties(&self) -> &[MessageProperty] {
        &self.properties
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

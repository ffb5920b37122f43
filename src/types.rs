//! Identity and transport-kind types.

use std::fmt;

/// A device identifier within a hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A module identifier, scoped to its parent device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub String);

impl ModuleId {
    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logical connection identity: a device, optionally narrowed to a
/// module on that device.
///
/// At most one live session exists per identity on any given connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    device: DeviceId,
    module: Option<ModuleId>,
}

impl Identity {
    /// Identity for a device.
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device: DeviceId(device_id.into()),
            module: None,
        }
    }

    /// Identity for a module on a device.
    pub fn module(device_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self {
            device: DeviceId(device_id.into()),
            module: Some(ModuleId(module_id.into())),
        }
    }

    /// The device component of this identity.
    pub fn device_id(&self) -> &DeviceId {
        &self.device
    }

    /// The module component, if this identity is module-scoped.
    pub fn module_id(&self) -> Option<&ModuleId> {
        self.module.as_ref()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module {
            Some(module) => write!(f, "{}/{}", self.device, module),
            None => write!(f, "{}", self.device),
        }
    }
}

/// The wire protocol carrying one or more sessions.
///
/// The core never touches wire frames; the kind only selects configured
/// behavior such as the credential-renewal delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// AMQP 1.0, multiplexing-capable, renews credentials in-band.
    Amqp,
    /// MQTT 3.1.1, single session per connection, reconnects on renewal.
    Mqtt,
    /// HTTPS request/response, no standing connection.
    Https,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Amqp => "amqp",
            TransportKind::Mqtt => "mqtt",
            TransportKind::Https => "https",
        };
        f.write_str(name)
    }
}

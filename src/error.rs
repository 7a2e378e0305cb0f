//! Custom error types for device control.
//!
//! This module defines `DeviceError`, the error type shared by every layer of the
//! crate. Using the `thiserror` crate, it provides one place to classify what can
//! go wrong when talking to hardware, from bad setting definitions to faults
//! raised while a device is streaming.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**, **`MissingSettings`**: problems detected when a device
//!   or setting is defined, or when an initial bulk update is incomplete.
//! - **`UnknownSetting`**, **`NotImplemented`**, **`InvalidValue`**: a caller
//!   addressed a setting that is absent, not writable, or given the wrong value.
//! - **`IncompatibleState`**, **`Disabled`**: the operation is valid in general
//!   but not in the device's current state, such as a software trigger while
//!   the device waits for hardware edges.
//! - **`UnsupportedFeature`**: the device cannot do this at all, for instance a
//!   trigger type/mode pair it does not implement.
//! - **`Initialise`**, **`Hardware`**, **`Acquisition`**: faults reported by the
//!   driver. Acquisition faults raised while streaming are delivered to clients
//!   in band instead of surfacing here.
//! - **`Client`**: wraps [`ClientError`] so delivery failures compose with `?`.
//!
//! Configuration file problems have their own type in [`crate::config`].

use std::time::Duration;

use thiserror::Error;

use crate::data::client::ClientError;

/// Convenience alias for results using the device error type.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors raised by devices and their settings.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    /// Invalid definition detected at registration or construction time.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An `init` settings update did not cover every setting.
    #[error("update_settings init=true but missing keys: {}", .0.join(", "))]
    MissingSettings(Vec<String>),

    /// No setting with this name is registered.
    #[error("Unknown setting: {0}")]
    UnknownSetting(String),

    /// The operation has no implementation on this device.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// A value was rejected.
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue {
        /// What was being set.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The device is in a state where this operation is not allowed.
    #[error("Incompatible state: {0}")]
    IncompatibleState(String),

    /// The device must be enabled first.
    #[error("Device is disabled")]
    Disabled,

    /// The device does not support the requested feature.
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Hardware initialisation failed.
    #[error("Initialisation failed: {0}")]
    Initialise(String),

    /// Driver level communication or hardware fault.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Fault while acquiring data.
    #[error("Acquisition error: {0}")]
    Acquisition(String),

    /// A blocking wait gave up.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Delivering data to a client failed.
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// One or more members of a device group failed.
    #[error("{} device(s) in group failed: {}", .0.len(), join_errors(.0))]
    Group(Vec<(String, DeviceError)>),
}

fn join_errors(errors: &[(String, DeviceError)]) -> String {
    errors
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DeviceError {
    /// True for errors caused by the device's current state rather than a fault.
    pub fn is_incompatible_state(&self) -> bool {
        matches!(self, DeviceError::IncompatibleState(_) | DeviceError::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeviceError::Hardware("laser interlock open".to_string());
        assert_eq!(err.to_string(), "Hardware error: laser interlock open");
    }

    #[test]
    fn test_missing_settings_lists_names() {
        let err = DeviceError::MissingSettings(vec!["gain".into(), "roi".into()]);
        assert_eq!(
            err.to_string(),
            "update_settings init=true but missing keys: gain, roi"
        );
    }

    #[test]
    fn test_group_error_names_members() {
        let err = DeviceError::Group(vec![
            ("camera".into(), DeviceError::Hardware("timeout".into())),
            ("laser".into(), DeviceError::Initialise("no reply".into())),
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 device(s) in group failed"));
        assert!(msg.contains("camera: Hardware error: timeout"));
    }

    #[test]
    fn test_client_error_converts() {
        let err: DeviceError = ClientError::ConnectionClosed.into();
        assert!(matches!(err, DeviceError::Client(ClientError::ConnectionClosed)));
        assert!(!err.is_incompatible_state());
        assert!(DeviceError::Disabled.is_incompatible_state());
    }
}

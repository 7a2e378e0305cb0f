//! Trigger capability shared by cameras, light sources and mirrors.
//!
//! A trigger has two orthogonal parts: the [`TriggerType`] says what event counts
//! as a trigger, the [`TriggerMode`] says what the device does when it sees one.
//! Each device supports a small fixed set of `(type, mode)` pairs, usually kept in
//! a [`TriggerConfig`].

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DeviceError, DeviceResult};

/// What constitutes a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    /// A call to [`TriggerTarget::trigger`].
    Software,
    /// Rising edge on the trigger line.
    RisingEdge,
    /// Falling edge on the trigger line.
    FallingEdge,
    /// Trigger line held high.
    High,
    /// Trigger line held low.
    Low,
    /// A pulse on the trigger line.
    Pulse,
}

/// What a trigger does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Act once per trigger.
    Once,
    /// Act for as long as the trigger lasts.
    Bulb,
    /// Act repeatedly, once per trigger, without re-arming.
    Strobe,
    /// Start on the first trigger and keep going.
    Start,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Proof that [`TriggerTarget::trigger`] checked the trigger type.
///
/// Only this module can create one, so `do_trigger` cannot be reached from
/// outside without going through the check.
#[derive(Debug)]
pub struct TriggerToken(());

/// Devices that can be triggered.
pub trait TriggerTarget: Send + Sync {
    /// Currently configured trigger type.
    fn trigger_type(&self) -> TriggerType;

    /// Currently configured trigger mode.
    fn trigger_mode(&self) -> TriggerMode;

    /// Change the trigger configuration.
    ///
    /// Fails with [`DeviceError::UnsupportedFeature`] for pairs the device does
    /// not implement.
    fn set_trigger(&self, ttype: TriggerType, tmode: TriggerMode) -> DeviceResult<()>;

    /// Device specific action for one software trigger.
    fn do_trigger(&self, token: TriggerToken) -> DeviceResult<()>;

    /// Fire a software trigger.
    fn trigger(&self) -> DeviceResult<()> {
        let ttype = self.trigger_type();
        if ttype != TriggerType::Software {
            return Err(DeviceError::IncompatibleState(format!(
                "trigger type is {ttype}, not software"
            )));
        }
        self.do_trigger(TriggerToken(()))
    }
}

/// Allowed trigger pairs plus the current selection.
#[derive(Debug)]
pub struct TriggerConfig {
    allowed: Vec<(TriggerType, TriggerMode)>,
    current: Mutex<(TriggerType, TriggerMode)>,
}

impl TriggerConfig {
    /// Config with an explicit list of pairs. The first pair is selected.
    pub fn new(allowed: Vec<(TriggerType, TriggerMode)>) -> DeviceResult<Self> {
        let first = *allowed.first().ok_or_else(|| {
            DeviceError::Configuration("a trigger target needs at least one trigger pair".into())
        })?;
        Ok(Self {
            allowed,
            current: Mutex::new(first),
        })
    }

    /// Only `(Software, Once)`.
    pub fn software_once() -> Self {
        Self::single(TriggerType::Software, TriggerMode::Once)
    }

    /// Only `(Software, Bulb)`.
    pub fn software_bulb() -> Self {
        Self::single(TriggerType::Software, TriggerMode::Bulb)
    }

    fn single(ttype: TriggerType, tmode: TriggerMode) -> Self {
        Self {
            allowed: vec![(ttype, tmode)],
            current: Mutex::new((ttype, tmode)),
        }
    }

    /// Whether the pair can be selected.
    pub fn allows(&self, ttype: TriggerType, tmode: TriggerMode) -> bool {
        self.allowed.contains(&(ttype, tmode))
    }

    /// Selectable pairs.
    pub fn allowed(&self) -> &[(TriggerType, TriggerMode)] {
        &self.allowed
    }

    /// Current trigger type.
    pub fn trigger_type(&self) -> TriggerType {
        self.current.lock().0
    }

    /// Current trigger mode.
    pub fn trigger_mode(&self) -> TriggerMode {
        self.current.lock().1
    }

    /// Select a pair.
    pub fn set(&self, ttype: TriggerType, tmode: TriggerMode) -> DeviceResult<()> {
        if !self.allows(ttype, tmode) {
            return Err(DeviceError::UnsupportedFeature(format!(
                "trigger type {ttype} with mode {tmode}"
            )));
        }
        debug!(%ttype, %tmode, "Trigger configuration changed");
        *self.current.lock() = (ttype, tmode);
        Ok(())
    }
}

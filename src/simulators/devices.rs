//! Simulated light source, filter wheel, deformable mirror and controller.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::info;

use crate::controller::Controller;
use crate::device::{DeviceControl, Driver};
use crate::devices::{DeformableMirrorDriver, FilterWheelDriver, LightSourceDriver};
use crate::error::DeviceResult;
use crate::trigger::{TriggerConfig, TriggerMode, TriggerTarget, TriggerToken, TriggerType};

// =============================================================================
// Light source
// =============================================================================

#[derive(Debug, Default)]
struct Emitter {
    emission: bool,
    power: f64,
}

/// A light source that only remembers what it was told.
#[derive(Debug)]
pub struct SimulatedLightSource {
    state: Mutex<Emitter>,
    trigger: TriggerConfig,
}

impl Default for SimulatedLightSource {
    fn default() -> Self {
        Self {
            state: Mutex::new(Emitter::default()),
            trigger: TriggerConfig::software_bulb(),
        }
    }
}

impl SimulatedLightSource {
    /// Light source that is off at zero power.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Driver for SimulatedLightSource {
    fn do_enable(&self) -> DeviceResult<bool> {
        self.state.lock().emission = true;
        Ok(true)
    }

    fn do_disable(&self) -> DeviceResult<()> {
        self.state.lock().emission = false;
        Ok(())
    }

    fn do_shutdown(&self) -> DeviceResult<()> {
        Ok(())
    }

    fn as_trigger_target(&self) -> Option<&dyn TriggerTarget> {
        Some(self)
    }
}

impl TriggerTarget for SimulatedLightSource {
    fn trigger_type(&self) -> TriggerType {
        self.trigger.trigger_type()
    }

    fn trigger_mode(&self) -> TriggerMode {
        self.trigger.trigger_mode()
    }

    fn set_trigger(&self, ttype: TriggerType, tmode: TriggerMode) -> DeviceResult<()> {
        self.trigger.set(ttype, tmode)
    }

    fn do_trigger(&self, _token: TriggerToken) -> DeviceResult<()> {
        Ok(())
    }
}

impl LightSourceDriver for SimulatedLightSource {
    fn status(&self) -> DeviceResult<Vec<String>> {
        let state = self.state.lock();
        Ok(vec![state.emission.to_string(), state.power.to_string()])
    }

    fn is_on(&self) -> DeviceResult<bool> {
        Ok(self.state.lock().emission)
    }

    fn do_get_power(&self) -> DeviceResult<f64> {
        let state = self.state.lock();
        Ok(if state.emission { state.power } else { 0.0 })
    }

    fn do_set_power(&self, power: f64) -> DeviceResult<()> {
        info!(power, "Power set");
        self.state.lock().power = power;
        Ok(())
    }
}

// =============================================================================
// Filter wheel
// =============================================================================

/// Constructor arguments of [`SimulatedFilterWheel`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterWheelConf {
    /// Number of filter positions
    pub positions: usize,
}

/// A filter wheel that moves instantly.
#[derive(Debug, Default)]
pub struct SimulatedFilterWheel {
    position: Mutex<usize>,
}

impl SimulatedFilterWheel {
    /// Wheel at position 0.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Driver for SimulatedFilterWheel {
    fn do_shutdown(&self) -> DeviceResult<()> {
        Ok(())
    }
}

impl FilterWheelDriver for SimulatedFilterWheel {
    fn do_get_position(&self) -> DeviceResult<usize> {
        Ok(*self.position.lock())
    }

    fn do_set_position(&self, position: usize) -> DeviceResult<()> {
        info!(position, "Setting position");
        *self.position.lock() = position;
        Ok(())
    }
}

// =============================================================================
// Deformable mirror
// =============================================================================

/// Constructor arguments of [`SimulatedDeformableMirror`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeformableMirrorConf {
    /// Number of actuators
    pub n_actuators: usize,
}

/// A deformable mirror that keeps the last applied pattern.
#[derive(Debug)]
pub struct SimulatedDeformableMirror {
    n_actuators: usize,
    current: Mutex<Option<Vec<f64>>>,
    trigger: TriggerConfig,
}

impl SimulatedDeformableMirror {
    /// Mirror with `n_actuators` actuators.
    pub fn new(n_actuators: usize) -> Self {
        Self {
            n_actuators,
            current: Mutex::new(None),
            trigger: TriggerConfig::software_once(),
        }
    }

    /// Last pattern applied, for inspection during development.
    pub fn current_pattern(&self) -> Option<Vec<f64>> {
        self.current.lock().clone()
    }
}

impl Driver for SimulatedDeformableMirror {
    fn do_shutdown(&self) -> DeviceResult<()> {
        Ok(())
    }

    fn as_trigger_target(&self) -> Option<&dyn TriggerTarget> {
        Some(self)
    }
}

impl TriggerTarget for SimulatedDeformableMirror {
    fn trigger_type(&self) -> TriggerType {
        self.trigger.trigger_type()
    }

    fn trigger_mode(&self) -> TriggerMode {
        self.trigger.trigger_mode()
    }

    fn set_trigger(&self, ttype: TriggerType, tmode: TriggerMode) -> DeviceResult<()> {
        self.trigger.set(ttype, tmode)
    }

    fn do_trigger(&self, _token: TriggerToken) -> DeviceResult<()> {
        Ok(())
    }
}

impl DeformableMirrorDriver for SimulatedDeformableMirror {
    fn n_actuators(&self) -> usize {
        self.n_actuators
    }

    fn do_apply_pattern(&self, pattern: &[f64]) -> DeviceResult<()> {
        *self.current.lock() = Some(pattern.to_vec());
        Ok(())
    }
}

// =============================================================================
// Controller
// =============================================================================

/// A controller over already constructed devices.
pub fn simulated_controller(
    devices: BTreeMap<String, Box<dyn DeviceControl>>,
) -> DeviceResult<Controller> {
    Controller::controller(devices)
}

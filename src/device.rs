//! Device lifecycle.
//!
//! A concrete device is written as a [`Driver`]: a set of hooks that talk to the
//! hardware. [`Device`] wraps a driver and owns the parts every device shares,
//! namely the tri-state `enabled` flag, the settings registry, and the
//! initialise → enable/disable → shutdown sequence with its error policy.
//!
//! [`DeviceControl`] is the object safe view used where devices of different
//! types are handled together (controllers, the device server).

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::error::DeviceResult;
use crate::setting::{SettingDescription, SettingValue, Settings, UpdateOutcome};
use crate::trigger::TriggerTarget;

/// Hardware hooks for one device.
///
/// Drivers keep their mutable state behind shared handles so that setting
/// closures registered in [`Driver::register_settings`] can reach it.
pub trait Driver: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> String {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    }

    /// Register device specific settings.
    fn register_settings(&self, _settings: &Settings) -> DeviceResult<()> {
        Ok(())
    }

    /// Connect to and configure the hardware. May be retried.
    fn initialize(&self) -> DeviceResult<()> {
        Ok(())
    }

    /// Prepare the hardware for use. Returns whether the device is now enabled.
    fn do_enable(&self) -> DeviceResult<bool> {
        Ok(true)
    }

    /// Put the hardware in a safe idle state.
    fn do_disable(&self) -> DeviceResult<()> {
        Ok(())
    }

    /// Release the hardware.
    fn do_shutdown(&self) -> DeviceResult<()>;

    /// Floating identity, for devices whose address is only known after
    /// initialisation.
    fn as_floating(&self) -> Option<&dyn FloatingDevice> {
        None
    }

    /// Trigger capability, if the device has one.
    fn as_trigger_target(&self) -> Option<&dyn TriggerTarget> {
        None
    }
}

/// A device whose identity is read from the hardware.
pub trait FloatingDevice: Send + Sync {
    /// Unique identifier, typically a serial number.
    fn get_id(&self) -> DeviceResult<String>;
}

/// Lifecycle wrapper around a [`Driver`].
pub struct Device<D: Driver> {
    driver: Arc<D>,
    name: String,
    index: Option<usize>,
    settings: Settings,
    enabled: RwLock<Option<bool>>,
    shut_down: AtomicBool,
}

impl<D: Driver> Device<D> {
    /// Wrap `driver` and register its settings.
    pub fn new(driver: D) -> DeviceResult<Self> {
        Self::build(Arc::new(driver), None, |_| Ok(()))
    }

    /// Same as [`Device::new`] for the `index`-th device under one SDK.
    pub fn with_index(driver: D, index: usize) -> DeviceResult<Self> {
        Self::build(Arc::new(driver), Some(index), |_| Ok(()))
    }

    /// Settings registered by `pre` come before the driver's own.
    pub(crate) fn build<F>(driver: Arc<D>, index: Option<usize>, pre: F) -> DeviceResult<Self>
    where
        F: FnOnce(&Settings) -> DeviceResult<()>,
    {
        let settings = Settings::new();
        pre(&settings)?;
        driver.register_settings(&settings)?;
        let name = match index {
            Some(i) => format!("{}[{i}]", driver.name()),
            None => driver.name(),
        };
        Ok(Self {
            driver,
            name,
            index,
            settings,
            enabled: RwLock::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// The wrapped driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub(crate) fn driver_arc(&self) -> &Arc<D> {
        &self.driver
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index among sibling devices, if any.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Settings registry.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// `None` until the device has been enabled or disabled once.
    pub fn is_enabled(&self) -> Option<bool> {
        *self.enabled.read()
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        *self.enabled.write() = Some(enabled);
    }

    /// Initialise the hardware.
    pub fn initialize(&self) -> DeviceResult<()> {
        self.driver.initialize()
    }

    /// Enable the device.
    ///
    /// Failures of the enable hook are logged and leave the device disabled.
    pub fn enable(&self) -> bool {
        let enabled = match self.driver.do_enable() {
            Ok(enabled) => enabled,
            Err(err) => {
                error!(device = %self.name, error = %err, "Failed to enable device");
                false
            }
        };
        self.set_enabled(enabled);
        enabled
    }

    /// Disable the device. The flag is cleared even if the hook fails.
    pub fn disable(&self) -> DeviceResult<()> {
        let result = self.driver.do_disable();
        self.set_enabled(false);
        if let Err(err) = &result {
            warn!(device = %self.name, error = %err, "Disable hook failed");
        }
        result
    }

    /// Disable and release the device. Never fails; errors are logged.
    pub fn shutdown(&self) {
        self.shutdown_with(|| self.disable());
    }

    /// Shutdown sequence with a caller supplied disable step. Runs once.
    pub(crate) fn shutdown_with<F>(&self, disable: F)
    where
        F: FnOnce() -> DeviceResult<()>,
    {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(device = %self.name, "Shutting down device");
        if let Err(err) = disable() {
            warn!(device = %self.name, error = %err, "Ignoring error while disabling for shutdown");
        }
        if let Err(err) = self.driver.do_shutdown() {
            error!(device = %self.name, error = %err, "Error in device shutdown hook");
        }
        info!(device = %self.name, "Device shut down");
    }

    /// True once [`Device::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl<D: Driver> Drop for Device<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Object safe device interface.
pub trait DeviceControl: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Index among sibling devices.
    fn index(&self) -> Option<usize>;

    /// Initialise the hardware.
    fn initialize(&self) -> DeviceResult<()>;

    /// Enable the device.
    fn enable(&self) -> DeviceResult<bool>;

    /// Disable the device.
    fn disable(&self) -> DeviceResult<()>;

    /// Shut the device down. Never fails.
    fn shutdown(&self);

    /// Tri-state enabled flag.
    fn is_enabled(&self) -> Option<bool>;

    /// Settings registry.
    fn settings(&self) -> &Settings;

    /// Identity of a floating device, `None` for fixed devices.
    fn floating_id(&self) -> Option<DeviceResult<String>> {
        None
    }

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Read one setting.
    fn get_setting(&self, name: &str) -> DeviceResult<SettingValue> {
        self.settings().get_value(name)
    }

    /// Write one setting.
    fn set_setting(&self, name: &str, value: SettingValue) -> DeviceResult<()> {
        self.settings().set_value(name, value)
    }

    /// Describe every setting.
    fn describe_settings(&self) -> Vec<(String, SettingDescription)> {
        self.settings().describe_all()
    }

    /// Read every setting, reporting failures as `None`.
    fn get_all_settings(&self) -> Vec<(String, Option<SettingValue>)> {
        self.settings().get_all()
    }

    /// Apply a batch of values. See [`Settings::update`].
    fn update_settings(
        &self,
        incoming: &BTreeMap<String, SettingValue>,
        init: bool,
    ) -> DeviceResult<BTreeMap<String, UpdateOutcome>> {
        self.settings().update(incoming, init)
    }
}

impl<D: Driver> DeviceControl for Device<D> {
    fn name(&self) -> &str {
        Device::name(self)
    }

    fn index(&self) -> Option<usize> {
        Device::index(self)
    }

    fn initialize(&self) -> DeviceResult<()> {
        Device::initialize(self)
    }

    fn enable(&self) -> DeviceResult<bool> {
        Ok(Device::enable(self))
    }

    fn disable(&self) -> DeviceResult<()> {
        Device::disable(self)
    }

    fn shutdown(&self) {
        Device::shutdown(self);
    }

    fn is_enabled(&self) -> Option<bool> {
        Device::is_enabled(self)
    }

    fn settings(&self) -> &Settings {
        Device::settings(self)
    }

    fn floating_id(&self) -> Option<DeviceResult<String>> {
        self.driver.as_floating().map(|floating| floating.get_id())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

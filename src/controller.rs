//! Devices that control other devices.
//!
//! A controller is typically one box on one connection driving several
//! devices: a stage plus a filter wheel, or a multi-laser engine. Each
//! controlled device has a name. Initialising or shutting down the controller
//! does the same for every controlled device; one failure never prevents the
//! others from being handled.

use std::collections::BTreeMap;

use tracing::{error, info};

use crate::device::{Device, DeviceControl, Driver};
use crate::error::{DeviceError, DeviceResult};

/// Driver owning a named set of devices.
pub struct DeviceGroup {
    devices: BTreeMap<String, Box<dyn DeviceControl>>,
}

impl DeviceGroup {
    /// Group owning `devices`.
    pub fn new(devices: BTreeMap<String, Box<dyn DeviceControl>>) -> Self {
        Self { devices }
    }

    /// Controlled devices by name.
    pub fn devices(&self) -> &BTreeMap<String, Box<dyn DeviceControl>> {
        &self.devices
    }

    /// One controlled device.
    pub fn device(&self, name: &str) -> Option<&dyn DeviceControl> {
        self.devices.get(name).map(|d| d.as_ref())
    }

    /// Run `op` on every device and collect the failures.
    fn fan_out<F>(&self, op: F) -> DeviceResult<()>
    where
        F: Fn(&dyn DeviceControl) -> DeviceResult<()>,
    {
        let failures: Vec<(String, DeviceError)> = self
            .devices
            .iter()
            .filter_map(|(name, device)| op(device.as_ref()).err().map(|err| (name.clone(), err)))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DeviceError::Group(failures))
        }
    }
}

impl Driver for DeviceGroup {
    fn initialize(&self) -> DeviceResult<()> {
        self.fan_out(|device| {
            device.initialize().map_err(|err| {
                error!(device = %device.name(), error = %err, "Failed to initialise controlled device");
                err
            })
        })
    }

    fn do_shutdown(&self) -> DeviceResult<()> {
        for (name, device) in &self.devices {
            info!(controlled = %name, "Shutting down controlled device");
            device.shutdown();
        }
        Ok(())
    }
}

/// A device controlling other devices.
pub type Controller = Device<DeviceGroup>;

impl Device<DeviceGroup> {
    /// Controller over `devices`.
    pub fn controller(devices: BTreeMap<String, Box<dyn DeviceControl>>) -> DeviceResult<Self> {
        Device::new(DeviceGroup::new(devices))
    }

    /// Controlled devices by name.
    pub fn devices(&self) -> &BTreeMap<String, Box<dyn DeviceControl>> {
        self.driver().devices()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Axis {
        fail_init: bool,
        inits: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl Driver for Axis {
        fn initialize(&self) -> DeviceResult<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(DeviceError::Initialise("no reply".into()));
            }
            Ok(())
        }

        fn do_shutdown(&self) -> DeviceResult<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn group(fail: &[&str]) -> (Controller, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let inits = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let mut devices: BTreeMap<String, Box<dyn DeviceControl>> = BTreeMap::new();
        for name in ["x", "y", "z"] {
            let axis = Axis {
                fail_init: fail.contains(&name),
                inits: Arc::clone(&inits),
                shutdowns: Arc::clone(&shutdowns),
            };
            devices.insert(name.to_string(), Box::new(Device::new(axis).unwrap()));
        }
        (Controller::controller(devices).unwrap(), inits, shutdowns)
    }

    #[test]
    fn test_initialize_does_not_short_circuit() {
        let (controller, inits, _) = group(&["x", "z"]);
        let err = controller.initialize().unwrap_err();
        assert_eq!(inits.load(Ordering::SeqCst), 3);
        match err {
            DeviceError::Group(failures) => {
                let names: Vec<_> = failures.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["x", "z"]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_shutdown_reaches_every_device() {
        let (controller, _, shutdowns) = group(&[]);
        controller.initialize().unwrap();
        assert_eq!(controller.devices().len(), 3);
        controller.shutdown();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 3);
        assert!(controller.driver().device("y").is_some());
    }
}

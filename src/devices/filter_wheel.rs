//! Filter wheels, cube turrets and filter sliders.

use std::sync::Arc;

use tracing::info;

use crate::device::{Device, Driver};
use crate::error::{DeviceError, DeviceResult};
use crate::setting::{Dtype, SettingBuilder, Settings};

use super::delegate_device_control;

/// Hardware hooks of a filter wheel.
pub trait FilterWheelDriver: Driver {
    /// Current zero-based position.
    fn do_get_position(&self) -> DeviceResult<usize>;

    /// Move to `position`; always called with a valid position.
    fn do_set_position(&self, position: usize) -> DeviceResult<()>;
}

struct Positioner<D> {
    driver: Arc<D>,
    positions: usize,
}

impl<D> Clone for Positioner<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            positions: self.positions,
        }
    }
}

impl<D: FilterWheelDriver> Positioner<D> {
    fn move_to(&self, position: usize) -> DeviceResult<()> {
        if position >= self.positions {
            return Err(DeviceError::InvalidValue {
                name: "position".into(),
                reason: format!(
                    "can't move to position {position}, limits are [0 {}]",
                    self.positions - 1
                ),
            });
        }
        info!(position, "Moving filter wheel");
        self.driver.do_set_position(position)
    }

    fn register(&self, settings: &Settings) -> DeviceResult<()> {
        let (get, set) = (self.clone(), self.clone());
        settings.add(
            SettingBuilder::new("position", Dtype::Int)
                .getter(move || get.driver.do_get_position())
                .setter(move |position: usize| set.move_to(position))
                .range(0, self.positions - 1),
        )
    }
}

/// A device with a fixed number of filter positions.
pub struct FilterWheel<D: FilterWheelDriver> {
    device: Device<D>,
    positioner: Positioner<D>,
}

impl<D: FilterWheelDriver> FilterWheel<D> {
    /// Wrap `driver` for a wheel with `positions` slots.
    pub fn new(driver: D, positions: usize) -> DeviceResult<Self> {
        Self::build(driver, positions, None)
    }

    /// Same as [`FilterWheel::new`] for the `index`-th wheel under one SDK.
    pub fn with_index(driver: D, positions: usize, index: usize) -> DeviceResult<Self> {
        Self::build(driver, positions, Some(index))
    }

    fn build(driver: D, positions: usize, index: Option<usize>) -> DeviceResult<Self> {
        if positions < 1 {
            return Err(DeviceError::Configuration(format!(
                "positions must be a positive number (was {positions})"
            )));
        }
        let driver = Arc::new(driver);
        let positioner = Positioner {
            driver: Arc::clone(&driver),
            positions,
        };
        let device = Device::build(driver, index, |settings| positioner.register(settings))?;
        Ok(Self { device, positioner })
    }

    /// Underlying device.
    pub fn device(&self) -> &Device<D> {
        &self.device
    }

    /// The wrapped driver.
    pub fn driver(&self) -> &D {
        self.device.driver()
    }

    /// Settings registry.
    pub fn settings(&self) -> &Settings {
        self.device.settings()
    }

    /// Number of positions.
    pub fn n_positions(&self) -> usize {
        self.positioner.positions
    }

    /// Current zero-based position.
    pub fn position(&self) -> DeviceResult<usize> {
        self.driver().do_get_position()
    }

    /// Move to a zero-based position.
    pub fn set_position(&self, position: usize) -> DeviceResult<()> {
        self.positioner.move_to(position)
    }

    /// Disable and release the hardware.
    pub fn shutdown(&self) {
        self.device.shutdown();
    }
}

delegate_device_control!(FilterWheel, FilterWheelDriver);

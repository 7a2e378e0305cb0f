//! Lasers, LEDs and other light sources.
//!
//! Light sources usually only support the bulb trigger mode. The trigger type
//! decides what enabling means: with a software trigger the source emits as
//! soon as it is enabled, with a high/low trigger it is armed to emit only
//! while the input line is in that state.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::device::{Device, Driver};
use crate::error::DeviceResult;
use crate::setting::{Dtype, SettingBuilder, Settings};
use crate::trigger::{TriggerMode, TriggerTarget, TriggerType};

use super::delegate_device_control;

/// Hardware hooks of a light source.
pub trait LightSourceDriver: Driver + TriggerTarget {
    /// Human readable status lines.
    fn status(&self) -> DeviceResult<Vec<String>>;

    /// Whether the source is currently able to emit.
    fn is_on(&self) -> DeviceResult<bool>;

    /// Power in `[0, 1]` as reported by the hardware.
    fn do_get_power(&self) -> DeviceResult<f64>;

    /// Set power; always called with a value in `[0, 1]`.
    fn do_set_power(&self, power: f64) -> DeviceResult<()>;
}

struct PowerControl<D> {
    driver: Arc<D>,
    set_point: Arc<Mutex<f64>>,
}

impl<D> Clone for PowerControl<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            set_point: Arc::clone(&self.set_point),
        }
    }
}

impl<D: LightSourceDriver> PowerControl<D> {
    fn power(&self) -> DeviceResult<f64> {
        if !self.driver.is_on()? {
            return Ok(0.0);
        }
        self.driver.do_get_power()
    }

    fn set_power(&self, power: f64) -> DeviceResult<()> {
        let clipped = power.clamp(0.0, 1.0);
        if clipped != power {
            debug!(requested = power, clipped, "Clipping power");
        }
        self.driver.do_set_power(clipped)?;
        *self.set_point.lock() = clipped;
        Ok(())
    }

    fn register(&self, settings: &Settings) -> DeviceResult<()> {
        let (get, set) = (self.clone(), self.clone());
        settings.add(
            SettingBuilder::new("power", Dtype::Float)
                .getter(move || get.power())
                .setter(move |power: f64| set.set_power(power))
                .range(0.0, 1.0),
        )
    }
}

/// A light source.
pub struct LightSource<D: LightSourceDriver> {
    device: Device<D>,
    power: PowerControl<D>,
}

impl<D: LightSourceDriver> LightSource<D> {
    /// Wrap `driver`. Registers the `power` setting.
    pub fn new(driver: D) -> DeviceResult<Self> {
        Self::build(driver, None)
    }

    /// Same as [`LightSource::new`] for the `index`-th source under one SDK.
    pub fn with_index(driver: D, index: usize) -> DeviceResult<Self> {
        Self::build(driver, Some(index))
    }

    fn build(driver: D, index: Option<usize>) -> DeviceResult<Self> {
        let driver = Arc::new(driver);
        let power = PowerControl {
            driver: Arc::clone(&driver),
            set_point: Arc::new(Mutex::new(0.0)),
        };
        let device = Device::build(driver, index, |settings| power.register(settings))?;
        Ok(Self { device, power })
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

    /// Enable emission (or arm the trigger).
    pub fn enable(&self) -> bool {
        self.device.enable()
    }

    /// Stop emission.
    pub fn disable(&self) -> DeviceResult<()> {
        self.device.disable()
    }

    /// Disable and release the hardware.
    pub fn shutdown(&self) {
        self.device.shutdown();
    }

    /// Current power in `[0, 1]`; zero while the source is off.
    pub fn power(&self) -> DeviceResult<f64> {
        self.power.power()
    }

    /// Set the power, clipped to `[0, 1]`.
    pub fn set_power(&self, power: f64) -> DeviceResult<()> {
        self.power.set_power(power)
    }

    /// Last power requested, after clipping.
    pub fn set_point(&self) -> f64 {
        *self.power.set_point.lock()
    }

    /// Whether the source can currently emit.
    pub fn is_on(&self) -> DeviceResult<bool> {
        self.driver().is_on()
    }

    /// Status lines reported by the hardware.
    pub fn status(&self) -> DeviceResult<Vec<String>> {
        self.driver().status()
    }

    /// Configured trigger type.
    pub fn trigger_type(&self) -> TriggerType {
        self.driver().trigger_type()
    }

    /// Configured trigger mode.
    pub fn trigger_mode(&self) -> TriggerMode {
        self.driver().trigger_mode()
    }

    /// Change the trigger configuration.
    pub fn set_trigger(&self, ttype: TriggerType, tmode: TriggerMode) -> DeviceResult<()> {
        self.driver().set_trigger(ttype, tmode)
    }

    /// Fire a software trigger.
    pub fn trigger(&self) -> DeviceResult<()> {
        self.driver().trigger()
    }
}

delegate_device_control!(LightSource, LightSourceDriver);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setting::{SettingValue, Values};
    use crate::trigger::{TriggerConfig, TriggerToken};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Led {
        on: AtomicBool,
        power: Mutex<f64>,
        trigger: TriggerConfig,
    }

    impl Default for Led {
        fn default() -> Self {
            Self {
                on: AtomicBool::new(false),
                power: Mutex::new(0.0),
                trigger: TriggerConfig::software_bulb(),
            }
        }
    }

    impl Driver for Led {
        fn do_enable(&self) -> DeviceResult<bool> {
            self.on.store(true, Ordering::SeqCst);
            Ok(true)
        }

        fn do_disable(&self) -> DeviceResult<()> {
            self.on.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn do_shutdown(&self) -> DeviceResult<()> {
            Ok(())
        }
    }

    impl TriggerTarget for Led {
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

    impl LightSourceDriver for Led {
        fn status(&self) -> DeviceResult<Vec<String>> {
            Ok(vec![self.on.load(Ordering::SeqCst).to_string()])
        }

        fn is_on(&self) -> DeviceResult<bool> {
            Ok(self.on.load(Ordering::SeqCst))
        }

        fn do_get_power(&self) -> DeviceResult<f64> {
            Ok(*self.power.lock())
        }

        fn do_set_power(&self, power: f64) -> DeviceResult<()> {
            *self.power.lock() = power;
            Ok(())
        }
    }

    #[test]
    fn test_power_is_clipped() {
        let led = LightSource::new(Led::default()).unwrap();
        led.enable();
        led.set_power(1.7).unwrap();
        assert_eq!(led.power().unwrap(), 1.0);
        assert_eq!(led.set_point(), 1.0);
        led.set_power(-0.2).unwrap();
        assert_eq!(led.power().unwrap(), 0.0);
    }

    #[test]
    fn test_power_reads_zero_when_off() {
        let led = LightSource::new(Led::default()).unwrap();
        led.set_power(0.5).unwrap();
        assert_eq!(led.power().unwrap(), 0.0);
        led.enable();
        assert_eq!(led.power().unwrap(), 0.5);
        led.disable().unwrap();
        assert_eq!(led.power().unwrap(), 0.0);
        assert_eq!(led.set_point(), 0.5);
    }

    #[test]
    fn test_power_setting() {
        let led = LightSource::new(Led::default()).unwrap();
        let described = led.settings().describe("power").unwrap();
        assert_eq!(described.values, Values::range(0.0, 1.0));
        led.enable();
        led.settings()
            .set_value("power", SettingValue::Float(0.25))
            .unwrap();
        assert_eq!(led.driver().do_get_power().unwrap(), 0.25);
    }

    #[test]
    fn test_only_bulb_mode() {
        let led = LightSource::new(Led::default()).unwrap();
        assert_eq!(led.trigger_mode(), TriggerMode::Bulb);
        assert!(led.set_trigger(TriggerType::Software, TriggerMode::Once).is_err());
        led.trigger().unwrap();
    }
}

//! Simulated camera.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, info};

use crate::camera::{Binning, CameraDriver, Frame, Roi};
use crate::data::DataDriver;
use crate::device::{Driver, FloatingDevice};
use crate::error::{DeviceError, DeviceResult};
use crate::server::SdkRegistry;
use crate::setting::{Dtype, SettingBuilder, Settings};
use crate::trigger::{TriggerConfig, TriggerMode, TriggerTarget, TriggerToken, TriggerType};

use super::image::{ImageGenerator, ImagePattern, PixelType};

/// Shape of the simulated sensor.
pub const SENSOR_SHAPE: (u32, u32) = (512, 512);

/// Name under which floating simulated cameras share their "SDK".
pub const SIMULATED_SDK: &str = "simulated-camera-sdk";

/// Constructor arguments of [`SimulatedCamera`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimulatedCameraConf {
    /// Initial exposure time in seconds
    pub exposure_time: f64,
    /// Dispatch queue capacity; 0 is unbounded
    pub queue_capacity: usize,
}

impl Default for SimulatedCameraConf {
    fn default() -> Self {
        Self {
            exposure_time: 0.1,
            queue_capacity: 0,
        }
    }
}

#[derive(Debug)]
struct State {
    roi: Roi,
    binning: Binning,
    exposure_time: f64,
    acquiring: bool,
    triggered: u32,
    sent: u64,
    error_percent: i64,
    gain: i64,
    generator: ImageGenerator,
}

/// A camera producing generated test images.
///
/// Acquires one frame per software trigger. The `_error_percent` setting makes
/// that share of fetches fail, for exercising error paths in clients.
pub struct SimulatedCamera {
    state: Arc<Mutex<State>>,
    trigger: TriggerConfig,
    uid: Option<String>,
}

impl SimulatedCamera {
    /// Camera with the given exposure time.
    pub fn new(exposure_time: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                roi: Roi::new(0, 0, SENSOR_SHAPE.0, SENSOR_SHAPE.1),
                binning: Binning::default(),
                exposure_time,
                acquiring: false,
                triggered: 0,
                sent: 0,
                error_percent: 0,
                gain: 0,
                generator: ImageGenerator::default(),
            })),
            trigger: TriggerConfig::software_once(),
            uid: None,
        }
    }

    /// Camera reached through a shared SDK, identified by `uid` once open.
    pub fn floating(uid: impl Into<String>, exposure_time: f64) -> DeviceResult<Self> {
        SdkRegistry::acquire(SIMULATED_SDK, || Ok(()))?;
        let mut camera = Self::new(exposure_time);
        camera.uid = Some(uid.into());
        Ok(camera)
    }

    /// Number of frames sent since acquisition last started.
    pub fn sent(&self) -> u64 {
        self.state.lock().sent
    }
}

impl Driver for SimulatedCamera {
    fn register_settings(&self, settings: &Settings) -> DeviceResult<()> {
        let state = &self.state;

        let (get, set) = (Arc::clone(state), Arc::clone(state));
        settings.add(
            SettingBuilder::for_enum::<ImagePattern>("image pattern")
                .enum_getter(move || Ok(get.lock().generator.pattern))
                .enum_setter(move |pattern: ImagePattern| {
                    set.lock().generator.pattern = pattern;
                    Ok(())
                }),
        )?;

        let (get, set) = (Arc::clone(state), Arc::clone(state));
        settings.add(
            SettingBuilder::for_enum::<PixelType>("image data type")
                .enum_getter(move || Ok(get.lock().generator.pixel_type))
                .enum_setter(move |pixel_type: PixelType| {
                    set.lock().generator.pixel_type = pixel_type;
                    Ok(())
                }),
        )?;

        let (get, set) = (Arc::clone(state), Arc::clone(state));
        settings.add(
            SettingBuilder::new("display image number", Dtype::Bool)
                .getter(move || Ok(get.lock().generator.numbering))
                .setter(move |numbering: bool| {
                    set.lock().generator.numbering = numbering;
                    Ok(())
                }),
        )?;

        let (get, set) = (Arc::clone(state), Arc::clone(state));
        settings.add(
            SettingBuilder::new("gain", Dtype::Int)
                .getter(move || Ok(get.lock().gain))
                .setter(move |gain: i64| {
                    set.lock().gain = gain;
                    Ok(())
                })
                .range(0, 8192),
        )?;

        let (get, set) = (Arc::clone(state), Arc::clone(state));
        settings.add(
            SettingBuilder::new("_error_percent", Dtype::Int)
                .getter(move || Ok(get.lock().error_percent))
                .setter(move |percent: i64| {
                    set.lock().error_percent = percent;
                    Ok(())
                })
                .range(0, 100),
        )
    }

    fn do_enable(&self) -> DeviceResult<bool> {
        info!("Preparing for acquisition");
        let mut state = self.state.lock();
        state.acquiring = true;
        state.triggered = 0;
        state.sent = 0;
        info!("Acquisition enabled");
        Ok(true)
    }

    fn do_disable(&self) -> DeviceResult<()> {
        self.abort()
    }

    fn do_shutdown(&self) -> DeviceResult<()> {
        if self.uid.is_some() {
            SdkRegistry::release(SIMULATED_SDK, || Ok(()))?;
        }
        Ok(())
    }

    fn as_floating(&self) -> Option<&dyn FloatingDevice> {
        self.uid.as_ref().map(|_| self as &dyn FloatingDevice)
    }

    fn as_trigger_target(&self) -> Option<&dyn TriggerTarget> {
        Some(self)
    }
}

impl FloatingDevice for SimulatedCamera {
    fn get_id(&self) -> DeviceResult<String> {
        self.uid
            .clone()
            .ok_or_else(|| DeviceError::NotImplemented("camera has no uid".into()))
    }
}

impl TriggerTarget for SimulatedCamera {
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
        let mut state = self.state.lock();
        debug!(acquiring = state.acquiring, "Trigger received");
        if state.acquiring {
            state.triggered += 1;
        }
        Ok(())
    }
}

impl DataDriver for SimulatedCamera {
    type Sample = Frame;

    fn abort(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        if state.acquiring {
            info!(sent = state.sent, "Disabling acquisition");
            state.acquiring = false;
        }
        Ok(())
    }

    fn fetch_data(&self) -> DeviceResult<Option<Frame>> {
        let (exposure, roi, binning, index, error_percent) = {
            let mut state = self.state.lock();
            if !state.acquiring || state.triggered == 0 {
                return Ok(None);
            }
            state.triggered -= 1;
            let index = state.sent;
            state.sent += 1;
            (state.exposure_time, state.roi, state.binning, index, state.error_percent)
        };

        let mut rng = rand::thread_rng();
        if rng.gen_range(0..100) < error_percent {
            info!("Raising simulated fault");
            return Err(DeviceError::Hardware(
                "simulated fault in SimulatedCamera fetch".into(),
            ));
        }
        if exposure > 0.0 {
            thread::sleep(Duration::from_secs_f64(exposure));
        }
        let dark = (32.0 * rng.gen::<f64>()).floor();
        let light = (255.0 - 128.0 * rng.gen::<f64>()).floor();
        let width = (roi.width / binning.h.max(1)) as usize;
        let height = (roi.height / binning.v.max(1)) as usize;
        debug!(index, width, height, "Sending image");
        let frame = self
            .state
            .lock()
            .generator
            .image(width, height, dark, light, Some(index))?;
        Ok(Some(frame))
    }
}

impl CameraDriver for SimulatedCamera {
    fn sensor_shape(&self) -> DeviceResult<(u32, u32)> {
        Ok(SENSOR_SHAPE)
    }

    fn binning(&self) -> DeviceResult<Binning> {
        Ok(self.state.lock().binning)
    }

    fn set_binning(&self, binning: Binning) -> DeviceResult<()> {
        self.state.lock().binning = binning;
        Ok(())
    }

    fn roi(&self) -> DeviceResult<Roi> {
        Ok(self.state.lock().roi)
    }

    fn set_roi(&self, roi: Roi) -> DeviceResult<()> {
        if roi.left + roi.width > SENSOR_SHAPE.0 || roi.top + roi.height > SENSOR_SHAPE.1 {
            return Err(DeviceError::InvalidValue {
                name: "roi".into(),
                reason: format!("{roi:?} exceeds the {SENSOR_SHAPE:?} sensor"),
            });
        }
        self.state.lock().roi = roi;
        Ok(())
    }

    fn exposure_time(&self) -> DeviceResult<f64> {
        Ok(self.state.lock().exposure_time)
    }

    fn set_exposure_time(&self, seconds: f64) -> DeviceResult<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(DeviceError::InvalidValue {
                name: "exposure time".into(),
                reason: format!("{seconds} is not a valid time"),
            });
        }
        self.state.lock().exposure_time = seconds;
        Ok(())
    }

    fn cycle_time(&self) -> DeviceResult<f64> {
        self.exposure_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::setting::SettingValue;
    use crate::simulators::image::read_stamp;

    fn camera() -> Camera<SimulatedCamera> {
        Camera::new(SimulatedCamera::new(0.0)).unwrap()
    }

    #[test]
    fn test_settings_registered_after_camera_settings() {
        let camera = camera();
        let names = camera.settings().names();
        assert_eq!(
            names,
            [
                "transform",
                "readout mode",
                "roi",
                "image pattern",
                "image data type",
                "display image number",
                "gain",
                "_error_percent",
            ]
        );
    }

    #[test]
    fn test_no_frame_without_trigger() {
        let driver = SimulatedCamera::new(0.0);
        driver.do_enable().unwrap();
        assert!(driver.fetch_data().unwrap().is_none());
        driver.trigger().unwrap();
        let frame = driver.fetch_data().unwrap().unwrap();
        assert_eq!(frame.shape(), (512, 512));
        assert_eq!(read_stamp(&frame), Some(0));
        assert!(driver.fetch_data().unwrap().is_none());
    }

    #[test]
    fn test_frame_size_follows_roi_and_binning() {
        let camera = camera();
        camera.set_binning(Binning::new(2, 4)).unwrap();
        camera.set_roi(Roi::new(0, 0, 128, 64)).unwrap();
        camera.enable().unwrap();
        let frame = camera
            .grab_next_data_timeout(true, Duration::from_secs(5))
            .unwrap();
        assert_eq!(frame.shape(), (64, 16));
        camera.shutdown();
    }

    #[test]
    fn test_trigger_ignored_while_not_acquiring() {
        let driver = SimulatedCamera::new(0.0);
        driver.trigger().unwrap();
        driver.do_enable().unwrap();
        assert!(driver.fetch_data().unwrap().is_none());
    }

    #[test]
    fn test_error_percent_produces_faults() {
        let camera = camera();
        camera
            .settings()
            .set_value("_error_percent", SettingValue::Int(100))
            .unwrap();
        let driver = camera.driver();
        driver.do_enable().unwrap();
        driver.trigger().unwrap();
        assert!(matches!(driver.fetch_data(), Err(DeviceError::Hardware(_))));
    }

    #[test]
    fn test_roi_outside_sensor_rejected() {
        let driver = SimulatedCamera::new(0.0);
        assert!(driver.set_roi(Roi::new(500, 0, 20, 10)).is_err());
    }
}

//! Cameras.
//!
//! [`Camera`] is a [`DataDevice`] producing [`Frame`]s. It owns the geometry
//! bookkeeping every camera shares:
//!
//! - a fixed *readout* transform that corrects for the order in which the
//!   sensor is read out, and a *client* transform requested by the user to
//!   match the optical setup, combined with [`Transform::combine`];
//! - the conversion between the client-visible sensor shape, binning and ROI
//!   and the raw hardware values, which swap axes under a 90° rotation.
//!
//! Frames are transformed on the dispatch thread, so the fetch loop stays as
//! cheap as the hardware allows.

mod frame;
mod geometry;

pub use frame::{Frame, PixelBuffer};
pub use geometry::{Binning, Roi, Transform};

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::data::acquisition::Acquisition;
use crate::data::client::{Client, ClientSpec};
use crate::data::{ClientGuard, DataDevice, DataDeviceOptions, DataDriver, Processor};
use crate::device::DeviceControl;
use crate::error::{DeviceError, DeviceResult};
use crate::setting::{Dtype, SettingBuilder, SettingValue, Settings, UpdateOutcome, Values};
use crate::trigger::{TriggerMode, TriggerTarget, TriggerType};

/// Hardware hooks of a camera.
///
/// All geometry here is in raw hardware orientation; [`Camera`] converts to
/// and from what clients see.
pub trait CameraDriver: DataDriver<Sample = Frame> + TriggerTarget {
    /// `(width, height)` of the sensor in pixels.
    fn sensor_shape(&self) -> DeviceResult<(u32, u32)>;

    /// Current binning.
    fn binning(&self) -> DeviceResult<Binning>;

    /// Change binning. Called with acquisition paused.
    fn set_binning(&self, binning: Binning) -> DeviceResult<()>;

    /// Current region of interest.
    fn roi(&self) -> DeviceResult<Roi>;

    /// Change the region of interest. Called with acquisition paused.
    fn set_roi(&self, roi: Roi) -> DeviceResult<()>;

    /// Exposure time in seconds.
    fn exposure_time(&self) -> DeviceResult<f64>;

    /// Set the exposure time in seconds.
    fn set_exposure_time(&self, seconds: f64) -> DeviceResult<()>;

    /// Time between frames in seconds.
    fn cycle_time(&self) -> DeviceResult<f64>;

    /// Descriptions of the available readout modes.
    fn readout_modes(&self) -> Vec<String> {
        vec!["default".to_string()]
    }

    /// Index of the current readout mode.
    fn readout_mode(&self) -> usize {
        0
    }

    /// Select a readout mode. Returns the new readout transform when the mode
    /// changes the readout order.
    fn set_readout_mode(&self, index: usize) -> DeviceResult<Option<Transform>> {
        if index < self.readout_modes().len() {
            Ok(None)
        } else {
            Err(DeviceError::InvalidValue {
                name: "readout mode".into(),
                reason: format!("no readout mode {index}"),
            })
        }
    }

    /// Readout transform of the initial readout mode.
    fn readout_transform(&self) -> Transform {
        Transform::IDENTITY
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Transforms {
    readout: Transform,
    client: Transform,
    combined: Transform,
}

impl Transforms {
    fn new(readout: Transform) -> Self {
        Self {
            readout,
            client: Transform::IDENTITY,
            combined: readout,
        }
    }

    fn set_client(&mut self, client: Transform) {
        self.client = client;
        self.combined = Transform::combine(self.readout, client);
    }

    fn set_readout(&mut self, readout: Transform) {
        self.readout = readout;
        self.combined = Transform::combine(readout, self.client);
    }
}

/// Geometry conversions shared by [`Camera`] and its setting closures.
struct CameraGeometry<D> {
    driver: Arc<D>,
    transforms: Arc<RwLock<Transforms>>,
    acquisition: Acquisition,
}

impl<D> Clone for CameraGeometry<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            transforms: Arc::clone(&self.transforms),
            acquisition: self.acquisition.clone(),
        }
    }
}

impl<D: CameraDriver> CameraGeometry<D> {
    fn rotated(&self) -> bool {
        self.transforms.read().combined.rot90
    }

    fn sensor_shape(&self) -> DeviceResult<(u32, u32)> {
        let (w, h) = self.driver.sensor_shape()?;
        Ok(if self.rotated() { (h, w) } else { (w, h) })
    }

    fn binning(&self) -> DeviceResult<Binning> {
        let raw = self.driver.binning()?;
        Ok(if self.rotated() { raw.transposed() } else { raw })
    }

    fn set_binning(&self, binning: Binning) -> DeviceResult<()> {
        if binning.h == 0 || binning.v == 0 {
            return Err(DeviceError::InvalidValue {
                name: "binning".into(),
                reason: "factors must be positive".into(),
            });
        }
        let raw = if self.rotated() { binning.transposed() } else { binning };
        self.acquisition
            .keep_acquiring(|| self.driver.set_binning(raw))
    }

    fn roi(&self) -> DeviceResult<Roi> {
        let raw = self.driver.roi()?;
        Ok(if self.rotated() { raw.transposed() } else { raw })
    }

    fn set_roi(&self, roi: Roi) -> DeviceResult<()> {
        let (max_w, max_h) = self.sensor_shape()?;
        let binning = self.binning()?;
        let mut visible = roi;
        if visible.width == 0 {
            visible.width = max_w.saturating_sub(visible.left) / binning.h.max(1);
        }
        if visible.height == 0 {
            visible.height = max_h.saturating_sub(visible.top) / binning.v.max(1);
        }
        let raw = if self.rotated() { visible.transposed() } else { visible };
        debug!(?visible, ?raw, "Setting ROI");
        self.acquisition.keep_acquiring(|| self.driver.set_roi(raw))
    }

    fn client_transform(&self) -> Transform {
        self.transforms.read().client
    }

    fn set_transform(&self, client: Transform) {
        let mut transforms = self.transforms.write();
        transforms.set_client(client);
        debug!(%client, combined = %transforms.combined, "Transform changed");
    }

    fn set_readout_mode(&self, index: usize) -> DeviceResult<()> {
        if let Some(readout) = self.driver.set_readout_mode(index)? {
            self.transforms.write().set_readout(readout);
            info!(mode = index, %readout, "Readout transform changed");
        }
        Ok(())
    }

    fn register(&self, settings: &Settings) -> DeviceResult<()> {
        let (get, set) = (self.clone(), self.clone());
        settings.add(
            SettingBuilder::for_enum::<Transform>("transform")
                .enum_getter(move || Ok(get.client_transform()))
                .enum_setter(move |t: Transform| {
                    set.set_transform(t);
                    Ok(())
                }),
        )?;

        let (get, set, values) = (self.clone(), self.clone(), self.clone());
        settings.add(
            SettingBuilder::new("readout mode", Dtype::Enum)
                .getter(move || Ok(get.driver.readout_mode()))
                .setter(move |index: usize| set.set_readout_mode(index))
                .dynamic_values(move || Values::labels(values.driver.readout_modes())),
        )?;

        let (get, set) = (self.clone(), self.clone());
        settings.add(
            SettingBuilder::new("roi", Dtype::Tuple)
                .getter(move || get.roi())
                .setter(move |roi: Roi| set.set_roi(roi)),
        )
    }
}

/// A streaming camera.
pub struct Camera<D: CameraDriver> {
    data: DataDevice<D>,
    geometry: CameraGeometry<D>,
}

impl<D: CameraDriver> Camera<D> {
    /// Wrap `driver` with default options.
    pub fn new(driver: D) -> DeviceResult<Self> {
        Self::with_options(driver, DataDeviceOptions::default())
    }

    /// Wrap `driver`.
    ///
    /// The `transform`, `readout mode` and `roi` settings are registered
    /// before the driver's own.
    pub fn with_options(driver: D, options: DataDeviceOptions) -> DeviceResult<Self> {
        let driver = Arc::new(driver);
        let transforms = Arc::new(RwLock::new(Transforms::new(driver.readout_transform())));
        let processor: Processor<Frame> = {
            let transforms = Arc::clone(&transforms);
            Arc::new(move |frame: Frame| {
                let transform = transforms.read().combined;
                Ok(frame.transformed(transform))
            })
        };

        let mut geometry = None;
        let data = DataDevice::build(
            Arc::clone(&driver),
            options,
            |settings, acquisition| {
                let g = CameraGeometry {
                    driver: Arc::clone(&driver),
                    transforms: Arc::clone(&transforms),
                    acquisition: acquisition.clone(),
                };
                g.register(settings)?;
                geometry = Some(g);
                Ok(())
            },
            Some(processor),
        )?;
        let geometry = geometry.ok_or_else(|| {
            DeviceError::Configuration("camera geometry was not registered".into())
        })?;
        Ok(Self { data, geometry })
    }

    /// Underlying data device.
    pub fn data(&self) -> &DataDevice<D> {
        &self.data
    }

    /// The wrapped driver.
    pub fn driver(&self) -> &D {
        self.data.driver()
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        self.data.name()
    }

    /// Settings registry.
    pub fn settings(&self) -> &Settings {
        self.data.settings()
    }

    /// Tri-state enabled flag.
    pub fn is_enabled(&self) -> Option<bool> {
        self.data.is_enabled()
    }

    /// Whether the hardware is acquiring.
    pub fn is_acquiring(&self) -> bool {
        self.data.is_acquiring()
    }

    /// Initialise the hardware.
    pub fn initialize(&self) -> DeviceResult<()> {
        self.data.initialize()
    }

    /// See [`DataDevice::enable`].
    pub fn enable(&self) -> DeviceResult<bool> {
        self.data.enable()
    }

    /// See [`DataDevice::disable`].
    pub fn disable(&self) -> DeviceResult<()> {
        self.data.disable()
    }

    /// Stop acquisition without disabling.
    pub fn abort(&self) -> DeviceResult<()> {
        self.data.abort()
    }

    /// See [`DataDevice::shutdown`].
    pub fn shutdown(&self) {
        self.data.shutdown();
    }

    /// See [`DataDevice::set_client`].
    pub fn set_client(&self, client: Option<ClientSpec<Frame>>) -> DeviceResult<()> {
        self.data.set_client(client)
    }

    /// See [`DataDevice::install_client`].
    pub fn install_client(&self, client: Arc<dyn Client<Frame>>) -> ClientGuard<Frame> {
        self.data.install_client(client)
    }

    /// Wait for the next frame, optionally firing a software trigger first.
    pub fn grab_next_data(&self, soft_trigger: bool) -> DeviceResult<Frame> {
        self.data
            .grab_with(soft_trigger, Some(self.driver() as &dyn TriggerTarget), None)
    }

    /// [`Camera::grab_next_data`] giving up after `timeout`.
    pub fn grab_next_data_timeout(&self, soft_trigger: bool, timeout: Duration) -> DeviceResult<Frame> {
        self.data.grab_with(
            soft_trigger,
            Some(self.driver() as &dyn TriggerTarget),
            Some(timeout),
        )
    }

    /// Apply a batch of values with acquisition paused.
    pub fn update_settings(
        &self,
        incoming: &BTreeMap<String, SettingValue>,
        init: bool,
    ) -> DeviceResult<BTreeMap<String, UpdateOutcome>> {
        self.data.update_settings(incoming, init)
    }

    /// Sensor `(width, height)` as clients see it.
    pub fn get_sensor_shape(&self) -> DeviceResult<(u32, u32)> {
        self.geometry.sensor_shape()
    }

    /// Binning as clients see it.
    pub fn get_binning(&self) -> DeviceResult<Binning> {
        self.geometry.binning()
    }

    /// Set binning in client coordinates.
    pub fn set_binning(&self, binning: Binning) -> DeviceResult<()> {
        self.geometry.set_binning(binning)
    }

    /// ROI as clients see it.
    pub fn get_roi(&self) -> DeviceResult<Roi> {
        self.geometry.roi()
    }

    /// Set the ROI in client coordinates.
    ///
    /// A zero width or height selects the rest of the sensor from the given
    /// offset, divided by the binning.
    pub fn set_roi(&self, roi: Roi) -> DeviceResult<()> {
        self.geometry.set_roi(roi)
    }

    /// Transform requested by the client.
    pub fn get_transform(&self) -> Transform {
        self.geometry.client_transform()
    }

    /// Request a client transform.
    pub fn set_transform(&self, transform: Transform) {
        self.geometry.set_transform(transform);
    }

    /// Transform applied to frames: readout and client combined.
    pub fn transform(&self) -> Transform {
        self.geometry.transforms.read().combined
    }

    /// Transform of the current readout mode.
    pub fn readout_transform(&self) -> Transform {
        self.geometry.transforms.read().readout
    }

    /// Select a readout mode, updating the readout transform if it changes.
    pub fn set_readout_mode(&self, index: usize) -> DeviceResult<()> {
        self.geometry.set_readout_mode(index)
    }

    /// Exposure time in seconds.
    pub fn exposure_time(&self) -> DeviceResult<f64> {
        self.driver().exposure_time()
    }

    /// Set the exposure time in seconds.
    pub fn set_exposure_time(&self, seconds: f64) -> DeviceResult<()> {
        self.driver().set_exposure_time(seconds)
    }

    /// Time between frames in seconds.
    pub fn cycle_time(&self) -> DeviceResult<f64> {
        self.driver().cycle_time()
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

impl<D: CameraDriver> DeviceControl for Camera<D> {
    fn name(&self) -> &str {
        Camera::name(self)
    }

    fn index(&self) -> Option<usize> {
        DeviceControl::index(&self.data)
    }

    fn initialize(&self) -> DeviceResult<()> {
        Camera::initialize(self)
    }

    fn enable(&self) -> DeviceResult<bool> {
        Camera::enable(self)
    }

    fn disable(&self) -> DeviceResult<()> {
        Camera::disable(self)
    }

    fn shutdown(&self) {
        Camera::shutdown(self);
    }

    fn is_enabled(&self) -> Option<bool> {
        Camera::is_enabled(self)
    }

    fn settings(&self) -> &Settings {
        Camera::settings(self)
    }

    fn floating_id(&self) -> Option<DeviceResult<String>> {
        DeviceControl::floating_id(&self.data)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn update_settings(
        &self,
        incoming: &BTreeMap<String, SettingValue>,
        init: bool,
    ) -> DeviceResult<BTreeMap<String, UpdateOutcome>> {
        Camera::update_settings(self, incoming, init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Driver;
    use crate::trigger::{TriggerConfig, TriggerToken};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 4x2 sensor with a configurable readout transform for mode 1.
    struct Sensor {
        binning: Mutex<Binning>,
        roi: Mutex<Roi>,
        mode: Mutex<usize>,
        aborts: AtomicUsize,
        trigger: TriggerConfig,
    }

    impl Sensor {
        fn new() -> Self {
            Self {
                binning: Mutex::new(Binning::default()),
                roi: Mutex::new(Roi::new(0, 0, 4, 2)),
                mode: Mutex::new(0),
                aborts: AtomicUsize::new(0),
                trigger: TriggerConfig::software_once(),
            }
        }
    }

    impl Driver for Sensor {
        fn do_shutdown(&self) -> DeviceResult<()> {
            Ok(())
        }
    }

    impl TriggerTarget for Sensor {
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

    impl DataDriver for Sensor {
        type Sample = Frame;

        fn abort(&self) -> DeviceResult<()> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl CameraDriver for Sensor {
        fn sensor_shape(&self) -> DeviceResult<(u32, u32)> {
            Ok((4, 2))
        }

        fn binning(&self) -> DeviceResult<Binning> {
            Ok(*self.binning.lock())
        }

        fn set_binning(&self, binning: Binning) -> DeviceResult<()> {
            *self.binning.lock() = binning;
            Ok(())
        }

        fn roi(&self) -> DeviceResult<Roi> {
            Ok(*self.roi.lock())
        }

        fn set_roi(&self, roi: Roi) -> DeviceResult<()> {
            *self.roi.lock() = roi;
            Ok(())
        }

        fn exposure_time(&self) -> DeviceResult<f64> {
            Ok(0.01)
        }

        fn set_exposure_time(&self, _seconds: f64) -> DeviceResult<()> {
            Ok(())
        }

        fn cycle_time(&self) -> DeviceResult<f64> {
            Ok(0.01)
        }

        fn readout_modes(&self) -> Vec<String> {
            vec!["normal".into(), "reversed".into()]
        }

        fn readout_mode(&self) -> usize {
            *self.mode.lock()
        }

        fn set_readout_mode(&self, index: usize) -> DeviceResult<Option<Transform>> {
            *self.mode.lock() = index;
            Ok(Some(if index == 1 {
                Transform::new(true, false, false)
            } else {
                Transform::IDENTITY
            }))
        }
    }

    #[test]
    fn test_base_settings_registered_first() {
        let camera = Camera::new(Sensor::new()).unwrap();
        assert_eq!(
            camera.settings().names(),
            vec!["transform", "readout mode", "roi"]
        );
        let described = camera.settings().describe("roi").unwrap();
        assert_eq!(described.values, Values::None);
    }

    #[test]
    fn test_rotation_swaps_visible_geometry() {
        let camera = Camera::new(Sensor::new()).unwrap();
        camera.set_transform(Transform::new(false, false, true));
        assert_eq!(camera.get_sensor_shape().unwrap(), (2, 4));
        camera.driver().set_binning(Binning::new(2, 1)).unwrap();
        assert_eq!(camera.get_binning().unwrap(), Binning::new(1, 2));
        camera.set_binning(Binning::new(1, 2)).unwrap();
        assert_eq!(*camera.driver().binning.lock(), Binning::new(2, 1));
    }

    #[test]
    fn test_roi_round_trips_under_rotation() {
        let camera = Camera::new(Sensor::new()).unwrap();
        camera.set_transform(Transform::new(false, false, true));
        camera.set_roi(Roi::new(1, 0, 1, 3)).unwrap();
        assert_eq!(*camera.driver().roi.lock(), Roi::new(0, 1, 3, 1));
        assert_eq!(camera.get_roi().unwrap(), Roi::new(1, 0, 1, 3));
    }

    #[test]
    fn test_zero_roi_size_fills_remaining_sensor() {
        let camera = Camera::new(Sensor::new()).unwrap();
        camera.driver().set_binning(Binning::new(2, 1)).unwrap();
        camera.set_roi(Roi::new(2, 0, 0, 0)).unwrap();
        assert_eq!(camera.get_roi().unwrap(), Roi::new(2, 0, 1, 2));
    }

    #[test]
    fn test_transform_setting_round_trips() {
        let camera = Camera::new(Sensor::new()).unwrap();
        camera
            .settings()
            .set_value("transform", SettingValue::Int(5))
            .unwrap();
        assert_eq!(camera.get_transform(), Transform::new(true, false, true));
        assert_eq!(
            camera.settings().get_value("transform").unwrap(),
            SettingValue::Int(5)
        );
        assert!(camera
            .settings()
            .set_value("transform", SettingValue::Int(8))
            .is_err());
    }

    #[test]
    fn test_readout_mode_recomputes_combined_transform() {
        let camera = Camera::new(Sensor::new()).unwrap();
        camera.set_transform(Transform::new(true, true, false));
        camera
            .settings()
            .set_value("readout mode", SettingValue::Int(1))
            .unwrap();
        assert_eq!(camera.readout_transform(), Transform::new(true, false, false));
        assert_eq!(camera.transform(), Transform::new(false, true, false));
        assert_eq!(camera.get_transform(), Transform::new(true, true, false));
        assert!(camera
            .settings()
            .set_value("readout mode", SettingValue::Int(2))
            .is_err());
    }

    #[test]
    fn test_geometry_changes_pause_running_acquisition() {
        let camera = Camera::new(Sensor::new()).unwrap();
        assert!(camera.enable().unwrap());
        camera.set_roi(Roi::new(0, 0, 2, 2)).unwrap();
        assert!(camera.is_acquiring());
        assert_eq!(camera.driver().aborts.load(Ordering::SeqCst), 1);
        camera.shutdown();
    }
}

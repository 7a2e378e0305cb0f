//! Simulated hardware driven through the public device wrappers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, Receiver};
use rust_microscope::camera::{Binning, Camera, Frame, Roi};
use rust_microscope::data::client::{Client, Payload};
use rust_microscope::device::DeviceControl;
use rust_microscope::devices::{FilterWheel, LightSource};
use rust_microscope::error::DeviceError;
use rust_microscope::setting::{SettingValue, Values};
use rust_microscope::simulators::image::read_stamp;
use rust_microscope::simulators::{
    simulated_controller, SimulatedCamera, SimulatedFilterWheel, SimulatedLightSource,
};

const GRAB_TIMEOUT: Duration = Duration::from_secs(5);

/// Camera with no exposure delay producing black frames, so that only the
/// frame number stamp is lit.
fn black_camera() -> Camera<SimulatedCamera> {
    let camera = Camera::new(SimulatedCamera::new(0.0)).unwrap();
    // "black" is the fifth pattern.
    camera
        .set_setting("image pattern", SettingValue::Int(4))
        .unwrap();
    camera
}

#[test]
fn test_frames_are_numbered_in_order() {
    let camera = black_camera();
    camera.enable().unwrap();
    for expected in 0..3 {
        let frame = camera.grab_next_data_timeout(true, GRAB_TIMEOUT).unwrap();
        assert_eq!(read_stamp(&frame), Some(expected));
    }
    assert_eq!(camera.driver().sent(), 3);
    camera.shutdown();
}

#[test]
fn test_streaming_client_receives_every_trigger() {
    let camera = black_camera();
    camera.enable().unwrap();

    let (tx, rx): (_, Receiver<(Payload<Frame>, DateTime<Utc>)>) = unbounded();
    let client: Arc<dyn Client<Frame>> = Arc::new(tx);
    let guard = camera.install_client(client);
    for _ in 0..5 {
        camera.trigger().unwrap();
    }
    let stamps: Vec<u64> = (0..5)
        .map(|_| {
            let (payload, _) = rx.recv_timeout(GRAB_TIMEOUT).unwrap();
            read_stamp(&payload.data().unwrap()).unwrap()
        })
        .collect();
    assert_eq!(stamps, [0, 1, 2, 3, 4]);
    drop(guard);
    assert_eq!(camera.data().client_count(), 0);
    camera.shutdown();
}

#[test]
fn test_enable_resets_frame_counter() {
    let camera = black_camera();
    camera.enable().unwrap();
    camera.grab_next_data_timeout(true, GRAB_TIMEOUT).unwrap();
    camera.disable().unwrap();
    camera.enable().unwrap();
    let frame = camera.grab_next_data_timeout(true, GRAB_TIMEOUT).unwrap();
    assert_eq!(read_stamp(&frame), Some(0));
    camera.shutdown();
}

#[test]
fn test_simulated_fault_reaches_grabber() {
    let camera = black_camera();
    camera
        .set_setting("_error_percent", SettingValue::Int(100))
        .unwrap();
    camera.enable().unwrap();
    let err = camera
        .grab_next_data_timeout(true, GRAB_TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, DeviceError::Acquisition(_)));
    assert!(err.to_string().contains("simulated fault"));

    // The fetch loop keeps going once faults stop.
    camera
        .set_setting("_error_percent", SettingValue::Int(0))
        .unwrap();
    assert!(camera.grab_next_data_timeout(true, GRAB_TIMEOUT).is_ok());
    camera.shutdown();
}

#[test]
fn test_pixel_type_and_geometry() {
    let camera = black_camera();
    camera
        .set_setting("image data type", SettingValue::Int(2))
        .unwrap();
    camera.set_binning(Binning::new(2, 2)).unwrap();
    camera.set_roi(Roi::new(0, 0, 256, 128)).unwrap();
    camera.enable().unwrap();
    let frame = camera.grab_next_data_timeout(true, GRAB_TIMEOUT).unwrap();
    assert_eq!(frame.pixels().type_name(), "float");
    assert_eq!(frame.shape(), (128, 64));
    camera.shutdown();
}

#[test]
fn test_roi_outside_sensor_is_rejected() {
    let camera = black_camera();
    assert!(camera.set_roi(Roi::new(500, 0, 100, 10)).is_err());
    assert_eq!(camera.get_roi().unwrap(), Roi::new(0, 0, 512, 512));
}

#[test]
fn test_grab_from_disabled_camera() {
    let camera = black_camera();
    let err = camera
        .grab_next_data_timeout(true, GRAB_TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, DeviceError::Disabled));
}

#[test]
fn test_filter_wheel_limits() {
    let wheel = FilterWheel::new(SimulatedFilterWheel::new(), 6).unwrap();
    assert_eq!(
        wheel.settings().describe("position").unwrap().values,
        Values::range(0, 5)
    );
    wheel.set_position(5).unwrap();
    assert_eq!(wheel.position().unwrap(), 5);
    assert!(wheel.set_position(6).is_err());
    assert_eq!(wheel.position().unwrap(), 5);
}

#[test]
fn test_light_source_power_is_clipped() {
    let source = LightSource::new(SimulatedLightSource::new()).unwrap();
    source.enable();
    source.set_power(1.7).unwrap();
    assert_eq!(source.set_point(), 1.0);
    assert_eq!(source.power().unwrap(), 1.0);
    source.set_power(-0.2).unwrap();
    assert_eq!(source.power().unwrap(), 0.0);
}

#[test]
fn test_controller_lifecycle() {
    let mut devices: BTreeMap<String, Box<dyn DeviceControl>> = BTreeMap::new();
    devices.insert(
        "laser".into(),
        Box::new(LightSource::new(SimulatedLightSource::new()).unwrap()),
    );
    devices.insert(
        "camera".into(),
        Box::new(Camera::new(SimulatedCamera::new(0.0)).unwrap()),
    );
    let controller = simulated_controller(devices).unwrap();
    controller.initialize().unwrap();
    let names: Vec<&str> = controller.devices().keys().map(String::as_str).collect();
    assert_eq!(names, ["camera", "laser"]);

    controller.shutdown();
    let laser = controller.devices()["laser"]
        .as_any()
        .downcast_ref::<LightSource<SimulatedLightSource>>()
        .unwrap();
    assert!(laser.device().is_shut_down());
}

//! Simulated devices for use during development.
//!
//! They mimic the behaviour of real hardware closely enough to exercise
//! clients and the server without anything attached. [`register_builtin`]
//! makes them available to the device server under their type names.

pub mod camera;
pub mod devices;
pub mod image;

pub use camera::{SimulatedCamera, SimulatedCameraConf};
pub use devices::{
    simulated_controller, DeformableMirrorConf, FilterWheelConf, SimulatedDeformableMirror,
    SimulatedFilterWheel, SimulatedLightSource,
};
pub use image::{ImageGenerator, ImagePattern, PixelType};

use serde::Deserialize;

use crate::camera::Camera;
use crate::data::DataDeviceOptions;
use crate::devices::{DeformableMirror, FilterWheel, LightSource};
use crate::server::{parse_conf, DeviceRegistry, ServedDevice};

/// Devices that take no constructor arguments.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoConf {}

/// Identifier reported by the `index`-th floating simulated camera.
pub fn floating_camera_uid(index: usize) -> String {
    format!("simcam-{index}")
}

/// Register every simulated device class.
pub fn register_builtin(registry: &mut DeviceRegistry) {
    registry.register("SimulatedCamera", |index, conf| {
        let conf: SimulatedCameraConf = parse_conf("SimulatedCamera", conf)?;
        let options = DataDeviceOptions {
            queue_capacity: conf.queue_capacity,
            index: Some(index),
        };
        let camera = Camera::with_options(SimulatedCamera::new(conf.exposure_time), options)?;
        Ok(Box::new(camera) as Box<dyn ServedDevice>)
    });

    registry.register("SimulatedFloatingCamera", |index, conf| {
        let conf: SimulatedCameraConf = parse_conf("SimulatedFloatingCamera", conf)?;
        let options = DataDeviceOptions {
            queue_capacity: conf.queue_capacity,
            index: Some(index),
        };
        let driver = SimulatedCamera::floating(floating_camera_uid(index), conf.exposure_time)?;
        let camera = Camera::with_options(driver, options)?;
        Ok(Box::new(camera) as Box<dyn ServedDevice>)
    });

    registry.register("SimulatedLightSource", |index, conf| {
        let _: NoConf = parse_conf("SimulatedLightSource", conf)?;
        let source = LightSource::with_index(SimulatedLightSource::new(), index)?;
        Ok(Box::new(source) as Box<dyn ServedDevice>)
    });

    registry.register("SimulatedFilterWheel", |index, conf| {
        let conf: FilterWheelConf = parse_conf("SimulatedFilterWheel", conf)?;
        let wheel = FilterWheel::with_index(SimulatedFilterWheel::new(), conf.positions, index)?;
        Ok(Box::new(wheel) as Box<dyn ServedDevice>)
    });

    registry.register("SimulatedDeformableMirror", |index, conf| {
        let conf: DeformableMirrorConf = parse_conf("SimulatedDeformableMirror", conf)?;
        let mirror =
            DeformableMirror::with_index(SimulatedDeformableMirror::new(conf.n_actuators), index)?;
        Ok(Box::new(mirror) as Box<dyn ServedDevice>)
    });
}

/// Registry holding the simulated device classes.
pub fn builtin_registry() -> DeviceRegistry {
    let mut registry = DeviceRegistry::new();
    register_builtin(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceControl;
    use serde_json::json;

    #[test]
    fn test_builtin_classes() {
        let registry = builtin_registry();
        assert_eq!(
            registry.classes(),
            [
                "SimulatedCamera",
                "SimulatedDeformableMirror",
                "SimulatedFilterWheel",
                "SimulatedFloatingCamera",
                "SimulatedLightSource",
            ]
        );
    }

    #[test]
    fn test_unknown_conf_key_fails_construction() {
        let registry = builtin_registry();
        let err = registry
            .create("SimulatedFilterWheel", 0, &json!({"positions": 6, "speed": 2}))
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown field"));
        assert!(registry
            .create("SimulatedLightSource", 0, &json!({"wavelength": 488}))
            .is_err());
    }

    #[test]
    fn test_missing_conf_key_fails_construction() {
        let registry = builtin_registry();
        assert!(registry
            .create("SimulatedDeformableMirror", 0, &json!({}))
            .is_err());
        let mirror = registry
            .create("SimulatedDeformableMirror", 3, &json!({"n_actuators": 69}))
            .unwrap();
        assert_eq!(mirror.index(), Some(3));
    }
}

//! Capability layers for non-streaming devices.
//!
//! Each layer pairs a driver trait with the hardware hooks and a wrapper around
//! [`Device`](crate::device::Device) that adds the behaviour every device of
//! that kind shares: value clipping and range checks, the settings it always
//! registers, and the software trigger fallbacks.

/// Implements [`DeviceControl`](crate::device::DeviceControl) for a wrapper
/// holding its device in a `device` field.
macro_rules! delegate_device_control {
    ($wrapper:ident, $bound:path) => {
        impl<D: $bound> $crate::device::DeviceControl for $wrapper<D> {
            fn name(&self) -> &str {
                self.device.name()
            }

            fn index(&self) -> Option<usize> {
                self.device.index()
            }

            fn initialize(&self) -> $crate::error::DeviceResult<()> {
                self.device.initialize()
            }

            fn enable(&self) -> $crate::error::DeviceResult<bool> {
                Ok(self.device.enable())
            }

            fn disable(&self) -> $crate::error::DeviceResult<()> {
                self.device.disable()
            }

            fn shutdown(&self) {
                self.device.shutdown();
            }

            fn is_enabled(&self) -> Option<bool> {
                self.device.is_enabled()
            }

            fn settings(&self) -> &$crate::setting::Settings {
                self.device.settings()
            }

            fn floating_id(&self) -> Option<$crate::error::DeviceResult<String>> {
                $crate::device::DeviceControl::floating_id(&self.device)
            }

            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
    };
}

pub(crate) use delegate_device_control;

pub mod deformable_mirror;
pub mod filter_wheel;
pub mod light_source;

pub use deformable_mirror::{DeformableMirror, DeformableMirrorDriver, Patterns};
pub use filter_wheel::{FilterWheel, FilterWheelDriver};
pub use light_source::{LightSource, LightSourceDriver};

//! Deformable mirrors.
//!
//! A pattern is one value per actuator in `[0, 1]`. Values outside that range
//! are passed through; clipping is up to the driver. Mirrors with an on-board
//! pattern queue take a whole stack at once and step through it on each
//! trigger. Mirrors without one get a software queue that applies the next
//! pattern on every software trigger.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::{Device, Driver};
use crate::error::{DeviceError, DeviceResult};
use crate::setting::Settings;
use crate::trigger::{TriggerMode, TriggerTarget, TriggerType};

use super::delegate_device_control;

/// One or more patterns stored row-major with their array shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patterns {
    shape: Vec<usize>,
    values: Vec<f64>,
}

impl Patterns {
    /// A single pattern.
    pub fn single(pattern: Vec<f64>) -> Self {
        Self {
            shape: vec![pattern.len()],
            values: pattern,
        }
    }

    /// A stack of patterns, one per row.
    pub fn stack(rows: Vec<Vec<f64>>) -> DeviceResult<Self> {
        let width = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != width) {
            return Err(DeviceError::InvalidValue {
                name: "patterns".into(),
                reason: "rows have different lengths".into(),
            });
        }
        Ok(Self {
            shape: vec![rows.len(), width],
            values: rows.into_iter().flatten().collect(),
        })
    }

    /// Array of arbitrary shape, as received from a remote client.
    pub fn from_shape(shape: Vec<usize>, values: Vec<f64>) -> DeviceResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(DeviceError::InvalidValue {
                name: "patterns".into(),
                reason: format!("shape {shape:?} needs {expected} values, got {}", values.len()),
            });
        }
        Ok(Self { shape, values })
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Array shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of patterns: 1 for a single pattern.
    pub fn len(&self) -> usize {
        match self.shape.as_slice() {
            [_] => 1,
            [rows, _] => *rows,
            _ => 0,
        }
    }

    /// True when there is no pattern.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pattern `i`.
    pub fn pattern(&self, i: usize) -> Option<&[f64]> {
        let width = *self.shape.last()?;
        if i >= self.len() {
            return None;
        }
        self.values.get(i * width..(i + 1) * width)
    }
}

/// Hardware hooks of a deformable mirror.
pub trait DeformableMirrorDriver: Driver + TriggerTarget {
    /// Number of actuators.
    fn n_actuators(&self) -> usize;

    /// Apply one pattern of `n_actuators` values.
    fn do_apply_pattern(&self, pattern: &[f64]) -> DeviceResult<()>;

    /// Load a stack onto the hardware queue.
    ///
    /// Returns `false` when the hardware has no queue, in which case the
    /// patterns are kept in software and applied one per software trigger.
    fn do_queue_patterns(&self, _patterns: &Patterns) -> DeviceResult<bool> {
        Ok(false)
    }
}

#[derive(Debug, Default)]
struct SoftwareQueue {
    patterns: Option<Patterns>,
    next: usize,
}

/// A deformable mirror.
pub struct DeformableMirror<D: DeformableMirrorDriver> {
    device: Device<D>,
    queue: Mutex<SoftwareQueue>,
}

impl<D: DeformableMirrorDriver> DeformableMirror<D> {
    /// Wrap `driver`.
    pub fn new(driver: D) -> DeviceResult<Self> {
        Self::build(driver, None)
    }

    /// Same as [`DeformableMirror::new`] for the `index`-th mirror under one SDK.
    pub fn with_index(driver: D, index: usize) -> DeviceResult<Self> {
        Self::build(driver, Some(index))
    }

    fn build(driver: D, index: Option<usize>) -> DeviceResult<Self> {
        Ok(Self {
            device: Device::build(Arc::new(driver), index, |_| Ok(()))?,
            queue: Mutex::new(SoftwareQueue::default()),
        })
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

    /// Number of actuators.
    pub fn n_actuators(&self) -> usize {
        self.driver().n_actuators()
    }

    fn validate(&self, patterns: &Patterns) -> DeviceResult<()> {
        let invalid = |reason: String| DeviceError::InvalidValue {
            name: "patterns".into(),
            reason,
        };
        let ndim = patterns.ndim();
        if ndim == 0 || ndim > 2 {
            return Err(invalid(format!(
                "PATTERNS has {ndim} dimensions (must be 1 or 2)"
            )));
        }
        let width = patterns.shape().last().copied().unwrap_or_default();
        let n = self.n_actuators();
        if width != n {
            return Err(invalid(format!(
                "PATTERNS length of second dimension '{width}' differs from number of actuators '{n}'"
            )));
        }
        Ok(())
    }

    fn require_software_trigger(&self, operation: &str) -> DeviceResult<()> {
        if self.driver().trigger_type() != TriggerType::Software {
            return Err(DeviceError::IncompatibleState(format!(
                "{operation} requires software trigger type"
            )));
        }
        Ok(())
    }

    /// Apply one pattern now. Requires the software trigger type.
    pub fn apply_pattern(&self, pattern: &[f64]) -> DeviceResult<()> {
        self.require_software_trigger("apply_pattern")?;
        self.validate(&Patterns::single(pattern.to_vec()))?;
        self.driver().do_apply_pattern(pattern)
    }

    /// Queue a stack of patterns, replacing any previous queue.
    pub fn queue_patterns(&self, patterns: Patterns) -> DeviceResult<()> {
        self.validate(&patterns)?;
        let mut queue = self.queue.lock();
        if self.driver().do_queue_patterns(&patterns)? {
            debug!(device = %self.device.name(), count = patterns.len(), "Patterns queued on hardware");
            *queue = SoftwareQueue::default();
        } else {
            debug!(device = %self.device.name(), count = patterns.len(), "Patterns queued in software");
            *queue = SoftwareQueue {
                patterns: Some(patterns),
                next: 0,
            };
        }
        Ok(())
    }

    /// Apply the next queued pattern.
    ///
    /// With a software queue this requires the software trigger type; with a
    /// hardware queue it fires a software trigger at the driver.
    pub fn next_pattern(&self) -> DeviceResult<()> {
        let mut guard = self.queue.lock();
        if guard.patterns.is_none() {
            drop(guard);
            return self.driver().trigger();
        }
        self.require_software_trigger("next_pattern")?;
        let queue = &mut *guard;
        let patterns = queue.patterns.as_ref().ok_or_else(|| {
            DeviceError::IncompatibleState("no pattern queued to apply".into())
        })?;
        let pattern = patterns.pattern(queue.next).ok_or_else(|| {
            DeviceError::IncompatibleState(format!(
                "all {} queued patterns have been applied",
                patterns.len()
            ))
        })?;
        self.driver().do_apply_pattern(pattern)?;
        queue.next += 1;
        Ok(())
    }

    /// Same as [`DeformableMirror::next_pattern`].
    pub fn trigger(&self) -> DeviceResult<()> {
        self.next_pattern()
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

    /// Disable and release the hardware.
    pub fn shutdown(&self) {
        self.device.shutdown();
    }
}

delegate_device_control!(DeformableMirror, DeformableMirrorDriver);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{TriggerConfig, TriggerToken};

    struct Membrane {
        applied: Mutex<Vec<Vec<f64>>>,
        trigger: TriggerConfig,
    }

    impl Membrane {
        fn new() -> Self {
            Self {
                applied: Mutex::new(Vec::new()),
                trigger: TriggerConfig::new(vec![
                    (TriggerType::Software, TriggerMode::Once),
                    (TriggerType::RisingEdge, TriggerMode::Once),
                ])
                .unwrap(),
            }
        }
    }

    impl Driver for Membrane {
        fn do_shutdown(&self) -> DeviceResult<()> {
            Ok(())
        }
    }

    impl TriggerTarget for Membrane {
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
            Err(DeviceError::Hardware("no hardware queue".into()))
        }
    }

    impl DeformableMirrorDriver for Membrane {
        fn n_actuators(&self) -> usize {
            3
        }

        fn do_apply_pattern(&self, pattern: &[f64]) -> DeviceResult<()> {
            self.applied.lock().push(pattern.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_pattern_length_checked() {
        let mirror = DeformableMirror::new(Membrane::new()).unwrap();
        mirror.apply_pattern(&[0.1, 0.2, 0.3]).unwrap();
        let err = mirror.apply_pattern(&[0.1, 0.2]).unwrap_err();
        assert!(err.to_string().contains("length of second dimension '2'"));
    }

    #[test]
    fn test_three_dimensions_rejected() {
        let mirror = DeformableMirror::new(Membrane::new()).unwrap();
        let cube = Patterns::from_shape(vec![2, 1, 3], vec![0.0; 6]).unwrap();
        let err = mirror.queue_patterns(cube).unwrap_err();
        assert!(err.to_string().contains("dimensions (must be 1 or 2)"));
    }

    #[test]
    fn test_software_queue_fallback() {
        let mirror = DeformableMirror::new(Membrane::new()).unwrap();
        let stack = Patterns::stack(vec![vec![0.0; 3], vec![0.5; 3]]).unwrap();
        mirror.queue_patterns(stack).unwrap();
        mirror.next_pattern().unwrap();
        mirror.trigger().unwrap();
        assert_eq!(mirror.driver().applied.lock().len(), 2);
        assert_eq!(mirror.driver().applied.lock()[1], vec![0.5; 3]);
        assert!(mirror.next_pattern().unwrap_err().is_incompatible_state());
    }

    #[test]
    fn test_hardware_trigger_blocks_software_stepping() {
        let mirror = DeformableMirror::new(Membrane::new()).unwrap();
        mirror
            .queue_patterns(Patterns::stack(vec![vec![0.0; 3]]).unwrap())
            .unwrap();
        mirror
            .set_trigger(TriggerType::RisingEdge, TriggerMode::Once)
            .unwrap();
        assert!(mirror.next_pattern().unwrap_err().is_incompatible_state());
        assert!(mirror.apply_pattern(&[0.0; 3]).unwrap_err().is_incompatible_state());
    }

    #[test]
    fn test_without_queue_trigger_goes_to_driver() {
        let mirror = DeformableMirror::new(Membrane::new()).unwrap();
        let err = mirror.next_pattern().unwrap_err();
        assert!(matches!(err, DeviceError::Hardware(_)));
    }
}

//! Batch setting updates through the public device interface.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rust_microscope::data::{DataDevice, DataDriver};
use rust_microscope::device::{Device, DeviceControl, Driver};
use rust_microscope::error::{DeviceError, DeviceResult};
use rust_microscope::setting::{
    Dtype, SettingBuilder, SettingEnum, SettingValue, Settings, UpdateOutcome, Values,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Objective {
    Low,
    High,
    Oil,
}

impl SettingEnum for Objective {
    fn choices() -> Vec<(i64, String)> {
        vec![(1, "10x".into()), (4, "40x".into()), (9, "100x oil".into())]
    }

    fn index(self) -> i64 {
        match self {
            Objective::Low => 1,
            Objective::High => 4,
            Objective::Oil => 9,
        }
    }

    fn from_index(index: i64) -> Option<Self> {
        match index {
            1 => Some(Objective::Low),
            4 => Some(Objective::High),
            9 => Some(Objective::Oil),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct StageState {
    speed: Mutex<f64>,
    objective: Mutex<Objective>,
    speed_writes: AtomicUsize,
    objective_writes: AtomicUsize,
}

/// Motorised stage with a speed, an objective turret and a serial number.
struct Stage {
    state: Arc<StageState>,
}

impl Stage {
    fn new() -> Self {
        Self {
            state: Arc::new(StageState {
                speed: Mutex::new(1.0),
                objective: Mutex::new(Objective::Low),
                speed_writes: AtomicUsize::new(0),
                objective_writes: AtomicUsize::new(0),
            }),
        }
    }
}

impl Driver for Stage {
    fn register_settings(&self, settings: &Settings) -> DeviceResult<()> {
        let (get, set) = (Arc::clone(&self.state), Arc::clone(&self.state));
        settings.add(
            SettingBuilder::new("speed", Dtype::Float)
                .getter(move || Ok(*get.speed.lock()))
                .setter(move |speed: f64| {
                    set.speed_writes.fetch_add(1, Ordering::SeqCst);
                    *set.speed.lock() = speed;
                    Ok(())
                })
                .range(0.0, 10.0),
        )?;

        let (get, set) = (Arc::clone(&self.state), Arc::clone(&self.state));
        settings.add(
            SettingBuilder::for_enum::<Objective>("objective")
                .enum_getter(move || Ok(*get.objective.lock()))
                .enum_setter(move |objective: Objective| {
                    set.objective_writes.fetch_add(1, Ordering::SeqCst);
                    *set.objective.lock() = objective;
                    Ok(())
                }),
        )?;

        settings.add(SettingBuilder::new("serial", Dtype::Str).getter(|| Ok("ST-0042")))
    }

    fn do_shutdown(&self) -> DeviceResult<()> {
        Ok(())
    }
}

fn batch(entries: &[(&str, SettingValue)]) -> BTreeMap<String, SettingValue> {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

#[test]
fn test_init_requires_every_setting() {
    let stage = Device::new(Stage::new()).unwrap();
    let incoming = batch(&[("speed", SettingValue::Float(2.0))]);

    match stage.update_settings(&incoming, true) {
        Err(DeviceError::MissingSettings(missing)) => {
            assert_eq!(missing, vec!["objective".to_string(), "serial".to_string()]);
        }
        other => panic!("expected missing settings, got {other:?}"),
    }
    // Nothing was written.
    let state = &stage.driver().state;
    assert_eq!(state.speed_writes.load(Ordering::SeqCst), 0);
    assert_eq!(*state.speed.lock(), 1.0);
}

#[test]
fn test_init_writes_unchanged_values() {
    let stage = Device::new(Stage::new()).unwrap();
    let incoming = batch(&[
        ("speed", SettingValue::Float(1.0)),
        ("objective", SettingValue::Int(1)),
        ("serial", SettingValue::Str("ignored".into())),
    ]);
    let results = stage.update_settings(&incoming, true).unwrap();

    let state = &stage.driver().state;
    assert_eq!(state.speed_writes.load(Ordering::SeqCst), 1);
    assert_eq!(state.objective_writes.load(Ordering::SeqCst), 1);
    assert_eq!(results["speed"], UpdateOutcome::Applied(SettingValue::Float(1.0)));
    assert_eq!(results["serial"], UpdateOutcome::NotImplemented);
}

#[test]
fn test_unchanged_values_are_not_written() {
    let stage = Device::new(Stage::new()).unwrap();
    let incoming = batch(&[
        ("speed", SettingValue::Float(1.0)),
        ("objective", SettingValue::Int(4)),
    ]);
    let results = stage.update_settings(&incoming, false).unwrap();

    let state = &stage.driver().state;
    assert_eq!(state.speed_writes.load(Ordering::SeqCst), 0);
    assert_eq!(state.objective_writes.load(Ordering::SeqCst), 1);
    assert!(!results.contains_key("speed"));
    assert_eq!(results["objective"], UpdateOutcome::Applied(SettingValue::Int(4)));

    // Repeating the same batch is a no-op.
    let again = stage.update_settings(&incoming, false).unwrap();
    assert!(again.is_empty());
    assert_eq!(state.objective_writes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unknown_names_are_reported() {
    let stage = Device::new(Stage::new()).unwrap();
    let incoming = batch(&[
        ("speed", SettingValue::Float(3.5)),
        ("focus", SettingValue::Float(0.2)),
    ]);
    let results = stage.update_settings(&incoming, false).unwrap();
    assert_eq!(results["focus"], UpdateOutcome::NotImplemented);
    assert_eq!(results["speed"], UpdateOutcome::Applied(SettingValue::Float(3.5)));
}

#[test]
fn test_enum_indices_are_stable() {
    let stage = Device::new(Stage::new()).unwrap();
    let description = stage.settings().describe("objective").unwrap();
    assert_eq!(description.dtype, Dtype::Enum);
    assert_eq!(
        description.values,
        Values::Choices(vec![
            (1, "10x".into()),
            (4, "40x".into()),
            (9, "100x oil".into()),
        ])
    );

    stage.set_setting("objective", SettingValue::Int(9)).unwrap();
    assert_eq!(*stage.driver().state.objective.lock(), Objective::Oil);
    assert_eq!(stage.get_setting("objective").unwrap(), SettingValue::Int(9));

    // Positions are not indices.
    assert!(stage.set_setting("objective", SettingValue::Int(2)).is_err());
    assert_eq!(*stage.driver().state.objective.lock(), Objective::Oil);
}

#[test]
fn test_get_all_in_registration_order() {
    let stage = Device::new(Stage::new()).unwrap();
    let all = stage.get_all_settings();
    let names: Vec<&str> = all.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["speed", "objective", "serial"]);
    assert_eq!(all[2].1, Some(SettingValue::Str("ST-0042".into())));
}

/// Streaming driver whose exposure can only change while idle.
struct Streamer {
    running: Arc<AtomicBool>,
    exposure: Arc<Mutex<f64>>,
    changed_while_running: Arc<AtomicBool>,
    starts: AtomicUsize,
    aborts: AtomicUsize,
}

impl Streamer {
    fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            exposure: Arc::new(Mutex::new(0.1)),
            changed_while_running: Arc::new(AtomicBool::new(false)),
            starts: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }
}

impl Driver for Streamer {
    fn register_settings(&self, settings: &Settings) -> DeviceResult<()> {
        let get = Arc::clone(&self.exposure);
        let (set, running, flagged) = (
            Arc::clone(&self.exposure),
            Arc::clone(&self.running),
            Arc::clone(&self.changed_while_running),
        );
        settings.add(
            SettingBuilder::new("exposure", Dtype::Float)
                .getter(move || Ok(*get.lock()))
                .setter(move |seconds: f64| {
                    if running.load(Ordering::SeqCst) {
                        flagged.store(true, Ordering::SeqCst);
                    }
                    *set.lock() = seconds;
                    Ok(())
                })
                .range(0.0, 60.0),
        )
    }

    fn do_enable(&self) -> DeviceResult<bool> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(true)
    }

    fn do_shutdown(&self) -> DeviceResult<()> {
        Ok(())
    }
}

impl DataDriver for Streamer {
    type Sample = f64;

    fn abort(&self) -> DeviceResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_update_pauses_and_resumes_acquisition() {
    let device = DataDevice::new(Streamer::new()).unwrap();
    device.enable().unwrap();
    assert!(device.is_acquiring());

    let incoming = batch(&[("exposure", SettingValue::Float(0.25))]);
    device.update_settings(&incoming, false).unwrap();

    let driver = device.driver();
    assert!(!driver.changed_while_running.load(Ordering::SeqCst));
    assert_eq!(driver.aborts.load(Ordering::SeqCst), 1);
    assert_eq!(driver.starts.load(Ordering::SeqCst), 2);
    assert!(device.is_acquiring());
    assert_eq!(*driver.exposure.lock(), 0.25);
    device.shutdown();
}

#[test]
fn test_update_on_idle_device_does_not_start_it() {
    let device = DataDevice::new(Streamer::new()).unwrap();
    let incoming = batch(&[("exposure", SettingValue::Float(0.5))]);
    device.update_settings(&incoming, false).unwrap();
    assert_eq!(device.driver().starts.load(Ordering::SeqCst), 0);
    assert!(!device.is_acquiring());
}

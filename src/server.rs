//! Device server bootstrap.
//!
//! Turns [`DeviceDefinition`]s into running devices: each definition names a
//! registered class, which is constructed from the definition's `conf` table,
//! initialised with retry, and assigned the address it will be served on.
//!
//! Floating devices only learn their identity once the hardware is open. The
//! server therefore maps every `uid` of a class to its address up front and
//! resolves a floating device's address from [`DeviceControl::floating_id`]
//! after construction.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{DeviceDefinition, ServerConfig};
use crate::device::DeviceControl;
use crate::error::{DeviceError, DeviceResult};
use crate::retry::RetryPolicy;

/// A device the server can own and serve.
pub trait ServedDevice: DeviceControl + 'static {}

impl<T: DeviceControl + 'static> ServedDevice for T {}

type Constructor =
    Box<dyn Fn(usize, &serde_json::Value) -> DeviceResult<Box<dyn ServedDevice>> + Send + Sync>;

/// Parse a class' constructor arguments.
///
/// Argument structs are expected to use `#[serde(deny_unknown_fields)]` so
/// that misspelt keys fail construction instead of being ignored.
pub fn parse_conf<T: DeserializeOwned>(class: &str, conf: &serde_json::Value) -> DeviceResult<T> {
    serde_json::from_value(conf.clone())
        .map_err(|err| DeviceError::Configuration(format!("{class}: invalid conf: {err}")))
}

/// Device classes known to the server, by name.
#[derive(Default)]
pub struct DeviceRegistry {
    constructors: HashMap<String, Constructor>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `class`. The constructor receives the device's index among
    /// devices of the same class and its `conf` table.
    pub fn register<F>(&mut self, class: impl Into<String>, constructor: F)
    where
        F: Fn(usize, &serde_json::Value) -> DeviceResult<Box<dyn ServedDevice>>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(class.into(), Box::new(constructor));
    }

    /// Whether `class` is registered.
    pub fn contains(&self, class: &str) -> bool {
        self.constructors.contains_key(class)
    }

    /// Registered class names, sorted.
    pub fn classes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Construct one device.
    pub fn create(
        &self,
        class: &str,
        index: usize,
        conf: &serde_json::Value,
    ) -> DeviceResult<Box<dyn ServedDevice>> {
        let constructor = self.constructors.get(class).ok_or_else(|| {
            DeviceError::Configuration(format!("device class '{class}' is not registered"))
        })?;
        constructor(index, conf)
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}

/// Where a device is served.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServedAddress {
    /// Host name or address
    pub host: String,
    /// Port
    pub port: u16,
}

impl fmt::Display for ServedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<&DeviceDefinition> for ServedAddress {
    fn from(definition: &DeviceDefinition) -> Self {
        Self {
            host: definition.host.clone(),
            port: definition.port,
        }
    }
}

/// Addresses of the floating devices of one class, by uid.
pub type UidMap = HashMap<String, ServedAddress>;

/// A constructed and initialised device.
pub struct RunningDevice {
    /// Registered class name
    pub class: String,
    /// Address the device is served on
    pub address: ServedAddress,
    /// The device
    pub device: Box<dyn ServedDevice>,
}

impl fmt::Debug for RunningDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningDevice")
            .field("class", &self.class)
            .field("address", &self.address)
            .field("device", &self.device.name())
            .finish()
    }
}

/// Constructs devices from definitions.
pub struct DeviceServer {
    registry: DeviceRegistry,
    retry: RetryPolicy,
    stop: Arc<AtomicBool>,
    next_index: Mutex<HashMap<String, usize>>,
}

impl DeviceServer {
    /// Server over the classes in `registry`.
    pub fn new(registry: DeviceRegistry, retry: RetryPolicy) -> Self {
        Self {
            registry,
            retry,
            stop: Arc::new(AtomicBool::new(false)),
            next_index: Mutex::new(HashMap::new()),
        }
    }

    /// Registered classes.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Setting this flag abandons devices still retrying start-up.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Ask every pending start-up to give up.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn take_index(&self, class: &str) -> usize {
        let mut counts = self.next_index.lock();
        let next = counts.entry(class.to_string()).or_insert(0);
        let index = *next;
        *next += 1;
        index
    }

    /// Construct, initialise and place one device.
    ///
    /// Construction and initialisation are retried together according to the
    /// server's [`RetryPolicy`]. `uid_map` is only consulted for floating
    /// devices.
    pub fn start(&self, definition: &DeviceDefinition, uid_map: &UidMap) -> DeviceResult<RunningDevice> {
        let class = definition.class.as_str();
        if !self.registry.contains(class) {
            return Err(DeviceError::Configuration(format!(
                "device class '{class}' is not registered"
            )));
        }
        let index = self.take_index(class);
        let what = format!("start {class}[{index}]");
        let device = self.retry.run_until(&what, &self.stop, |attempt| {
            if attempt > 1 {
                info!(class, index, attempt, "Retrying device start-up");
            }
            let device = self.registry.create(class, index, &definition.conf)?;
            device.initialize()?;
            Ok(device)
        })?;

        let address = match device.floating_id() {
            Some(uid) => {
                let uid = uid?;
                let address = uid_map.get(&uid).cloned().ok_or_else(|| {
                    DeviceError::Configuration(format!("Host or port not found for device {uid}"))
                })?;
                info!(class, %uid, %address, "Floating device identified");
                address
            }
            None => {
                if definition.uid.is_some() {
                    return Err(DeviceError::Configuration(format!(
                        "uid must not be given for non floating device class '{class}'"
                    )));
                }
                ServedAddress::from(definition)
            }
        };

        info!(device = %device.name(), %address, "Device initialised; serving");
        Ok(RunningDevice {
            class: class.to_string(),
            address,
            device,
        })
    }

    /// Start every device in `config`.
    ///
    /// Devices that fail to start are logged and skipped so that one broken
    /// device does not keep the rest of the rig down.
    pub fn start_all(&self, config: &ServerConfig) -> Vec<RunningDevice> {
        if config.devices.is_empty() {
            warn!("No devices specified");
        }
        let uid_maps = uid_maps(&config.devices);
        let empty = UidMap::new();
        let mut running = Vec::with_capacity(config.devices.len());
        for definition in &config.devices {
            let uid_map = uid_maps.get(&definition.class).unwrap_or(&empty);
            match self.start(definition, uid_map) {
                Ok(device) => running.push(device),
                Err(err) => {
                    error!(class = %definition.class, address = %definition.address(), error = %err, "Failed to start device");
                }
            }
        }
        running
    }
}

/// uid to address maps, one per class.
pub fn uid_maps(definitions: &[DeviceDefinition]) -> HashMap<String, UidMap> {
    let mut maps: HashMap<String, UidMap> = HashMap::new();
    for definition in definitions {
        if let Some(uid) = &definition.uid {
            maps.entry(definition.class.clone())
                .or_default()
                .insert(uid.clone(), ServedAddress::from(definition));
        }
    }
    maps
}

/// Shut every device down, in reverse start order.
pub fn shutdown_all(running: Vec<RunningDevice>) {
    for device in running.into_iter().rev() {
        info!(device = %device.device.name(), address = %device.address, "Stopping device");
        device.device.shutdown();
    }
}

// =============================================================================
// Vendor SDK reference counting
// =============================================================================

static SDKS: Lazy<Mutex<HashMap<String, usize>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Process-wide reference counts of vendor SDKs shared by several devices.
///
/// The first [`SdkRegistry::acquire`] of a name runs its initialiser and the
/// last [`SdkRegistry::release`] runs its teardown. One mutex guards every
/// SDK, and it is held while the initialiser or teardown runs.
pub struct SdkRegistry;

impl SdkRegistry {
    /// Take a reference to SDK `name`, running `init` if it is the first.
    ///
    /// A failing `init` leaves the SDK unreferenced.
    pub fn acquire<F>(name: &str, init: F) -> DeviceResult<()>
    where
        F: FnOnce() -> DeviceResult<()>,
    {
        let mut sdks = SDKS.lock();
        let count = sdks.get(name).copied().unwrap_or(0);
        if count == 0 {
            info!(sdk = name, "Initialising SDK");
            init()?;
        }
        sdks.insert(name.to_string(), count + 1);
        Ok(())
    }

    /// Drop a reference to SDK `name`, running `teardown` if it was the last.
    pub fn release<F>(name: &str, teardown: F) -> DeviceResult<()>
    where
        F: FnOnce() -> DeviceResult<()>,
    {
        let mut sdks = SDKS.lock();
        match sdks.get(name).copied() {
            None | Some(0) => {
                warn!(sdk = name, "Release of an SDK that was not acquired");
                Ok(())
            }
            Some(1) => {
                sdks.remove(name);
                info!(sdk = name, "Tearing down SDK");
                teardown()
            }
            Some(count) => {
                sdks.insert(name.to_string(), count - 1);
                Ok(())
            }
        }
    }

    /// Current reference count of `name`.
    pub fn count(name: &str) -> usize {
        SDKS.lock().get(name).copied().unwrap_or(0)
    }
}

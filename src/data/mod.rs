//! Streaming devices.
//!
//! A [`DataDevice`] moves samples from the hardware to clients through two
//! background threads:
//!
//! - the **fetch loop** polls [`DataDriver::fetch_data`] and enqueues each
//!   sample together with the client that was current when it was captured;
//! - the **dispatch loop** takes items off the queue, drops those whose client
//!   is no longer live, processes the rest and delivers them.
//!
//! Faults raised by the fetch hook travel through the queue as
//! [`Payload::Error`] so that clients learn about them in band and the fetch
//! loop keeps running. Nothing that happens during processing or delivery can
//! stop the dispatch loop; only [`DataDevice::shutdown`] does, by sending a stop
//! item through the queue.

pub mod acquisition;
pub mod client;

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::device::{Device, DeviceControl, Driver};
use crate::error::{DeviceError, DeviceResult};
use crate::setting::{SettingValue, Settings, UpdateOutcome};
use crate::trigger::TriggerTarget;

use self::acquisition::Acquisition;
use self::client::{
    Client, ClientError, ClientHandle, ClientId, ClientResolver, ClientSpec, ClientStack, Payload,
    RemoteError,
};

/// Pause between polls when the fetch hook has nothing.
const FETCH_IDLE: Duration = Duration::from_millis(1);

/// How long the fetch loop waits on a full queue before re-checking its stop flag.
const ENQUEUE_POLL: Duration = Duration::from_millis(50);

/// Hooks of a device that produces discrete samples.
pub trait DataDriver: Driver {
    /// One unit of acquired data.
    type Sample: Send + 'static;

    /// Stop hardware acquisition.
    fn abort(&self) -> DeviceResult<()>;

    /// Poll the hardware once.
    ///
    /// Must return `Ok(None)` rather than block for long when nothing is
    /// ready, so that the fetch loop notices when it is asked to stop.
    fn fetch_data(&self) -> DeviceResult<Option<Self::Sample>> {
        Ok(None)
    }

    /// Per-sample transform applied on the dispatch thread.
    fn process_data(&self, sample: Self::Sample) -> DeviceResult<Self::Sample> {
        Ok(sample)
    }

    /// True when the hardware pushes samples through a [`SampleSink`] instead
    /// of being polled.
    fn uses_callback(&self) -> bool {
        false
    }

    /// Receive the sink used in callback mode. Called once at construction.
    fn attach_sink(&self, _sink: SampleSink<Self::Sample>) {}

    /// Register settings that need the acquisition handle, typically setters
    /// wrapped with [`Acquisition::wrap_setter`].
    fn register_data_settings(
        &self,
        _settings: &Settings,
        _acquisition: &Acquisition,
    ) -> DeviceResult<()> {
        Ok(())
    }
}

/// Extra processing applied after [`DataDriver::process_data`].
pub type Processor<S> = Arc<dyn Fn(S) -> DeviceResult<S> + Send + Sync>;

/// Construction options for a [`DataDevice`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DataDeviceOptions {
    /// Dispatch queue capacity; `0` means unbounded.
    pub queue_capacity: usize,
    /// Index among sibling devices.
    pub index: Option<usize>,
}

enum QueueItem<S> {
    Sample {
        client: ClientHandle<S>,
        sample: S,
        timestamp: DateTime<Utc>,
    },
    Fault {
        client: ClientHandle<S>,
        error: RemoteError,
        timestamp: DateTime<Utc>,
    },
    Stop,
}

/// Shared between the device, its threads and any [`SampleSink`].
struct Pipeline<S> {
    clients: Mutex<ClientStack<S>>,
    tx: Sender<QueueItem<S>>,
}

impl<S> Pipeline<S> {
    fn capture(&self, sample: S) -> Option<QueueItem<S>> {
        let client = self.clients.lock().current()?;
        Some(QueueItem::Sample {
            client,
            sample,
            timestamp: Utc::now(),
        })
    }

    fn capture_fault(&self, err: &DeviceError) -> Option<QueueItem<S>> {
        let client = self.clients.lock().current()?;
        Some(QueueItem::Fault {
            client,
            error: RemoteError::from(err),
            timestamp: Utc::now(),
        })
    }
}

/// Handle through which callback-mode hardware delivers samples.
pub struct SampleSink<S> {
    pipeline: Arc<Pipeline<S>>,
}

impl<S> Clone for SampleSink<S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

impl<S: Send + 'static> SampleSink<S> {
    /// Queue a sample for the current client. Returns false if it was dropped.
    pub fn push(&self, sample: S) -> bool {
        match self.pipeline.capture(sample) {
            Some(item) => self.pipeline.tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Queue a fault for the current client. Returns false if it was dropped.
    pub fn push_error(&self, err: &DeviceError) -> bool {
        match self.pipeline.capture_fault(err) {
            Some(item) => self.pipeline.tx.send(item).is_ok(),
            None => false,
        }
    }
}

struct FetchHandle {
    run: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Removes its client from the stack when dropped.
#[must_use = "the client is removed as soon as the guard is dropped"]
pub struct ClientGuard<S> {
    pipeline: Arc<Pipeline<S>>,
    id: ClientId,
}

impl<S> ClientGuard<S> {
    /// Id of the installed client.
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl<S> Drop for ClientGuard<S> {
    fn drop(&mut self) {
        self.pipeline.clients.lock().remove(self.id);
    }
}

/// Single-slot client used by [`DataDevice::grab_next_data`].
struct NextSample<S> {
    slot: Mutex<Option<Payload<S>>>,
    ready: Condvar,
}

impl<S> NextSample<S> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn wait(&self, deadline: Option<Instant>) -> Option<Payload<S>> {
        let mut slot = self.slot.lock();
        while slot.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
                None => self.ready.wait(&mut slot),
            }
        }
        slot.take()
    }
}

impl<S: Send> Client<S> for NextSample<S> {
    fn receive(&self, payload: Payload<S>, _timestamp: DateTime<Utc>) -> Result<(), ClientError> {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(payload);
            self.ready.notify_all();
        }
        Ok(())
    }
}

/// A [`Device`] with the fetch/dispatch engine and a client stack.
pub struct DataDevice<D: DataDriver> {
    device: Device<D>,
    acquisition: Acquisition,
    pipeline: Arc<Pipeline<D::Sample>>,
    rx: Receiver<QueueItem<D::Sample>>,
    fetch: Mutex<Option<FetchHandle>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    processor: Option<Processor<D::Sample>>,
    resolver: RwLock<Option<Arc<dyn ClientResolver<D::Sample>>>>,
}

impl<D: DataDriver> DataDevice<D> {
    /// Wrap `driver` with default options.
    pub fn new(driver: D) -> DeviceResult<Self> {
        Self::with_options(driver, DataDeviceOptions::default())
    }

    /// Wrap `driver`.
    pub fn with_options(driver: D, options: DataDeviceOptions) -> DeviceResult<Self> {
        Self::build(Arc::new(driver), options, |_, _| Ok(()), None)
    }

    /// Settings registered by `pre` come first, then the driver's
    /// [`Driver::register_settings`] and [`DataDriver::register_data_settings`].
    pub(crate) fn build<F>(
        driver: Arc<D>,
        options: DataDeviceOptions,
        pre: F,
        processor: Option<Processor<D::Sample>>,
    ) -> DeviceResult<Self>
    where
        F: FnOnce(&Settings, &Acquisition) -> DeviceResult<()>,
    {
        let acquisition = Acquisition::new(driver.clone());
        let device = Device::build(Arc::clone(&driver), options.index, |settings| {
            pre(settings, &acquisition)
        })?;
        driver.register_data_settings(device.settings(), &acquisition)?;

        let (tx, rx) = match options.queue_capacity {
            0 => channel::unbounded(),
            n => channel::bounded(n),
        };
        let pipeline = Arc::new(Pipeline {
            clients: Mutex::new(ClientStack::new()),
            tx,
        });
        if driver.uses_callback() {
            driver.attach_sink(SampleSink {
                pipeline: Arc::clone(&pipeline),
            });
        }

        Ok(Self {
            device,
            acquisition,
            pipeline,
            rx,
            fetch: Mutex::new(None),
            dispatch: Mutex::new(None),
            processor,
            resolver: RwLock::new(None),
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

    /// Acquisition handle.
    pub fn acquisition(&self) -> &Acquisition {
        &self.acquisition
    }

    /// Whether the hardware is acquiring.
    pub fn is_acquiring(&self) -> bool {
        self.acquisition.is_acquiring()
    }

    /// Tri-state enabled flag.
    pub fn is_enabled(&self) -> Option<bool> {
        self.device.is_enabled()
    }

    /// Settings registry.
    pub fn settings(&self) -> &Settings {
        self.device.settings()
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Initialise the hardware.
    pub fn initialize(&self) -> DeviceResult<()> {
        self.device.initialize()
    }

    /// Start acquisition and the background threads.
    ///
    /// Unlike [`Device::enable`], a failing enable hook is returned to the
    /// caller. Calling this while already enabled does not start new threads.
    pub fn enable(&self) -> DeviceResult<bool> {
        debug!(device = %self.name(), "Enabling");
        let started = match self.acquisition.start() {
            Ok(started) => started,
            Err(err) => {
                self.device.set_enabled(false);
                error!(device = %self.name(), error = %err, "Failed to enable device");
                return Err(err);
            }
        };
        if !started {
            self.device.set_enabled(false);
            return Ok(false);
        }
        if !self.driver().uses_callback() {
            self.ensure_fetch_loop()?;
        }
        self.ensure_dispatch_loop()?;
        self.device.set_enabled(true);
        Ok(true)
    }

    /// Stop the fetch loop and disable the hardware.
    ///
    /// Blocks until the fetch thread has exited.
    pub fn disable(&self) -> DeviceResult<()> {
        self.device.set_enabled(false);
        let handle = self.fetch.lock().take();
        if let Some(handle) = handle {
            handle.run.store(false, Ordering::Release);
            if handle.thread.thread().id() == thread::current().id() {
                warn!(device = %self.name(), "disable called from the fetch thread; not joining");
            } else if handle.thread.join().is_err() {
                error!(device = %self.name(), "Fetch thread panicked");
            }
        }
        let result = self.device.disable();
        self.acquisition.mark_stopped();
        result
    }

    /// Stop hardware acquisition without disabling the device.
    pub fn abort(&self) -> DeviceResult<()> {
        self.acquisition.abort()
    }

    /// Disable, release the hardware and stop the dispatch thread.
    pub fn shutdown(&self) {
        self.device.shutdown_with(|| self.disable());
        self.stop_dispatch();
    }

    fn ensure_fetch_loop(&self) -> DeviceResult<()> {
        let mut fetch = self.fetch.lock();
        if let Some(handle) = fetch.as_ref() {
            if !handle.thread.is_finished() {
                return Ok(());
            }
        }
        let run = Arc::new(AtomicBool::new(true));
        let worker = FetchWorker {
            name: self.name().to_string(),
            driver: Arc::clone(self.device.driver_arc()),
            pipeline: Arc::clone(&self.pipeline),
            run: Arc::clone(&run),
        };
        let handle = thread::Builder::new()
            .name(format!("{}-fetch", self.name()))
            .spawn(move || worker.run())
            .map_err(|err| DeviceError::Acquisition(format!("cannot start fetch thread: {err}")))?;
        *fetch = Some(FetchHandle { run, thread: handle });
        Ok(())
    }

    fn ensure_dispatch_loop(&self) -> DeviceResult<()> {
        let mut dispatch = self.dispatch.lock();
        if let Some(handle) = dispatch.as_ref() {
            if !handle.is_finished() {
                return Ok(());
            }
        }
        let worker = DispatchWorker {
            name: self.name().to_string(),
            driver: Arc::clone(self.device.driver_arc()),
            processor: self.processor.clone(),
            pipeline: Arc::clone(&self.pipeline),
            rx: self.rx.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("{}-dispatch", self.name()))
            .spawn(move || worker.run())
            .map_err(|err| DeviceError::Acquisition(format!("cannot start dispatch thread: {err}")))?;
        *dispatch = Some(handle);
        Ok(())
    }

    fn stop_dispatch(&self) {
        let Some(handle) = self.dispatch.lock().take() else {
            return;
        };
        if self.pipeline.tx.send(QueueItem::Stop).is_err() {
            return;
        }
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!(device = %self.name(), "Dispatch thread panicked");
        }
    }

    /// Thread ids of the running fetch and dispatch loops.
    pub fn worker_threads(&self) -> (Option<thread::ThreadId>, Option<thread::ThreadId>) {
        let fetch = self
            .fetch
            .lock()
            .as_ref()
            .filter(|h| !h.thread.is_finished())
            .map(|h| h.thread.thread().id());
        let dispatch = self
            .dispatch
            .lock()
            .as_ref()
            .filter(|t| !t.is_finished())
            .map(|t| t.thread().id());
        (fetch, dispatch)
    }

    // -------------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------------

    /// Used to turn locator strings into clients.
    pub fn set_client_resolver(&self, resolver: Arc<dyn ClientResolver<D::Sample>>) {
        *self.resolver.write() = Some(resolver);
    }

    fn resolve(&self, spec: ClientSpec<D::Sample>) -> DeviceResult<Arc<dyn Client<D::Sample>>> {
        match spec {
            ClientSpec::Direct(client) => Ok(client),
            ClientSpec::Locator(locator) => {
                let resolver = self.resolver.read().clone().ok_or_else(|| {
                    DeviceError::Configuration(format!(
                        "no client resolver to connect to {locator}"
                    ))
                })?;
                resolver.resolve(&locator)
            }
        }
    }

    /// Push a client, or pop the current one with `None`.
    ///
    /// Pops pair with pushes only by convention; prefer
    /// [`DataDevice::install_client`] when the caller owns the client's
    /// lifetime.
    pub fn set_client(&self, client: Option<ClientSpec<D::Sample>>) -> DeviceResult<()> {
        match client {
            None => {
                if self.pipeline.clients.lock().pop().is_none() {
                    debug!(device = %self.name(), "No client to remove");
                }
            }
            Some(spec) => {
                let client = self.resolve(spec)?;
                let id = self.pipeline.clients.lock().push(client);
                info!(device = %self.name(), client = id, "Client installed");
            }
        }
        Ok(())
    }

    /// Push a client resolved from `locator`.
    pub fn receive_client(&self, locator: &str) -> DeviceResult<()> {
        self.set_client(Some(ClientSpec::Locator(locator.to_string())))
    }

    /// Push `client` for as long as the returned guard lives.
    pub fn install_client(&self, client: Arc<dyn Client<D::Sample>>) -> ClientGuard<D::Sample> {
        let id = self.pipeline.clients.lock().push(client);
        ClientGuard {
            pipeline: Arc::clone(&self.pipeline),
            id,
        }
    }

    /// Number of clients on the stack.
    pub fn client_count(&self) -> usize {
        self.pipeline.clients.lock().len()
    }

    /// Wait for the next sample.
    ///
    /// With `soft_trigger` a software trigger is fired after the temporary
    /// client is installed. Blocks without limit; see
    /// [`DataDevice::grab_next_data_timeout`].
    pub fn grab_next_data(&self, soft_trigger: bool) -> DeviceResult<D::Sample> {
        self.grab_with(soft_trigger, self.driver().as_trigger_target(), None)
    }

    /// [`DataDevice::grab_next_data`] giving up after `timeout`.
    pub fn grab_next_data_timeout(
        &self,
        soft_trigger: bool,
        timeout: Duration,
    ) -> DeviceResult<D::Sample> {
        self.grab_with(soft_trigger, self.driver().as_trigger_target(), Some(timeout))
    }

    pub(crate) fn grab_with(
        &self,
        soft_trigger: bool,
        target: Option<&dyn TriggerTarget>,
        timeout: Option<Duration>,
    ) -> DeviceResult<D::Sample> {
        if self.is_enabled() != Some(true) {
            return Err(DeviceError::Disabled);
        }
        let next = Arc::new(NextSample::new());
        let _guard = self.install_client(next.clone());
        if soft_trigger {
            match target {
                Some(target) => target.trigger()?,
                None => {
                    return Err(DeviceError::UnsupportedFeature(format!(
                        "{} cannot be triggered from software",
                        self.name()
                    )))
                }
            }
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        match next.wait(deadline) {
            Some(Payload::Data(sample)) => Ok(sample),
            Some(Payload::Error(err)) => Err(DeviceError::Acquisition(err.message)),
            None => Err(DeviceError::Timeout(timeout.unwrap_or_default())),
        }
    }

    /// Apply a batch of values with acquisition paused.
    pub fn update_settings(
        &self,
        incoming: &BTreeMap<String, SettingValue>,
        init: bool,
    ) -> DeviceResult<BTreeMap<String, UpdateOutcome>> {
        self.acquisition
            .keep_acquiring(|| self.device.settings().update(incoming, init))
    }
}

impl<D: DataDriver> Drop for DataDevice<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<D: DataDriver> DeviceControl for DataDevice<D> {
    fn name(&self) -> &str {
        DataDevice::name(self)
    }

    fn index(&self) -> Option<usize> {
        self.device.index()
    }

    fn initialize(&self) -> DeviceResult<()> {
        DataDevice::initialize(self)
    }

    fn enable(&self) -> DeviceResult<bool> {
        DataDevice::enable(self)
    }

    fn disable(&self) -> DeviceResult<()> {
        DataDevice::disable(self)
    }

    fn shutdown(&self) {
        DataDevice::shutdown(self);
    }

    fn is_enabled(&self) -> Option<bool> {
        DataDevice::is_enabled(self)
    }

    fn settings(&self) -> &Settings {
        DataDevice::settings(self)
    }

    fn floating_id(&self) -> Option<DeviceResult<String>> {
        DeviceControl::floating_id(&self.device)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn update_settings(
        &self,
        incoming: &BTreeMap<String, SettingValue>,
        init: bool,
    ) -> DeviceResult<BTreeMap<String, UpdateOutcome>> {
        DataDevice::update_settings(self, incoming, init)
    }
}

// =============================================================================
// Background loops
// =============================================================================

struct FetchWorker<D: DataDriver> {
    name: String,
    driver: Arc<D>,
    pipeline: Arc<Pipeline<D::Sample>>,
    run: Arc<AtomicBool>,
}

impl<D: DataDriver> FetchWorker<D> {
    fn run(self) {
        debug!(device = %self.name, "Fetch loop started");
        while self.run.load(Ordering::Acquire) {
            let item = match self.driver.fetch_data() {
                Ok(Some(sample)) => self.pipeline.capture(sample),
                Ok(None) => {
                    thread::sleep(FETCH_IDLE);
                    continue;
                }
                Err(err) => {
                    error!(device = %self.name, error = %err, "Fault while fetching data");
                    self.pipeline.capture_fault(&err)
                }
            };
            match item {
                Some(item) => {
                    if !self.enqueue(item) {
                        break;
                    }
                }
                None => debug!(device = %self.name, "No client; sample dropped"),
            }
        }
        debug!(device = %self.name, "Fetch loop stopped");
    }

    /// Blocks on a full queue, giving up when asked to stop.
    fn enqueue(&self, mut item: QueueItem<D::Sample>) -> bool {
        loop {
            match self.pipeline.tx.send_timeout(item, ENQUEUE_POLL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if !self.run.load(Ordering::Acquire) {
                        return false;
                    }
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

struct DispatchWorker<D: DataDriver> {
    name: String,
    driver: Arc<D>,
    processor: Option<Processor<D::Sample>>,
    pipeline: Arc<Pipeline<D::Sample>>,
    rx: Receiver<QueueItem<D::Sample>>,
}

impl<D: DataDriver> DispatchWorker<D> {
    fn run(self) {
        debug!(device = %self.name, "Dispatch loop started");
        for item in self.rx.iter() {
            let (client, payload, timestamp) = match item {
                QueueItem::Stop => break,
                QueueItem::Sample {
                    client,
                    sample,
                    timestamp,
                } => {
                    if !self.is_live(&client) {
                        continue;
                    }
                    match self.process(sample) {
                        Some(sample) => (client, Payload::Data(sample), timestamp),
                        None => continue,
                    }
                }
                QueueItem::Fault {
                    client,
                    error,
                    timestamp,
                } => {
                    if !self.is_live(&client) {
                        continue;
                    }
                    (client, Payload::Error(error), timestamp)
                }
            };
            self.deliver(&client, payload, timestamp);
        }
        debug!(device = %self.name, "Dispatch loop stopped");
    }

    fn is_live(&self, client: &ClientHandle<D::Sample>) -> bool {
        self.pipeline.clients.lock().is_live(client.id())
    }

    fn process(&self, sample: D::Sample) -> Option<D::Sample> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let sample = self.driver.process_data(sample)?;
            match &self.processor {
                Some(processor) => processor(sample),
                None => Ok(sample),
            }
        }));
        match outcome {
            Ok(Ok(sample)) => Some(sample),
            Ok(Err(err)) => {
                error!(device = %self.name, error = %err, "Failed to process sample");
                None
            }
            Err(_) => {
                error!(device = %self.name, "Sample processing panicked");
                None
            }
        }
    }

    fn deliver(&self, client: &ClientHandle<D::Sample>, payload: Payload<D::Sample>, timestamp: DateTime<Utc>) {
        let outcome = catch_unwind(AssertUnwindSafe(|| client.receive(payload, timestamp)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(ClientError::ConnectionClosed)) => {
                info!(device = %self.name, client = client.id(), "Client connection closed; removing");
                self.pipeline.clients.lock().mark_dead(client.id());
            }
            Ok(Err(err)) => {
                warn!(device = %self.name, client = client.id(), error = %err, "Delivery failed");
            }
            Err(_) => {
                error!(device = %self.name, client = client.id(), "Client panicked during delivery");
            }
        }
    }
}

//! Acquisition state and state-preserving reconfiguration.
//!
//! Some hardware cannot change buffer sizes, binning or ROI while it streams.
//! [`Acquisition::keep_acquiring`] stops acquisition if it is running, performs
//! the change, and restarts it afterwards, on both the success and the error
//! path. Setters that need this are wrapped at registration time with
//! [`Acquisition::wrap_setter`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::DeviceResult;

use super::DataDriver;

/// Start/stop hooks of a streaming driver.
pub trait AcquisitionHooks: Send + Sync {
    /// Stop hardware acquisition.
    fn halt(&self) -> DeviceResult<()>;

    /// Prepare and start hardware acquisition. Returns whether it started.
    fn prepare(&self) -> DeviceResult<bool>;
}

impl<D: DataDriver> AcquisitionHooks for D {
    fn halt(&self) -> DeviceResult<()> {
        self.abort()
    }

    fn prepare(&self) -> DeviceResult<bool> {
        self.do_enable()
    }
}

/// Shared acquisition flag plus the hooks that change it.
#[derive(Clone)]
pub struct Acquisition {
    hooks: Arc<dyn AcquisitionHooks>,
    acquiring: Arc<AtomicBool>,
}

impl Acquisition {
    /// Track acquisition driven by `hooks`.
    pub fn new(hooks: Arc<dyn AcquisitionHooks>) -> Self {
        Self {
            hooks,
            acquiring: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the hardware is currently acquiring.
    pub fn is_acquiring(&self) -> bool {
        self.acquiring.load(Ordering::Acquire)
    }

    /// Run the prepare hook and record the outcome.
    pub fn start(&self) -> DeviceResult<bool> {
        match self.hooks.prepare() {
            Ok(started) => {
                self.acquiring.store(started, Ordering::Release);
                Ok(started)
            }
            Err(err) => {
                self.acquiring.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Run the halt hook. The flag is cleared even if the hook fails.
    pub fn abort(&self) -> DeviceResult<()> {
        let result = self.hooks.halt();
        self.acquiring.store(false, Ordering::Release);
        result
    }

    pub(crate) fn mark_stopped(&self) {
        self.acquiring.store(false, Ordering::Release);
    }

    /// Abort if acquiring. Acquisition resumes when the guard is dropped or
    /// [`AcquisitionPause::resume`] is called.
    pub fn pause(&self) -> DeviceResult<AcquisitionPause> {
        let was_acquiring = self.is_acquiring();
        if was_acquiring {
            debug!("Pausing acquisition");
            self.abort()?;
        }
        Ok(AcquisitionPause {
            acquisition: self.clone(),
            was_acquiring,
            finished: false,
        })
    }

    /// Run `op` with acquisition paused.
    ///
    /// An error from `op` takes precedence over an error while resuming.
    pub fn keep_acquiring<T, F>(&self, op: F) -> DeviceResult<T>
    where
        F: FnOnce() -> DeviceResult<T>,
    {
        let pause = self.pause()?;
        let outcome = op();
        let resumed = pause.resume();
        match outcome {
            Ok(value) => resumed.map(|()| value),
            Err(err) => {
                if let Err(resume_err) = resumed {
                    warn!(error = %resume_err, "Failed to resume acquisition after error");
                }
                Err(err)
            }
        }
    }

    /// Wrap a setter so it always runs through [`Acquisition::keep_acquiring`].
    pub fn wrap_setter<T, F>(&self, setter: F) -> impl Fn(T) -> DeviceResult<()> + Send + Sync + 'static
    where
        T: 'static,
        F: Fn(T) -> DeviceResult<()> + Send + Sync + 'static,
    {
        let acquisition = self.clone();
        move |value| acquisition.keep_acquiring(|| setter(value))
    }
}

/// Guard returned by [`Acquisition::pause`].
#[must_use = "acquisition resumes as soon as the guard is dropped"]
pub struct AcquisitionPause {
    acquisition: Acquisition,
    was_acquiring: bool,
    finished: bool,
}

impl AcquisitionPause {
    /// Whether acquisition was running before the pause.
    pub fn was_acquiring(&self) -> bool {
        self.was_acquiring
    }

    /// Resume now and report the result.
    pub fn resume(mut self) -> DeviceResult<()> {
        self.finished = true;
        if self.was_acquiring {
            debug!("Resuming acquisition");
            self.acquisition.start()?;
        }
        Ok(())
    }
}

impl Drop for AcquisitionPause {
    fn drop(&mut self) {
        if !self.finished && self.was_acquiring {
            if let Err(err) = self.acquisition.start() {
                warn!(error = %err, "Failed to resume acquisition");
            }
        }
    }
}

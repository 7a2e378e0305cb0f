//! Retrying operations that fail while hardware comes up.
//!
//! Device constructors and initialisers often fail for a while after power-up
//! or while another process still holds the hardware. The server keeps
//! retrying them with a fixed delay until they succeed, the attempt limit is
//! reached, or it is asked to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{DeviceError, DeviceResult};

/// Longest single sleep between checks of the stop flag.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Defines a policy for retrying an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts; `None` retries until stopped.
    pub max_attempts: Option<u32>,
    /// Delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy with an attempt limit.
    pub fn bounded(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff_delay,
        }
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// `op` receives the 1-based attempt number. On give-up the last error
    /// is returned.
    pub fn run<T, F>(&self, what: &str, op: F) -> DeviceResult<T>
    where
        F: FnMut(u32) -> DeviceResult<T>,
    {
        self.run_until(what, &AtomicBool::new(false), op)
    }

    /// Same as [`RetryPolicy::run`], giving up early once `stop` is set.
    pub fn run_until<T, F>(&self, what: &str, stop: &AtomicBool, mut op: F) -> DeviceResult<T>
    where
        F: FnMut(u32) -> DeviceResult<T>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if self.max_attempts.is_some_and(|max| attempt >= max) {
                warn!(operation = what, attempts = attempt, error = %err, "Giving up");
                return Err(err);
            }
            info!(
                operation = what,
                attempt,
                error = %err,
                "Failed; retrying in {:?}",
                self.backoff_delay
            );
            if !sleep_unless_stopped(self.backoff_delay, stop) {
                return Err(DeviceError::Initialise(format!(
                    "{what}: stopped after {attempt} attempt(s), last error: {err}"
                )));
            }
        }
    }
}

/// Returns false if `stop` was set before `delay` elapsed.
fn sleep_unless_stopped(delay: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(STOP_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_logic_succeeds() {
        let policy = RetryPolicy::bounded(3, Duration::from_millis(10));
        let mut attempts = 0;
        let result = policy.run("open", |n| {
            attempts = n;
            if n >= 2 {
                Ok(n)
            } else {
                Err(DeviceError::Initialise("busy".into()))
            }
        });
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_retry_logic_fails_with_last_error() {
        let policy = RetryPolicy::bounded(3, Duration::from_millis(1));
        let mut attempts = 0;
        let result: DeviceResult<()> = policy.run("open", |n| {
            attempts = n;
            Err(DeviceError::Hardware(format!("attempt {n}")))
        });
        assert_eq!(attempts, 3);
        assert_eq!(result.unwrap_err().to_string(), "Hardware error: attempt 3");
    }

    #[test]
    fn test_stop_interrupts_unbounded_retry() {
        let policy = RetryPolicy {
            max_attempts: None,
            backoff_delay: Duration::from_secs(60),
        };
        let stop = AtomicBool::new(true);
        let result: DeviceResult<()> =
            policy.run_until("open", &stop, |_| Err(DeviceError::Initialise("busy".into())));
        assert!(matches!(result, Err(DeviceError::Initialise(_))));
    }
}

//! Periodic loop drivers
//!
//! Every agent loop runs on its own OS thread: run the body, sleep the
//! interval, repeat until the shared [`RunFlag`] is cleared. A body that
//! returns an error is logged and followed by the loop's backoff sleep
//! instead of its normal interval. Sleeps wake early when the flag is
//! cleared, so shutdown does not wait out a long interval.

use anyhow::Result;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Minimum sleep after a failed iteration
pub const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Shared "keep running" flag with interruptible sleep
#[derive(Debug, Clone, Default)]
pub struct RunFlag {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl RunFlag {
    /// A flag that starts in the running state
    pub fn running() -> Self {
        let flag = Self::default();
        flag.set(true);
        flag
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, value: bool) {
        *self.lock() = value;
        self.inner.1.notify_all();
    }

    pub fn start(&self) {
        self.set(true);
    }

    /// Clear the flag and wake every sleeping loop
    pub fn stop(&self) {
        self.set(false);
    }

    pub fn is_running(&self) -> bool {
        *self.lock()
    }

    /// Sleep up to `duration`. Returns false if the flag was cleared before
    /// or during the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut running = self.lock();
        while *running {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            running = self
                .inner
                .1
                .wait_timeout(running, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        false
    }
}

/// When the first iteration runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstTick {
    Immediate,
    AfterInterval,
}

/// Cadence of one loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSpec {
    pub name: &'static str,
    pub interval: Duration,
    /// Sleep after a failed iteration
    pub backoff: Duration,
    pub first_tick: FirstTick,
}

impl LoopSpec {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            backoff: interval.max(ERROR_BACKOFF),
            first_tick: FirstTick::Immediate,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Wait one interval before the first iteration
    pub fn delayed(mut self) -> Self {
        self.first_tick = FirstTick::AfterInterval;
        self
    }
}

/// Run `body` on a dedicated thread named after the loop
pub fn spawn_loop<F>(spec: LoopSpec, flag: RunFlag, body: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut() -> Result<()> + Send + 'static,
{
    thread::Builder::new()
        .name(format!("tailship-{}", spec.name))
        .spawn(move || run_loop(&spec, &flag, body))
}

/// Drive `body` on the current thread until `flag` is cleared
pub fn run_loop<F>(spec: &LoopSpec, flag: &RunFlag, mut body: F)
where
    F: FnMut() -> Result<()>,
{
    debug!(name = spec.name, interval = ?spec.interval, "Loop started");

    if spec.first_tick == FirstTick::AfterInterval && !flag.sleep(spec.interval) {
        debug!(name = spec.name, "Loop stopped");
        return;
    }

    while flag.is_running() {
        let pause = match body() {
            Ok(()) => spec.interval,
            Err(e) => {
                error!(name = spec.name, backoff = ?spec.backoff, "Error in {} loop: {:#}", spec.name, e);
                spec.backoff
            }
        };
        if !flag.sleep(pause) {
            break;
        }
    }

    debug!(name = spec.name, "Loop stopped");
}

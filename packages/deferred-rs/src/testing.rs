//! Testing utilities for code built on deferreds.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! deferred = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Using `Probe` to Observe Deliveries
//!
//! ```ignore
//! use deferred::testing::Probe;
//!
//! let probe = Probe::new();
//! lookup.exec(probe.callback())?;
//!
//! assert!(probe.wait(1, Duration::from_secs(1)).await);
//! assert_eq!(probe.single()?, expected);
//! ```
//!
//! # Using `WarningCounter` to Catch Misbehaving Work
//!
//! Double completion and late timers are logged, not returned. Count them:
//!
//! ```ignore
//! use deferred::testing::WarningCounter;
//!
//! let ((), warnings) = WarningCounter::capture(|| {
//!     flaky.exec(|_| {}).unwrap();
//! });
//! assert_eq!(warnings.warnings(), 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use crate::error::Outcome;

/// Records every outcome delivered to its callbacks.
///
/// Tests should wait for meaning, not time: [`Probe::wait`] and
/// [`Probe::wait_blocking`] return as soon as the expected number of
/// deliveries has happened.
pub struct Probe<T> {
    shared: Arc<ProbeShared<T>>,
}

struct ProbeShared<T> {
    outcomes: Mutex<Vec<Outcome<T>>>,
    calls: AtomicUsize,
    condvar: Condvar,
    notify: Notify,
}

impl<T> Clone for Probe<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Default for Probe<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Probe<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ProbeShared {
                outcomes: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                condvar: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// A consumer callback that records into this probe.
    pub fn callback(&self) -> impl FnOnce(Outcome<T>) + Send + 'static {
        let shared = Arc::clone(&self.shared);
        move |outcome| {
            {
                let mut outcomes = shared.outcomes();
                outcomes.push(outcome);
                shared.calls.fetch_add(1, Ordering::AcqRel);
            }
            shared.condvar.notify_all();
            shared.notify.notify_waiters();
        }
    }

    /// Total deliveries observed so far.
    pub fn calls(&self) -> usize {
        self.shared.calls.load(Ordering::Acquire)
    }

    /// Drain the recorded outcomes.
    pub fn take(&self) -> Vec<Outcome<T>> {
        std::mem::take(&mut *self.shared.outcomes())
    }

    /// Remove and return the only recorded outcome.
    ///
    /// # Panics
    ///
    /// Panics unless exactly one outcome is recorded.
    pub fn single(&self) -> Outcome<T> {
        let mut outcomes = self.take();
        assert_eq!(
            outcomes.len(),
            1,
            "expected exactly one delivery, got {}",
            outcomes.len()
        );
        outcomes.remove(0)
    }

    /// Wait until at least `expected` deliveries happened. Returns false if
    /// `timeout` elapsed first.
    pub async fn wait(&self, expected: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                // Register before checking so a concurrent delivery is not missed
                let notified = self.shared.notify.notified();
                if self.calls() >= expected {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Blocking variant of [`Probe::wait`] for tests without a runtime.
    pub fn wait_blocking(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outcomes = self.shared.outcomes();
        while self.calls() < expected {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            outcomes = match self.shared.condvar.wait_timeout(outcomes, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl<T> ProbeShared<T> {
    fn outcomes(&self) -> MutexGuard<'_, Vec<Outcome<T>>> {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A `tracing` layer counting warnings and errors.
#[derive(Debug, Clone, Default)]
pub struct WarningCounter {
    warnings: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

impl WarningCounter {
    /// Run `f` with a subscriber that counts events emitted on this thread.
    pub fn capture<R>(f: impl FnOnce() -> R) -> (R, WarningCounter) {
        let counter = WarningCounter::default();
        let subscriber = tracing_subscriber::registry().with(counter.clone());
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, counter)
    }

    pub fn warnings(&self) -> usize {
        self.warnings.load(Ordering::Acquire)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Acquire)
    }
}

impl<S: Subscriber> Layer<S> for WarningCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        match *event.metadata().level() {
            Level::WARN => {
                self.warnings.fetch_add(1, Ordering::AcqRel);
            }
            Level::ERROR => {
                self.errors.fetch_add(1, Ordering::AcqRel);
            }
            _ => {}
        }
    }
}

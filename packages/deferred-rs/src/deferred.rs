//! The public deferred handle and its three consumption modes.
//!
//! ```text
//!            ┌─ exec(cb) ───────────── callback mode
//! Deferred ──┼─ to_future() / then() ─ future mode (memoized)
//!            └─ now() ──────────────── immediate mode
//! ```
//!
//! Every mode funnels into the state machine's single entry point exactly
//! once. Use one mode per deferred; a second execution request is logged and
//! ignored.
//!
//! # Consumer Panics
//!
//! A panic in the consumer callback is never reported as a work failure:
//!
//! - While the work is still on the stack, it is smuggled out of the work's
//!   failure boundary and resumed unchanged from `exec()`.
//! - After execution returned, it propagates normally on whichever thread
//!   completed the work, unless an uncaught handler was given to
//!   [`Deferred::exec_with`].

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{mpsc, Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, MapOk, Shared, UnwrapOrElse};
use futures::{FutureExt, TryFutureExt};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::DeferredConfig;
use crate::error::{Error, Outcome, UsageError, WorkError, E_ABANDONED};
use crate::lifecycle::{apply_rules, Matcher, Rule};
use crate::machine::{escape, lock, Delivery, DeferredId, Done, Machine, Sink, Work};
use crate::normalize::{normalize, Failure};
use crate::omen::Omen;

type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;
type UncaughtHandler = Box<dyn FnOnce(Error) + Send>;

// =============================================================================
// Deferred
// =============================================================================

/// One unit of asynchronous work with a single-fire completion guarantee.
///
/// Cheap to clone; clones are the same deferred.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use deferred::Deferred;
///
/// let lookup = Deferred::new(|done| {
///     tokio::spawn(async move {
///         match fetch_user(42).await {
///             Ok(user) => done.ok(user),
///             Err(e) => done.err(e),
///         }
///     });
/// });
///
/// lookup
///     .timeout(Duration::from_secs(5))
///     .tolerate_on("E_NOT_FOUND", |_| User::guest())?;
///
/// let user = lookup.to_future().await?;
/// ```
pub struct Deferred<T> {
    machine: Arc<Machine<T>>,
    promise: Arc<Mutex<Option<Promise<T>>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            machine: Arc::clone(&self.machine),
            promise: Arc::clone(&self.promise),
        }
    }
}

impl<T: Send + 'static> Deferred<T> {
    /// Wrap infallible work. The work may still panic; that counts as a
    /// synchronous failure.
    #[track_caller]
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce(Done<T>) + Send + 'static,
    {
        Self::with_config(DeferredConfig::default(), work)
    }

    /// Wrap work that can fail before handing off. An `Err` return is a
    /// synchronous failure.
    #[track_caller]
    pub fn try_new<F, E>(work: F) -> Self
    where
        F: FnOnce(Done<T>) -> Result<(), E> + Send + 'static,
        E: Into<Failure>,
    {
        Self::from_work(
            Box::new(move |done: Done<T>| work(done).map_err(Into::<Failure>::into)),
            DeferredConfig::default(),
        )
    }

    /// Wrap infallible work with explicit configuration.
    #[track_caller]
    pub fn with_config<F>(config: DeferredConfig, work: F) -> Self
    where
        F: FnOnce(Done<T>) + Send + 'static,
    {
        Self::from_work(
            Box::new(move |done: Done<T>| -> Result<(), Failure> {
                work(done);
                Ok(())
            }),
            config,
        )
    }

    #[track_caller]
    fn from_work(work: Work<T>, config: DeferredConfig) -> Self {
        Self {
            machine: Arc::new(Machine::new(work, Omen::here(), config)),
            promise: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> DeferredId {
        self.machine.id()
    }

    /// Call site that created this deferred.
    pub fn omen(&self) -> &Omen {
        self.machine.omen()
    }

    pub fn has_begun(&self) -> bool {
        self.machine.has_begun()
    }

    pub fn has_finished(&self) -> bool {
        self.machine.has_finished()
    }

    pub fn has_timed_out(&self) -> bool {
        self.machine.has_timed_out()
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Race the work against a timer. Zero disables the timer.
    ///
    /// A non-zero timeout requires a tokio runtime when execution begins.
    pub fn timeout(&self, timeout: Duration) -> &Self {
        self.machine.set_timeout(timeout);
        self
    }

    /// Replace every error with the handler's result.
    pub fn intercept<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(Error) -> Error + Send + 'static,
    {
        self.machine
            .push_rule(Rule::intercept(Matcher::Any, Box::new(handler)));
        self
    }

    /// Replace errors with code `rule` with the handler's result.
    pub fn intercept_on<F>(&self, rule: &str, handler: F) -> Result<&Self, Error>
    where
        F: FnOnce(Error) -> Error + Send + 'static,
    {
        let matcher = Matcher::parse(rule)?;
        self.machine
            .push_rule(Rule::intercept(matcher, Box::new(handler)));
        Ok(self)
    }

    /// Turn every error into a successful result.
    pub fn tolerate<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(Error) -> T + Send + 'static,
    {
        self.machine
            .push_rule(Rule::tolerate(Matcher::Any, Box::new(handler)));
        self
    }

    /// Turn errors with code `rule` into a successful result.
    pub fn tolerate_on<F>(&self, rule: &str, handler: F) -> Result<&Self, Error>
    where
        F: FnOnce(Error) -> T + Send + 'static,
    {
        let matcher = Matcher::parse(rule)?;
        self.machine
            .push_rule(Rule::tolerate(matcher, Box::new(handler)));
        Ok(self)
    }

    /// Ignore errors with code `rule`, resolving to `T::default()` instead.
    pub fn tolerate_code(&self, rule: &str) -> Result<&Self, Error>
    where
        T: Default,
    {
        self.tolerate_on(rule, |_| T::default())
    }

    // -------------------------------------------------------------------------
    // Callback mode
    // -------------------------------------------------------------------------

    /// Execute, delivering the outcome to `callback` exactly once.
    ///
    /// Returns `Err` only for usage errors; the work's own failures go to the
    /// callback.
    pub fn exec<F>(&self, callback: F) -> Result<(), Error>
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.exec_inner(Box::new(callback), None)
    }

    /// Like [`exec`](Self::exec), but a panic in `callback` after execution
    /// returned is normalized and handed to `on_uncaught` instead of
    /// unwinding through the thread that completed the work.
    pub fn exec_with<F, U>(&self, callback: F, on_uncaught: U) -> Result<(), Error>
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
        U: FnOnce(Error) + Send + 'static,
    {
        self.exec_inner(Box::new(callback), Some(Box::new(on_uncaught)))
    }

    fn exec_inner(
        &self,
        callback: Callback<T>,
        on_uncaught: Option<UncaughtHandler>,
    ) -> Result<(), Error> {
        let origin = self.machine.id();
        let omen = self.machine.omen().clone();
        let config = self.machine.config().clone();

        self.machine.begin(move |rules: Vec<Rule<T>>| -> Sink<T> {
            Box::new(move |outcome, delivery| {
                let outcome = apply_rules(rules, outcome, &omen, &config);
                hand_off(
                    origin,
                    callback,
                    outcome,
                    delivery,
                    on_uncaught,
                    &omen,
                    &config,
                );
            })
        })
    }

    /// Execute and report the outcome through `tracing`.
    pub fn log(&self) -> Result<(), Error>
    where
        T: fmt::Debug,
    {
        let id = self.id();
        self.exec(move |outcome| match outcome {
            Ok(value) => info!(deferred = %id, ?value, "deferred finished successfully"),
            Err(err) => error!(deferred = %id, error = %err, "deferred failed"),
        })
    }

    // -------------------------------------------------------------------------
    // Immediate mode
    // -------------------------------------------------------------------------

    /// Execute and return the outcome directly.
    ///
    /// Only valid for work that completes before returning control. Otherwise
    /// fails with [`UsageError::NotSynchronous`] and the eventual real
    /// completion is discarded quietly.
    pub fn now(&self) -> Result<T, Error> {
        let (tx, rx) = mpsc::channel();
        self.exec(move |outcome| {
            // The receiver is gone if now() already gave up.
            let _ = tx.send(outcome);
        })?;

        match rx.try_recv() {
            Ok(outcome) => outcome,
            Err(_) => {
                self.machine.silence();
                Err(UsageError::NotSynchronous.into())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Future mode
    // -------------------------------------------------------------------------

    /// The memoized future for this deferred.
    ///
    /// The first call starts execution; every call returns the same future,
    /// so awaiting it repeatedly never re-runs the work. Work may call
    /// `to_future()` on its own deferred and receives that same future.
    ///
    /// A usage error is not memoized: the returned future resolves to it, and
    /// the next call tries to execute again.
    pub fn to_future(&self) -> Promise<T>
    where
        T: Clone,
    {
        let (tx, promise) = {
            let mut slot = lock(&self.promise, self.id());
            if let Some(promise) = slot.as_ref() {
                return promise.clone();
            }
            let (tx, rx) = oneshot::channel();
            let promise = Promise::pending(rx);
            *slot = Some(promise.clone());
            (tx, promise)
        };

        // The slot lock is released here, so the work itself can reach it.
        let started = self.exec(move |outcome| {
            let _ = tx.send(outcome);
        });
        match started {
            Ok(()) => promise,
            Err(err) => {
                let mut slot = lock(&self.promise, self.id());
                if slot.as_ref().is_some_and(|memo| memo.ptr_eq(&promise)) {
                    *slot = None;
                }
                Promise::settled(Err(err))
            }
        }
    }

    /// Map a successful outcome.
    pub fn then<U, F>(&self, on_fulfilled: F) -> MapOk<Promise<T>, F>
    where
        T: Clone,
        F: FnOnce(T) -> U,
    {
        self.to_future().map_ok(on_fulfilled)
    }

    /// Recover from a failed outcome.
    pub fn catch<F>(&self, on_rejected: F) -> UnwrapOrElse<Promise<T>, F>
    where
        T: Clone,
        F: FnOnce(Error) -> T,
    {
        self.to_future().unwrap_or_else(on_rejected)
    }
}

impl<T: Send + 'static> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.machine.id())
            .field("omen", self.machine.omen())
            .finish()
    }
}

/// Call the consumer, handling its panics according to where it is called.
fn hand_off<T>(
    origin: DeferredId,
    callback: Callback<T>,
    outcome: Outcome<T>,
    delivery: Delivery,
    on_uncaught: Option<UncaughtHandler>,
    omen: &Omen,
    config: &DeferredConfig,
) {
    match (delivery, on_uncaught) {
        (Delivery::InsideWork, _) => {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
                escape(origin, payload);
            }
        }
        (Delivery::Waited, Some(handler)) => {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
                let err = normalize(Failure::from_panic(payload), omen, config);
                warn!(deferred = %origin, error = %err, "consumer callback panicked; routing to uncaught handler");
                handler(err);
            }
        }
        _ => callback(outcome),
    }
}

// =============================================================================
// Promise
// =============================================================================

/// Shared future resolving to a deferred's outcome.
///
/// Clones observe the same execution; use [`Promise::ptr_eq`] to check
/// identity.
pub struct Promise<T> {
    inner: Shared<BoxFuture<'static, Outcome<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    fn pending(rx: oneshot::Receiver<Outcome<T>>) -> Self {
        let future = async move {
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(WorkError::new(
                    "deferred settled without reaching its future \
                     (already executed, or dropped before it finished)",
                )
                .with_code(E_ABANDONED)
                .into()),
            }
        };
        Self {
            inner: future.boxed().shared(),
        }
    }

    fn settled(outcome: Outcome<T>) -> Self {
        Self {
            inner: futures::future::ready(outcome).boxed().shared(),
        }
    }
}

impl<T: Clone> Promise<T> {
    /// Returns true if both promises share the same underlying future.
    pub fn ptr_eq(&self, other: &Promise<T>) -> bool {
        Shared::ptr_eq(&self.inner, &other.inner)
    }

    /// The outcome, if already resolved and polled.
    pub fn peek(&self) -> Option<&Outcome<T>> {
        self.inner.peek()
    }
}

impl<T: Clone> Future for Promise<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.poll_unpin(cx)
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

//! The completion state machine.
//!
//! A [`Machine`] owns one unit of work and guarantees that whatever the work
//! does, exactly one outcome reaches the consumer.
//!
//! # Competitors
//!
//! Three events can settle a machine:
//!
//! ```text
//!                ┌── work returns Err / panics ──┐
//!  begin() ──────┼── Done::ok / Done::err ───────┼──► deliver() ──► sink
//!                └── race timer fires ───────────┘
//! ```
//!
//! The first one observed under the state lock wins. Every later one is a
//! diagnosable no-op: it is logged, never delivered.
//!
//! # Failure Boundary
//!
//! The work runs inside `catch_unwind`. If the consumer's own callback panics
//! while the work is still on the stack, that panic must not be mistaken for
//! a work failure. The adapter re-raises it as an [`Escape`] tagged with this
//! machine's id; the boundary recognises its own escapes and resumes the
//! original panic untouched.
//!
//! Boundaries nest when work executes another deferred. Each thread keeps a
//! stack of the boundaries it is inside, so an escape crossing an inner
//! boundary on its way to an outer one passes through untouched.
//!
//! # Locking
//!
//! All mutable state lives behind one mutex. User code (work, rules, the
//! consumer callback) never runs while it is held.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::DeferredConfig;
use crate::error::{Error, Outcome, TimeoutError, UsageError};
use crate::lifecycle::Rule;
use crate::normalize::{normalize, Failure};
use crate::omen::Omen;

// =============================================================================
// Identity
// =============================================================================

/// Process-unique identity of one deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeferredId(u64);

impl DeferredId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeferredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deferred#{}", self.0)
    }
}

// =============================================================================
// Escape Marker
// =============================================================================

/// Panic payload carrying a consumer panic out of the work's failure boundary.
pub(crate) struct Escape {
    origin: DeferredId,
    payload: Box<dyn Any + Send>,
}

/// Re-raise a consumer panic as an escape owned by `origin`.
pub(crate) fn escape(origin: DeferredId, payload: Box<dyn Any + Send>) -> ! {
    resume_unwind(Box::new(Escape { origin, payload }))
}

// =============================================================================
// Delivery Context
// =============================================================================

/// Where the consumer is being called from, relative to `begin()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// On the exec thread, with the work still on the stack.
    InsideWork,
    /// On the exec thread before `begin()` returned, outside the work.
    Synchronous,
    /// After `begin()` returned, or from another thread.
    Waited,
}

pub(crate) type Work<T> = Box<dyn FnOnce(Done<T>) -> Result<(), Failure> + Send>;
pub(crate) type Sink<T> = Box<dyn FnOnce(Outcome<T>, Delivery) + Send>;

// =============================================================================
// Active Boundaries
// =============================================================================

thread_local! {
    static BOUNDARIES: RefCell<Vec<DeferredId>> = const { RefCell::new(Vec::new()) };
}

/// Marks `id`'s failure boundary as active on this thread until dropped.
struct BoundaryGuard(DeferredId);

impl BoundaryGuard {
    fn enter(id: DeferredId) -> Self {
        BOUNDARIES.with(|stack| stack.borrow_mut().push(id));
        Self(id)
    }
}

impl Drop for BoundaryGuard {
    fn drop(&mut self) {
        BOUNDARIES.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|id| *id == self.0) {
                stack.remove(pos);
            }
        });
    }
}

fn inside_boundary(id: DeferredId) -> bool {
    BOUNDARIES.with(|stack| stack.borrow().contains(&id))
}

// =============================================================================
// State
// =============================================================================

#[derive(Default)]
struct State {
    begun: bool,
    finished: bool,
    timed_out: bool,
    waited_a_tick: bool,
    /// Suppresses duplicate-completion warnings after a failed `now()`.
    quiet: bool,
    exec_thread: Option<ThreadId>,
    timer: Option<JoinHandle<()>>,
}

impl State {
    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub(crate) fn lock<'a, V>(mutex: &'a Mutex<V>, id: DeferredId) -> MutexGuard<'a, V> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(deferred = %id, "mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

// =============================================================================
// Machine
// =============================================================================

pub(crate) struct Machine<T> {
    id: DeferredId,
    omen: Omen,
    config: DeferredConfig,
    work: Mutex<Option<Work<T>>>,
    timeout: Mutex<Option<Duration>>,
    rules: Mutex<Vec<Rule<T>>>,
    sink: Mutex<Option<Sink<T>>>,
    state: Mutex<State>,
}

impl<T: Send + 'static> Machine<T> {
    pub(crate) fn new(work: Work<T>, omen: Omen, config: DeferredConfig) -> Self {
        Self {
            id: DeferredId::next(),
            omen,
            timeout: Mutex::new(config.default_timeout),
            config,
            work: Mutex::new(Some(work)),
            rules: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            state: Mutex::new(State::default()),
        }
    }

    pub(crate) fn id(&self) -> DeferredId {
        self.id
    }

    pub(crate) fn omen(&self) -> &Omen {
        &self.omen
    }

    pub(crate) fn config(&self) -> &DeferredConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state, self.id)
    }

    pub(crate) fn has_begun(&self) -> bool {
        self.state().begun
    }

    pub(crate) fn has_finished(&self) -> bool {
        self.state().finished
    }

    pub(crate) fn has_timed_out(&self) -> bool {
        self.state().timed_out
    }

    /// Set the race timeout. Zero disables it.
    pub(crate) fn set_timeout(&self, timeout: Duration) {
        if self.has_begun() {
            warn!(deferred = %self.id, "timeout changed after execution began; it will not apply");
        }
        *lock(&self.timeout, self.id) = (!timeout.is_zero()).then_some(timeout);
    }

    pub(crate) fn push_rule(&self, rule: Rule<T>) {
        if self.has_begun() {
            warn!(deferred = %self.id, "lifecycle rule registered after execution began");
        }
        lock(&self.rules, self.id).push(rule);
    }

    /// Silence duplicate-completion diagnostics for this machine.
    pub(crate) fn silence(&self) {
        self.state().quiet = true;
    }

    /// The single execution entry point.
    ///
    /// `build_sink` receives the registered rules once execution is committed,
    /// so rules are never consumed by a request that fails or loses the race.
    /// Returns `Err` only for usage errors detected before anything runs.
    /// A repeated call is logged and ignored.
    pub(crate) fn begin<B>(self: &Arc<Self>, build_sink: B) -> Result<(), Error>
    where
        B: FnOnce(Vec<Rule<T>>) -> Sink<T>,
    {
        let (timeout, runtime) = {
            let mut state = self.state();
            if state.begun {
                warn!(
                    deferred = %self.id,
                    omen = %self.omen,
                    "execution requested more than once; ignoring the repeat request"
                );
                return Ok(());
            }
            let timeout = *lock(&self.timeout, self.id);
            let runtime = match timeout {
                Some(timeout) => Some(
                    Handle::try_current().map_err(|_| UsageError::NoRuntime { timeout })?,
                ),
                None => None,
            };
            state.begun = true;
            state.exec_thread = Some(thread::current().id());
            (timeout, runtime)
        };

        let Some(work) = lock(&self.work, self.id).take() else {
            error!(deferred = %self.id, "work missing on first execution");
            return Ok(());
        };
        let rules = std::mem::take(&mut *lock(&self.rules, self.id));
        *lock(&self.sink, self.id) = Some(build_sink(rules));

        if let (Some(timeout), Some(runtime)) = (timeout, runtime) {
            debug!(deferred = %self.id, timeout_ms = timeout.as_millis() as u64, "arming race timer");
            let machine = Arc::clone(self);
            let timer = runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                machine.on_timeout(timeout);
            });
            let mut state = self.state();
            if state.finished || state.timed_out {
                timer.abort();
            } else {
                state.timer = Some(timer);
            }
        }

        debug!(deferred = %self.id, "executing work");
        let done = Done {
            machine: Arc::clone(self),
        };

        let thrown = {
            let _boundary = BoundaryGuard::enter(self.id);
            catch_unwind(AssertUnwindSafe(|| work(done)))
        };

        let failure = match thrown {
            Ok(Ok(())) => None,
            Ok(Err(failure)) => Some(failure),
            Err(payload) => match payload.downcast::<Escape>() {
                Ok(escaped) if escaped.origin == self.id => {
                    self.record_tick();
                    resume_unwind(escaped.payload);
                }
                Ok(escaped) if inside_boundary(escaped.origin) => {
                    debug!(
                        deferred = %self.id,
                        origin = %escaped.origin,
                        "consumer panic of an enclosing deferred crossing this boundary"
                    );
                    self.record_tick();
                    resume_unwind(escaped);
                }
                Ok(escaped) => Some(Failure::from_panic(escaped.payload)),
                Err(payload) => Some(Failure::from_panic(payload)),
            },
        };

        if let Some(failure) = failure {
            self.on_thrown(failure);
        }
        self.record_tick();
        Ok(())
    }

    fn record_tick(&self) {
        let mut state = self.state();
        state.waited_a_tick = !state.finished;
    }

    /// The work failed before returning control.
    fn on_thrown(&self, failure: Failure) {
        {
            let mut state = self.state();
            if state.finished {
                warn!(
                    deferred = %self.id,
                    omen = %self.omen,
                    ?failure,
                    "work failed after it already signalled completion; ignoring the failure"
                );
                return;
            }
            if state.timed_out {
                warn!(
                    deferred = %self.id,
                    omen = %self.omen,
                    ?failure,
                    "work failed after the race timer already fired; ignoring the failure"
                );
                state.finished = true;
                return;
            }
            state.finished = true;
            state.clear_timer();
        }
        let err = normalize(failure, &self.omen, &self.config);
        self.deliver(Err(err));
    }

    /// The work signalled completion through [`Done`].
    fn on_signal(&self, result: Result<T, Failure>) {
        {
            let mut state = self.state();
            if state.finished {
                if state.quiet {
                    debug!(deferred = %self.id, "late completion after now() gave up; discarding");
                } else {
                    warn!(
                        deferred = %self.id,
                        omen = %self.omen,
                        "completion signalled more than once; ignoring the repeat signal"
                    );
                }
                return;
            }
            if state.timed_out {
                state.finished = true;
                debug!(deferred = %self.id, "work finished after the race timer fired; discarding its outcome");
                return;
            }
            state.finished = true;
            state.clear_timer();
        }
        let outcome = result.map_err(|failure| normalize(failure, &self.omen, &self.config));
        self.deliver(outcome);
    }

    /// The race timer fired.
    fn on_timeout(&self, timeout: Duration) {
        {
            let mut state = self.state();
            if state.finished || state.timed_out {
                warn!(
                    deferred = %self.id,
                    finished = state.finished,
                    timed_out = state.timed_out,
                    "race timer fired after the deferred already settled; \
                     the work function may be misbehaving"
                );
                return;
            }
            state.timed_out = true;
            state.timer = None;
        }
        debug!(deferred = %self.id, timeout_ms = timeout.as_millis() as u64, "race timer won");
        let err = TimeoutError::new(timeout, self.omen.clone());
        self.deliver(Err(err.into()));
    }

    fn delivery(&self) -> Delivery {
        if inside_boundary(self.id) {
            return Delivery::InsideWork;
        }
        let state = self.state();
        if !state.waited_a_tick && state.exec_thread == Some(thread::current().id()) {
            Delivery::Synchronous
        } else {
            Delivery::Waited
        }
    }

    fn deliver(&self, outcome: Outcome<T>) {
        let Some(sink) = lock(&self.sink, self.id).take() else {
            error!(deferred = %self.id, "settled twice or without a consumer; dropping outcome");
            return;
        };
        let delivery = self.delivery();
        debug!(deferred = %self.id, ok = outcome.is_ok(), ?delivery, "delivering outcome");
        sink(outcome, delivery);
    }
}

// =============================================================================
// Completion Signal
// =============================================================================

/// Completion signal handed to the work function.
///
/// Consumed by [`Done::ok`], [`Done::err`] and [`Done::finish`]. Clones share
/// the same deferred; only the first signal across all clones is delivered.
/// Multi-value completion travels as a tuple in `T`.
pub struct Done<T> {
    machine: Arc<Machine<T>>,
}

impl<T> Clone for Done<T> {
    fn clone(&self) -> Self {
        Self {
            machine: Arc::clone(&self.machine),
        }
    }
}

impl<T: Send + 'static> Done<T> {
    /// Signal success.
    pub fn ok(self, value: T) {
        self.finish(Ok(value))
    }

    /// Signal failure.
    pub fn err(self, failure: impl Into<Failure>) {
        self.finish(Err(failure.into()))
    }

    /// Signal either outcome.
    pub fn finish(self, result: Result<T, Failure>) {
        self.machine.on_signal(result)
    }

    /// Identity of the deferred this signal belongs to.
    pub fn deferred_id(&self) -> DeferredId {
        self.machine.id
    }
}

impl<T> fmt::Debug for Done<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done")
            .field("deferred", &self.machine.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn machine<F>(work: F) -> Arc<Machine<i32>>
    where
        F: FnOnce(Done<i32>) -> Result<(), Failure> + Send + 'static,
    {
        Arc::new(Machine::new(
            Box::new(work),
            Omen::here(),
            DeferredConfig::default(),
        ))
    }

    fn recording_sink() -> (Sink<i32>, mpsc::Receiver<(Outcome<i32>, Delivery)>) {
        let (tx, rx) = mpsc::channel();
        let sink: Sink<i32> = Box::new(move |outcome, delivery| {
            let _ = tx.send((outcome, delivery));
        });
        (sink, rx)
    }

    #[test]
    fn test_ids_are_unique() {
        let a = DeferredId::next();
        let b = DeferredId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_synchronous_completion_is_inside_work() {
        let m = machine(|done| {
            done.ok(42);
            Ok(())
        });
        let (sink, rx) = recording_sink();
        m.begin(|_| sink).unwrap();

        let (outcome, delivery) = rx.try_recv().unwrap();
        assert_eq!(outcome.unwrap(), 42);
        assert_eq!(delivery, Delivery::InsideWork);
        assert!(m.has_finished());
    }

    #[test]
    fn test_duplicate_signal_delivers_once() {
        let m = machine(|done| {
            done.clone().ok(1);
            done.ok(2);
            Ok(())
        });
        let (sink, rx) = recording_sink();
        m.begin(|_| sink).unwrap();

        assert_eq!(rx.try_recv().unwrap().0.unwrap(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_returned_error_is_synchronous_throw() {
        let m = machine(|_done| Err(Failure::from("refused")));
        let (sink, rx) = recording_sink();
        m.begin(|_| sink).unwrap();

        let (outcome, delivery) = rx.try_recv().unwrap();
        assert_eq!(outcome.unwrap_err().to_string(), "refused");
        assert_eq!(delivery, Delivery::Synchronous);
    }

    #[test]
    fn test_throw_after_signal_is_ignored() {
        let m = machine(|done| {
            done.ok(5);
            Err(Failure::from("too late"))
        });
        let (sink, rx) = recording_sink();
        m.begin(|_| sink).unwrap();

        assert_eq!(rx.try_recv().unwrap().0.unwrap(), 5);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_second_begin_is_ignored() {
        let m = machine(|done| {
            done.ok(1);
            Ok(())
        });
        let (first, rx1) = recording_sink();
        let (second, rx2) = recording_sink();
        m.begin(|_| first).unwrap();
        m.begin(|_| second).unwrap();

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_own_escape_resumes_original_payload() {
        let m = machine(|done| {
            done.ok(1);
            Ok(())
        });
        let id = m.id();
        let sink: Sink<i32> = Box::new(move |_, _| escape(id, Box::new("consumer bug")));

        let caught = catch_unwind(AssertUnwindSafe(|| m.begin(|_| sink))).unwrap_err();
        assert_eq!(caught.downcast_ref::<&str>(), Some(&"consumer bug"));
    }

    #[test]
    fn test_foreign_escape_is_a_work_failure() {
        let foreign = DeferredId::next();
        let m = machine(move |_done| escape(foreign, Box::new("not ours")));
        let (sink, rx) = recording_sink();
        m.begin(|_| sink).unwrap();

        let (outcome, _) = rx.try_recv().unwrap();
        assert_eq!(outcome.unwrap_err().to_string(), "not ours");
    }

    #[test]
    fn test_timeout_without_runtime_is_usage_error() {
        let m = machine(|_done| Ok(()));
        m.set_timeout(Duration::from_millis(10));
        let (sink, _rx) = recording_sink();

        let err = m.begin(|_| sink).unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::NoRuntime { .. })));
        assert!(!m.has_begun());
    }

    #[test]
    fn test_repeat_begin_without_runtime_is_ignored() {
        let m = machine(|done| {
            done.ok(1);
            Ok(())
        });
        let (first, rx) = recording_sink();
        m.begin(|_| first).unwrap();

        m.set_timeout(Duration::from_millis(10));
        let (second, _rx) = recording_sink();
        assert!(m.begin(|_| second).is_ok());
        assert_eq!(rx.try_recv().unwrap().0.unwrap(), 1);
    }

    #[test]
    fn test_rules_survive_failed_begin() {
        use crate::lifecycle::Matcher;

        let m = machine(|_done| Err(Failure::from("nope")));
        m.push_rule(Rule::tolerate(Matcher::Any, Box::new(|_| 7)));
        m.set_timeout(Duration::from_millis(10));

        let mut handed = None;
        assert!(m.begin(|rules| {
            handed = Some(rules.len());
            recording_sink().0
        })
        .is_err());
        assert_eq!(handed, None);

        let rt = tokio::runtime::Runtime::new().unwrap();
        let _entered = rt.enter();
        let (sink, _rx) = recording_sink();
        m.begin(|rules| {
            handed = Some(rules.len());
            sink
        })
        .unwrap();
        assert_eq!(handed, Some(1));
    }

    #[test]
    fn test_boundary_stack_tracks_nesting() {
        let outer = DeferredId::next();
        let inner = DeferredId::next();
        assert!(!inside_boundary(outer));
        {
            let _outer = BoundaryGuard::enter(outer);
            {
                let _inner = BoundaryGuard::enter(inner);
                assert!(inside_boundary(outer));
                assert!(inside_boundary(inner));
            }
            assert!(inside_boundary(outer));
            assert!(!inside_boundary(inner));
        }
        assert!(!inside_boundary(outer));
    }

    #[tokio::test]
    async fn test_timer_wins_race() {
        let m = machine(|_done| Ok(()));
        m.set_timeout(Duration::from_millis(5));
        let (sink, rx) = recording_sink();
        m.begin(|_| sink).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (outcome, delivery) = rx.try_recv().unwrap();
        assert!(outcome.unwrap_err().is_timeout());
        assert_eq!(delivery, Delivery::Waited);
        assert!(m.has_timed_out());
        assert!(!m.has_finished());
    }
}

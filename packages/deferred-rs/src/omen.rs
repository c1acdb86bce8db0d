//! Trace anchors.
//!
//! Work usually finishes on a different stack than the one that created the
//! deferred, so a backtrace taken when the error is built points at the
//! runtime, not at the caller. An [`Omen`] is captured when the deferred is
//! constructed and attached to every error it reports, so the original call
//! site can still be recovered.
//!
//! The backtrace honours `RUST_BACKTRACE`/`RUST_LIB_BACKTRACE`; when capture is
//! disabled only the caller location is kept.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Call-site context captured when a deferred is created.
///
/// Read-only after construction and cheap to clone.
#[derive(Clone)]
pub struct Omen {
    inner: Arc<OmenInner>,
}

struct OmenInner {
    location: &'static Location<'static>,
    backtrace: Backtrace,
}

impl Omen {
    /// Capture the caller's location and backtrace.
    #[track_caller]
    pub fn here() -> Self {
        Self {
            inner: Arc::new(OmenInner {
                location: Location::caller(),
                backtrace: Backtrace::capture(),
            }),
        }
    }

    /// Source location that created the deferred.
    pub fn location(&self) -> &'static Location<'static> {
        self.inner.location
    }

    /// Backtrace captured at construction, if capture was enabled.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.inner.backtrace.status() {
            BacktraceStatus::Captured => Some(&self.inner.backtrace),
            _ => None,
        }
    }

    /// Returns true if both omens come from the same capture.
    pub fn ptr_eq(&self, other: &Omen) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for Omen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deferred created at {}", self.inner.location)
    }
}

impl fmt::Debug for Omen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Omen")
            .field("location", &format_args!("{}", self.inner.location))
            .field("backtrace", &self.inner.backtrace.status())
            .finish()
    }
}

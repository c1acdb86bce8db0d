//! Structured error types for deferred execution.
//!
//! Every failure a consumer can observe is an [`Error`]:
//!
//! - [`UsageError`] - the caller misused the API. Returned at the call site,
//!   never routed through the completion channel.
//! - [`TimeoutError`] - the race timer won. Delivered like any other failure.
//! - [`WorkError`] - anything reported or thrown by the work function, after
//!   normalization.
//!
//! Consistency problems (double completion, a timer firing after settlement)
//! are not errors. By the time they are detected the authoritative outcome has
//! already been delivered, so they are only logged.
//!
//! # Example
//!
//! ```ignore
//! use deferred::{Deferred, Error};
//!
//! match deferred.now() {
//!     Ok(value) => println!("got {value}"),
//!     Err(Error::Timeout(e)) => eprintln!("gave up after {:?}", e.duration()),
//!     Err(e) if e.code() == Some("E_NOT_FOUND") => eprintln!("missing"),
//!     Err(e) => eprintln!("failed: {e}"),
//! }
//! ```

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::omen::Omen;

/// Code carried by every [`TimeoutError`].
pub const E_TIMEOUT: &str = "E_TIMEOUT";

/// Code carried by [`UsageError::NotSynchronous`].
pub const E_NOT_SYNCHRONOUS: &str = "E_NOT_SYNCHRONOUS";

/// Code carried by [`UsageError::InvalidRule`].
pub const E_INVALID_RULE: &str = "E_INVALID_RULE";

/// Code carried by [`UsageError::NoRuntime`].
pub const E_NO_RUNTIME: &str = "E_NO_RUNTIME";

/// Code carried by the error a future reports when its deferred can no longer
/// reach it: already executed through another mode, or dropped unsettled.
pub const E_ABANDONED: &str = "E_ABANDONED";

/// The result a consumer eventually receives.
pub type Outcome<T> = Result<T, Error>;

// =============================================================================
// Error
// =============================================================================

/// Canonical error for everything a deferred can report.
///
/// Cheap to clone so a memoized future can hand the same failure to every
/// awaiting continuation.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The API was misused at the call site.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// The race timer fired before the work finished.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The work failed.
    #[error(transparent)]
    Work(#[from] WorkError),
}

impl Error {
    /// Machine-readable code used by lifecycle rules to match this error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Usage(e) => Some(e.code()),
            Error::Timeout(_) => Some(E_TIMEOUT),
            Error::Work(e) => e.code(),
        }
    }

    /// Trace anchor of the deferred that reported this error, if any.
    pub fn omen(&self) -> Option<&Omen> {
        match self {
            Error::Usage(_) => None,
            Error::Timeout(e) => e.omen.as_ref(),
            Error::Work(e) => e.omen.as_ref(),
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, Error::Usage(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub fn is_work(&self) -> bool {
        matches!(self, Error::Work(_))
    }

    /// Tag a work error with the given omen unless it already carries one.
    pub(crate) fn anchored(self, omen: &Omen) -> Self {
        match self {
            Error::Work(mut e) if e.omen.is_none() => {
                e.omen = Some(omen.clone());
                Error::Work(e)
            }
            other => other,
        }
    }
}

// =============================================================================
// Usage Error
// =============================================================================

/// The caller misused the API.
///
/// Always surfaced immediately, never swallowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    /// A lifecycle rule was registered with an empty matcher.
    #[error("invalid lifecycle rule {rule:?}: expected a non-empty error code")]
    InvalidRule {
        /// The rejected rule.
        rule: String,
    },

    /// `now()` was used on work that did not finish before returning.
    #[error(
        "could not use now(): the work did not finish before returning control \
         (it is not actually synchronous)"
    )]
    NotSynchronous,

    /// A timeout was configured outside of a tokio runtime.
    #[error("a timeout of {}ms requires a running tokio runtime", .timeout.as_millis())]
    NoRuntime {
        /// The configured timeout.
        timeout: Duration,
    },
}

impl UsageError {
    /// Machine-readable code for this usage error.
    pub fn code(&self) -> &'static str {
        match self {
            UsageError::InvalidRule { .. } => E_INVALID_RULE,
            UsageError::NotSynchronous => E_NOT_SYNCHRONOUS,
            UsageError::NoRuntime { .. } => E_NO_RUNTIME,
        }
    }
}

// =============================================================================
// Timeout Error
// =============================================================================

/// The race timer won.
#[derive(Debug, Clone, Error)]
#[error("took too long to finish executing (timeout of {}ms exceeded)", .duration.as_millis())]
pub struct TimeoutError {
    pub(crate) duration: Duration,
    pub(crate) omen: Option<Omen>,
}

impl TimeoutError {
    pub(crate) fn new(duration: Duration, omen: Omen) -> Self {
        Self {
            duration,
            omen: Some(omen),
        }
    }

    /// The configured timeout that elapsed.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

// =============================================================================
// Work Error
// =============================================================================

/// A failure reported or thrown by the work function.
///
/// Carries an optional code for rule matching, an optional underlying cause,
/// and the trace anchor of the deferred that observed it.
#[derive(Debug, Clone)]
pub struct WorkError {
    message: String,
    code: Option<String>,
    source: Option<Arc<dyn StdError + Send + Sync>>,
    omen: Option<Omen>,
}

impl WorkError {
    /// Create a work error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            source: None,
            omen: None,
        }
    }

    /// Attach a code that lifecycle rules can match on.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach the underlying cause.
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub(crate) fn from_boxed(source: Box<dyn StdError + Send + Sync>) -> Self {
        Self {
            message: source.to_string(),
            code: None,
            source: Some(Arc::from(source)),
            omen: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn omen(&self) -> Option<&Omen> {
        self.omen.as_ref()
    }
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl StdError for WorkError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn test_timeout_display_cites_duration() {
        let err = TimeoutError {
            duration: Duration::from_millis(5),
            omen: None,
        };
        assert!(err.to_string().contains("5ms"));
        assert!(err.to_string().contains("took too long"));
    }

    #[test]
    fn test_error_codes() {
        let timeout: Error = TimeoutError {
            duration: Duration::from_millis(1),
            omen: None,
        }
        .into();
        assert_eq!(timeout.code(), Some(E_TIMEOUT));

        let usage: Error = UsageError::NotSynchronous.into();
        assert_eq!(usage.code(), Some(E_NOT_SYNCHRONOUS));

        let work: Error = WorkError::new("nope").with_code("E_BAR").into();
        assert_eq!(work.code(), Some("E_BAR"));

        let uncoded: Error = WorkError::new("nope").into();
        assert_eq!(uncoded.code(), None);
    }

    #[test]
    fn test_work_error_display_includes_code() {
        let err = WorkError::new("no such user").with_code("E_NOT_FOUND");
        assert_eq!(err.to_string(), "no such user (E_NOT_FOUND)");
    }

    #[test]
    fn test_work_error_keeps_source() {
        let err = WorkError::new("write failed").with_source(DiskError);
        let source = err.source().expect("source should be kept");
        assert_eq!(source.to_string(), "disk on fire");
    }

    #[test]
    fn test_error_is_pattern_matchable() {
        let err: Error = UsageError::InvalidRule {
            rule: String::new(),
        }
        .into();

        match &err {
            Error::Usage(UsageError::InvalidRule { rule }) => assert!(rule.is_empty()),
            _ => panic!("Expected InvalidRule"),
        }
        assert!(err.is_usage());
        assert!(!err.is_work());
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = Error::from(WorkError::new("boom")).into();
        let deferred_err = err.downcast_ref::<Error>();
        assert!(matches!(deferred_err, Some(Error::Work(_))));
    }

    #[test]
    fn test_anchored_only_tags_untagged_work_errors() {
        let omen = Omen::here();
        let tagged = Error::from(WorkError::new("x")).anchored(&omen);
        assert!(tagged.omen().is_some());

        let usage = Error::from(UsageError::NotSynchronous).anchored(&omen);
        assert!(usage.omen().is_none());
    }

    #[test]
    fn test_no_runtime_display() {
        let err = UsageError::NoRuntime {
            timeout: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("250ms"));
        assert_eq!(err.code(), E_NO_RUNTIME);
    }
}

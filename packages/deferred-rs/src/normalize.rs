//! Error normalization.
//!
//! Work can fail with almost anything: a canonical [`Error`], a foreign
//! `std::error::Error`, a wrapper around some deeper cause, a bare message, a
//! panic payload, or an arbitrary value. [`Failure`] is the closed set of
//! those shapes and [`normalize`] turns each one into an [`Error`].
//!
//! | Failure              | Result                                        |
//! |----------------------|-----------------------------------------------|
//! | `Error(e)`           | `e`, unchanged                                |
//! | `Caused { cause }`   | work error built from `cause`, wrapper dropped |
//! | `Foreign(e)`         | work error with `e` as its source             |
//! | `Message(s)`         | work error whose message is `s`               |
//! | `Other(v)`           | work error with a bounded rendering of `v`    |
//!
//! Every error built here is tagged with the owning deferred's [`Omen`].

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;

use crate::config::DeferredConfig;
use crate::error::{Error, WorkError};
use crate::omen::Omen;

/// A raw failure value, before normalization.
pub enum Failure {
    /// Already canonical; passes through unchanged.
    Error(Error),
    /// A wrapper whose only interesting content is its cause.
    Caused {
        /// Description of the wrapper, kept for diagnostics only.
        context: String,
        /// The error that actually happened.
        cause: Box<dyn StdError + Send + Sync>,
    },
    /// Any other proper error type.
    Foreign(Box<dyn StdError + Send + Sync>),
    /// A bare message.
    Message(String),
    /// Anything else. Rendered with bounded depth and length.
    Other(Box<dyn fmt::Debug + Send>),
}

impl Failure {
    pub fn foreign(err: impl StdError + Send + Sync + 'static) -> Self {
        Failure::Foreign(Box::new(err))
    }

    pub fn caused(
        context: impl Into<String>,
        cause: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Failure::Caused {
            context: context.into(),
            cause: Box::new(cause),
        }
    }

    pub fn other(value: impl fmt::Debug + Send + 'static) -> Self {
        Failure::Other(Box::new(value))
    }

    /// Classify a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<Failure>() {
            Ok(failure) => return *failure,
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<Error>() {
            Ok(err) => return Failure::Error(*err),
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<WorkError>() {
            Ok(err) => return Failure::Error(Error::Work(*err)),
            Err(payload) => payload,
        };
        if let Some(s) = payload.downcast_ref::<&str>() {
            return Failure::Message((*s).to_string());
        }
        match payload.downcast::<String>() {
            Ok(s) => Failure::Message(*s),
            Err(_) => Failure::Message("unknown panic".to_string()),
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Failure::Caused { context, cause } => f
                .debug_struct("Caused")
                .field("context", context)
                .field("cause", cause)
                .finish(),
            Failure::Foreign(e) => f.debug_tuple("Foreign").field(e).finish(),
            Failure::Message(s) => f.debug_tuple("Message").field(s).finish(),
            Failure::Other(v) => f.debug_tuple("Other").field(v).finish(),
        }
    }
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        Failure::Error(err)
    }
}

impl From<WorkError> for Failure {
    fn from(err: WorkError) -> Self {
        Failure::Error(Error::Work(err))
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Failure::Message(message)
    }
}

impl From<&str> for Failure {
    fn from(message: &str) -> Self {
        Failure::Message(message.to_string())
    }
}

impl From<Box<dyn StdError + Send + Sync>> for Failure {
    fn from(err: Box<dyn StdError + Send + Sync>) -> Self {
        Failure::Foreign(err)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(err) => Failure::Error(err),
            Err(err) => Failure::Foreign(err.into()),
        }
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Failure::foreign(err)
    }
}

/// Turn any failure into a canonical error tagged with `omen`.
pub fn normalize(failure: Failure, omen: &Omen, config: &DeferredConfig) -> Error {
    match failure {
        Failure::Error(err) => err,
        Failure::Caused { cause, .. } | Failure::Foreign(cause) => match cause.downcast::<Error>() {
            Ok(err) => *err,
            Err(cause) => Error::Work(WorkError::from_boxed(cause)).anchored(omen),
        },
        Failure::Message(message) => Error::Work(WorkError::new(message)).anchored(omen),
        Failure::Other(value) => {
            let rendered =
                render_bounded(&*value, config.max_render_depth, config.max_render_len);
            Error::Work(WorkError::new(rendered)).anchored(omen)
        }
    }
}

/// Render `value` with `{:?}`, eliding anything nested deeper than
/// `max_depth` and truncating after `max_len` bytes.
///
/// Formatting stops as soon as the length limit is hit, so an oversized or
/// runaway `Debug` impl never gets to finish.
pub fn render_bounded(value: &dyn fmt::Debug, max_depth: usize, max_len: usize) -> String {
    let mut writer = BoundedWriter {
        out: String::new(),
        depth: 0,
        max_depth,
        max_len,
        quote: None,
        escaped: false,
        truncated: false,
    };
    // An Err here only means the writer hit its length limit.
    let _ = fmt::write(&mut writer, format_args!("{:?}", value));
    if writer.truncated {
        writer.out.push('…');
    }
    writer.out
}

struct BoundedWriter {
    out: String,
    depth: usize,
    max_depth: usize,
    max_len: usize,
    /// Open string or char literal, if any. Brackets inside don't nest.
    quote: Option<char>,
    escaped: bool,
    truncated: bool,
}

impl BoundedWriter {
    fn push(&mut self, c: char) {
        if let Some(quote) = self.quote {
            if self.depth <= self.max_depth {
                self.out.push(c);
            }
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == quote {
                self.quote = None;
            }
            return;
        }

        match c {
            '"' | '\'' => {
                self.quote = Some(c);
                if self.depth <= self.max_depth {
                    self.out.push(c);
                }
            }
            '{' | '[' | '(' => {
                self.depth += 1;
                if self.depth <= self.max_depth + 1 {
                    self.out.push(c);
                }
                if self.depth == self.max_depth + 1 {
                    self.out.push('…');
                }
            }
            '}' | ']' | ')' => {
                if self.depth <= self.max_depth + 1 {
                    self.out.push(c);
                }
                self.depth = self.depth.saturating_sub(1);
            }
            _ => {
                if self.depth <= self.max_depth {
                    self.out.push(c);
                }
            }
        }
    }
}

impl fmt::Write for BoundedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.out.len() >= self.max_len {
                self.truncated = true;
                return Err(fmt::Error);
            }
            self.push(c);
        }
        Ok(())
    }
}

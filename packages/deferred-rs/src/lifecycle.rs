//! After-execution lifecycle rules.
//!
//! Rules run once the work has settled and before the consumer sees the
//! outcome. They only transform the outcome handed to them; they never touch
//! the deferred's own state.
//!
//! | Kind        | Runs when                    | Effect                        |
//! |-------------|------------------------------|-------------------------------|
//! | `intercept` | an error matches the rule    | error replaced by handler's   |
//! | `tolerate`  | an error matches the rule    | error cleared, handler's value becomes the result |
//!
//! A rule without a matcher matches every error. Successful outcomes pass
//! through every rule untouched. Rules apply in registration order, so a
//! tolerated error is invisible to the rules after it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::debug;

use crate::config::DeferredConfig;
use crate::error::{Error, Outcome, UsageError};
use crate::normalize::{normalize, Failure};
use crate::omen::Omen;

/// Which errors a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Matcher {
    Any,
    Code(String),
}

impl Matcher {
    /// Parse a rule identifier. Only non-empty error codes are supported.
    pub(crate) fn parse(rule: &str) -> Result<Self, UsageError> {
        if rule.trim().is_empty() {
            return Err(UsageError::InvalidRule {
                rule: rule.to_string(),
            });
        }
        Ok(Matcher::Code(rule.to_string()))
    }

    fn matches(&self, err: &Error) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::Code(code) => err.code() == Some(code.as_str()),
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Any => f.write_str("*"),
            Matcher::Code(code) => f.write_str(code),
        }
    }
}

pub(crate) type InterceptFn = Box<dyn FnOnce(Error) -> Error + Send>;
pub(crate) type TolerateFn<T> = Box<dyn FnOnce(Error) -> T + Send>;

pub(crate) enum Handler<T> {
    Intercept(InterceptFn),
    Tolerate(TolerateFn<T>),
}

/// A registered after-execution rule.
pub(crate) struct Rule<T> {
    matcher: Matcher,
    handler: Handler<T>,
}

impl<T> Rule<T> {
    pub(crate) fn intercept(matcher: Matcher, handler: InterceptFn) -> Self {
        Self {
            matcher,
            handler: Handler::Intercept(handler),
        }
    }

    pub(crate) fn tolerate(matcher: Matcher, handler: TolerateFn<T>) -> Self {
        Self {
            matcher,
            handler: Handler::Tolerate(handler),
        }
    }

    fn kind(&self) -> &'static str {
        match self.handler {
            Handler::Intercept(_) => "intercept",
            Handler::Tolerate(_) => "tolerate",
        }
    }

    /// Apply this rule to an outcome. A panicking handler replaces the
    /// current error with the normalized panic payload.
    fn apply(self, outcome: Outcome<T>, omen: &Omen, config: &DeferredConfig) -> Outcome<T> {
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !self.matcher.matches(&err) {
            return Err(err);
        }

        debug!(rule = %self.matcher, kind = self.kind(), error = %err, "lifecycle rule matched");

        match self.handler {
            Handler::Intercept(handler) => match catch_unwind(AssertUnwindSafe(|| handler(err))) {
                Ok(replacement) => Err(replacement.anchored(omen)),
                Err(payload) => Err(normalize(Failure::from_panic(payload), omen, config)),
            },
            Handler::Tolerate(handler) => match catch_unwind(AssertUnwindSafe(|| handler(err))) {
                Ok(value) => Ok(value),
                Err(payload) => Err(normalize(Failure::from_panic(payload), omen, config)),
            },
        }
    }
}

/// Run every rule, in order, over the outcome.
pub(crate) fn apply_rules<T>(
    rules: Vec<Rule<T>>,
    outcome: Outcome<T>,
    omen: &Omen,
    config: &DeferredConfig,
) -> Outcome<T> {
    rules
        .into_iter()
        .fold(outcome, |outcome, rule| rule.apply(outcome, omen, config))
}

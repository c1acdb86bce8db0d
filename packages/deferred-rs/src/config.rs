//! Deferred configuration.
//!
//! Defaults work for most callers. Services that want to tune them globally
//! can load them from the environment:
//!
//! | Variable                | Meaning                                     |
//! |-------------------------|---------------------------------------------|
//! | `DEFERRED_TIMEOUT_MS`   | Default race timeout, `0` disables it       |
//! | `DEFERRED_RENDER_DEPTH` | Nesting depth kept when rendering failures  |
//! | `DEFERRED_RENDER_LEN`   | Maximum length of a rendered failure        |

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Default nesting depth kept when rendering an arbitrary failure value.
pub const DEFAULT_RENDER_DEPTH: usize = 5;

/// Default maximum length of a rendered failure message.
pub const DEFAULT_RENDER_LEN: usize = 2048;

/// Tunables shared by every deferred built from the same config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredConfig {
    /// Timeout armed when the deferred does not set its own. `None` disables it.
    pub default_timeout: Option<Duration>,
    /// Nesting depth kept when a non-error failure is rendered to a message.
    pub max_render_depth: usize,
    /// Maximum length of a rendered failure message.
    pub max_render_len: usize,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            max_render_depth: DEFAULT_RENDER_DEPTH,
            max_render_len: DEFAULT_RENDER_LEN,
        }
    }
}

impl DeferredConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timeout by default. A zero duration disables it.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_max_render_depth(mut self, depth: usize) -> Self {
        self.max_render_depth = depth;
        self
    }

    pub fn with_max_render_len(mut self, len: usize) -> Self {
        self.max_render_len = len;
        self
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Missing keys keep their defaults; present but malformed keys are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = lookup("DEFERRED_TIMEOUT_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .context("DEFERRED_TIMEOUT_MS must be a whole number of milliseconds")?;
            config = config.with_default_timeout(Duration::from_millis(ms));
        }

        if let Some(depth) = lookup("DEFERRED_RENDER_DEPTH") {
            config.max_render_depth = depth
                .trim()
                .parse()
                .context("DEFERRED_RENDER_DEPTH must be a valid number")?;
        }

        if let Some(len) = lookup("DEFERRED_RENDER_LEN") {
            config.max_render_len = len
                .trim()
                .parse()
                .context("DEFERRED_RENDER_LEN must be a valid number")?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = DeferredConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, DeferredConfig::default());
        assert_eq!(config.default_timeout, None);
    }

    #[test]
    fn test_reads_all_keys() {
        let config = DeferredConfig::from_lookup(lookup(&[
            ("DEFERRED_TIMEOUT_MS", "1500"),
            ("DEFERRED_RENDER_DEPTH", "3"),
            ("DEFERRED_RENDER_LEN", " 64 "),
        ]))
        .unwrap();

        assert_eq!(config.default_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.max_render_depth, 3);
        assert_eq!(config.max_render_len, 64);
    }

    #[test]
    fn test_zero_timeout_disables_timer() {
        let config =
            DeferredConfig::from_lookup(lookup(&[("DEFERRED_TIMEOUT_MS", "0")])).unwrap();
        assert_eq!(config.default_timeout, None);
    }

    #[test]
    fn test_malformed_value_is_an_error() {
        let err = DeferredConfig::from_lookup(lookup(&[("DEFERRED_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("DEFERRED_TIMEOUT_MS"));
    }
}

//! # Deferred
//!
//! A single-fire deferred computation: one unit of asynchronous work whose
//! outcome reaches its consumer exactly once, however the work misbehaves.
//!
//! ## Core Concepts
//!
//! - [`Deferred`] wraps a work function that receives a [`Done`] signal.
//! - The work settles by calling [`Done::ok`] / [`Done::err`], by returning
//!   an error or panicking before it returns, or by losing a race against its
//!   timeout.
//! - Lifecycle rules ([`Deferred::intercept`], [`Deferred::tolerate`]) reshape
//!   errors before the consumer sees them.
//! - The outcome is consumed once: by callback ([`Deferred::exec`]), as a
//!   shared future ([`Deferred::to_future`]), or immediately
//!   ([`Deferred::now`]).
//!
//! ## Architecture
//!
//! ```text
//! Deferred::new(work)
//!     │
//!     ▼ exec() / to_future() / now()
//! Machine.begin() ───────────────────────────────┐
//!     │                                          │
//!     ├─► work(done) inside catch_unwind         │
//!     │       │                                  │
//!     │       ├─► done.ok / done.err ──┐         │
//!     │       └─► Err / panic ─────────┤         │
//!     │                                ├─► first wins
//!     └─► race timer (tokio) ──────────┘         │
//!                                                ▼
//!                                  normalize ─► rules ─► consumer
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Single fire** - The consumer is invoked at most once per deferred
//! 2. **Single execution** - The work runs at most once, however many times
//!    execution is requested
//! 3. **Canonical errors** - Every failure reaching a consumer is an [`Error`]
//! 4. **Consumer panics are not work failures** - They propagate, unchanged
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use deferred::{Deferred, WorkError};
//!
//! let greeting = Deferred::new(|done| {
//!     tokio::spawn(async move {
//!         match load_name().await {
//!             Some(name) => done.ok(format!("hello, {name}")),
//!             None => done.err(WorkError::new("nobody home").with_code("E_EMPTY")),
//!         }
//!     });
//! });
//!
//! greeting
//!     .timeout(Duration::from_millis(500))
//!     .tolerate_on("E_EMPTY", |_| "hello, stranger".to_string())?;
//!
//! println!("{}", greeting.to_future().await?);
//! ```

mod config;
mod deferred;
mod error;
mod lifecycle;
mod machine;
mod normalize;
mod omen;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export the handle and its futures
pub use crate::deferred::{Deferred, Promise};

// Re-export completion signal types
pub use crate::machine::{DeferredId, Done};

// Re-export error types
pub use crate::error::{
    Error, Outcome, TimeoutError, UsageError, WorkError, E_ABANDONED, E_INVALID_RULE,
    E_NOT_SYNCHRONOUS, E_NO_RUNTIME, E_TIMEOUT,
};

// Re-export normalization
pub use crate::normalize::{normalize, render_bounded, Failure};

// Re-export configuration
pub use crate::config::{DeferredConfig, DEFAULT_RENDER_DEPTH, DEFAULT_RENDER_LEN};

pub use crate::omen::Omen;

//! paywatch-core: single-fire payment event correlation
//!
//! Observes a third-party checkout page from the outside and reports two
//! events exactly once each: "payment instrument created" and "payment
//! confirmed". Neither event has a stable signal, so several weak ones are
//! watched at the same time and merged.
//!
//! # Architecture
//!
//! ```text
//! network calls ─┐
//! DOM mutations ─┼─► Correlation Gate ─► Ready Invoker ─► "created"
//! messages ──────┘          │
//!                           └─► Confirmation Poller ─► Hand-off ─► "confirmed" + redirect
//! ```
//!
//! # Modules
//!
//! - `config`: Configuration (defaults, TOML parsing, validation)
//! - `error`: Error types
//! - `logging`: `tracing` subscriber setup
//! - `host`: Capability traits the embedding host implements
//! - `signal`: Signals, customer data, amount normalization
//! - `sources`: Network, DOM and message signal sources
//! - `gate`: Single-fire correlation gate
//! - `retry`: Retry policies and runners
//! - `invoker`: Delivery to late-bound notifiers
//! - `poller`: Payment confirmation polling
//! - `handoff`: Purchase notification and funnel redirect
//! - `attribution`: Campaign tag capture and persistence
//! - `http`: reqwest-backed outbound client
//! - `engine`: Wiring and activation
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod attribution;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod handoff;
pub mod host;
pub mod http;
pub mod invoker;
pub mod logging;
pub mod poller;
pub mod retry;
pub mod signal;
pub mod sources;

pub use config::Config;
pub use engine::{Engine, EngineHandles};
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

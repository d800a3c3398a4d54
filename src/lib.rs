//! A PostHog client for Rust: analytics event ingestion and feature flags
//! with deterministic local evaluation.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] built from a [`Config`]. Events
//! captured through the client are validated, normalized, queued in
//! memory, and delivered in batches by a background worker thread. Host
//! code paths never block on network I/O: a full queue drops new messages
//! and reports through the `on_error` callback instead.
//!
//! When a personal API key is configured, flag and cohort definitions are
//! cached by a background poller and flags are evaluated locally and
//! deterministically, so the same subject always receives the same
//! decision. Queries that cannot be decided locally fall back to the
//! decide endpoint.
//!
//! # Error handling
//!
//! The public API never raises. Ingestion methods return `false` on
//! failure, flag queries return `None`, and details are reported through
//! the configured `on_error` callback. See [`Error`] for the taxonomy.
//!
//! # Logging
//!
//! The crate logs through the [`log`](https://docs.rs/log) facade under
//! the `posthog` target.
//!
//! # Examples
//!
//! ```no_run
//! # use posthog_rust::{Client, Config};
//! let client = Client::new(
//!     Config::from_api_key("phc_project_key").personal_api_key("phx_personal_key"),
//! )
//! .unwrap();
//!
//! client.capture("user-1", "signup", Default::default());
//!
//! if client.flag_enabled("new-onboarding", "user-1", &Default::default()) == Some(true) {
//!     // ...
//! }
//!
//! client.shutdown();
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

mod backoff;
mod batch;
mod client;
mod config;
mod error;
mod exception;
mod message;
mod normalizer;
mod transport;
mod worker;

pub mod flags;

#[cfg(test)]
pub(crate) mod testutil;

pub use client::{CaptureOptions, Client};
pub use config::{BeforeSend, Config, OnError};
pub use error::{Error, Result};
pub use flags::{FlagOptions, FlagResult, FlagValue};
pub use message::{Message, MessageKind, Properties};

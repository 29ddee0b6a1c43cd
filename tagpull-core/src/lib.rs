//! tagpull-core: a fixed-rate industrial telemetry poller.
//!
//! Reads tagged values from PLCs and SNMP devices on a fixed cycle,
//! decodes raw payloads into typed scalars, runs per-point numeric
//! transforms, deduplicates against the previous cycle and pushes changed
//! values to a line-oriented sink. The CLI entry point lives in the
//! `tagpull-cli` crate.

pub mod config;
pub mod datapoint;
pub mod decode;
pub mod engine;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod proto;
pub mod transform;
pub mod types;

pub use error::{Error, Result};

//! Hearth - a supervisor for a locally hosted AI stack
//!
//! Hearth wires pre-built container images into one stack and owns only the
//! parts around them:
//!
//! - Layered configuration from defaults, a project `.env` and the environment
//! - A declarative service manifest with dependencies and health checks
//! - Dependency-ordered, health-gated startup and reverse-order teardown
//! - Persistent named volumes with backup and restore
//! - An outbound tunnel publishing services under public hostnames

pub mod config;
pub mod error;
pub mod manifest;
pub mod runtime;
pub mod sequencer;
pub mod storage;
pub mod supervisor;
pub mod tunnel;

pub use error::{HearthError, Result};

//! Core types and error definitions for the Conduit MCP connection core.
//!
//! This crate provides the foundational pieces shared by the transport and
//! handler crates: the error taxonomy and the tracing bootstrap.
//!
//! # Main types
//!
//! - [`ConduitError`] — Unified error enum; raw platform errors are translated
//!   into it at the transport boundary.
//! - [`ErrorKind`] — Coarse classification driving retry policy.
//! - [`ConduitResult`] — Convenience alias for `Result<T, ConduitError>`.
//! - [`AttemptRecord`] — One retry attempt, carried by exhausted errors.

/// Error taxonomy.
pub mod error;
/// Logging bootstrap.
pub mod telemetry;

pub use error::{AttemptRecord, ConduitError, ConduitResult, ErrorKind};

//! # cfgsync-events
//!
//! The release data model and the upstream envelope that carries it.
//!
//! ## Design Principles
//!
//! - A decoded release is immutable and already validated
//! - Transport secrets never leave memory: anything persisted or exposed goes
//!   through `ReleaseDescriptor::without_secrets`
//! - Envelopes are versioned; unknown types and versions are rejected at decode

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;

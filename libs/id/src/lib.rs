//! # cfgsync-id
//!
//! Typed identifiers for the cfgsync agent.
//!
//! ## Design Principles
//!
//! - IDs are issued upstream as non-zero integers; zero means "unset"
//! - Each ID type is distinct so an `AppId` can never be passed as a `ReleaseId`
//! - The bare number is the canonical form (it names release directories on disk)
//! - A labelled form (`app_42`, `rel_7`) is accepted for logs and config files

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

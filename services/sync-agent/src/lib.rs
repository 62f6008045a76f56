//! cfgsync Agent Library
//!
//! The sync agent runs next to managed applications and keeps their
//! configuration files in step with centrally published releases. It
//! receives release-change events, fetches the referenced content,
//! verifies it, places it in a per-release directory, and tells the
//! application to reload.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler
//! └── AppRegistry
//!     └── AppRuntime(app_id)      (control loop, one active job)
//!         ├── JobQueue            (bounded, supersedes pending jobs)
//!         └── ReleaseApplier      (lock → readiness → fetch → metadata → reload)
//!             ├── ReleaseWorkspace
//!             ├── ReadinessChecker
//!             ├── FetcherTable    (HTTP repository, object store)
//!             └── ReloadNotifier
//! ```
//!
//! ## Modules
//!
//! - `fetch`: storage backends with direct and range-parallel transfer
//! - `workspace`: on-disk release layout, advisory locks, permissions
//! - `runtime`: per-application control loop and retry
//! - `scheduler`: upstream event entry point

pub mod config;
pub mod fetch;
pub mod job;
pub mod pipeline;
pub mod queue;
pub mod readiness;
pub mod registry;
pub mod reload;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod workspace;

// Re-export commonly used types
pub use config::Config;
pub use fetch::{ContentFetcher, FetchError, FetcherTable};
pub use job::{Job, JobContext, JobKind};
pub use registry::{AppRegistry, RegistryError};
pub use retry::RetryPolicy;
pub use runtime::{CurrentRelease, StatsSnapshot};
pub use scheduler::Scheduler;

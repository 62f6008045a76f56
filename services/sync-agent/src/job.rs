//! Release-change jobs.
//!
//! Producers build a loosely-filled `JobContext`; the queue validates it into
//! a `Job` whose fields are all present.

use std::fmt;
use std::sync::Arc;

use cfgsync_events::{EventError, ReleaseDescriptor};
use cfgsync_id::{AppId, Cursor, JobId, ReleaseId};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job is missing its {0}")]
    Missing(&'static str),

    #[error("invalid release: {0}")]
    InvalidRelease(#[from] EventError),

    #[error("queue capacity {0} is below the minimum of 2")]
    Capacity(usize),
}

/// What a job asks the runtime to do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKind {
    ReleaseChange,
    /// A kind this agent does not know how to run.
    Other(String),
}

impl JobKind {
    pub fn is_supported(&self) -> bool {
        matches!(self, JobKind::ReleaseChange)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::ReleaseChange => write!(f, "release_change"),
            JobKind::Other(kind) => write!(f, "{kind}"),
        }
    }
}

/// A job as submitted, before validation.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    /// Upstream event identifier, for correlation.
    pub event_id: String,
    pub cursor: Cursor,
    pub kind: Option<JobKind>,
    pub cancel: Option<CancellationToken>,
    pub release: Option<Arc<ReleaseDescriptor>>,
    /// Falls back to the queue's default when absent.
    pub retry: Option<RetryPolicy>,
}

impl JobContext {
    /// A fully populated release-change job with a fresh token.
    pub fn release_change(
        id: JobId,
        event_id: impl Into<String>,
        cursor: Cursor,
        release: Arc<ReleaseDescriptor>,
    ) -> Self {
        Self {
            id,
            event_id: event_id.into(),
            cursor,
            kind: Some(JobKind::ReleaseChange),
            cancel: Some(CancellationToken::new()),
            release: Some(release),
            retry: None,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// A validated job.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    event_id: String,
    cursor: Cursor,
    kind: JobKind,
    cancel: CancellationToken,
    release: Arc<ReleaseDescriptor>,
    retry: RetryPolicy,
}

impl Job {
    /// Validate a context, filling in `default_retry` when none was given.
    pub fn from_context(context: JobContext, default_retry: &RetryPolicy) -> Result<Self, JobError> {
        let kind = context.kind.ok_or(JobError::Missing("kind"))?;
        let cancel = context.cancel.ok_or(JobError::Missing("cancellation token"))?;
        let release = context.release.ok_or(JobError::Missing("release descriptor"))?;
        if kind.is_supported() {
            release.validate()?;
        }

        Ok(Self {
            id: context.id,
            event_id: context.event_id,
            cursor: context.cursor,
            kind,
            cancel,
            release,
            retry: context.retry.unwrap_or_else(|| default_retry.clone()),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn release(&self) -> &Arc<ReleaseDescriptor> {
        &self.release
    }

    pub fn app_id(&self) -> AppId {
        self.release.app_id
    }

    pub fn release_id(&self) -> ReleaseId {
        self.release.release_id
    }

    /// A fresh copy of this job's retry budget.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}

//! Error types shared across the nettune core.

use thiserror::Error;

/// Failures from the host adapters (sysctl, qdisc, systemd, host facts).
///
/// External-tool failures keep the tool's stderr so callers can surface the
/// original command output in an API error's `details` field.
#[derive(Debug, Error)]
pub enum HostError {
    /// An I/O operation against the pseudo-filesystem or a managed file
    /// failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Human-readable description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The external tool could not be spawned at all.
    #[error("failed to execute {command}: {source}")]
    Spawn {
        /// The command line that failed to start.
        command: String,
        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The external tool ran and exited non-zero.
    #[error("{command} failed: {stderr}")]
    CommandFailed {
        /// The command line that ran.
        command: String,
        /// The tool's stderr, trimmed.
        stderr: String,
    },

    /// No default-route interface could be resolved.
    #[error("no default route interface found")]
    NoDefaultRoute,

    /// No qdisc is attached to the named interface.
    #[error("no qdisc found for interface {interface}")]
    QdiscNotFound {
        /// The interface that had no qdisc.
        interface: String,
    },

    /// A multi-entry operation partially failed. Individual failures are
    /// joined in `summary`; successful entries were still applied.
    #[error("{failed} of {attempted} entries failed: {summary}")]
    Partial {
        /// Total entries attempted.
        attempted: usize,
        /// Entries that failed.
        failed: usize,
        /// Joined per-entry failure messages.
        summary: String,
    },
}

impl HostError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// The underlying tool output for API `details`, when there is one.
    #[must_use]
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { stderr, .. } => Some(stderr.as_str()),
            Self::Partial { summary, .. } => Some(summary.as_str()),
            _ => None,
        }
    }
}

/// The core error taxonomy: not-found, validation, concurrency, host
/// operation, and internal failures.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The requested profile does not exist.
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// The requested snapshot does not exist.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Another apply or rollback holds the single-writer lock.
    #[error("another apply or rollback operation is in progress")]
    ApplyInProgress,

    /// A request or on-disk document failed schema validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A host adapter operation failed.
    #[error(transparent)]
    Host(#[from] HostError),

    /// A state-store I/O operation failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Human-readable description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization of a state document failed.
    #[error("JSON error during {context}: {source}")]
    Json {
        /// Human-readable description of the operation that failed.
        context: String,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

impl CoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    /// Stable machine-readable error code, as exposed over the API.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProfileNotFound(_) => "PROFILE_NOT_FOUND",
            Self::SnapshotNotFound(_) => "SNAPSHOT_NOT_FOUND",
            Self::ApplyInProgress => "APPLY_IN_PROGRESS",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::Host(_) => "SYSTEM_UNAVAILABLE",
            Self::Io { .. } | Self::Json { .. } => "INTERNAL_ERROR",
        }
    }

    /// The underlying tool output for API `details`, when there is one.
    #[must_use]
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Host(err) => err.details(),
            _ => None,
        }
    }
}

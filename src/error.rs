use thiserror::Error;

use crate::workload::WorkloadError;

/// Errors that end a reconcile pass early.
///
/// None of these escape [`Charm::reconcile`](crate::Charm): each one is
/// classified into a [`Status`](crate::Status) instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The `log-level` option holds a value outside the accepted set
    #[error("invalid log-level '{0}', expected one of info, debug, warning, error, critical")]
    InvalidLogLevel(String),

    /// The `log-level` option is absent from the configuration
    #[error("log-level option is not set")]
    MissingLogLevel,

    /// One or more required integrations have no relation data yet
    #[error("missing integrations: {}", .0.join(", "))]
    MissingRelations(Vec<String>),

    /// The managed workload rejected or failed an operation
    #[error(transparent)]
    Workload(#[from] WorkloadError),

    /// The process-wide tracing subscriber could not be installed
    #[error("logging setup error: {0}")]
    Logging(String),
}

impl Error {
    /// Whether operator action is needed before a retry can succeed.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::InvalidLogLevel(_) | Self::MissingLogLevel | Self::MissingRelations(_)
        )
    }

    /// Whether the error clears on its own once the workload comes up.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Workload(WorkloadError::Unreachable(_)))
    }
}

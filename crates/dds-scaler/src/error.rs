use dds_meta::StoreError;

use crate::mutator::RetryError;

/// How a failure is treated by the cycle loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad policy or labels. Only a config change fixes it.
    Configuration,
    /// Reading cluster state failed.
    Transport,
    /// Write conflicts outlasted the retry budget.
    Conflict,
    /// A write failed for a reason other than a conflict.
    Mutation,
}

#[derive(Debug, thiserror::Error)]
pub enum ScalerError {
    #[error("unknown device name: {0}")]
    UnknownDeviceName(String),

    #[error("invalid integer in {value}: {source}")]
    InvalidInteger {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("failed to parse {field}: {source}")]
    MalformedPolicy {
        field: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("duplicate catalog index {0} in device-info")]
    DuplicateCatalogIndex(i32),

    #[error("policy config map {namespace}/{name} not found")]
    PolicyNotFound { namespace: String, name: String },

    #[error("failed to {action}: {source}")]
    Transport {
        action: String,
        #[source]
        source: StoreError,
    },

    #[error("max retries ({attempts}) reached, last error: {last}")]
    RetriesExhausted { attempts: u32, last: StoreError },

    #[error("failed to {action}: {source}")]
    Mutation {
        action: String,
        #[source]
        source: StoreError,
    },
}

impl ScalerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScalerError::UnknownDeviceName(_)
            | ScalerError::InvalidInteger { .. }
            | ScalerError::MalformedPolicy { .. }
            | ScalerError::DuplicateCatalogIndex(_)
            | ScalerError::PolicyNotFound { .. } => ErrorKind::Configuration,
            ScalerError::Transport { .. } => ErrorKind::Transport,
            ScalerError::RetriesExhausted { .. } => ErrorKind::Conflict,
            ScalerError::Mutation { .. } => ErrorKind::Mutation,
        }
    }

    pub(crate) fn transport(action: impl Into<String>) -> impl FnOnce(StoreError) -> Self {
        let action = action.into();
        move |source| ScalerError::Transport { action, source }
    }

    pub(crate) fn from_retry(action: impl Into<String>, err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::Fatal(source) => ScalerError::Mutation {
                action: action.into(),
                source,
            },
            RetryError::Exhausted { attempts, last } => {
                ScalerError::RetriesExhausted { attempts, last }
            }
        }
    }
}

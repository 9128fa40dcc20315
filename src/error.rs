use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmError {
    #[error("instance \"{name}\" failed to start: {reason}")]
    StartFailure { name: String, reason: String },

    #[error("The feature is not implemented on this backend")]
    NotImplementedOnThisBackend,

    #[error("invalid memory size: '{0}'")]
    InvalidMemorySize(String),

    #[error("invalid setting '{key}={value}': {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },

    #[error("cannot {op} instance '{instance}': {reason}")]
    InstanceSettings {
        op: String,
        instance: String,
        reason: String,
    },

    #[error("timed out waiting for {operation}")]
    Timeout { operation: String },

    #[error("invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("QMP error: {0}")]
    Qmp(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VmError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VmError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, VmError>;

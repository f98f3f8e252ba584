//! Error types for the e2e harness
//!
//! Failures fall into four groups: setup of cluster objects, bounded waits
//! that ran out of time, verification mismatches and external tool failures.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("command `{command}` failed: stderr={stderr}, stdout={stdout}")]
    CommandFailed {
        command: String,
        stdout: String,
        stderr: String,
    },

    #[error("exceeded waiting for {what} after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("failed to set up {resource}: {message}")]
    Setup { resource: String, message: String },

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("object store provider error: {0}")]
    Provider(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("scenario cancelled")]
    Cancelled,
}

impl Error {
    pub fn setup(resource: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Setup {
            resource: resource.into(),
            message: message.to_string(),
        }
    }

    /// Wraps this error as a setup failure of `resource`, keeping the cause text.
    pub fn context(self, resource: impl Into<String>) -> Self {
        Error::setup(resource, self)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// True when the API rejected a request because the object does not exist.
pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

//! Error handling module for arkdeploy
//!
//! Every failure that can stop a deployment step is expressed as a
//! `DeployError`. Soft misses (an unknown mountpoint, a mapper node that does
//! not exist yet) are NOT errors: resolvers return empty values for those and
//! leave the decision to the caller.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for arkdeploy
#[derive(Error, Debug)]
pub enum DeployError {
    /// Filesystem errors, always tagged with the path that was touched
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The external program could not be started at all
    #[error("Failed to spawn `{command}`: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The external program ran and exited unsuccessfully
    #[error("Command `{command}` failed with exit status {code}")]
    CommandFailed { command: String, code: i32 },

    /// A monitored long-running command exited unsuccessfully
    #[error("Command `{command}` failed with code {code}. Last output: {last_line}")]
    MonitoredCommandFailed {
        command: String,
        code: i32,
        last_line: String,
    },

    /// A device required by the remount sequence could not be resolved
    #[error("Required device not found for mountpoint {0}")]
    MissingDevice(String),

    /// A UUID that generated configuration depends on resolved to nothing
    #[error("Could not determine {kind} UUID for mountpoint {mount_point}")]
    MissingUuid {
        kind: &'static str,
        mount_point: String,
    },

    /// The deployments directory holds no deployment
    #[error("No deployment found in {}", .0.display())]
    NoDeployment(PathBuf),

    /// One operation of the remount sequence failed
    #[error("{operation} failed: {source}")]
    Mount {
        operation: String,
        #[source]
        source: Box<DeployError>,
    },

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Template set errors (unknown or unsupported placeholders)
    #[error("Template error: {0}")]
    Template(String),
}

/// Result type alias for arkdeploy operations
pub type Result<T> = std::result::Result<T, DeployError>;

impl DeployError {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a template error
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Tag a failure with the remount operation it interrupted
    pub fn mount(operation: impl Into<String>, source: DeployError) -> Self {
        Self::Mount {
            operation: operation.into(),
            source: Box::new(source),
        }
    }
}

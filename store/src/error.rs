//! Stable, typed error taxonomy. `thiserror` rather than bare `anyhow`
//! here because, unlike most internal failures in this runtime, these
//! variants are meant to be matched on by an embedding engine (and by
//! the CLI, to decide exit codes and messages) -- see containers-containrs'
//! own services crate for the same `thiserror`-at-the-boundary shape.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("id '{0}' is already in use")]
    IdInUse(String),

    #[error("id '{0}' doesn't match the required format [\\w+\\-.]{{1,1024}}")]
    InvalidIdFormat(String),

    #[error("container '{0}' does not exist")]
    ContainerNotExists(String),

    #[error("container is paused")]
    ContainerPaused,

    #[error("cannot {action}: container is not stopped (status: {status})")]
    ContainerNotStopped { action: String, status: String },

    #[error("cannot {action}: container is not running (status: {status})")]
    ContainerNotRunning { action: String, status: String },

    #[error("container is not paused")]
    ContainerNotPaused,

    #[error("no process operations available for this container")]
    NoProcessOps,

    #[error("invalid configuration: {context}: {source}")]
    ConfigInvalid {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("console already exists")]
    ConsoleExists,

    #[error("unsupported signal")]
    UnsupportedSignal,

    #[error("{context}: {source}")]
    SystemError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    /// Best-effort stable string for programmatic matching by an
    /// embedding engine (the `Display` impl above is for humans and
    /// may grow detail over time; this is the part that shouldn't).
    pub fn code(&self) -> &'static str {
        match self {
            Self::IdInUse(_) => "ID_IN_USE",
            Self::InvalidIdFormat(_) => "INVALID_ID_FORMAT",
            Self::ContainerNotExists(_) => "CONTAINER_NOT_EXISTS",
            Self::ContainerPaused => "CONTAINER_PAUSED",
            Self::ContainerNotStopped { .. } => "CONTAINER_NOT_STOPPED",
            Self::ContainerNotRunning { .. } => "CONTAINER_NOT_RUNNING",
            Self::ContainerNotPaused => "CONTAINER_NOT_PAUSED",
            Self::NoProcessOps => "NO_PROCESS_OPS",
            Self::ConfigInvalid { .. } => "CONFIG_INVALID",
            Self::ConsoleExists => "CONSOLE_EXISTS",
            Self::UnsupportedSignal => "UNSUPPORTED_SIGNAL",
            Self::SystemError { .. } => "SYSTEM_ERROR",
        }
    }
}

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("file {} not found", .0.display())]
    MissingFile(PathBuf),

    #[error("invalid CPU count: {0:?}")]
    InvalidCpuCount(String),

    #[error("failed to launch {binary}: {status}: {stderr}")]
    Launch {
        binary: String,
        status: String,
        stderr: String,
    },

    #[error("QMP error: {0}")]
    Qmp(#[from] QmpError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum QmpError {
    #[error("cannot execute {command}: qmp_capabilities has not been negotiated")]
    CapabilitiesNotNegotiated { command: String },

    #[error("{command} failed: {class}: {desc}")]
    Command {
        command: String,
        class: String,
        desc: String,
    },

    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("QMP connection closed")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

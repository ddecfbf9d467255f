use std::path::PathBuf;
use thiserror::Error;

/// The prober failed or produced output we could not read
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run prober for {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("prober exited with code {code} for {path}: {stderr}")]
    Exit {
        path: PathBuf,
        code: i32,
        stderr: String,
    },
    #[error("unparseable prober output for {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The encoder could not be run to completion
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("encoder exited with code {code:?}\n{tail}")]
    Exit { code: Option<i32>, tail: String },
    #[error("failed to {action} encoder process: {reason}")]
    Signal { action: &'static str, reason: String },
    #[error("encoder process already exited before it could be {0}")]
    AlreadyExited(&'static str),
    #[error("pausing is not supported on this platform")]
    Unsupported,
    #[error("no encode is in progress")]
    NotRunning,
    #[error("failed to wait for encoder: {0}")]
    Wait(#[source] std::io::Error),
}

/// Moving or inspecting the finished output failed
#[derive(Debug, Error)]
pub enum DispositionError {
    #[error("failed to stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove scratch output {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why `start` was refused
#[derive(Debug, Error)]
pub enum StartError {
    #[error("a run is already in progress")]
    AlreadyRunning,
    #[error("root directory does not exist: {0}")]
    MissingRoot(PathBuf),
    #[error("{0} is not installed or not runnable")]
    ToolMissing(String),
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
    #[error("failed to prepare scratch directory {path}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pipeline controller has shut down")]
    Closed,
}

/// Terminal outcome of processing one file
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Disposition(#[from] DispositionError),
    #[error("aborted by user")]
    Aborted,
}

use std::path::PathBuf;
use std::time::Duration;

use crate::disposition::Disposition;

/// Coarse pipeline state shown to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Idle,
    Running,
    Paused,
    Done,
    Error,
}

/// Why a file was not encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyCompressed { quality: u32, preset: String },
    UnreadableTag,
}

/// Totals for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub encoded: usize,
    pub improved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl RunSummary {
    pub fn saved_bytes(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Notifications for whoever drives the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Status(PipelineStatus),
    Progress {
        file: PathBuf,
        frame: u64,
        percent: f64,
        file_elapsed: Duration,
        total_elapsed: Duration,
        remaining: Option<Duration>,
    },
    Sizes {
        file: PathBuf,
        before: u64,
        /// Final size once known
        after: Option<u64>,
        /// Running estimate while encoding
        estimated: Option<u64>,
    },
    FileSkipped { file: PathBuf, reason: SkipReason },
    FileFinished { file: PathBuf, disposition: Disposition },
    FileFailed { file: PathBuf, error: String },
    Summary(RunSummary),
}

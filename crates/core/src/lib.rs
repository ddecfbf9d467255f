pub mod config;
pub mod disposition;
pub mod encode;
pub mod error;
pub mod events;
pub mod job;
pub mod ledger;
pub mod outcome_log;
pub mod pipeline;
pub mod preset;
pub mod probe;
pub mod progress;
pub mod queue;
pub mod resources;
pub mod supervisor;
pub mod tools;

pub use config::{CompressionConfig, PerformanceTier, VideoCodec};
pub use disposition::{Disposition, DispositionPolicy};
pub use error::{DispositionError, EncodeError, ProbeError, RunError, StartError};
pub use events::{PipelineEvent, PipelineStatus, RunSummary, SkipReason};
pub use ledger::{should_compress, CompressionTag, Verdict};
pub use pipeline::{ConfigSource, Pipeline, PipelineHandle};
pub use probe::MediaMetadata;
pub use queue::{QueueItem, TraversalQueue};
pub use supervisor::{JobOutcome, JobSupervisor, SupervisorEvent};

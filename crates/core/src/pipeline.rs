use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::CompressionConfig;
use crate::disposition::{preserve_scratch, Disposition, DispositionPolicy, NotImprovedTagger};
use crate::encode::{build_encode_command, EncodeRequest};
use crate::error::{EncodeError, RunError, StartError};
use crate::events::{PipelineEvent, PipelineStatus, RunSummary, SkipReason};
use crate::job::{JobDescriptor, JobState, Stopwatch};
use crate::ledger::{self, Verdict};
use crate::outcome_log::OutcomeLog;
use crate::probe::{self, MediaMetadata};
use crate::queue::{QueueItem, TraversalQueue};
use crate::resources::ResourcePlan;
use crate::supervisor::{JobOutcome, JobSupervisor, SupervisorEvent};
use crate::tools::{self, EncoderSettings};

/// Where each run gets its configuration from
#[derive(Debug, Clone)]
pub enum ConfigSource {
    Fixed(CompressionConfig),
    /// Re-read at every start; a missing file means defaults
    File(Option<PathBuf>),
}

impl ConfigSource {
    fn load(&self) -> Result<CompressionConfig, StartError> {
        match self {
            ConfigSource::Fixed(config) => {
                config.validate().map_err(StartError::Config)?;
                Ok(config.clone())
            }
            ConfigSource::File(path) => {
                CompressionConfig::load_config(path.as_deref()).map_err(StartError::Config)
            }
        }
    }
}

#[derive(Debug)]
enum Command {
    Start {
        root: PathBuf,
        reply: oneshot::Sender<Result<(), StartError>>,
    },
    Pause,
    Resume,
    Abort,
}

/// Cloneable control surface for a running [`Pipeline`]
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl PipelineHandle {
    /// Begin a run over `root`. Rejected while another run is in progress.
    pub async fn start(&self, root: impl Into<PathBuf>) -> Result<(), StartError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Start { root: root.into(), reply })
            .map_err(|_| StartError::Closed)?;
        rx.await.map_err(|_| StartError::Closed)?
    }

    pub fn pause(&self) {
        let _ = self.tx.send(Command::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(Command::Resume);
    }

    pub fn abort(&self) {
        let _ = self.tx.send(Command::Abort);
    }
}

/// Everything that lives for exactly one run
struct Run {
    config: CompressionConfig,
    settings: EncoderSettings,
    plan: ResourcePlan,
    queue: TraversalQueue,
    policy: DispositionPolicy,
    log: OutcomeLog,
    total: Stopwatch,
    summary: RunSummary,
    /// Paused with no encode in flight; hold before the next file
    held: bool,
    abort_requested: bool,
}

enum FileResult {
    Continue,
    Halt,
    Aborted,
}

enum RunEnd {
    Done,
    Error,
    Aborted,
}

enum Step {
    Command(Option<Command>),
    Event(Option<SupervisorEvent>),
    Tick,
}

/// The batch compression controller.
///
/// Walks the queue, probes, consults the ledger, supervises one encode at a
/// time and finalizes each result. Runs as a single task owning all run
/// state; driven through a [`PipelineHandle`], reporting [`PipelineEvent`]s.
pub struct Pipeline {
    source: ConfigSource,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    status: PipelineStatus,
}

impl Pipeline {
    pub fn new(source: ConfigSource, events: mpsc::UnboundedSender<PipelineEvent>) -> (Self, PipelineHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let pipeline = Self {
            source,
            commands,
            events,
            status: PipelineStatus::Idle,
        };
        (pipeline, PipelineHandle { tx })
    }

    /// Create and run a controller on its own task
    pub fn spawn(
        source: ConfigSource,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> (PipelineHandle, JoinHandle<()>) {
        let (pipeline, handle) = Self::new(source, events);
        (handle, tokio::spawn(pipeline.run()))
    }

    /// Serve commands until every handle is dropped
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Start { root, reply } => match self.prepare(&root).await {
                    Ok(run) => {
                        let _ = reply.send(Ok(()));
                        self.execute(run).await;
                    }
                    Err(e) => {
                        warn!("Refusing to start on {}: {}", root.display(), e);
                        let _ = reply.send(Err(e));
                    }
                },
                Command::Pause => warn!("No run in progress; ignoring pause"),
                Command::Resume => warn!("No run in progress; ignoring resume"),
                Command::Abort => debug!("No run in progress; nothing to abort"),
            }
        }
        debug!("Pipeline controller shutting down");
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&mut self, status: PipelineStatus) {
        if self.status != status {
            self.status = status;
            self.emit(PipelineEvent::Status(status));
        }
    }

    async fn prepare(&self, root: &Path) -> Result<Run, StartError> {
        let config = self.source.load()?;
        for warning in config.warnings() {
            warn!("⚠️  {}", warning);
        }

        if !root.is_dir() {
            return Err(StartError::MissingRoot(root.to_path_buf()));
        }

        let settings = tools::prepare(&config).await?;

        std::fs::create_dir_all(&config.scratch_dir).map_err(|source| StartError::Scratch {
            path: config.scratch_dir.clone(),
            source,
        })?;
        release_scratch(&config.scratch_output());

        let plan = ResourcePlan::detect(config.performance_mode);
        info!(
            "Starting run on {} ({:?} tier, {} thread(s), overwrite: {})",
            root.display(),
            config.performance_mode,
            plan.threads,
            config.overwrite
        );

        let tag = settings.compression_tag(&config);
        let policy = DispositionPolicy {
            overwrite: config.overwrite,
            tagger: Some(NotImprovedTagger {
                ffmpeg_bin: config.ffmpeg_bin.clone(),
                comment: tag.not_improved(),
                scratch: config.scratch_dir.join(format!("patch.{}", config.extension())),
            }),
        };

        Ok(Run {
            queue: TraversalQueue::new(root, &config.extension()).exclude(&config.scratch_dir),
            log: OutcomeLog::new(&config.log_dir),
            settings,
            plan,
            policy,
            total: Stopwatch::started(),
            summary: RunSummary::default(),
            held: false,
            abort_requested: false,
            config,
        })
    }

    async fn execute(&mut self, mut run: Run) {
        self.set_status(PipelineStatus::Running);

        let end = loop {
            while let Ok(command) = self.commands.try_recv() {
                self.control_between_files(command, &mut run);
            }
            if !self.hold_while_paused(&mut run).await || run.abort_requested {
                break RunEnd::Aborted;
            }

            match run.queue.next_item() {
                QueueItem::FileReady(path) => match self.process_file(&mut run, path).await {
                    FileResult::Continue => {}
                    FileResult::Halt => break RunEnd::Error,
                    FileResult::Aborted => break RunEnd::Aborted,
                },
                QueueItem::DirectoryExpanded(dir) => debug!("Expanded {}", dir.display()),
                QueueItem::Empty => break RunEnd::Done,
            }
        };

        run.total.stop();
        let summary = run.summary.clone();
        info!(
            "Run finished: {} encoded ({} smaller), {} skipped, {} failed, {} -> {} bytes in {:?}",
            summary.encoded,
            summary.improved,
            summary.skipped,
            summary.failed,
            summary.bytes_before,
            summary.bytes_after,
            run.total.elapsed()
        );
        self.emit(PipelineEvent::Summary(summary));

        match end {
            RunEnd::Done => {
                info!("✅ All files processed");
                self.set_status(PipelineStatus::Done);
            }
            RunEnd::Error => self.set_status(PipelineStatus::Error),
            RunEnd::Aborted => {
                info!("🛑 Run aborted");
                run.queue.clear();
                release_scratch(&run.config.scratch_output());
                self.set_status(PipelineStatus::Idle);
            }
        }
    }

    /// Handle a command that arrived while no encoder is running
    fn control_between_files(&mut self, command: Command, run: &mut Run) {
        match command {
            Command::Start { reply, .. } => {
                let _ = reply.send(Err(StartError::AlreadyRunning));
            }
            Command::Pause => {
                if !run.held {
                    run.held = true;
                    run.total.stop();
                    self.set_status(PipelineStatus::Paused);
                }
            }
            Command::Resume => {
                if run.held {
                    run.held = false;
                    run.total.start();
                    self.set_status(PipelineStatus::Running);
                }
            }
            Command::Abort => run.abort_requested = true,
        }
    }

    /// Block while held; false if the run should end
    async fn hold_while_paused(&mut self, run: &mut Run) -> bool {
        while run.held && !run.abort_requested {
            match self.commands.recv().await {
                Some(command) => self.control_between_files(command, run),
                None => return false,
            }
        }
        true
    }

    async fn probe_cancellable(&mut self, run: &mut Run, path: &Path) -> Result<MediaMetadata, RunError> {
        let ffprobe = run.config.ffprobe_bin.clone();
        let probe = probe::probe(&ffprobe, path);
        tokio::pin!(probe);

        loop {
            let command = tokio::select! {
                result = &mut probe => return result.map_err(RunError::from),
                command = self.commands.recv() => command,
            };
            match command {
                Some(command) => self.control_between_files(command, run),
                None => run.abort_requested = true,
            }
            if run.abort_requested {
                return Err(RunError::Aborted);
            }
        }
    }

    async fn process_file(&mut self, run: &mut Run, path: PathBuf) -> FileResult {
        info!("Processing {}", path.display());

        let meta = match self.probe_cancellable(run, &path).await {
            Ok(meta) => meta,
            Err(RunError::Aborted) => {
                debug!("Probe of {} cancelled", path.display());
                return FileResult::Aborted;
            }
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                self.record_failure(run, &path, &e);
                return FileResult::Continue;
            }
        };

        match ledger::assess(&meta.tags, run.config.quality, run.settings.preset_rank) {
            Verdict::Adequate { quality, preset } => {
                info!("{} already compressed (crf {}, {}), skipping", path.display(), quality, preset);
                run.summary.skipped += 1;
                self.emit(PipelineEvent::FileSkipped {
                    file: path,
                    reason: SkipReason::AlreadyCompressed { quality, preset },
                });
                return FileResult::Continue;
            }
            Verdict::Unreadable => {
                info!("{} carries an unreadable compression tag, skipping", path.display());
                run.summary.skipped += 1;
                self.emit(PipelineEvent::FileSkipped {
                    file: path,
                    reason: SkipReason::UnreadableTag,
                });
                return FileResult::Continue;
            }
            Verdict::Weaker { quality, preset } => {
                info!(
                    "{} was compressed with weaker settings (crf {}, {}), trying again",
                    path.display(),
                    quality,
                    preset
                );
            }
            Verdict::Untagged => {}
        }

        if !self.hold_while_paused(run).await || run.abort_requested {
            return FileResult::Aborted;
        }

        let scratch = run.config.scratch_output();
        release_scratch(&scratch);

        let mut job = JobDescriptor::new(path, scratch, meta.frame_count, meta.size_bytes);
        if job.frame_count.is_none() {
            warn!("Job {}: frame count unknown, progress will not be shown", job.id);
        }
        self.emit(PipelineEvent::Sizes {
            file: job.source.clone(),
            before: job.source_bytes,
            after: None,
            estimated: None,
        });

        let command = build_encode_command(
            &run.config,
            &run.settings,
            EncodeRequest {
                input: &job.source,
                output: &job.scratch_output,
                source_tags: &meta.tags,
                threads: run.plan.threads,
            },
        );

        job.state = JobState::Launching;
        let outcome = match JobSupervisor::launch(&command, job.frame_count, &run.plan) {
            Ok(mut supervisor) => {
                job.state = supervisor.state();
                match supervisor.pid() {
                    Some(pid) => info!("Job {}: encoding {} (pid {})", job.id, job.source.display(), pid),
                    None => info!("Job {}: encoding {}", job.id, job.source.display()),
                }
                job.stopwatch.start();
                let outcome = self.supervise(run, &mut job, &mut supervisor).await;
                job.stopwatch.stop();
                outcome
            }
            Err(e) => {
                job.state = JobState::Failed;
                JobOutcome::Failed(e)
            }
        };

        match outcome {
            JobOutcome::Completed => {
                info!(
                    "Job {}: encode started {} finished in {:?}",
                    job.id,
                    job.started_at.format("%H:%M:%S"),
                    job.elapsed()
                );
                self.finalize(run, &job).await
            }
            JobOutcome::Failed(e) => {
                error!("Job {}: ❌ {}", job.id, e);
                release_scratch(&job.scratch_output);
                self.record_failure(run, &job.source, &RunError::Encode(e));
                FileResult::Halt
            }
            JobOutcome::Aborted => {
                release_scratch(&job.scratch_output);
                FileResult::Aborted
            }
        }
    }

    async fn supervise(&mut self, run: &mut Run, job: &mut JobDescriptor, supervisor: &mut JobSupervisor) -> JobOutcome {
        let mut tick = tokio::time::interval(Duration::from_millis(run.config.progress_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                event = supervisor.next_event() => Step::Event(event),
                _ = tick.tick() => Step::Tick,
            };

            match step {
                Step::Command(None) | Step::Command(Some(Command::Abort)) => {
                    run.abort_requested = true;
                    supervisor.abort().await;
                }
                Step::Command(Some(Command::Start { reply, .. })) => {
                    let _ = reply.send(Err(StartError::AlreadyRunning));
                }
                Step::Command(Some(Command::Pause)) => match supervisor.pause() {
                    Ok(()) => {
                        job.state = supervisor.state();
                        job.stopwatch.stop();
                        run.total.stop();
                        self.set_status(PipelineStatus::Paused);
                    }
                    Err(EncodeError::Unsupported) => warn!("Job {}: pausing is not supported here", job.id),
                    Err(e) => warn!("Job {}: pause failed: {}", job.id, e),
                },
                Step::Command(Some(Command::Resume)) => match supervisor.resume() {
                    Ok(()) => {
                        job.state = supervisor.state();
                        job.stopwatch.start();
                        run.total.start();
                        self.set_status(PipelineStatus::Running);
                    }
                    Err(e) => warn!("Job {}: resume failed: {}", job.id, e),
                },
                Step::Event(Some(SupervisorEvent::Progress { frame, percent })) => {
                    job.frames_done = frame;
                    if let Some(percent) = percent {
                        job.progress = percent;
                    }
                }
                Step::Event(Some(SupervisorEvent::OutputSize(bytes))) => {
                    job.estimated_output_bytes = Some(bytes);
                    self.emit(PipelineEvent::Sizes {
                        file: job.source.clone(),
                        before: job.source_bytes,
                        after: None,
                        estimated: Some(bytes),
                    });
                }
                Step::Event(Some(SupervisorEvent::Finished(outcome))) => {
                    job.state = supervisor.state();
                    // a paused job that failed leaves the pipeline running again
                    if !run.total.is_running() && !run.abort_requested {
                        run.total.start();
                        self.set_status(PipelineStatus::Running);
                    }
                    return outcome;
                }
                Step::Event(None) => return JobOutcome::Failed(EncodeError::NotRunning),
                Step::Tick => {
                    if job.state == JobState::Running {
                        self.emit(PipelineEvent::Progress {
                            file: job.source.clone(),
                            frame: job.frames_done,
                            percent: job.progress,
                            file_elapsed: job.elapsed(),
                            total_elapsed: run.total.elapsed(),
                            remaining: job.remaining(),
                        });
                    }
                }
            }
        }
    }

    async fn finalize(&mut self, run: &mut Run, job: &JobDescriptor) -> FileResult {
        match run.policy.finalize(job).await {
            Ok(disposition) => {
                let (before, after) = disposition.sizes();
                match &disposition {
                    Disposition::Discarded { .. } => {
                        run.summary.bytes_before += before;
                        run.summary.bytes_after += before;
                    }
                    _ => {
                        info!("Job {}: ✅ {} MB --> {} MB", job.id, before as f64 / 1e6, after as f64 / 1e6);
                        run.summary.improved += 1;
                        run.summary.bytes_before += before;
                        run.summary.bytes_after += after;
                    }
                }
                run.summary.encoded += 1;

                if let Err(e) = run.log.record_disposition(&job.source, &disposition) {
                    warn!("Failed to write outcome log in {}: {}", run.log.dir().display(), e);
                }
                self.emit(PipelineEvent::Sizes {
                    file: job.source.clone(),
                    before,
                    after: Some(after),
                    estimated: job.estimated_output_bytes,
                });
                self.emit(PipelineEvent::FileFinished {
                    file: job.source.clone(),
                    disposition,
                });
                FileResult::Continue
            }
            Err(e) => {
                error!("Job {}: could not place output: {}", job.id, e);
                let recovered_dir = run.config.scratch_dir.join("recovered");
                let preserved = preserve_scratch(&job.scratch_output, &recovered_dir, &job.source, job.id).await;
                let result = match &preserved {
                    Ok(kept) => {
                        warn!("Job {}: encoded output kept at {}", job.id, kept.display());
                        FileResult::Continue
                    }
                    Err(e2) => {
                        error!("Job {}: could not preserve output either: {}", job.id, e2);
                        FileResult::Halt
                    }
                };
                self.record_failure(run, &job.source, &RunError::Disposition(e));
                result
            }
        }
    }

    fn record_failure(&self, run: &mut Run, path: &Path, error: &RunError) {
        run.summary.failed += 1;
        if let Err(e) = run.log.record_error(path, error) {
            warn!("Failed to write outcome log in {}: {}", run.log.dir().display(), e);
        }
        self.emit(PipelineEvent::FileFailed {
            file: path.to_path_buf(),
            error: error.to_string(),
        });
    }
}

/// Free the shared scratch slot; a leftover file is removed
fn release_scratch(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed scratch output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove scratch output {}: {}", path.display(), e),
    }
}

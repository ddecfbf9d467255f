use std::collections::VecDeque;
use std::process::ExitStatus;
use std::time::Duration;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::encode::EncodeCommand;
use crate::error::EncodeError;
use crate::job::JobState;
use crate::progress::{percent_complete, ProgressLine};
use crate::resources::ResourcePlan;

/// Lines of output quoted when an encode fails
const TAIL_LINES: usize = 20;
/// How long to keep reading output after the process has exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a terminated encoder gets before it is killed
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// How a job ended
#[derive(Debug)]
pub enum JobOutcome {
    Completed,
    Failed(EncodeError),
    Aborted,
}

/// Something the encoder reported
#[derive(Debug)]
pub enum SupervisorEvent {
    Progress { frame: u64, percent: Option<f64> },
    /// Running output size reported by the encoder; advisory only
    OutputSize(u64),
    Finished(JobOutcome),
}

enum Step {
    Line(Option<String>),
    Exited(std::io::Result<ExitStatus>),
    Drained,
}

/// Sole owner of the running encoder process: spawns it, turns its output
/// into progress, suspends it and tears it down
pub struct JobSupervisor {
    state: JobState,
    child: Option<Child>,
    pid: Option<u32>,
    lines: mpsc::UnboundedReceiver<String>,
    lines_open: bool,
    readers: Vec<JoinHandle<()>>,
    pending: VecDeque<SupervisorEvent>,
    outcome: Option<JobOutcome>,
    exit_status: Option<ExitStatus>,
    tail: VecDeque<String>,
    frame_count: Option<u64>,
}

impl JobSupervisor {
    /// Spawn the encoder and start reading its output
    pub fn launch(
        command: &EncodeCommand,
        frame_count: Option<u64>,
        plan: &ResourcePlan,
    ) -> Result<Self, EncodeError> {
        debug!("Launching: {}", command);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut child = command.to_command().spawn().map_err(EncodeError::Spawn)?;
        let pid = child.id();

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(stderr, tx.clone())));
        }
        drop(tx);

        if let Some(pid) = pid {
            plan.apply(pid);
        }

        Ok(Self {
            state: JobState::Running,
            child: Some(child),
            pid,
            lines: rx,
            lines_open: true,
            readers,
            pending: VecDeque::new(),
            outcome: None,
            exit_status: None,
            tail: VecDeque::with_capacity(TAIL_LINES),
            frame_count,
        })
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the next thing worth reporting.
    ///
    /// Returns `Finished` exactly once, then `None`. Safe to cancel and call again.
    pub async fn next_event(&mut self) -> Option<SupervisorEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if let Some(outcome) = self.outcome.take() {
                return Some(SupervisorEvent::Finished(outcome));
            }
            if self.state.is_terminal() {
                return None;
            }

            let step = if self.exit_status.is_some() {
                match timeout(DRAIN_TIMEOUT, self.lines.recv()).await {
                    Ok(Some(line)) => Step::Line(Some(line)),
                    Ok(None) | Err(_) => Step::Drained,
                }
            } else {
                let Some(child) = self.child.as_mut() else {
                    return None;
                };
                let lines = &mut self.lines;
                tokio::select! {
                    line = lines.recv(), if self.lines_open => Step::Line(line),
                    status = child.wait() => Step::Exited(status),
                }
            };

            match step {
                Step::Line(Some(line)) => self.observe(line),
                Step::Line(None) => self.lines_open = false,
                Step::Exited(Ok(status)) => {
                    debug!("Encoder exited with {}", status);
                    self.exit_status = Some(status);
                }
                Step::Exited(Err(e)) => self.finish(JobState::Failed, JobOutcome::Failed(EncodeError::Wait(e))),
                Step::Drained => self.complete(),
            }
        }
    }

    fn observe(&mut self, line: String) {
        let parsed = ProgressLine::parse(&line);
        if let Some(frame) = parsed.frame {
            self.pending.push_back(SupervisorEvent::Progress {
                frame,
                percent: percent_complete(frame, self.frame_count),
            });
        }
        if let Some(size) = parsed.size_bytes {
            self.pending.push_back(SupervisorEvent::OutputSize(size));
        }

        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }

    fn complete(&mut self) {
        self.stop_readers();
        let status = self.exit_status;
        match status {
            Some(status) if status.success() => self.finish(JobState::Completed, JobOutcome::Completed),
            _ => {
                let tail = self.tail.iter().cloned().collect::<Vec<_>>().join("\n");
                let code = status.and_then(|s| s.code());
                self.finish(JobState::Failed, JobOutcome::Failed(EncodeError::Exit { code, tail }));
            }
        }
    }

    fn finish(&mut self, state: JobState, outcome: JobOutcome) {
        self.state = state;
        self.outcome = Some(outcome);
        self.child = None;
    }

    fn stop_readers(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }

    /// Reap the process if it is already gone; it can no longer be signalled
    fn check_alive(&mut self, action: &'static str) -> Result<(), EncodeError> {
        let exited = match self.child.as_mut() {
            Some(child) => child.try_wait().map_err(EncodeError::Wait)?,
            None => return Err(EncodeError::NotRunning),
        };
        if let Some(status) = exited {
            warn!("Encoder exited ({}) before it could be {}", status, action);
            self.exit_status = Some(status);
            self.stop_readers();
            self.pending.clear();
            self.finish(JobState::Failed, JobOutcome::Failed(EncodeError::AlreadyExited(action)));
            return Err(EncodeError::AlreadyExited(action));
        }
        Ok(())
    }

    /// Suspend the encoder. Output already produced stays queued.
    pub fn pause(&mut self) -> Result<(), EncodeError> {
        match self.state {
            JobState::Paused => return Ok(()),
            JobState::Running => {}
            _ => return Err(EncodeError::NotRunning),
        }
        if !cfg!(unix) {
            return Err(EncodeError::Unsupported);
        }
        self.check_alive("paused")?;
        self.signal("pause", SignalKind::Stop)?;
        self.state = JobState::Paused;
        info!("⏸️  Encoder paused");
        Ok(())
    }

    /// Continue a suspended encoder
    pub fn resume(&mut self) -> Result<(), EncodeError> {
        match self.state {
            JobState::Running => return Ok(()),
            JobState::Paused => {}
            _ => return Err(EncodeError::NotRunning),
        }
        self.check_alive("resumed")?;
        self.signal("resume", SignalKind::Continue)?;
        self.state = JobState::Running;
        info!("▶️  Encoder resumed");
        Ok(())
    }

    fn signal(&mut self, action: &'static str, kind: SignalKind) -> Result<(), EncodeError> {
        let Some(pid) = self.pid else {
            return Err(EncodeError::NotRunning);
        };
        if let Err(reason) = send_signal(pid, kind) {
            self.stop_readers();
            self.pending.clear();
            let err = EncodeError::Signal { action, reason: reason.clone() };
            self.finish(JobState::Failed, JobOutcome::Failed(EncodeError::Signal { action, reason }));
            return Err(err);
        }
        Ok(())
    }

    /// Terminate the encoder, waiting briefly for it to exit before killing it.
    ///
    /// Works from any non-terminal state, including while suspended. The job
    /// ends as `Aborted`, never as a failure.
    pub async fn abort(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.stop_readers();
        self.pending.clear();

        if let Some(mut child) = self.child.take() {
            if self.exit_status.is_none() {
                terminate(&mut child, self.pid).await;
            }
        }
        self.state = JobState::Aborted;
        self.outcome = Some(JobOutcome::Aborted);
        info!("🛑 Encoder aborted");
    }
}

impl Drop for JobSupervisor {
    fn drop(&mut self) {
        self.stop_readers();
    }
}

#[derive(Debug, Clone, Copy)]
enum SignalKind {
    Stop,
    Continue,
    Terminate,
}

#[cfg(unix)]
fn send_signal(pid: u32, kind: SignalKind) -> Result<(), String> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match kind {
        SignalKind::Stop => Signal::SIGSTOP,
        SignalKind::Continue => Signal::SIGCONT,
        SignalKind::Terminate => Signal::SIGTERM,
    };
    kill(Pid::from_raw(pid as i32), signal).map_err(|e| e.to_string())
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, kind: SignalKind) -> Result<(), String> {
    Err(format!("{:?} is not supported on this platform", kind))
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let (true, Some(pid)) = (cfg!(unix), pid) {
        // a stopped process only acts on SIGTERM once continued
        let _ = send_signal(pid, SignalKind::Terminate);
        let _ = send_signal(pid, SignalKind::Continue);
        match timeout(ABORT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Encoder terminated with {}", status);
                return;
            }
            Ok(Err(e)) => warn!("Failed waiting for terminated encoder: {}", e),
            Err(_) => warn!("Encoder ignored SIGTERM for {:?}, killing", ABORT_GRACE),
        }
    }
    if let Err(e) = child.kill().await {
        warn!("Failed to kill encoder: {}", e);
    }
}

/// Forward output as lines, splitting on both `\r` and `\n`
async fn pump_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        let consumed = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => {
                for &byte in chunk {
                    if byte == b'\n' || byte == b'\r' {
                        if !line.is_empty() {
                            if tx.send(String::from_utf8_lossy(&line).into_owned()).is_err() {
                                return;
                            }
                            line.clear();
                        }
                    } else {
                        line.push(byte);
                    }
                }
                chunk.len()
            }
            Err(e) => {
                debug!("Stopped reading encoder output: {}", e);
                break;
            }
        };
        reader.consume(consumed);
    }
    if !line.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&line).into_owned());
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Instant;

    fn shell(script: &str) -> EncodeCommand {
        EncodeCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn plan() -> ResourcePlan {
        ResourcePlan { threads: 1, total_cores: 1, niceness: 0 }
    }

    async fn collect(sup: &mut JobSupervisor) -> Vec<SupervisorEvent> {
        let mut events = Vec::new();
        while let Some(event) = sup.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_progress_and_completion() {
        let mut sup = JobSupervisor::launch(
            &shell("printf 'frame=50 size=10kB\\rframe=100 size=20kB\\n'; exit 0"),
            Some(100),
            &plan(),
        )
        .unwrap();

        let events = collect(&mut sup).await;
        let percents: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                SupervisorEvent::Progress { percent, .. } => *percent,
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![50.0, 100.0]);
        assert!(events.iter().any(|e| matches!(e, SupervisorEvent::OutputSize(20_000))));
        assert!(matches!(events.last(), Some(SupervisorEvent::Finished(JobOutcome::Completed))));
        assert_eq!(sup.state(), JobState::Completed);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure_with_tail() {
        let mut sup = JobSupervisor::launch(&shell("echo 'no such encoder' >&2; exit 3"), None, &plan()).unwrap();
        let events = collect(&mut sup).await;
        match events.last() {
            Some(SupervisorEvent::Finished(JobOutcome::Failed(EncodeError::Exit { code, tail }))) => {
                assert_eq!(*code, Some(3));
                assert!(tail.contains("no such encoder"));
            }
            other => panic!("unexpected final event: {:?}", other),
        }
        assert_eq!(sup.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn test_pause_resume_keeps_every_line() {
        let script = "i=1; while [ $i -le 40 ]; do echo \"frame=$i\"; i=$((i+1)); sleep 0.01; done; exit 0";
        let mut sup = JobSupervisor::launch(&shell(script), Some(40), &plan()).unwrap();

        let mut frames = Vec::new();
        while frames.len() < 5 {
            if let Some(SupervisorEvent::Progress { frame, .. }) = sup.next_event().await {
                frames.push(frame);
            }
        }

        sup.pause().unwrap();
        assert_eq!(sup.state(), JobState::Paused);
        tokio::time::sleep(Duration::from_millis(100)).await;
        sup.resume().unwrap();
        assert_eq!(sup.state(), JobState::Running);

        for event in collect(&mut sup).await {
            if let SupervisorEvent::Progress { frame, .. } = event {
                frames.push(frame);
            }
        }
        assert_eq!(frames, (1..=40).collect::<Vec<u64>>());
        assert_eq!(sup.state(), JobState::Completed);
    }

    #[tokio::test]
    async fn test_abort_while_paused() {
        let mut sup = JobSupervisor::launch(&shell("exec sleep 30"), None, &plan()).unwrap();
        sup.pause().unwrap();

        let started = Instant::now();
        sup.abort().await;
        assert!(started.elapsed() < ABORT_GRACE);
        assert_eq!(sup.state(), JobState::Aborted);
        assert!(matches!(
            sup.next_event().await,
            Some(SupervisorEvent::Finished(JobOutcome::Aborted))
        ));
        assert!(sup.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_pause_after_exit_fails_job() {
        let mut sup = JobSupervisor::launch(&shell("exit 0"), None, &plan()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = sup.pause().unwrap_err();
        assert!(matches!(err, EncodeError::AlreadyExited("paused")));
        assert_eq!(sup.state(), JobState::Failed);
        assert!(matches!(
            sup.next_event().await,
            Some(SupervisorEvent::Finished(JobOutcome::Failed(_)))
        ));
    }

    #[tokio::test]
    async fn test_pause_requires_running_job() {
        let mut sup = JobSupervisor::launch(&shell("exit 0"), None, &plan()).unwrap();
        collect(&mut sup).await;
        assert!(matches!(sup.pause(), Err(EncodeError::NotRunning)));
        assert!(matches!(sup.resume(), Err(EncodeError::NotRunning)));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let cmd = EncodeCommand {
            program: PathBuf::from("/nonexistent/ffmpeg"),
            args: Vec::new(),
        };
        assert!(matches!(
            JobSupervisor::launch(&cmd, None, &plan()),
            Err(EncodeError::Spawn(_))
        ));
    }
}

use std::path::PathBuf;
use std::time::{Duration, Instant};
use chrono::{DateTime, Local};
use uuid::Uuid;

/// Lifecycle of one encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Launching,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Aborted)
    }
}

/// Elapsed-time counter that only advances while running
#[derive(Debug, Clone, Default)]
pub struct Stopwatch {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl Stopwatch {
    pub fn started() -> Self {
        Self {
            accumulated: Duration::ZERO,
            running_since: Some(Instant::now()),
        }
    }

    pub fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += since.elapsed();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.accumulated + self.running_since.map(|s| s.elapsed()).unwrap_or_default()
    }
}

/// Everything known about the file currently being encoded
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub id: Uuid,
    pub source: PathBuf,
    /// Shared scratch output; must be released before the next job starts
    pub scratch_output: PathBuf,
    pub frame_count: Option<u64>,
    pub source_bytes: u64,
    pub started_at: DateTime<Local>,
    pub state: JobState,
    pub stopwatch: Stopwatch,
    /// Last frame the encoder reported
    pub frames_done: u64,
    /// Last parsed progress, 0..=100
    pub progress: f64,
    /// Output size reported by the encoder so far
    pub estimated_output_bytes: Option<u64>,
}

impl JobDescriptor {
    pub fn new(source: PathBuf, scratch_output: PathBuf, frame_count: Option<u64>, source_bytes: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            scratch_output,
            frame_count,
            source_bytes,
            started_at: Local::now(),
            state: JobState::Idle,
            stopwatch: Stopwatch::default(),
            frames_done: 0,
            progress: 0.0,
            estimated_output_bytes: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.stopwatch.elapsed()
    }

    /// Time left at the current rate, once there is any progress to go on
    pub fn remaining(&self) -> Option<Duration> {
        estimate_remaining(self.elapsed(), self.progress)
    }
}

/// `elapsed * (100 - pct) / pct`, or None before the first progress report
pub fn estimate_remaining(elapsed: Duration, percent: f64) -> Option<Duration> {
    if percent <= 0.0 || !percent.is_finite() {
        return None;
    }
    let percent = percent.min(100.0);
    let ratio = (100.0 - percent) / percent;
    Duration::try_from_secs_f64(elapsed.as_secs_f64() * ratio).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopwatch_stops_accumulating_when_stopped() {
        let mut sw = Stopwatch::started();
        std::thread::sleep(Duration::from_millis(20));
        sw.stop();
        let frozen = sw.elapsed();
        assert!(frozen >= Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sw.elapsed(), frozen);
        sw.start();
        assert!(sw.is_running());
        std::thread::sleep(Duration::from_millis(5));
        assert!(sw.elapsed() > frozen);
    }

    #[test]
    fn test_remaining_estimate() {
        assert_eq!(estimate_remaining(Duration::from_secs(10), 0.0), None);
        assert_eq!(estimate_remaining(Duration::from_secs(10), 50.0), Some(Duration::from_secs(10)));
        assert_eq!(estimate_remaining(Duration::from_secs(30), 25.0), Some(Duration::from_secs(90)));
        assert_eq!(estimate_remaining(Duration::from_secs(30), 100.0), Some(Duration::ZERO));
    }

    #[test]
    fn test_remaining_estimate_out_of_range_is_unknown() {
        assert_eq!(estimate_remaining(Duration::from_secs(10), 5.42e-18), None);
        assert_eq!(estimate_remaining(Duration::from_secs(10), f64::NAN), None);
    }

    #[test]
    fn test_first_frame_of_huge_count_has_no_estimate() {
        let percent = crate::progress::percent_complete(1, Some(u64::MAX)).unwrap();
        assert_eq!(estimate_remaining(Duration::from_secs(1000), percent), None);

        let job = JobDescriptor::new(PathBuf::from("a.mp4"), PathBuf::from("data.mp4"), Some(u64::MAX), 10);
        assert_eq!(job.remaining(), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Aborted.is_terminal());
        assert!(!JobState::Paused.is_terminal());
        assert!(!JobState::Launching.is_terminal());
    }

    #[test]
    fn test_new_job_is_idle() {
        let job = JobDescriptor::new(PathBuf::from("a.mp4"), PathBuf::from("data.mp4"), Some(10), 10);
        assert_eq!(job.state, JobState::Idle);
        assert_eq!(job.remaining(), None);
    }
}

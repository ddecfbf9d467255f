use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Local, NaiveDate};
use humansize::{format_size, DECIMAL};

use crate::disposition::Disposition;

/// Append-only outcome log, one file per calendar day
#[derive(Debug, Clone)]
pub struct OutcomeLog {
    dir: PathBuf,
}

impl OutcomeLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/dd-mm-YYYY.log`
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.log", date.format("%d-%m-%Y")))
    }

    /// Append one entry stamped with the current local time
    pub fn record(&self, lines: &[String]) -> std::io::Result<()> {
        self.record_at(Local::now(), lines)
    }

    fn record_at(&self, now: DateTime<Local>, lines: &[String]) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(now.date_naive()))?;

        let mut entry = format!("{} :\n", now.format("%H:%M:%S"));
        for line in lines {
            entry.push_str("\t\t");
            entry.push_str(line);
            entry.push('\n');
        }
        file.write_all(entry.as_bytes())
    }

    pub fn record_disposition(&self, source: &Path, disposition: &Disposition) -> std::io::Result<()> {
        let (before, after) = disposition.sizes();
        let headline = match disposition {
            Disposition::Replaced { .. } => source.display().to_string(),
            Disposition::SavedAlongside { path, .. } => {
                format!("{} (--> {})", source.display(), path.display())
            }
            Disposition::Discarded { tagged, .. } => format!(
                "{} (not smaller, output discarded{})",
                source.display(),
                if *tagged { ", source tagged" } else { "" }
            ),
        };
        self.record(&[headline, size_line(before, after)])
    }

    pub fn record_error(&self, source: &Path, error: &dyn Display) -> std::io::Result<()> {
        self.record(&[source.display().to_string(), format!("ERROR: {}", error)])
    }
}

/// `100 -> 90 bytes (100 B -> 90 B)`
pub fn size_line(before: u64, after: u64) -> String {
    format!(
        "{} -> {} bytes ({} -> {})",
        before,
        after,
        format_size(before, DECIMAL),
        format_size(after, DECIMAL)
    )
}

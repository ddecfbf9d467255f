use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, warn};

/// Result of one pull from the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    /// A media file ready to be processed
    FileReady(PathBuf),
    /// A directory was read and its children queued
    DirectoryExpanded(PathBuf),
    /// Nothing left; the run is done
    Empty,
}

/// Two-stack work list over a directory tree.
///
/// Files of the most recently expanded directory are drained before the next
/// directory is read, and the newest subdirectories are read first.
#[derive(Debug, Clone)]
pub struct TraversalQueue {
    pending_directories: Vec<PathBuf>,
    pending_files: Vec<PathBuf>,
    extension: String,
    excluded: Vec<PathBuf>,
}

impl TraversalQueue {
    /// Queue rooted at `root`, accepting files whose extension matches
    /// `extension` case-insensitively
    pub fn new(root: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            pending_directories: vec![root.into()],
            pending_files: Vec::new(),
            extension: extension.trim_start_matches('.').to_lowercase(),
            excluded: Vec::new(),
        }
    }

    /// Never descend into `dir` (used for the scratch directory)
    pub fn exclude(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.excluded.push(fs::canonicalize(&dir).unwrap_or(dir));
        self
    }

    pub fn pending_directories(&self) -> usize {
        self.pending_directories.len()
    }

    pub fn pending_files(&self) -> usize {
        self.pending_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_directories.is_empty() && self.pending_files.is_empty()
    }

    /// Drop all pending work
    pub fn clear(&mut self) {
        self.pending_directories.clear();
        self.pending_files.clear();
    }

    /// Pull the next unit of work
    pub fn next_item(&mut self) -> QueueItem {
        if let Some(file) = self.pending_files.pop() {
            return QueueItem::FileReady(file);
        }
        match self.pending_directories.pop() {
            Some(dir) => {
                self.expand(&dir);
                QueueItem::DirectoryExpanded(dir)
            }
            None => QueueItem::Empty,
        }
    }

    fn expand(&mut self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read directory {}: {}", dir.display(), e);
                return;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry in {}: {}", dir.display(), e);
                    continue;
                }
            };
            let path = entry.path();

            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    warn!("Cannot stat {}: {}", path.display(), e);
                    continue;
                }
            };

            let is_dir = if file_type.is_symlink() {
                // links to directories are not followed; links to files are
                match fs::metadata(&path) {
                    Ok(m) if m.is_dir() => {
                        debug!("Not following directory link {}", path.display());
                        continue;
                    }
                    Ok(_) => false,
                    Err(_) => continue,
                }
            } else {
                file_type.is_dir()
            };

            if is_dir {
                if self.is_excluded(&path) {
                    debug!("Skipping excluded directory {}", path.display());
                    continue;
                }
                self.pending_directories.push(path);
            } else if self.matches_extension(&path) {
                self.pending_files.push(path);
            }
        }
    }

    fn is_excluded(&self, path: &Path) -> bool {
        if self.excluded.is_empty() {
            return false;
        }
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.excluded.iter().any(|ex| *ex == canonical)
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase() == self.extension)
            .unwrap_or(false)
    }
}

/// Yields only files, expanding directories as needed
impl Iterator for TraversalQueue {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        loop {
            match self.next_item() {
                QueueItem::FileReady(file) => return Some(file),
                QueueItem::DirectoryExpanded(_) => continue,
                QueueItem::Empty => return None,
            }
        }
    }
}

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use tokio::fs;
use uuid::Uuid;

use crate::encode::build_tag_patch_command;
use crate::error::DispositionError;
use crate::job::JobDescriptor;

/// What happened to a finished encode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The source was replaced by the smaller output
    Replaced { before: u64, after: u64 },
    /// The output was saved next to the source
    SavedAlongside { path: PathBuf, before: u64, after: u64 },
    /// The output was not smaller and was deleted
    Discarded { before: u64, after: u64, tagged: bool },
}

impl Disposition {
    pub fn sizes(&self) -> (u64, u64) {
        match self {
            Disposition::Replaced { before, after }
            | Disposition::SavedAlongside { before, after, .. }
            | Disposition::Discarded { before, after, .. } => (*before, *after),
        }
    }
}

/// Marks sources whose encode did not shrink them, by remuxing with a new comment
#[derive(Debug, Clone)]
pub struct NotImprovedTagger {
    pub ffmpeg_bin: PathBuf,
    /// Full comment text, already carrying the "not improved" prefix
    pub comment: String,
    /// Where the remux is written before it replaces the source
    pub scratch: PathBuf,
}

impl NotImprovedTagger {
    /// Best effort: any failure leaves the source as it was
    async fn tag(&self, source: &Path) -> bool {
        let cmd = build_tag_patch_command(&self.ffmpeg_bin, source, &self.scratch, &self.comment);
        debug!("Tagging source: {}", cmd);

        let result = match cmd.to_command().output().await {
            Ok(output) if output.status.success() => move_file(&self.scratch, source).await,
            Ok(output) => Err(DispositionError::Move {
                from: source.to_path_buf(),
                to: self.scratch.clone(),
                source: std::io::Error::new(
                    ErrorKind::Other,
                    format!(
                        "tag remux exited with {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                ),
            }),
            Err(e) => Err(DispositionError::Move {
                from: source.to_path_buf(),
                to: self.scratch.clone(),
                source: e,
            }),
        };

        match result {
            Ok(()) => {
                info!("Marked {} as not improvable", source.display());
                true
            }
            Err(e) => {
                warn!("Could not mark {} as not improvable: {}", source.display(), e);
                let _ = fs::remove_file(&self.scratch).await;
                false
            }
        }
    }
}

/// Decides what to keep once an encode has completed
#[derive(Debug, Clone)]
pub struct DispositionPolicy {
    pub overwrite: bool,
    pub tagger: Option<NotImprovedTagger>,
}

impl DispositionPolicy {
    /// Compare output to source and keep, replace, or discard.
    ///
    /// On success the scratch output no longer exists. On error the source is
    /// untouched and the scratch output is left for the caller to preserve.
    pub async fn finalize(&self, job: &JobDescriptor) -> Result<Disposition, DispositionError> {
        let before = file_size(&job.source).await?;
        let after = file_size(&job.scratch_output).await?;

        if after >= before {
            info!(
                "Job {}: result is not smaller than source ({} >= {} bytes), discarding",
                job.id, after, before
            );
            fs::remove_file(&job.scratch_output)
                .await
                .map_err(|source| DispositionError::Cleanup {
                    path: job.scratch_output.clone(),
                    source,
                })?;

            let tagged = match (&self.tagger, self.overwrite) {
                (Some(tagger), false) => tagger.tag(&job.source).await,
                _ => false,
            };
            return Ok(Disposition::Discarded { before, after, tagged });
        }

        if self.overwrite {
            info!("Job {}: overwriting source file", job.id);
            move_file(&job.scratch_output, &job.source).await?;
            Ok(Disposition::Replaced { before, after })
        } else {
            let sibling = compressed_sibling(&job.source);
            info!("Job {}: saving to {}", job.id, sibling.display());
            move_file(&job.scratch_output, &sibling).await?;
            Ok(Disposition::SavedAlongside {
                path: sibling,
                before,
                after,
            })
        }
    }
}

async fn file_size(path: &Path) -> Result<u64, DispositionError> {
    fs::metadata(path)
        .await
        .map(|m| m.len())
        .map_err(|source| DispositionError::Stat {
            path: path.to_path_buf(),
            source,
        })
}

/// `<stem> (compressed).<ext>` in the source's directory
pub fn compressed_sibling(source: &Path) -> PathBuf {
    let mut name = OsString::from(source.file_stem().unwrap_or_default());
    name.push(" (compressed)");
    if let Some(ext) = source.extension() {
        name.push(".");
        name.push(ext);
    }
    source.with_file_name(name)
}

/// Move `from` onto `to`, replacing it.
///
/// Tries a rename first; across filesystems, copies to a hidden file beside
/// `to`, renames that into place, then removes `from`. Once `to` is in place
/// the move has succeeded; a leftover `from` is only logged.
pub async fn move_file(from: &Path, to: &Path) -> Result<(), DispositionError> {
    let move_err = |source| DispositionError::Move {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    match fs::rename(from, to).await {
        Ok(()) => return Ok(()),
        Err(e) => debug!("rename {} -> {} failed ({}), copying", from.display(), to.display(), e),
    }

    let mut part_name = OsString::from(".");
    part_name.push(to.file_name().unwrap_or_default());
    part_name.push(".part");
    let part = to.with_file_name(part_name);

    if let Err(e) = fs::copy(from, &part).await {
        let _ = fs::remove_file(&part).await;
        return Err(move_err(e));
    }
    if let Err(e) = fs::rename(&part, to).await {
        let _ = fs::remove_file(&part).await;
        return Err(move_err(e));
    }
    if let Err(e) = fs::remove_file(from).await {
        warn!("{} is in place but {} could not be removed: {}", to.display(), from.display(), e);
    }
    Ok(())
}

/// Move a scratch output that could not be placed into `recovered_dir`,
/// freeing the scratch slot without losing the encode
pub async fn preserve_scratch(
    scratch: &Path,
    recovered_dir: &Path,
    source: &Path,
    job_id: Uuid,
) -> Result<PathBuf, DispositionError> {
    if fs::metadata(scratch).await.is_err() {
        return Ok(scratch.to_path_buf());
    }
    fs::create_dir_all(recovered_dir)
        .await
        .map_err(|e| DispositionError::Move {
            from: scratch.to_path_buf(),
            to: recovered_dir.to_path_buf(),
            source: e,
        })?;

    let stem = source.file_stem().unwrap_or_default().to_string_lossy();
    let ext = scratch.extension().unwrap_or_default().to_string_lossy();
    let target = recovered_dir.join(format!("{}-{}.{}", stem, job_id, ext));
    move_file(scratch, &target).await?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        source: PathBuf,
        job: JobDescriptor,
        scratch_dir: PathBuf,
    }

    fn fixture(source_len: usize, output_len: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let library = dir.path().join("library");
        let scratch_dir = dir.path().join("scratch");
        std::fs::create_dir_all(&library).unwrap();
        std::fs::create_dir_all(&scratch_dir).unwrap();

        let source = library.join("clip.mp4");
        std::fs::write(&source, vec![b's'; source_len]).unwrap();
        let scratch = scratch_dir.join("data.mp4");
        std::fs::write(&scratch, vec![b'o'; output_len]).unwrap();

        let job = JobDescriptor::new(source.clone(), scratch, None, source_len as u64);
        Fixture { _dir: dir, source, job, scratch_dir }
    }

    fn policy(overwrite: bool, scratch_dir: &Path) -> DispositionPolicy {
        DispositionPolicy {
            overwrite,
            tagger: Some(NotImprovedTagger {
                ffmpeg_bin: PathBuf::from("/nonexistent/ffmpeg"),
                comment: "< ffmpeg (-c:v libx265 -crf 23 -preset medium -c:a libmp3lame -b:a 320k)".to_string(),
                scratch: scratch_dir.join("patch.mp4"),
            }),
        }
    }

    #[tokio::test]
    async fn test_smaller_output_replaces_source() {
        let fx = fixture(100, 90);
        let outcome = policy(true, &fx.scratch_dir).finalize(&fx.job).await.unwrap();

        assert_eq!(outcome, Disposition::Replaced { before: 100, after: 90 });
        assert_eq!(std::fs::read(&fx.source).unwrap(), vec![b'o'; 90]);
        assert!(!fx.job.scratch_output.exists());
    }

    #[tokio::test]
    async fn test_smaller_output_saved_alongside() {
        let fx = fixture(100, 90);
        let outcome = policy(false, &fx.scratch_dir).finalize(&fx.job).await.unwrap();

        let sibling = fx.source.with_file_name("clip (compressed).mp4");
        assert_eq!(
            outcome,
            Disposition::SavedAlongside { path: sibling.clone(), before: 100, after: 90 }
        );
        assert_eq!(std::fs::read(&sibling).unwrap(), vec![b'o'; 90]);
        assert_eq!(std::fs::read(&fx.source).unwrap(), vec![b's'; 100]);
        assert!(!fx.job.scratch_output.exists());
    }

    #[tokio::test]
    async fn test_larger_output_discarded() {
        for overwrite in [true, false] {
            let fx = fixture(100, 110);
            let outcome = policy(overwrite, &fx.scratch_dir).finalize(&fx.job).await.unwrap();

            assert_eq!(outcome, Disposition::Discarded { before: 100, after: 110, tagged: false });
            assert_eq!(std::fs::read(&fx.source).unwrap(), vec![b's'; 100]);
            assert!(!fx.job.scratch_output.exists());
            assert!(!fx.scratch_dir.join("patch.mp4").exists());
            assert!(!fx.source.with_file_name("clip (compressed).mp4").exists());
        }
    }

    #[tokio::test]
    async fn test_equal_size_is_not_an_improvement() {
        let fx = fixture(100, 100);
        let outcome = policy(true, &fx.scratch_dir).finalize(&fx.job).await.unwrap();
        assert!(matches!(outcome, Disposition::Discarded { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_not_improved_tag_applied() {
        use std::os::unix::fs::PermissionsExt;

        let fx = fixture(100, 110);
        // stand-in remuxer: copies the input and appends the comment argument
        let remuxer = fx.scratch_dir.join("fake-ffmpeg");
        std::fs::write(
            &remuxer,
            "#!/bin/sh\nin=\"\"; comment=\"\"; out=\"\"\nwhile [ $# -gt 0 ]; do\n  case \"$1\" in\n    -i) in=\"$2\"; shift ;;\n    -metadata) comment=\"$2\"; shift ;;\n  esac\n  out=\"$1\"; shift\ndone\ncat \"$in\" > \"$out\"\nprintf '%s' \"$comment\" >> \"$out\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&remuxer, std::fs::Permissions::from_mode(0o755)).unwrap();
        // exec can briefly fail with ETXTBSY while a concurrent fork holds the write handle
        for _ in 0..50 {
            if std::process::Command::new(&remuxer).output().is_ok() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        let mut policy = policy(false, &fx.scratch_dir);
        if let Some(tagger) = policy.tagger.as_mut() {
            tagger.ffmpeg_bin = remuxer;
        }
        let outcome = policy.finalize(&fx.job).await.unwrap();

        assert!(matches!(outcome, Disposition::Discarded { tagged: true, .. }));
        let patched = String::from_utf8(std::fs::read(&fx.source).unwrap()).unwrap();
        assert!(patched.ends_with("comment=< ffmpeg (-c:v libx265 -crf 23 -preset medium -c:a libmp3lame -b:a 320k)"));
        assert!(!fx.scratch_dir.join("patch.mp4").exists());
    }

    #[tokio::test]
    async fn test_missing_output_is_error_and_source_untouched() {
        let fx = fixture(100, 90);
        std::fs::remove_file(&fx.job.scratch_output).unwrap();
        let err = policy(true, &fx.scratch_dir).finalize(&fx.job).await.unwrap_err();
        assert!(matches!(err, DispositionError::Stat { .. }));
        assert_eq!(std::fs::read(&fx.source).unwrap(), vec![b's'; 100]);
    }

    #[tokio::test]
    async fn test_preserve_scratch() {
        let fx = fixture(100, 90);
        let recovered = fx.scratch_dir.join("recovered");
        let kept = preserve_scratch(&fx.job.scratch_output, &recovered, &fx.source, fx.job.id)
            .await
            .unwrap();
        assert!(kept.starts_with(&recovered));
        assert!(kept.to_string_lossy().contains("clip-"));
        assert!(!fx.job.scratch_output.exists());
        assert_eq!(std::fs::read(&kept).unwrap(), vec![b'o'; 90]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_move_succeeds_when_source_cannot_be_removed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir_all(&locked).unwrap();
        let from = locked.join("data.mp4");
        std::fs::write(&from, b"encoded").unwrap();
        let to = dir.path().join("clip.mp4");
        std::fs::write(&to, b"original source").unwrap();

        // rename and unlink both need write access to `locked`; copying does not
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();
        let result = move_file(&from, &to).await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(result.is_ok());
        assert_eq!(std::fs::read(&to).unwrap(), b"encoded");
        assert!(!dir.path().join(".clip.mp4.part").exists());
    }

    #[test]
    fn test_compressed_sibling_name() {
        assert_eq!(
            compressed_sibling(Path::new("/v/Trip 2019.MP4")),
            PathBuf::from("/v/Trip 2019 (compressed).MP4")
        );
    }
}

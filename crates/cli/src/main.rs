use anyhow::{bail, Context, Result};
use clap::Parser;
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use stomp_core::{
    ledger, probe, tools, CompressionConfig, ConfigSource, Disposition, Pipeline, PipelineEvent, PipelineHandle,
    PipelineStatus, RunSummary, SkipReason, TraversalQueue, Verdict,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Batch video recompressor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory to compress; defaults to the configured autorun path
    root: Option<PathBuf>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Report what would be encoded without touching anything
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    logger.format_timestamp_secs();
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let cfg = CompressionConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;

    let root = match args.root.clone().or_else(|| cfg.autorun_root().map(Path::to_path_buf)) {
        Some(root) => root,
        None => bail!("No directory given and no autorun path configured"),
    };

    info!("Stomp starting on {}", root.display());
    info!("  Codec: {:?}, quality {}, speed {}", cfg.video_codec, cfg.quality, cfg.speed);
    info!("  Overwrite: {}", cfg.overwrite);
    info!("  Performance mode: {:?}", cfg.performance_mode);

    if args.dry_run {
        return dry_run(&cfg, &root).await;
    }

    let (tx, mut events) = mpsc::unbounded_channel();
    let (handle, _controller) = Pipeline::spawn(ConfigSource::File(args.config.clone()), tx);
    handle
        .start(&root)
        .await
        .with_context(|| format!("Failed to start on {}", root.display()))?;

    tokio::spawn(read_controls(handle.clone()));
    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting run");
            interrupt.abort();
        }
    });

    println!("Controls: [p]ause, [r]esume, [a]bort, then Enter");

    let mut summary = RunSummary::default();
    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::Status(status) => {
                debug!("Status: {:?}", status);
                match status {
                    PipelineStatus::Paused => println!("⏸  Paused"),
                    PipelineStatus::Running => println!("▶  Running"),
                    PipelineStatus::Done => {
                        print_summary(&summary);
                        return Ok(());
                    }
                    PipelineStatus::Idle => {
                        print_summary(&summary);
                        println!("🛑 Aborted");
                        return Ok(());
                    }
                    PipelineStatus::Error => {
                        print_summary(&summary);
                        bail!("Run stopped on an encoder failure");
                    }
                }
            }
            PipelineEvent::Progress { file, frame, percent, file_elapsed, total_elapsed, remaining } => {
                println!(
                    "{} | {} | {:>5.1}% (frame {}) | total {}{}",
                    file_name(&file),
                    clock(file_elapsed),
                    percent,
                    frame,
                    clock(total_elapsed),
                    remaining.map(|r| format!(" | ~{} left", clock(r))).unwrap_or_default()
                );
            }
            PipelineEvent::Sizes { file, before, after, estimated } => {
                if let Some(after) = after {
                    println!("{}: {}", file_name(&file), size_change(before, after));
                } else if let Some(estimated) = estimated {
                    println!("{}", estimate_line(&file, before, estimated));
                } else {
                    println!("🎬 {} ({})", file.display(), format_size(before, DECIMAL));
                }
            }
            PipelineEvent::FileSkipped { file, reason } => match reason {
                SkipReason::AlreadyCompressed { quality, preset } => {
                    println!("⏭  {} (already crf {} {})", file.display(), quality, preset)
                }
                SkipReason::UnreadableTag => println!("⏭  {} (unreadable compression tag)", file.display()),
            },
            PipelineEvent::FileFinished { file, disposition } => match disposition {
                Disposition::Replaced { .. } => println!("✅ {} replaced", file_name(&file)),
                Disposition::SavedAlongside { path, .. } => println!("✅ saved {}", path.display()),
                Disposition::Discarded { tagged, .. } => println!(
                    "↩  {} not smaller, kept original{}",
                    file_name(&file),
                    if tagged { " (tagged)" } else { "" }
                ),
            },
            PipelineEvent::FileFailed { file, error } => println!("❌ {}: {}", file.display(), error),
            PipelineEvent::Summary(s) => summary = s,
        }
    }

    bail!("Pipeline stopped unexpectedly")
}

/// Map operator keystrokes on stdin to pipeline commands
async fn read_controls(handle: PipelineHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim().to_ascii_lowercase().as_str() {
            "p" | "pause" => handle.pause(),
            "r" | "resume" => handle.resume(),
            "a" | "abort" | "q" => handle.abort(),
            "" => {}
            other => warn!("Unknown control '{}'", other),
        }
    }
}

/// Probe every candidate and report what a real run would do
async fn dry_run(cfg: &CompressionConfig, root: &Path) -> Result<()> {
    if !root.is_dir() {
        bail!("Root directory does not exist: {}", root.display());
    }
    let settings = tools::prepare(cfg).await?;

    let mut would_encode = 0;
    let mut would_skip = 0;
    let mut total_bytes = 0u64;
    for path in TraversalQueue::new(root, &cfg.extension()).exclude(&cfg.scratch_dir) {
        let meta = match probe::probe(&cfg.ffprobe_bin, &path).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        match ledger::assess(&meta.tags, cfg.quality, settings.preset_rank) {
            Verdict::Untagged => {
                would_encode += 1;
                total_bytes += meta.size_bytes;
                println!("encode  {} ({})", path.display(), format_size(meta.size_bytes, DECIMAL));
            }
            Verdict::Weaker { quality, preset } => {
                would_encode += 1;
                total_bytes += meta.size_bytes;
                println!("encode  {} (was crf {} {})", path.display(), quality, preset);
            }
            Verdict::Adequate { quality, preset } => {
                would_skip += 1;
                println!("skip    {} (crf {} {})", path.display(), quality, preset);
            }
            Verdict::Unreadable => {
                would_skip += 1;
                println!("skip    {} (unreadable tag)", path.display());
            }
        }
    }

    println!(
        "{} file(s) to encode ({}), {} already compressed",
        would_encode,
        format_size(total_bytes, DECIMAL),
        would_skip
    );
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "📊 {} encoded ({} smaller), {} skipped, {} failed, saved {}",
        summary.encoded,
        summary.improved,
        summary.skipped,
        summary.failed,
        format_size(summary.saved_bytes(), DECIMAL)
    );
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn size_change(before: u64, after: u64) -> String {
    let pct = if before > 0 { after as f64 / before as f64 * 100.0 } else { 0.0 };
    format!(
        "{} -> {} ({:.1}% of original)",
        format_size(before, DECIMAL),
        format_size(after, DECIMAL),
        pct
    )
}

fn estimate_line(file: &Path, before: u64, estimated: u64) -> String {
    format!("{}: ~{} so far", file_name(file), size_change(before, estimated))
}

/// `h:mm:ss`
fn clock(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

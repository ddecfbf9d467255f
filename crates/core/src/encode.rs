use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::config::CompressionConfig;
use crate::tools::EncoderSettings;

/// A fully built ffmpeg invocation
#[derive(Debug, Clone)]
pub struct EncodeCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl EncodeCommand {
    fn new(program: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
            args: Vec::new(),
        }
    }

    fn arg(&mut self, arg: impl Into<OsString>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    fn pair(&mut self, flag: &str, value: impl Into<OsString>) -> &mut Self {
        self.arg(flag).arg(value)
    }

    /// Position of a flag, for inspecting built commands
    pub fn position(&self, flag: &str) -> Option<usize> {
        self.args.iter().position(|a| a == flag)
    }

    /// Value following a flag
    pub fn value_of(&self, flag: &str) -> Option<String> {
        let idx = self.position(flag)?;
        self.args.get(idx + 1).map(|v| v.to_string_lossy().into_owned())
    }

    /// Ready-to-spawn process with all stdio captured
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl std::fmt::Display for EncodeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Per-file inputs to the encode invocation
#[derive(Debug, Clone, Copy)]
pub struct EncodeRequest<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub source_tags: &'a HashMap<String, String>,
    pub threads: usize,
}

/// Build the encode command: codec flags, thread hint, carried-over tags,
/// and the compression tag written last so it wins over any source comment.
pub fn build_encode_command(
    config: &CompressionConfig,
    settings: &EncoderSettings,
    request: EncodeRequest<'_>,
) -> EncodeCommand {
    let mut cmd = EncodeCommand::new(&config.ffmpeg_bin);
    cmd.arg("-hide_banner").arg("-nostdin").arg("-y");

    if settings.cuda {
        cmd.pair("-hwaccel", "cuda");
    }
    cmd.pair("-i", request.input);

    cmd.pair("-c:v", settings.video_encoder.as_str());
    if settings.nvenc {
        cmd.pair("-cq", config.quality.to_string())
            .pair("-rc", "vbr_hq")
            .pair("-b:v", "0");
    } else {
        cmd.pair("-crf", config.quality.to_string());
    }
    cmd.pair("-preset", settings.preset)
        .pair("-c:a", config.audio_codec.as_str())
        .pair("-b:a", config.audio_bitrate.as_str())
        .pair("-threads", request.threads.max(1).to_string());

    if settings.video_encoder == "libx265" {
        cmd.pair("-x265-params", "log-level=quiet");
    }

    let mut carried: Vec<(&String, &String)> = request
        .source_tags
        .iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case("comment"))
        .collect();
    carried.sort();
    for (key, value) in carried {
        cmd.pair("-metadata", format!("{}={}", key, value));
    }

    let tag = settings.compression_tag(config);
    cmd.pair("-metadata", format!("comment={}", tag));

    cmd.arg(request.output);
    cmd
}

/// Build a stream-copy remux that rewrites only the comment tag
pub fn build_tag_patch_command(ffmpeg_bin: &Path, input: &Path, output: &Path, comment: &str) -> EncodeCommand {
    let mut cmd = EncodeCommand::new(ffmpeg_bin);
    cmd.arg("-hide_banner")
        .arg("-nostdin")
        .pair("-loglevel", "error")
        .arg("-y")
        .pair("-i", input)
        .pair("-map", "0")
        .pair("-c", "copy")
        .pair("-map_metadata", "0")
        .pair("-metadata", format!("comment={}", comment))
        .arg(output);
    cmd
}

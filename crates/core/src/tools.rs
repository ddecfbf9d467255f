use std::path::Path;
use std::process::Stdio;
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use tokio::process::Command;

use crate::config::{CompressionConfig, VideoCodec};
use crate::error::StartError;
use crate::ledger::CompressionTag;
use crate::preset::{preset_for_speed, preset_rank, DEFAULT_PRESETS, NVENC_PRESETS};

/// Hardware features the installed ffmpeg offers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub hevc_nvenc: bool,
    pub h264_nvenc: bool,
    pub cuda: bool,
}

impl Capabilities {
    /// Read `ffmpeg -encoders` and `ffmpeg -hwaccels` listings
    pub fn parse(encoders: &str, hwaccels: &str) -> Self {
        let has_encoder = |name: &str| {
            encoders
                .lines()
                .any(|line| line.split_whitespace().nth(1) == Some(name))
        };
        Self {
            hevc_nvenc: has_encoder("hevc_nvenc"),
            h264_nvenc: has_encoder("h264_nvenc"),
            cuda: hwaccels.lines().any(|line| line.trim() == "cuda"),
        }
    }

    fn nvenc_for(&self, codec: VideoCodec) -> bool {
        match codec {
            VideoCodec::H265 => self.hevc_nvenc,
            VideoCodec::H264 => self.h264_nvenc,
        }
    }
}

/// Encoder choice for a run, fixed once at start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub video_encoder: String,
    pub nvenc: bool,
    pub cuda: bool,
    pub preset: &'static str,
    /// Efficiency rank of `preset`, what the ledger compares against
    pub preset_rank: u32,
}

impl EncoderSettings {
    pub fn resolve(config: &CompressionConfig, caps: &Capabilities) -> Self {
        let nvenc = config.hardware_acceleration && caps.nvenc_for(config.video_codec);
        let video_encoder = match (config.video_codec, nvenc) {
            (VideoCodec::H265, true) => "hevc_nvenc",
            (VideoCodec::H264, true) => "h264_nvenc",
            (VideoCodec::H265, false) => "libx265",
            (VideoCodec::H264, false) => "libx264",
        };
        let table = if nvenc { NVENC_PRESETS } else { DEFAULT_PRESETS };
        let preset = preset_for_speed(config.speed, table);

        Self {
            video_encoder: video_encoder.to_string(),
            nvenc,
            cuda: config.hardware_acceleration && caps.cuda,
            preset,
            preset_rank: preset_rank(preset).unwrap_or(0),
        }
    }

    /// Tag embedded in every output produced with these settings
    pub fn compression_tag(&self, config: &CompressionConfig) -> CompressionTag {
        CompressionTag {
            video_encoder: self.video_encoder.clone(),
            quality: config.quality,
            preset: self.preset.to_string(),
            audio_codec: config.audio_codec.clone(),
            audio_bitrate: config.audio_bitrate.clone(),
        }
    }
}

/// Check a tool answers `-version`
pub async fn verify_tool(bin: &Path) -> Result<(), StartError> {
    let status = Command::new(bin)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await;

    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => {
            debug!("{} -version exited with {}", bin.display(), s);
            Err(StartError::ToolMissing(bin.display().to_string()))
        }
        Err(e) => {
            debug!("{} -version failed to run: {}", bin.display(), e);
            Err(StartError::ToolMissing(bin.display().to_string()))
        }
    }
}

async fn listing(ffmpeg_bin: &Path, flag: &str) -> Result<String> {
    let output = Command::new(ffmpeg_bin)
        .arg("-hide_banner")
        .arg(flag)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to query {} {}", ffmpeg_bin.display(), flag))?;

    if !output.status.success() {
        return Err(anyhow!("{} {} exited with {}", ffmpeg_bin.display(), flag, output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Ask ffmpeg which hardware paths it supports
pub async fn detect_capabilities(ffmpeg_bin: &Path) -> Result<Capabilities> {
    let encoders = listing(ffmpeg_bin, "-encoders").await?;
    let hwaccels = listing(ffmpeg_bin, "-hwaccels").await?;
    Ok(Capabilities::parse(&encoders, &hwaccels))
}

/// Verify both tools and pick the encoder for this run
pub async fn prepare(config: &CompressionConfig) -> Result<EncoderSettings, StartError> {
    verify_tool(&config.ffmpeg_bin).await?;
    verify_tool(&config.ffprobe_bin).await?;

    let caps = if config.hardware_acceleration {
        match detect_capabilities(&config.ffmpeg_bin).await {
            Ok(caps) => caps,
            Err(e) => {
                warn!("Hardware detection failed, using software encoding: {:#}", e);
                Capabilities::default()
            }
        }
    } else {
        Capabilities::default()
    };

    let settings = EncoderSettings::resolve(config, &caps);
    info!(
        "🎬 Encoder: {} preset {}{}",
        settings.video_encoder,
        settings.preset,
        if settings.cuda { " (cuda decode)" } else { "" }
    );
    Ok(settings)
}

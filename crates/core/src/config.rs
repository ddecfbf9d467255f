use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::preset::DEFAULT_PRESETS;

/// Quality factor above which overwriting sources is no longer visually lossless
pub const VISUALLY_LOSSLESS_LIMIT: u32 = 18;

/// Video codec family; the concrete encoder is chosen at run start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    #[default]
    H265,
}

/// How much of the machine an encode may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "TierRepr")]
pub enum PerformanceTier {
    #[default]
    Background,
    Standard,
    Maximum,
}

/// Tiers may be written by name or by the legacy 0/1/2 index
#[derive(Deserialize)]
#[serde(untagged)]
enum TierRepr {
    Index(u8),
    Name(String),
}

impl TryFrom<TierRepr> for PerformanceTier {
    type Error = String;

    fn try_from(value: TierRepr) -> std::result::Result<Self, Self::Error> {
        match value {
            TierRepr::Index(0) => Ok(Self::Background),
            TierRepr::Index(1) => Ok(Self::Standard),
            TierRepr::Index(2) => Ok(Self::Maximum),
            TierRepr::Index(n) => Err(format!("unknown performance tier index {}", n)),
            TierRepr::Name(name) => match name.to_lowercase().as_str() {
                "background" => Ok(Self::Background),
                "standard" => Ok(Self::Standard),
                "maximum" => Ok(Self::Maximum),
                other => Err(format!("unknown performance tier '{}'", other)),
            },
        }
    }
}

/// Settings for one compression run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub video_codec: VideoCodec,
    pub audio_codec: String,
    /// Constant rate factor, lower is better quality
    #[serde(alias = "constant_rate_factor", alias = "crf")]
    pub quality: u32,
    /// Ordinal into the slow-to-fast preset table (0 = veryslow)
    pub speed: u32,
    #[serde(alias = "bitrate")]
    pub audio_bitrate: String,
    #[serde(alias = "performanceMode")]
    pub performance_mode: PerformanceTier,
    /// Replace sources in place instead of writing "(compressed)" siblings
    pub overwrite: bool,
    pub hardware_acceleration: bool,
    /// Only files with this extension are queued
    pub media_extension: String,
    /// Holds the single scratch output shared by all jobs
    pub scratch_dir: PathBuf,
    /// Per-day outcome logs
    pub log_dir: PathBuf,
    /// Start automatically on `autorun_path` when no root is given
    pub autorun: bool,
    #[serde(alias = "autorunPath")]
    pub autorun_path: Option<PathBuf>,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// Period of the progress tick in milliseconds
    pub progress_interval_ms: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl CompressionConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            video_codec: VideoCodec::H265,
            audio_codec: "libmp3lame".to_string(),
            quality: 23,
            speed: 3, // medium
            audio_bitrate: "320k".to_string(),
            performance_mode: PerformanceTier::Background,
            overwrite: false,
            hardware_acceleration: false,
            media_extension: "mp4".to_string(),
            scratch_dir: std::env::temp_dir().join("stomp"),
            log_dir: PathBuf::from("logs"),
            autorun: false,
            autorun_path: None,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            progress_interval_ms: 500,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no encoder invocation could be built from
    pub fn validate(&self) -> Result<()> {
        if self.quality > 51 {
            bail!("quality must be between 0 and 51, got {}", self.quality);
        }
        let max_speed = DEFAULT_PRESETS.len() as u32 - 1;
        if self.speed > max_speed {
            bail!("speed must be between 0 and {}, got {}", max_speed, self.speed);
        }
        if self.media_extension.trim_start_matches('.').is_empty() {
            bail!("media_extension must not be empty");
        }
        if self.progress_interval_ms == 0 {
            bail!("progress_interval_ms must be positive");
        }
        Ok(())
    }

    /// Non-fatal problems worth showing the operator before a run
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.overwrite && self.quality > VISUALLY_LOSSLESS_LIMIT {
            warnings.push(format!(
                "overwrite is enabled with quality {} (> {}): sources will be replaced with visibly lossy encodes",
                self.quality, VISUALLY_LOSSLESS_LIMIT
            ));
        }
        warnings
    }

    /// Extension without a leading dot, lowercased
    pub fn extension(&self) -> String {
        self.media_extension.trim_start_matches('.').to_lowercase()
    }

    /// The single scratch output every job writes to
    pub fn scratch_output(&self) -> PathBuf {
        self.scratch_dir.join(format!("data.{}", self.extension()))
    }

    /// Root to use when none was supplied explicitly
    pub fn autorun_root(&self) -> Option<&Path> {
        if self.autorun {
            self.autorun_path.as_deref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = CompressionConfig::default_config();
        assert_eq!(cfg.quality, 23);
        assert_eq!(cfg.speed, 3);
        assert_eq!(cfg.audio_bitrate, "320k");
        assert_eq!(cfg.video_codec, VideoCodec::H265);
        assert!(cfg.validate().is_ok());
        assert!(cfg.warnings().is_empty());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = CompressionConfig::load_config(Some(Path::new("/nonexistent/stomp.json"))).unwrap();
        assert_eq!(cfg, CompressionConfig::default_config());
    }

    #[test]
    fn test_legacy_json_keys() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"video_codec": "h264", "constant_rate_factor": 28, "speed": 5,
                "bitrate": "192k", "performanceMode": 2, "overwrite": true,
                "autorun": true, "autorunPath": "/media/videos"}}"#
        )
        .unwrap();

        let cfg = CompressionConfig::load_config(Some(file.path())).unwrap();
        assert_eq!(cfg.video_codec, VideoCodec::H264);
        assert_eq!(cfg.quality, 28);
        assert_eq!(cfg.speed, 5);
        assert_eq!(cfg.audio_bitrate, "192k");
        assert_eq!(cfg.performance_mode, PerformanceTier::Maximum);
        assert!(cfg.overwrite);
        assert_eq!(cfg.autorun_root(), Some(Path::new("/media/videos")));
        // untouched fields keep their defaults
        assert_eq!(cfg.audio_codec, "libmp3lame");
    }

    #[test]
    fn test_toml_config() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            "quality = 20\nperformance_mode = \"standard\"\nmedia_extension = \".MP4\"\n"
        )
        .unwrap();

        let cfg = CompressionConfig::load_config(Some(file.path())).unwrap();
        assert_eq!(cfg.quality, 20);
        assert_eq!(cfg.performance_mode, PerformanceTier::Standard);
        assert_eq!(cfg.extension(), "mp4");
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut cfg = CompressionConfig::default_config();
        cfg.speed = 9;
        assert!(cfg.validate().is_err());

        let mut cfg = CompressionConfig::default_config();
        cfg.quality = 52;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unknown_tier_rejected() {
        let result: std::result::Result<CompressionConfig, _> =
            serde_json::from_str(r#"{"performanceMode": 7}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_lossy_overwrite_warning() {
        let mut cfg = CompressionConfig::default_config();
        cfg.overwrite = true;
        cfg.quality = 18;
        assert!(cfg.warnings().is_empty());
        cfg.quality = 19;
        assert_eq!(cfg.warnings().len(), 1);
    }

    #[test]
    fn test_autorun_requires_flag() {
        let mut cfg = CompressionConfig::default_config();
        cfg.autorun_path = Some(PathBuf::from("/media"));
        assert_eq!(cfg.autorun_root(), None);
        cfg.autorun = true;
        assert_eq!(cfg.autorun_root(), Some(Path::new("/media")));
    }
}

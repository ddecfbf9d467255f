use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use regex::Regex;

use crate::preset::preset_rank;

/// Sentinel that marks a comment as written by this tool
pub const COMPRESSION_SENTINEL: &str = "ffmpeg";

/// Prefix of the tag left on sources whose encode did not shrink them
pub const NOT_IMPROVED_PREFIX: &str = "< ";

static SETTINGS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-crf (\d+) -preset (\w+)\)").expect("valid settings regex"));

/// Settings recorded in an output's `comment` tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionTag {
    pub video_encoder: String,
    pub quality: u32,
    pub preset: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
}

impl CompressionTag {
    /// Tag text for a source that was tried with these settings but did not shrink
    pub fn not_improved(&self) -> String {
        format!("{}{}", NOT_IMPROVED_PREFIX, self)
    }
}

impl fmt::Display for CompressionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (-c:v {} -crf {} -preset {} -c:a {} -b:a {})",
            COMPRESSION_SENTINEL,
            self.video_encoder,
            self.quality,
            self.preset,
            self.audio_codec,
            self.audio_bitrate
        )
    }
}

/// How a file's existing tag compares to the requested settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No compression tag; never processed
    Untagged,
    /// Processed before with weaker settings
    Weaker { quality: u32, preset: String },
    /// Processed before with settings at least as strong
    Adequate { quality: u32, preset: String },
    /// Carries the sentinel but the settings cannot be read
    Unreadable,
}

impl Verdict {
    pub fn needs_compression(&self) -> bool {
        matches!(self, Verdict::Untagged | Verdict::Weaker { .. })
    }
}

/// Find the comment tag; container tag keys vary in case
pub fn comment_tag(tags: &HashMap<String, String>) -> Option<&str> {
    tags.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("comment"))
        .map(|(_, v)| v.as_str())
}

/// Classify a file's tags against the requested quality and preset rank.
///
/// Every encode carries a [`CompressionTag`] in its comment; a file is worth
/// encoding again only if its tag records weaker settings.
pub fn assess(tags: &HashMap<String, String>, quality: u32, rank: u32) -> Verdict {
    let Some(comment) = comment_tag(tags) else {
        return Verdict::Untagged;
    };
    if !comment.contains(COMPRESSION_SENTINEL) {
        return Verdict::Untagged;
    }

    let Some(caps) = SETTINGS_RE.captures(comment) else {
        return Verdict::Unreadable;
    };
    let Ok(embedded_quality) = caps[1].parse::<u32>() else {
        return Verdict::Unreadable;
    };
    let preset = caps[2].to_string();
    let Some(embedded_rank) = preset_rank(&preset) else {
        return Verdict::Unreadable;
    };

    // Either axis being weaker is enough to try again
    if embedded_quality > quality || embedded_rank < rank {
        Verdict::Weaker {
            quality: embedded_quality,
            preset,
        }
    } else {
        Verdict::Adequate {
            quality: embedded_quality,
            preset,
        }
    }
}

/// Whether a file with these tags should be (re-)encoded
pub fn should_compress(tags: &HashMap<String, String>, quality: u32, rank: u32) -> bool {
    assess(tags, quality, rank).needs_compression()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::{DEFAULT_PRESETS, MAX_RANK};
    use proptest::prelude::*;

    fn tag(quality: u32, preset: &str) -> CompressionTag {
        CompressionTag {
            video_encoder: "libx265".to_string(),
            quality,
            preset: preset.to_string(),
            audio_codec: "libmp3lame".to_string(),
            audio_bitrate: "320k".to_string(),
        }
    }

    fn tags_with_comment(comment: &str) -> HashMap<String, String> {
        let mut tags = HashMap::new();
        tags.insert("comment".to_string(), comment.to_string());
        tags
    }

    #[test]
    fn test_tag_rendering() {
        assert_eq!(
            tag(23, "medium").to_string(),
            "ffmpeg (-c:v libx265 -crf 23 -preset medium -c:a libmp3lame -b:a 320k)"
        );
        assert!(tag(23, "medium").not_improved().starts_with("< ffmpeg ("));
    }

    #[test]
    fn test_untagged_files_compress() {
        assert!(should_compress(&HashMap::new(), 23, 5));
        assert!(should_compress(&tags_with_comment("family trip"), 23, 5));
    }

    #[test]
    fn test_requested_settings_scenario() {
        // requested quality 20 at rank 3 ("faster")
        let a = tags_with_comment(&tag(28, "faster").to_string());
        assert!(should_compress(&a, 20, 3));

        let b = tags_with_comment(&tag(18, "medium").to_string());
        assert!(!should_compress(&b, 20, 3));
    }

    #[test]
    fn test_faster_preset_is_retried() {
        let tags = tags_with_comment(&tag(20, "ultrafast").to_string());
        assert_eq!(
            assess(&tags, 23, 5),
            Verdict::Weaker { quality: 20, preset: "ultrafast".to_string() }
        );
    }

    #[test]
    fn test_not_improved_tag_counts_as_processed() {
        let tags = tags_with_comment(&tag(23, "medium").not_improved());
        assert!(!should_compress(&tags, 23, 5));
    }

    #[test]
    fn test_unreadable_tags_are_skipped() {
        assert_eq!(assess(&tags_with_comment("ffmpeg (-crf -preset)"), 23, 5), Verdict::Unreadable);
        let unknown_preset = tags_with_comment("ffmpeg (-c:v x -crf 20 -preset p7)");
        assert_eq!(assess(&unknown_preset, 23, 5), Verdict::Unreadable);
        let huge = tags_with_comment("ffmpeg (-crf 99999999999999999999 -preset slow)");
        assert!(!should_compress(&huge, 23, 5));
    }

    #[test]
    fn test_comment_key_case_insensitive() {
        let mut tags = HashMap::new();
        tags.insert("COMMENT".to_string(), tag(18, "slow").to_string());
        assert!(!should_compress(&tags, 23, 5));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_at_least_as_strong_is_skipped(
            requested_q in 0u32..=51,
            requested_rank in 0u32..=MAX_RANK,
            q_delta in 0u32..=20,
            rank_delta in 0u32..=MAX_RANK,
        ) {
            let embedded_q = requested_q.saturating_sub(q_delta);
            let embedded_rank = (requested_rank + rank_delta).min(MAX_RANK);
            let preset = DEFAULT_PRESETS[(MAX_RANK - embedded_rank) as usize];
            let tags = tags_with_comment(&tag(embedded_q, preset).to_string());
            prop_assert!(!should_compress(&tags, requested_q, requested_rank));
        }

        #[test]
        fn test_own_tag_round_trips_to_skip(q in 0u32..=51, speed in 0usize..DEFAULT_PRESETS.len()) {
            let preset = DEFAULT_PRESETS[speed];
            let rank = preset_rank(preset).unwrap();
            let tags = tags_with_comment(&tag(q, preset).to_string());
            prop_assert!(!should_compress(&tags, q, rank));
        }
    }
}

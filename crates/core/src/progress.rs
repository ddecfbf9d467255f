use std::sync::LazyLock;
use regex::Regex;

static FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").expect("valid frame regex"));
static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"size=\s*(\d+)\s*(kB|KiB)").expect("valid size regex"));

/// Markers found in one line of encoder output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressLine {
    pub frame: Option<u64>,
    /// Output written so far, in bytes
    pub size_bytes: Option<u64>,
}

impl ProgressLine {
    pub fn parse(line: &str) -> Self {
        let frame = FRAME_RE
            .captures(line)
            .and_then(|c| c[1].parse::<u64>().ok());
        let size_bytes = SIZE_RE.captures(line).and_then(|c| {
            let n = c[1].parse::<u64>().ok()?;
            let unit = if &c[2] == "KiB" { 1024 } else { 1000 };
            n.checked_mul(unit)
        });
        Self { frame, size_bytes }
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_none() && self.size_bytes.is_none()
    }
}

/// Percentage of `total` frames done, clamped to [0, 100]
pub fn percent_complete(frame: u64, total: Option<u64>) -> Option<f64> {
    match total {
        Some(total) if total > 0 => Some((frame as f64 / total as f64 * 100.0).clamp(0.0, 100.0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_typical_stats_line() {
        let line = "frame=  240 fps= 48 q=28.0 size=    1536kB time=00:00:10.00 bitrate=1258.3kbits/s speed=2.0x";
        let parsed = ProgressLine::parse(line);
        assert_eq!(parsed.frame, Some(240));
        assert_eq!(parsed.size_bytes, Some(1_536_000));
    }

    #[test]
    fn test_kibibyte_sizes() {
        let parsed = ProgressLine::parse("frame=10 fps=0.0 q=0.0 size=       2KiB time=N/A");
        assert_eq!(parsed.size_bytes, Some(2048));
    }

    #[test]
    fn test_unrelated_lines() {
        assert!(ProgressLine::parse("Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'a.mp4':").is_empty());
        assert!(ProgressLine::parse("size=N/A time=00:00:01.00").is_empty());
    }

    #[test]
    fn test_percent_clamped() {
        assert_eq!(percent_complete(50, Some(200)), Some(25.0));
        assert_eq!(percent_complete(300, Some(200)), Some(100.0));
        assert_eq!(percent_complete(10, Some(0)), None);
        assert_eq!(percent_complete(10, None), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_percent_always_in_range(frame in 0u64..10_000_000, total in 1u64..10_000_000) {
            let pct = percent_complete(frame, Some(total)).unwrap();
            prop_assert!((0.0..=100.0).contains(&pct));
        }

        #[test]
        fn test_frame_marker_found_anywhere(prefix in "[a-z ]{0,10}", frame in 0u64..1_000_000, pad in 0usize..6) {
            let line = format!("{}frame={}{} fps=30", prefix, " ".repeat(pad), frame);
            prop_assert_eq!(ProgressLine::parse(&line).frame, Some(frame));
        }
    }
}

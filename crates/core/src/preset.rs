/// Canonical x264/x265 speed presets, slowest first
pub const DEFAULT_PRESETS: &[&str] = &[
    "veryslow", "slower", "slow", "medium", "fast", "faster", "veryfast", "superfast", "ultrafast",
];

/// Presets understood by the NVENC encoders, slowest first
pub const NVENC_PRESETS: &[&str] = &["slow", "medium", "fast"];

/// Highest rank a preset can have (`veryslow`)
pub const MAX_RANK: u32 = DEFAULT_PRESETS.len() as u32 - 1;

/// Efficiency rank of a preset name: `veryslow` is 8, `ultrafast` is 0.
///
/// A higher rank compresses harder, so a file already encoded at a rank at
/// least as high as the requested one has nothing left to gain.
pub fn preset_rank(name: &str) -> Option<u32> {
    DEFAULT_PRESETS
        .iter()
        .position(|p| p.eq_ignore_ascii_case(name))
        .map(|idx| MAX_RANK - idx as u32)
}

/// Pick the preset for a speed ordinal (0..=8) from an encoder's table,
/// scaling the ordinal when the table is shorter than the canonical one.
pub fn preset_for_speed(speed: u32, table: &'static [&'static str]) -> &'static str {
    let last = table.len().saturating_sub(1);
    let speed = speed.min(MAX_RANK) as f64;
    let idx = (speed / MAX_RANK as f64 * last as f64).round() as usize;
    table[idx.min(last)]
}

//! Pitch-shift filter chain and per-format codec presets.

use crate::format::AudioFormat;
use log::debug;
use strum_macros::Display;

/// Reference pitch the output is tuned to
pub const TARGET_PITCH_HZ: u32 = 432;
/// Reference pitch the source is assumed to be tuned to
pub const SOURCE_PITCH_HZ: u32 = 440;
/// Sample rate every converted file is resampled to
pub const DEFAULT_TARGET_SAMPLE_RATE: u32 = 48_000;

const BITRATE_FLAG: &str = "-b:a";
const GENERIC_LOSSY: &[&str] = &["-c:a", "aac", "-b:a", "320k"];

/// Codec preset tier. `Safe` is only tried after `Hq` failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum QualityTier {
    #[strum(serialize = "HQ")]
    Hq,
    #[strum(serialize = "Safe")]
    Safe,
}

/// Builds the ffmpeg `-af` chain.
///
/// The stream is first reinterpreted at `original_rate * 432/440`, which
/// lowers pitch (and slows playback) by exactly that ratio, then resampled
/// to `target_rate`. No tempo correction is applied.
pub fn pitch_filter_chain(original_rate: u32, target_rate: u32) -> String {
    format!(
        "asetrate={}*{}/{},aresample={}",
        original_rate, TARGET_PITCH_HZ, SOURCE_PITCH_HZ, target_rate
    )
}

fn table(format: AudioFormat, tier: QualityTier) -> &'static [&'static str] {
    use AudioFormat::*;
    use QualityTier::*;
    match (format, tier) {
        (Mp3, Hq) => &["-c:a", "libmp3lame", "-b:a", "320k", "-compression_level", "0"],
        (Mp3, Safe) => &["-c:a", "libmp3lame", "-b:a", "320k"],
        (M4a, Hq) => &["-c:a", "aac", "-b:a", "512k", "-movflags", "+faststart"],
        (M4a, Safe) => &["-c:a", "aac", "-b:a", "256k", "-movflags", "+faststart"],
        (Aac, Hq) => &["-c:a", "aac", "-b:a", "512k"],
        (Aac, Safe) => &["-c:a", "aac", "-b:a", "256k"],
        (Flac, Hq) => &["-c:a", "flac", "-compression_level", "8"],
        (Flac, Safe) => &["-c:a", "flac"],
        (Wav, Hq) => &["-c:a", "pcm_s24le"],
        (Wav, Safe) => &["-c:a", "pcm_s16le"],
        (Wma, Hq) => &["-c:a", "wmapro", "-b:a", "320k"],
        (Wma, Safe) => &["-c:a", "wmav2", "-b:a", "192k"],
        (Ogg, Hq) => &["-c:a", "libvorbis", "-b:a", "320k"],
        (Ogg, Safe) => &["-c:a", "libvorbis", "-q:a", "6"],
        (Opus, Hq) => &["-c:a", "libopus", "-b:a", "256k"],
        (Opus, Safe) => &["-c:a", "libopus", "-b:a", "160k"],
    }
}

/// Codec arguments for an output extension at the given tier, before any
/// bitrate adjustment. Unknown extensions get a generic high-bitrate AAC.
pub fn codec_args(extension: &str, tier: QualityTier) -> Vec<String> {
    AudioFormat::from_extension(extension)
        .map_or(GENERIC_LOSSY, |format| table(format, tier))
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Codec arguments with the source bitrate cap applied.
///
/// Lossless outputs are never adjusted.
pub fn codec_args_for_source(
    extension: &str,
    tier: QualityTier,
    source_bit_rate: Option<u64>,
) -> Vec<String> {
    let args = codec_args(extension, tier);
    match AudioFormat::from_extension(extension) {
        Some(format) if format.is_lossless() => args,
        _ => cap_bitrate(args, source_bit_rate),
    }
}

/// Lowers the `-b:a` value to the source bitrate when the source is known to
/// be poorer than the preset. The value is truncated to whole kbps.
pub fn cap_bitrate(mut args: Vec<String>, source_bit_rate: Option<u64>) -> Vec<String> {
    let Some(source_bps) = source_bit_rate else {
        return args;
    };
    let Some(idx) = args.iter().position(|a| a == BITRATE_FLAG) else {
        return args;
    };
    let Some(value) = args.get_mut(idx + 1) else {
        return args;
    };
    if let Some(preset_bps) = parse_bitrate(value) {
        if source_bps < preset_bps {
            let capped = format!("{}k", (source_bps / 1000).max(1));
            debug!("Capping bitrate from {} to source {}", value, capped);
            *value = capped;
        }
    }
    args
}

/// Parses an ffmpeg bitrate such as `320k` or `128000` into bits/sec
pub fn parse_bitrate(value: &str) -> Option<u64> {
    let lower = value.to_ascii_lowercase();
    match lower.strip_suffix('k') {
        Some(kbps) => kbps.parse::<u64>().ok().map(|k| k * 1000),
        None => lower.parse().ok(),
    }
}

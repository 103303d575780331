//! Reading sample rate and bitrate of the first audio stream.
//!
//! ffprobe's JSON is tried first. Some damaged or unusual containers make
//! ffprobe refuse while ffmpeg still prints usable stream info in its banner,
//! so that is the second source. If both come up empty the caller can still
//! proceed with [`DEFAULT_SAMPLE_RATE`].

use crate::process::CommandRunner;
use crate::toolchain::ToolchainPaths;
use log::{debug, info, warn};
use regex_lite::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::ffi::OsString;
use std::path::Path;
use std::sync::OnceLock;

/// Sample rate assumed when nothing could be read from the file
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Stream properties read from a source file. `None` means the value could
/// not be determined, never zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioStreamInfo {
    pub sample_rate_hz: Option<u32>,
    pub bit_rate_bps: Option<u64>,
}

impl AudioStreamInfo {
    #[inline]
    pub fn sample_rate_or_default(&self) -> u32 {
        self.sample_rate_hz.unwrap_or(DEFAULT_SAMPLE_RATE)
    }
}

/// Which step of the fallback chain produced the sample rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeSource {
    Inspector,
    EncoderBanner,
    Assumed,
}

/// Probes `path`, always returning a sample rate.
///
/// This never fails; every problem along the way is logged and degrades to
/// the next fallback.
pub fn probe<R: CommandRunner + ?Sized>(
    toolchain: &ToolchainPaths,
    runner: &R,
    path: &Path,
) -> AudioStreamInfo {
    let (mut info, source) = probe_with_source(toolchain, runner, path);
    if source == ProbeSource::Assumed {
        info.sample_rate_hz = Some(DEFAULT_SAMPLE_RATE);
    }
    info
}

/// Like [`probe`] but leaves an unresolved sample rate as `None` and reports
/// where the answer came from.
pub fn probe_with_source<R: CommandRunner + ?Sized>(
    toolchain: &ToolchainPaths,
    runner: &R,
    path: &Path,
) -> (AudioStreamInfo, ProbeSource) {
    let name = path.file_name().unwrap_or_default().to_string_lossy();

    let inspected = probe_inspector(toolchain, runner, path);
    if inspected.sample_rate_hz.is_some() {
        info!("Got metadata for {} via ffprobe", name);
        return (inspected, ProbeSource::Inspector);
    }
    warn!("ffprobe failed for {}. Falling back to ffmpeg.", name);

    // a bit rate from ffprobe survives unless the banner reports its own
    let banner = probe_encoder(toolchain, runner, path);
    let info = AudioStreamInfo {
        sample_rate_hz: banner.sample_rate_hz,
        bit_rate_bps: banner.bit_rate_bps.or(inspected.bit_rate_bps),
    };
    if info.sample_rate_hz.is_some() {
        info!("Got sample rate for {} via ffmpeg fallback", name);
        return (info, ProbeSource::EncoderBanner);
    }

    warn!(
        "All methods failed to get metadata for {}. Assuming {} Hz.",
        name, DEFAULT_SAMPLE_RATE
    );
    (info, ProbeSource::Assumed)
}

fn probe_inspector<R: CommandRunner + ?Sized>(
    toolchain: &ToolchainPaths,
    runner: &R,
    path: &Path,
) -> AudioStreamInfo {
    let args: Vec<OsString> = [
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_streams",
        "-select_streams",
        "a:0",
    ]
    .into_iter()
    .map(OsString::from)
    .chain(std::iter::once(path.as_os_str().to_owned()))
    .collect();

    let output = runner.run(toolchain.inspector(), &args);
    if !output.success() {
        debug!("ffprobe exited with {} for {}", output.status, path.display());
        return AudioStreamInfo::default();
    }
    parse_inspector_json(&output.stdout_lossy())
}

fn probe_encoder<R: CommandRunner + ?Sized>(
    toolchain: &ToolchainPaths,
    runner: &R,
    path: &Path,
) -> AudioStreamInfo {
    // `ffmpeg -i <file>` without an output always exits non-zero; the banner
    // on stderr is all that matters here.
    let args = [OsString::from("-i"), path.as_os_str().to_owned()];
    let output = runner.run(toolchain.encoder(), &args);
    parse_encoder_banner(&output.stderr_lossy())
}

#[derive(Deserialize)]
struct InspectorOutput {
    #[serde(default)]
    streams: Vec<InspectorStream>,
}

#[derive(Deserialize)]
struct InspectorStream {
    sample_rate: Option<Value>,
    bit_rate: Option<Value>,
}

/// Extracts the first stream's rates from `ffprobe -print_format json`
/// output. Missing or non-numeric fields come back as `None`.
pub fn parse_inspector_json(json: &str) -> AudioStreamInfo {
    let parsed: InspectorOutput = match serde_json::from_str(json) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Unparseable ffprobe output: {}", e);
            return AudioStreamInfo::default();
        }
    };
    let Some(stream) = parsed.streams.first() else {
        return AudioStreamInfo::default();
    };
    AudioStreamInfo {
        sample_rate_hz: numeric(stream.sample_rate.as_ref())
            .and_then(|sr| u32::try_from(sr).ok())
            .filter(|&sr| sr > 0),
        bit_rate_bps: numeric(stream.bit_rate.as_ref()).filter(|&br| br > 0),
    }
}

/// ffprobe reports numbers as strings; accept those when made only of digits
fn numeric(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn sample_rate_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s+Hz").expect("valid sample rate pattern"))
}

fn bit_rate_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s+kb/s").expect("valid bit rate pattern"))
}

/// Scans ffmpeg's diagnostic banner for the first `<n> Hz` and `<n> kb/s`.
pub fn parse_encoder_banner(text: &str) -> AudioStreamInfo {
    let first_number = |re: &Regex| {
        re.captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
    };
    AudioStreamInfo {
        sample_rate_hz: first_number(sample_rate_pattern())
            .and_then(|sr| u32::try_from(sr).ok())
            .filter(|&sr| sr > 0),
        bit_rate_bps: first_number(bit_rate_pattern()).map(|kbps| kbps * 1000),
    }
}

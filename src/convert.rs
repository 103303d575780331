//! Running ffmpeg on one file with the HQ → Safe retry.

use crate::error::Error;
use crate::policy::{self, DEFAULT_TARGET_SAMPLE_RATE, QualityTier};
use crate::probe::{self, AudioStreamInfo};
use crate::process::{CommandRunner, ProcessOutput, SystemRunner};
use crate::toolchain::ToolchainPaths;
use log::{debug, info, warn};
use regex_lite::Regex;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// How many meaningful stderr lines are kept per failed attempt
const DIAGNOSTIC_TAIL: usize = 15;
const NO_DIAGNOSTICS: &str = "(no ffmpeg stderr captured)";

/// One source file to convert, consumed by [`Converter::convert_one`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionTask {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub sample_rate_hz: u32,
    pub bit_rate_bps: Option<u64>,
}

impl ConversionTask {
    /// Builds a task from probe results, defaulting an unknown sample rate
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, info: AudioStreamInfo) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            sample_rate_hz: info.sample_rate_or_default(),
            bit_rate_bps: info.bit_rate_bps,
        }
    }
}

/// Why a file was not converted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A non-empty file already sits at the destination
    DestinationExists(PathBuf),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DestinationExists(path) => write!(f, "{} already exists", path.display()),
        }
    }
}

/// A per-file failure, kept as text so it can travel across threads and be
/// shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub source: PathBuf,
    pub message: String,
}

impl FileFailure {
    pub fn new(source: impl Into<PathBuf>, error: &Error) -> Self {
        Self {
            source: source.into(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for FileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.source.file_name().unwrap_or_default().to_string_lossy();
        write!(f, "{}: {}", name, self.message)
    }
}

/// Result of handling one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionOutcome {
    /// Written by the given tier. `Safe` means HQ failed first.
    Success { tier: QualityTier },
    Skipped(SkipReason),
    Failed(FileFailure),
}

impl ConversionOutcome {
    /// Converted, but only by the fallback tier
    #[inline]
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            Self::Success {
                tier: QualityTier::Safe
            }
        )
    }
}

/// Drives ffmpeg/ffprobe for single files.
///
/// Holds the verified toolchain and the process runner; shared read-only by
/// the batch worker.
#[derive(Debug)]
pub struct Converter<R = SystemRunner> {
    toolchain: ToolchainPaths,
    runner: R,
    target_sample_rate: u32,
}

impl Converter<SystemRunner> {
    pub fn new(toolchain: ToolchainPaths, process_timeout: Option<Duration>) -> Self {
        Self::with_runner(toolchain, SystemRunner::new(process_timeout))
    }
}

impl<R: CommandRunner> Converter<R> {
    pub fn with_runner(toolchain: ToolchainPaths, runner: R) -> Self {
        Self {
            toolchain,
            runner,
            target_sample_rate: DEFAULT_TARGET_SAMPLE_RATE,
        }
    }

    /// Sets the sample rate every output is resampled to
    pub fn target_sample_rate(mut self, hz: u32) -> Self {
        self.target_sample_rate = hz;
        self
    }

    #[inline]
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Reads stream info of `path`; see [`probe::probe`]
    pub fn probe(&self, path: &Path) -> AudioStreamInfo {
        probe::probe(&self.toolchain, &self.runner, path)
    }

    /// Full ffmpeg argument list for one attempt at `tier`.
    ///
    /// The codec preset is picked from the destination extension.
    pub fn build_arguments(&self, task: &ConversionTask, tier: QualityTier) -> Vec<OsString> {
        let chain = policy::pitch_filter_chain(task.sample_rate_hz, self.target_sample_rate);
        let extension = task
            .destination
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        let codec = policy::codec_args_for_source(&extension, tier, task.bit_rate_bps);

        let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), task.source.clone().into()];
        args.extend(
            ["-map", "0:a?", "-map", "0:v?", "-c:v", "copy", "-af"]
                .into_iter()
                .map(OsString::from),
        );
        args.push(chain.into());
        args.extend(codec.into_iter().map(OsString::from));
        args.push(task.destination.clone().into());
        args
    }

    /// Converts one file: HQ first, then Safe.
    ///
    /// The destination directory is created up front. ffmpeg owns writing
    /// the output file itself.
    pub fn convert_one(&self, task: &ConversionTask) -> ConversionOutcome {
        match self.try_convert(task) {
            Ok(tier) => ConversionOutcome::Success { tier },
            Err(e) => ConversionOutcome::Failed(FileFailure::new(&task.source, &e)),
        }
    }

    fn try_convert(&self, task: &ConversionTask) -> Result<QualityTier, Error> {
        let name = task.source.file_name().unwrap_or_default().to_string_lossy();
        info!(
            "Converting {} to {} (source rate {} Hz, target rate {} Hz)",
            task.source.display(),
            task.destination.display(),
            task.sample_rate_hz,
            self.target_sample_rate
        );
        if let Some(parent) = task.destination.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let hq = self.attempt(task, QualityTier::Hq);
        if hq.success() {
            info!("Converted {} with HQ settings", name);
            return Ok(QualityTier::Hq);
        }
        let hq_diagnostics = clean_diagnostics(&hq.stderr);
        warn!(
            "HQ conversion failed for {} ({}). Retrying with safe settings. Error:\n{}",
            name, hq.status, hq_diagnostics
        );

        let safe = self.attempt(task, QualityTier::Safe);
        if safe.success() {
            info!("Converted {} with Safe settings", name);
            return Ok(QualityTier::Safe);
        }

        Err(Error::Conversion {
            path: task.source.clone(),
            status: safe.status,
            hq: hq_diagnostics,
            safe: clean_diagnostics(&safe.stderr),
        })
    }

    fn attempt(&self, task: &ConversionTask, tier: QualityTier) -> ProcessOutput {
        let args = self.build_arguments(task, tier);
        debug!("{} attempt for {}", tier, task.source.display());
        self.runner.run(self.toolchain.encoder(), &args)
    }
}

fn noise_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"^\s*(ffmpeg version\b|",
            r"built with\b|",
            r"configuration:|",
            r"lib(?:av|sw|postproc)\w*\s+.*?\s+/\s+.*|",
            r"--(?:[a-zA-Z0-9_-]+=.*|[\w-]+)|",
            r"Incorrect BOM value|",
            r"Error reading comment frame, skipped)"
        ))
        .expect("valid ffmpeg noise pattern")
    })
}

/// Strips ffmpeg's version/build banner and known harmless warnings from
/// `stderr` and keeps the last few lines that remain.
pub fn clean_diagnostics(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let meaningful: Vec<&str> = text
        .lines()
        .filter(|line| !noise_pattern().is_match(line))
        .collect();
    if meaningful.is_empty() {
        return NO_DIAGNOSTICS.to_string();
    }
    let start = meaningful.len().saturating_sub(DIAGNOSTIC_TAIL);
    meaningful[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessStatus;
    use crate::test_support::{FakeRunner, exited, fake_toolchain, is_inspector};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const NOISY_STDERR: &str = "ffmpeg version 6.1 Copyright (c) 2000-2023 the FFmpeg developers\n\
        \x20 built with gcc 13.2.0\n\
        configuration: --enable-gpl --enable-libmp3lame\n\
        libavutil      58. 29.100 / 58. 29.100\n\
        Incorrect BOM value\n\
        Error reading comment frame, skipped\n\
        [libmp3lame @ 0x1] Unsupported compression level\n\
        Error initializing output stream 0:0\n";

    fn task(dir: &TempDir, destination: &str) -> ConversionTask {
        ConversionTask {
            source: dir.path().join("in").join("song.mp3"),
            destination: dir.path().join("out").join("nested").join(destination),
            sample_rate_hz: 44_100,
            bit_rate_bps: Some(320_000),
        }
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn arguments_preserve_streams_and_apply_chain() {
        let dir = TempDir::new().unwrap();
        let converter = Converter::with_runner(fake_toolchain(), FakeRunner::new(|_, _| exited(0, "", "")));
        let task = task(&dir, "song_432.mp3");
        let args = strings(&converter.build_arguments(&task, QualityTier::Hq));

        assert_eq!(args[0], "-y");
        assert_eq!(&args[1..3], ["-i", task.source.to_str().unwrap()]);
        assert_eq!(
            &args[3..10],
            ["-map", "0:a?", "-map", "0:v?", "-c:v", "copy", "-af"]
        );
        assert_eq!(args[10], "asetrate=44100*432/440,aresample=48000");
        assert_eq!(
            &args[11..args.len() - 1],
            ["-c:a", "libmp3lame", "-b:a", "320k", "-compression_level", "0"]
        );
        assert_eq!(args.last().unwrap(), task.destination.to_str().unwrap());
    }

    #[test]
    fn arguments_follow_destination_and_source_bitrate() {
        let dir = TempDir::new().unwrap();
        let converter = Converter::with_runner(fake_toolchain(), FakeRunner::new(|_, _| exited(0, "", "")))
            .target_sample_rate(44_100);
        let mut task = task(&dir, "song_432.m4a");
        task.bit_rate_bps = Some(96_000);
        task.sample_rate_hz = 22_050;

        let args = strings(&converter.build_arguments(&task, QualityTier::Safe));
        assert!(args.contains(&"asetrate=22050*432/440,aresample=44100".to_string()));
        assert!(args.contains(&"96k".to_string()));
        assert!(args.contains(&"+faststart".to_string()));
    }

    #[test]
    fn hq_success_runs_once() {
        let dir = TempDir::new().unwrap();
        let converter = Converter::with_runner(fake_toolchain(), FakeRunner::new(|_, _| exited(0, "", "noise")));
        let task = task(&dir, "song_432.mp3");

        let outcome = converter.convert_one(&task);
        assert_eq!(outcome, ConversionOutcome::Success { tier: QualityTier::Hq });
        assert!(!outcome.is_degraded());
        assert_eq!(converter.runner().call_count(), 1);
        assert!(task.destination.parent().unwrap().is_dir());
    }

    #[test]
    fn hq_failure_retries_with_safe() {
        let dir = TempDir::new().unwrap();
        let attempts = AtomicUsize::new(0);
        let runner = FakeRunner::new(move |_, _| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                exited(1, "", NOISY_STDERR)
            } else {
                exited(0, "", "")
            }
        });
        let converter = Converter::with_runner(fake_toolchain(), runner);
        let mut task = task(&dir, "song_432.m4a");
        task.bit_rate_bps = None;

        let outcome = converter.convert_one(&task);
        assert_eq!(outcome, ConversionOutcome::Success { tier: QualityTier::Safe });
        assert!(outcome.is_degraded());

        let calls = converter.runner().conversion_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains(&"512k".to_string()));
        assert!(calls[1].contains(&"256k".to_string()));
    }

    #[test]
    fn hq_timeout_retries_with_safe() {
        let dir = TempDir::new().unwrap();
        let attempts = AtomicUsize::new(0);
        let runner = FakeRunner::new(move |_, _| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                ProcessOutput::new(ProcessStatus::TimedOut(Duration::from_secs(30)), Vec::new(), "")
            } else {
                exited(0, "", "")
            }
        });
        let converter = Converter::with_runner(fake_toolchain(), runner);

        let outcome = converter.convert_one(&task(&dir, "song_432.flac"));
        assert_eq!(outcome, ConversionOutcome::Success { tier: QualityTier::Safe });
        assert_eq!(converter.runner().call_count(), 2);
    }

    #[test]
    fn both_tiers_failing_reports_both_diagnostics() {
        let dir = TempDir::new().unwrap();
        let converter = Converter::with_runner(fake_toolchain(), FakeRunner::new(|_, args| {
            if args.contains(&"-compression_level".to_string()) {
                exited(1, "", NOISY_STDERR)
            } else {
                exited(8, "", "Safe attempt exploded")
            }
        }));

        let ConversionOutcome::Failed(failure) = converter.convert_one(&task(&dir, "song_432.mp3")) else {
            panic!("expected failure");
        };
        assert!(failure.source.ends_with("song.mp3"));
        let message = &failure.message;
        assert!(message.contains("HQ error:\n[libmp3lame @ 0x1] Unsupported compression level"));
        assert!(message.contains("Safe error:\nSafe attempt exploded"));
        assert!(message.contains("exit code 8"));
        assert!(!message.contains("configuration:"));
        assert!(failure.to_string().starts_with("song.mp3: "));
    }

    #[test]
    fn unwritable_destination_directory_fails_without_running() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("out");
        fs::write(&blocker, "a file where a directory should be").unwrap();
        let converter = Converter::with_runner(fake_toolchain(), FakeRunner::new(|_, _| exited(0, "", "")));

        let outcome = converter.convert_one(&task(&dir, "song_432.mp3"));
        assert!(matches!(outcome, ConversionOutcome::Failed(_)));
        assert_eq!(converter.runner().call_count(), 0);
    }

    #[test]
    fn probe_goes_through_the_configured_toolchain() {
        let converter = Converter::with_runner(fake_toolchain(), FakeRunner::new(|program, _| {
            assert!(is_inspector(program));
            exited(0, r#"{"streams":[{"sample_rate":"32000"}]}"#, "")
        }));
        let info = converter.probe(Path::new("a.wav"));
        assert_eq!(info.sample_rate_hz, Some(32_000));
    }

    #[test]
    fn task_defaults_unknown_sample_rate() {
        let task = ConversionTask::new("a.flac", "b.flac", AudioStreamInfo::default());
        assert_eq!(task.sample_rate_hz, probe::DEFAULT_SAMPLE_RATE);
        assert_eq!(task.bit_rate_bps, None);
    }

    #[test]
    fn diagnostics_drop_banner_and_keep_tail() {
        let cleaned = clean_diagnostics(NOISY_STDERR.as_bytes());
        assert_eq!(
            cleaned,
            "[libmp3lame @ 0x1] Unsupported compression level\nError initializing output stream 0:0"
        );

        let long: String = (1..=40).map(|i| format!("line {i}\n")).collect();
        let cleaned = clean_diagnostics(long.as_bytes());
        assert_eq!(cleaned.lines().count(), DIAGNOSTIC_TAIL);
        assert!(cleaned.starts_with("line 26"));
        assert!(cleaned.ends_with("line 40"));

        assert_eq!(clean_diagnostics(b""), NO_DIAGNOSTICS);
        assert_eq!(clean_diagnostics(b"ffmpeg version n7.0\n"), NO_DIAGNOSTICS);
    }
}

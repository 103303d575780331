/// Module for batch orchestration
pub mod batch;
/// Module for single-file conversion
pub mod convert;
/// Module for error handling
pub mod error;
/// Module for supported formats and output naming
pub mod format;
/// Module for filter chain and codec presets
pub mod policy;
/// Module for stream metadata probing
pub mod probe;
/// Module for running external processes
pub mod process;
/// Module for locating ffmpeg and ffprobe
pub mod toolchain;

#[cfg(test)]
mod test_support;

pub use crate::batch::{
    BatchEvent, BatchHandle, BatchRequest, BatchStatus, BatchSummary, discover_files, run_batch,
    spawn_batch,
};
pub use crate::convert::{ConversionOutcome, ConversionTask, Converter, FileFailure, SkipReason};
pub use crate::error::{Error, ToolchainError};
pub use crate::format::AudioFormat;
pub use crate::policy::QualityTier;
pub use crate::probe::AudioStreamInfo;
pub use crate::toolchain::{ToolchainPaths, resolve_toolchain};

use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration options for a folder conversion
#[derive(Debug, Clone)]
pub struct ConverterOptions {
    /// Folder containing the audio files to convert
    pub input_dir: PathBuf,
    /// Base folder for converted files. If not set, `<input>_432Hz` next to
    /// the input folder is used.
    pub output_dir: Option<PathBuf>,
    /// Descend into subfolders of the input folder
    pub recursive: bool,
    /// Keep destinations that already exist with nonzero size
    pub skip_existing: bool,
    /// ffmpeg executable or the folder containing ffmpeg and ffprobe
    pub toolchain_hint: Option<PathBuf>,
    /// Sample rate all outputs are resampled to
    pub target_sample_rate: u32,
    /// Upper bound for any single ffmpeg/ffprobe run. None waits forever.
    pub process_timeout: Option<Duration>,
}

impl Default for ConverterOptions {
    fn default() -> Self {
        ConverterOptions {
            input_dir: PathBuf::from("."),
            output_dir: None,
            recursive: false,
            skip_existing: false,
            toolchain_hint: None,
            target_sample_rate: policy::DEFAULT_TARGET_SAMPLE_RATE,
            process_timeout: None,
        }
    }
}

impl ConverterOptions {
    /// The output base folder, defaulting to a `_432Hz` sibling of the input
    pub fn resolved_output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| default_output_dir(&self.input_dir))
    }
}

/// `<parent>/<name>_432Hz` for an input folder `<parent>/<name>`
pub fn default_output_dir(input_dir: impl AsRef<Path>) -> PathBuf {
    let input_dir = input_dir.as_ref();
    let input_dir = fs::canonicalize(input_dir).unwrap_or_else(|_| input_dir.to_path_buf());
    let name = input_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input_dir
        .parent()
        .unwrap_or(&input_dir)
        .join(format!("{}_432Hz", name))
}

/// Validates options and creates the output folder if needed
///
/// # Returns
/// The output folder to use
pub fn validate_options(options: &ConverterOptions) -> Result<PathBuf, Error> {
    if !options.input_dir.is_dir() {
        return Err(Error::InvalidOptions(format!(
            "Input path is not a valid directory: {:?}",
            options.input_dir
        )));
    }
    if options.target_sample_rate == 0 {
        return Err(Error::InvalidOptions(
            "Target sample rate must be greater than zero".to_string(),
        ));
    }
    if options.process_timeout.is_some_and(|t| t.is_zero()) {
        return Err(Error::InvalidOptions(
            "Process timeout must be greater than zero".to_string(),
        ));
    }

    let output_dir = options.resolved_output_dir();
    if !output_dir.exists() {
        fs::create_dir_all(&output_dir).map_err(|e| Error::Io {
            path: output_dir.clone(),
            source: e,
        })?;
        info!("Created output directory: {:?}", output_dir);
    } else if !output_dir.is_dir() {
        return Err(Error::InvalidOptions(format!(
            "Output path exists but is not a directory: {:?}",
            output_dir
        )));
    }
    Ok(output_dir)
}

/// Validates `options`, discovers the files and starts converting them on a
/// worker thread.
///
/// `toolchain` must already be resolved; see [`resolve_toolchain`].
pub fn start_folder_conversion(
    options: &ConverterOptions,
    toolchain: ToolchainPaths,
) -> Result<BatchHandle, Error> {
    let output_dir = validate_options(options)?;

    info!("Discovering audio files in {:?}...", options.input_dir);
    let files = discover_files(&options.input_dir, options.recursive)?;
    info!("Found {} audio files.", files.len());

    let converter = Converter::new(toolchain, options.process_timeout)
        .target_sample_rate(options.target_sample_rate);
    let request = BatchRequest {
        source_root: options.input_dir.clone(),
        files,
        destination_root: output_dir,
        skip_existing: options.skip_existing,
    };
    Ok(spawn_batch(Arc::new(converter), request))
}

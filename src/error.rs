use std::path::PathBuf;

use crate::process::ProcessStatus;

/// Raised when ffmpeg/ffprobe cannot be located. This is the only failure
/// that stops a run before any file is touched.
#[derive(thiserror::Error, Debug)]
pub enum ToolchainError {
    #[error(
        "{tool} ('{candidate}') not found or not executable. Last attempt based on: {resolved_from}.\n\
         Search locations checked (in order):\n{}\n\n\
         Please ensure ffmpeg and ffprobe are installed, accessible via PATH, bundled next to the program, or pointed to explicitly.",
        .tried.join("\n")
    )]
    NotFound {
        tool: &'static str,
        candidate: PathBuf,
        resolved_from: String,
        tried: Vec<String>,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
    #[error("I/O error during processing of {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot derive a destination path for {path}")]
    Destination { path: PathBuf },
    #[error("Conversion failed for {path} (exit status: {status})\nHQ error:\n{hq}\nSafe error:\n{safe}")]
    Conversion {
        path: PathBuf,
        status: ProcessStatus,
        hq: String,
        safe: String,
    },
    #[error("Batch worker thread panicked")]
    WorkerPanicked,
}

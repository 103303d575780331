//! Sequential batch conversion of a folder.
//!
//! One worker converts files one at a time, in discovery order. Observers
//! get a [`BatchEvent`] stream over a channel and can cancel between files;
//! a conversion already running is always allowed to finish.

use crate::convert::{ConversionOutcome, ConversionTask, Converter, FileFailure, SkipReason};
use crate::error::Error;
use crate::format::{self, AudioFormat};
use crate::process::CommandRunner;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use walkdir::WalkDir;

/// Finds all supported audio files in `folder`, descending into
/// subdirectories only when `recursive` is set.
///
/// Files come back in directory-listing order.
pub fn discover_files(folder: impl AsRef<Path>, recursive: bool) -> Result<Vec<PathBuf>, Error> {
    let folder = folder.as_ref();
    if !folder.is_dir() {
        return Err(Error::InvalidOptions(format!(
            "Source path is not a valid directory: {:?}",
            folder
        )));
    }

    let mut walker = WalkDir::new(folder).min_depth(1).follow_links(true);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut audio_files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if entry.file_type().is_file() && AudioFormat::from_path(entry.path()).is_some() {
            audio_files.push(entry.into_path());
        }
    }
    Ok(audio_files)
}

/// What to convert and where
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Folder the files were discovered in; their paths below it are
    /// mirrored under `destination_root`
    pub source_root: PathBuf,
    pub files: Vec<PathBuf>,
    pub destination_root: PathBuf,
    /// Leave destinations that already exist with nonzero size alone
    pub skip_existing: bool,
}

/// Final state of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    NoFiles,
    AllSucceeded,
    CompletedWithFailures(usize),
    Cancelled,
}

/// Tally of a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    /// Files handled so far, whatever their outcome
    pub processed: usize,
    pub succeeded: usize,
    /// Succeeded only with the Safe preset; included in `succeeded`
    pub degraded: usize,
    pub skipped: usize,
    pub failures: Vec<FileFailure>,
    pub cancelled: bool,
}

impl BatchSummary {
    fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    #[inline]
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn status(&self) -> BatchStatus {
        if self.cancelled {
            BatchStatus::Cancelled
        } else if self.total == 0 {
            BatchStatus::NoFiles
        } else if self.failures.is_empty() {
            BatchStatus::AllSucceeded
        } else {
            BatchStatus::CompletedWithFailures(self.failures.len())
        }
    }

    fn record(&mut self, outcome: &ConversionOutcome) {
        self.processed += 1;
        match outcome {
            ConversionOutcome::Success { .. } => {
                self.succeeded += 1;
                if outcome.is_degraded() {
                    self.degraded += 1;
                }
            }
            ConversionOutcome::Skipped(_) => self.skipped += 1,
            ConversionOutcome::Failed(failure) => self.failures.push(failure.clone()),
        }
    }
}

/// Progress notifications from a running batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    Started {
        total: usize,
    },
    /// Sent once per file regardless of outcome; `completed` counts up from 1
    /// to `total`
    FileFinished {
        completed: usize,
        total: usize,
        source: PathBuf,
        outcome: ConversionOutcome,
    },
    Finished(BatchSummary),
}

/// Runs the batch on the current thread.
///
/// Per-file problems are recorded in the summary and never stop the loop.
/// `cancel` is checked before each file.
pub fn run_batch<R: CommandRunner>(
    converter: &Converter<R>,
    request: &BatchRequest,
    events: Option<&Sender<BatchEvent>>,
    cancel: &AtomicBool,
) -> BatchSummary {
    let notify = |event: BatchEvent| {
        if let Some(tx) = events {
            // A dropped receiver only means nobody is watching anymore
            let _ = tx.send(event);
        }
    };

    let total = request.files.len();
    let mut summary = BatchSummary::new(total);
    notify(BatchEvent::Started { total });
    if total == 0 {
        info!("No supported audio files found.");
    }

    for source in &request.files {
        if cancel.load(Ordering::SeqCst) {
            warn!(
                "Batch cancelled after {} of {} files",
                summary.processed, total
            );
            summary.cancelled = true;
            break;
        }

        let outcome = process_file(converter, request, source);
        match &outcome {
            ConversionOutcome::Failed(failure) => debug!("{}", failure),
            ConversionOutcome::Skipped(reason) => info!("Skipping {}: {}", source.display(), reason),
            ConversionOutcome::Success { .. } => {}
        }
        summary.record(&outcome);
        notify(BatchEvent::FileFinished {
            completed: summary.processed,
            total,
            source: source.clone(),
            outcome,
        });
    }

    info!(
        "Batch complete. {} converted ({} with safe settings), {} skipped, {} failed.",
        summary.succeeded,
        summary.degraded,
        summary.skipped,
        summary.failed()
    );
    notify(BatchEvent::Finished(summary.clone()));
    summary
}

/// Handles a single discovered file: naming, skip-existing, probe, convert.
pub fn process_file<R: CommandRunner>(
    converter: &Converter<R>,
    request: &BatchRequest,
    source: &Path,
) -> ConversionOutcome {
    let Some(destination) = format::destination_for(source, &request.source_root, &request.destination_root)
    else {
        let err = Error::Destination {
            path: source.to_path_buf(),
        };
        return ConversionOutcome::Failed(FileFailure::new(source, &err));
    };

    if let Some(parent) = destination.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            let err = Error::Io {
                path: parent.to_path_buf(),
                source: e,
            };
            return ConversionOutcome::Failed(FileFailure::new(source, &err));
        }
    }

    if request.skip_existing && is_nonempty_file(&destination) {
        return ConversionOutcome::Skipped(SkipReason::DestinationExists(destination));
    }

    let info = converter.probe(source);
    let task = ConversionTask::new(source, destination, info);
    converter.convert_one(&task)
}

fn is_nonempty_file(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}

/// A batch running on its own worker thread
pub struct BatchHandle {
    events: Receiver<BatchEvent>,
    cancel: Arc<AtomicBool>,
    worker: JoinHandle<BatchSummary>,
}

impl BatchHandle {
    /// Progress stream; ends with [`BatchEvent::Finished`] unless the worker
    /// panicked
    pub fn events(&self) -> &Receiver<BatchEvent> {
        &self.events
    }

    /// Asks the worker to stop before the next file
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Waits for the worker and returns its tally
    pub fn join(self) -> Result<BatchSummary, Error> {
        self.worker.join().map_err(|_| Error::WorkerPanicked)
    }
}

/// Starts `request` on a dedicated worker thread so the caller's thread is
/// never blocked by conversion work.
pub fn spawn_batch<R>(converter: Arc<Converter<R>>, request: BatchRequest) -> BatchHandle
where
    R: CommandRunner + 'static,
{
    let (tx, rx) = mpsc::channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let worker_cancel = Arc::clone(&cancel);
    let worker = thread::spawn(move || run_batch(&converter, &request, Some(&tx), &worker_cancel));
    BatchHandle {
        events: rx,
        cancel,
        worker,
    }
}

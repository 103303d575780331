use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use pitch432::{
    BatchEvent, BatchStatus, ConversionOutcome, ConverterOptions, resolve_toolchain,
    start_folder_conversion,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// source music folder
    folder: PathBuf,

    /// destination base folder, default to `<folder>_432Hz` next to the source
    #[arg(short, long = "out")]
    output: Option<PathBuf>,

    /// also convert files in subfolders
    #[arg(short, long)]
    recursive: bool,

    /// skip files whose converted copy already exists
    #[arg(long)]
    keep: bool,

    /// ffmpeg executable, or the folder containing ffmpeg and ffprobe
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// sample rate of the converted files in Hz
    #[arg(long, default_value_t = pitch432::policy::DEFAULT_TARGET_SAMPLE_RATE)]
    target_rate: u32,

    /// give up on a single ffmpeg run after this many seconds, default to no limit
    #[arg(long)]
    timeout: Option<u64>,
}

fn main() -> Result<()> {
    _ = pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .parse_default_env()
        .try_init();

    let cli = Cli::parse();

    let options = ConverterOptions {
        input_dir: cli.folder,
        output_dir: cli.output,
        recursive: cli.recursive,
        skip_existing: cli.keep,
        toolchain_hint: cli.ffmpeg,
        target_sample_rate: cli.target_rate,
        process_timeout: cli.timeout.map(Duration::from_secs),
    };

    info!("Starting 432 Hz conversion with options:");
    info!("  Input Directory: {:?}", options.input_dir);
    info!("  Output Directory: {:?}", options.resolved_output_dir());
    info!("  Recursive: {}", options.recursive);
    info!("  Skip Existing: {}", options.skip_existing);
    info!("  Target Sample Rate: {} Hz", options.target_sample_rate);
    match options.process_timeout {
        Some(t) => info!("  Process Timeout: {}s", t.as_secs()),
        None => info!("  Process Timeout: none"),
    }
    info!("---");

    let toolchain = match resolve_toolchain(options.toolchain_hint.as_deref()) {
        Ok(toolchain) => toolchain,
        Err(e) => {
            error!("{}", e);
            Err(e)?
        }
    };

    let handle = start_folder_conversion(&options, toolchain)?;

    let pb = ProgressBar::new(0);
    pb.set_style(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("#>-"));
    pb.set_message("Converting files");

    for event in handle.events().iter() {
        match event {
            BatchEvent::Started { total } => pb.set_length(total as u64),
            BatchEvent::FileFinished {
                completed, outcome, ..
            } => {
                if let ConversionOutcome::Failed(failure) = outcome {
                    pb.suspend(|| error!("Failed to convert {}", failure));
                }
                pb.set_position(completed as u64);
            }
            BatchEvent::Finished(_) => pb.finish_with_message("Conversion done"),
        }
    }

    let summary = handle.join()?;
    match summary.status() {
        BatchStatus::NoFiles => {
            info!("No supported audio files found.");
            Ok(())
        }
        BatchStatus::AllSucceeded => {
            info!(
                "Conversion complete! Files are in: {:?}",
                options.resolved_output_dir()
            );
            if summary.degraded > 0 {
                warn!(
                    "{} files needed the safe settings after the HQ attempt failed.",
                    summary.degraded
                );
            }
            Ok(())
        }
        BatchStatus::CompletedWithFailures(n) => {
            anyhow::bail!("Conversion finished, but {} of {} files had errors", n, summary.total)
        }
        BatchStatus::Cancelled => anyhow::bail!("Conversion was cancelled"),
    }
}

//! Scripted stand-in for ffmpeg/ffprobe used by the unit tests.

#![cfg(test)]

use crate::process::{CommandRunner, ProcessOutput, ProcessStatus};
use crate::toolchain::{INSPECTOR_NAME, ToolchainPaths};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

type Handler = dyn Fn(&Path, &[String]) -> ProcessOutput + Send + Sync;

/// Answers every invocation through a closure and records what was asked.
pub struct FakeRunner {
    handler: Box<Handler>,
    calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

impl FakeRunner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Path, &[String]) -> ProcessOutput + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Invocations that were conversions, i.e. ffmpeg with an `-af` chain
    pub fn conversion_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|(program, args)| !is_inspector(program) && args.iter().any(|a| a == "-af"))
            .map(|(_, args)| args)
            .collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &Path, args: &[OsString]) -> ProcessOutput {
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        self.calls
            .lock()
            .unwrap()
            .push((program.to_path_buf(), args.clone()));
        (self.handler)(program, &args)
    }
}

pub fn fake_toolchain() -> ToolchainPaths {
    ToolchainPaths::new("/opt/ffmpeg/bin/ffmpeg", "/opt/ffmpeg/bin/ffprobe")
}

pub fn is_inspector(program: &Path) -> bool {
    program
        .file_stem()
        .is_some_and(|stem| stem.to_string_lossy() == INSPECTOR_NAME)
}

pub fn exited(code: i32, stdout: &str, stderr: &str) -> ProcessOutput {
    ProcessOutput::new(ProcessStatus::Exited(code), stdout, stderr)
}

/// ffprobe JSON describing one audio stream
pub fn probe_json(sample_rate: u32, bit_rate: u64) -> String {
    format!(
        r#"{{"streams":[{{"index":0,"codec_type":"audio","sample_rate":"{sample_rate}","bit_rate":"{bit_rate}"}}]}}"#
    )
}

/// Behaves like a working ffmpeg: probes report `sample_rate`/`bit_rate`,
/// conversions write a small file at the destination (the last argument)
/// unless `fails` says that destination should fail.
pub fn encoder_that_writes<F>(sample_rate: u32, bit_rate: u64, fails: F) -> FakeRunner
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    FakeRunner::new(move |program, args| {
        if is_inspector(program) {
            return exited(0, &probe_json(sample_rate, bit_rate), "");
        }
        let Some(destination) = args.last() else {
            return exited(1, "", "no arguments");
        };
        if fails(destination) {
            return exited(
                1,
                "",
                "ffmpeg version 6.1\nconfiguration: --enable-gpl\nError initializing output stream\n",
            );
        }
        std::fs::write(destination, b"converted").unwrap();
        exited(0, "", "")
    })
}

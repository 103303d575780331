use log::{debug, warn};
use std::borrow::Cow;
use std::ffi::OsString;
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// `CREATE_NO_WINDOW` process creation flag, keeps a console from flashing up
/// for every ffmpeg call on Windows.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a child process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Exited on its own with this code
    Exited(i32),
    /// Killed by a signal
    Terminated,
    /// Killed by us after the configured timeout elapsed
    TimedOut(Duration),
    /// Could not be started at all
    SpawnFailed,
}

impl ProcessStatus {
    #[inline]
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl From<ExitStatus> for ProcessStatus {
    fn from(status: ExitStatus) -> Self {
        status.code().map_or(Self::Terminated, Self::Exited)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Terminated => f.write_str("terminated by signal"),
            Self::TimedOut(after) => write!(f, "timed out after {}s", after.as_secs_f32()),
            Self::SpawnFailed => f.write_str("failed to start"),
        }
    }
}

/// Captured result of one child process invocation.
///
/// Failures are values here; a program that cannot be started yields
/// [`ProcessStatus::SpawnFailed`] with the reason in `stderr`.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ProcessStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn new(status: ProcessStatus, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    fn spawn_failed(program: &Path, err: &io::Error) -> Self {
        Self::new(
            ProcessStatus::SpawnFailed,
            Vec::new(),
            format!("Could not run {}: {}", program.display(), err),
        )
    }

    #[inline]
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Runs external programs and blocks until they finish.
///
/// The executor and prober only talk to ffmpeg through this trait, which keeps
/// them testable without the real toolchain installed.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &Path, args: &[OsString]) -> ProcessOutput;
}

/// Runs commands as real child processes with stdout and stderr captured.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    fn command(program: &Path, args: &[OsString]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[OsString]) -> ProcessOutput {
        debug!(
            "Executing: {} {}",
            program.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        let mut cmd = Self::command(program, args);
        let result = match self.timeout {
            None => cmd.output().map(|output| {
                ProcessOutput::new(output.status.into(), output.stdout, output.stderr)
            }),
            Some(timeout) => cmd.spawn().and_then(|child| wait_with_timeout(child, timeout)),
        };
        result.unwrap_or_else(|e| {
            warn!("Failed to run {}: {}", program.display(), e);
            ProcessOutput::spawn_failed(program, &e)
        })
    }
}

/// Waits for `child` while draining both pipes, killing it once `timeout`
/// has elapsed.
///
/// After a kill the pipes are not waited on: a grandchild forked by a wrapper
/// script may still hold them open. Whatever was read so far is returned and
/// the reader threads finish on their own.
fn wait_with_timeout(mut child: Child, timeout: Duration) -> io::Result<ProcessOutput> {
    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let stdout_reader = spawn_drain(child.stdout.take(), Arc::clone(&stdout_buf));
    let stderr_reader = spawn_drain(child.stderr.take(), Arc::clone(&stderr_buf));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break ProcessStatus::from(status),
            Ok(None) if Instant::now() >= deadline => {
                warn!("Process {} exceeded {:?}, killing it", child.id(), timeout);
                // kill fails only when the child already exited, wait reaps it either way
                let _ = child.kill();
                child.wait()?;
                return Ok(ProcessOutput::new(
                    ProcessStatus::TimedOut(timeout),
                    take(&stdout_buf),
                    take(&stderr_buf),
                ));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        }
    };

    let _ = stdout_reader.join();
    let _ = stderr_reader.join();
    Ok(ProcessOutput::new(status, take(&stdout_buf), take(&stderr_buf)))
}

fn spawn_drain<R>(pipe: Option<R>, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => lock(&sink).extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Stopped reading child pipe: {}", e);
                    break;
                }
            }
        }
    })
}

fn lock(buf: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take(buf: &Mutex<Vec<u8>>) -> Vec<u8> {
    std::mem::take(&mut *lock(buf))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<OsString> {
        vec!["-c".into(), script.into()]
    }

    #[test]
    fn captures_both_streams_and_exit_code() {
        let out = SystemRunner::default().run(Path::new("sh"), &sh("echo out; echo err >&2; exit 3"));
        assert_eq!(out.status, ProcessStatus::Exited(3));
        assert!(!out.success());
        assert_eq!(out.stdout_lossy(), "out\n");
        assert_eq!(out.stderr_lossy(), "err\n");
    }

    #[test]
    fn missing_program_is_a_value_not_a_panic() {
        let program = Path::new("/definitely/not/here/ffmpeg");
        let out = SystemRunner::default().run(program, &[]);
        assert_eq!(out.status, ProcessStatus::SpawnFailed);
        assert!(out.stderr_lossy().contains("/definitely/not/here/ffmpeg"));
    }

    #[test]
    fn timeout_kills_a_hung_process() {
        let runner = SystemRunner::new(Some(Duration::from_millis(200)));
        let started = Instant::now();
        let out = runner.run(Path::new("sh"), &sh("exec sleep 10"));
        assert_eq!(out.status, ProcessStatus::TimedOut(Duration::from_millis(200)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timeout_is_not_held_up_by_grandchildren_keeping_pipes_open() {
        let runner = SystemRunner::new(Some(Duration::from_millis(200)));
        let started = Instant::now();
        let out = runner.run(Path::new("sh"), &sh("echo started; sleep 10; true"));
        assert_eq!(out.status, ProcessStatus::TimedOut(Duration::from_millis(200)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(out.stdout_lossy(), "started\n");
    }

    #[test]
    fn timeout_does_not_affect_fast_processes() {
        let runner = SystemRunner::new(Some(Duration::from_secs(10)));
        let out = runner.run(Path::new("sh"), &sh("printf done"));
        assert!(out.success());
        assert_eq!(out.stdout_lossy(), "done");
    }
}

//! Runs the `zfs` and `zpool` binaries under a deadline and turns their exit
//! status and stderr into `KeyrootError`s.

use keyroot_core::error::{KeyrootError, KeyrootResult};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const FIRST_POLL: Duration = Duration::from_millis(5);
const MAX_POLL: Duration = Duration::from_millis(50);

/// A binary path plus the deadline applied to every invocation.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    path: PathBuf,
    timeout: Duration,
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    /// stderr if it says anything, else stdout.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// stdout and stderr drained on their own threads so a chatty child never
/// blocks on a full pipe while it is being polled.
struct PipeReaders {
    stdout: JoinHandle<io::Result<Vec<u8>>>,
    stderr: JoinHandle<io::Result<Vec<u8>>>,
}

impl PipeReaders {
    fn start(child: &mut Child) -> Self {
        Self {
            stdout: drain(child.stdout.take()),
            stderr: drain(child.stderr.take()),
        }
    }

    fn finish(self) -> KeyrootResult<(String, String)> {
        Ok((join_pipe(self.stdout, "stdout")?, join_pipe(self.stderr, "stderr")?))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn join_pipe(handle: JoinHandle<io::Result<Vec<u8>>>, name: &str) -> KeyrootResult<String> {
    let bytes = handle
        .join()
        .map_err(|_| KeyrootError::Provider(format!("{name} reader thread panicked")))??;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

impl CommandRunner {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    /// Run with `args` and require a zero exit status. A missing dataset or
    /// pool becomes `NotFound`; any other failure is a `Provider` error
    /// naming the command line.
    pub fn run_checked(&self, args: &[&str]) -> KeyrootResult<Output> {
        let out = self.run(args)?;
        if out.status != 0 {
            return Err(self.classify_failure(args, &out));
        }
        Ok(out)
    }

    /// Run with `args` and stdin closed, whatever the exit status.
    pub fn run(&self, args: &[&str]) -> KeyrootResult<Output> {
        let mut child = Command::new(&self.path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let readers = PipeReaders::start(&mut child);
        let status = match self.wait_for(&mut child)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(KeyrootError::Provider(format!(
                    "{} timed out after {:?}",
                    self.command_line(args),
                    self.timeout
                )));
            }
        };

        let (stdout, stderr) = readers.finish()?;
        Ok(Output {
            stdout,
            stderr,
            status: status.code().unwrap_or(-1),
        })
    }

    /// Poll until the child exits or the deadline passes, backing off
    /// between polls.
    fn wait_for(&self, child: &mut Child) -> KeyrootResult<Option<ExitStatus>> {
        let deadline = Instant::now() + self.timeout;
        let mut pause = FIRST_POLL;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(pause.min(deadline - now));
            pause = (pause * 2).min(MAX_POLL);
        }
    }

    fn classify_failure(&self, args: &[&str], output: &Output) -> KeyrootError {
        let diagnostic = output.diagnostic();
        let lower = diagnostic.to_ascii_lowercase();
        let command = self.command_line(args);

        if lower.contains("dataset does not exist") {
            return KeyrootError::NotFound(format!(
                "{command} reported missing dataset: {diagnostic}"
            ));
        }
        if lower.contains("no such pool") || lower.contains("pool does not exist") {
            return KeyrootError::NotFound(format!(
                "{command} reported missing pool: {diagnostic}"
            ));
        }

        let detail = if diagnostic.is_empty() {
            "no additional output"
        } else {
            diagnostic
        };
        KeyrootError::Provider(format!(
            "{command} exited with code {}: {detail}",
            output.status
        ))
    }

    fn command_line(&self, args: &[&str]) -> String {
        format!("{} {}", self.path.display(), args.join(" "))
    }
}

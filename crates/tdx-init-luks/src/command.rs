//! Spawns the encryption, filesystem and mount binaries with a timeout and
//! captures what they printed.

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tdx_init_core::error::{TdxInitError, TdxInitResult};

/// A binary path plus the timeout every invocation of it is held to.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    path: PathBuf,
    timeout: Duration,
}

/// Collected stdout, stderr and exit status of a finished command.
#[derive(Debug)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    /// Whatever the tool said about its failure, preferring stderr.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

impl CommandRunner {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    pub fn binary(&self) -> &Path {
        &self.path
    }

    /// Execute with `args`, feeding `input` on stdin when given.
    pub fn run(&self, args: &[&str], input: Option<&[u8]>) -> TdxInitResult<Output> {
        let mut command = Command::new(&self.path);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| {
            TdxInitError::tool(format!("failed to start {}: {err}", self.path.display()))
        })?;

        if let Some(bytes) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // a tool that exits without reading its stdin is judged by its exit status
                match stdin.write_all(bytes) {
                    Err(err) if err.kind() != ErrorKind::BrokenPipe => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(err.into());
                    }
                    _ => {}
                }
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> TdxInitResult<Output> {
        let start = Instant::now();
        let stdout_handle = Self::spawn_output_reader(stdout_pipe);
        let stderr_handle = Self::spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TdxInitError::tool(format!(
                "{} timed out after {:?}",
                self.path.display(),
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| TdxInitError::tool("stdout reader thread panicked"))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| TdxInitError::tool("stderr reader thread panicked"))??;

        Ok(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }

    fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<TdxInitResult<String>>
    where
        R: Read + Send + 'static,
    {
        thread::spawn(move || -> TdxInitResult<String> {
            let mut buf = Vec::new();
            if let Some(mut reader) = pipe {
                reader.read_to_end(&mut buf)?;
            }
            Ok(String::from_utf8_lossy(&buf).into_owned())
        })
    }
}

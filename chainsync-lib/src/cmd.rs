use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use std::fmt::{self, Display};
use std::io;
use std::process::Stdio;
use std::time::Duration;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("Command {program} exited with {status:?}: {stderr}")]
    CommandFailed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("Command {program} timed out after {}", humantime::format_duration(*after))]
    Timeout { program: String, after: Duration },
    #[error("Unable to kill {program}: {source}")]
    Kill { program: String, source: io::Error },
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

impl Error {
    /// A child we could not reap leaves the engine in an unknown state, retrying is unsafe.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Kill { .. })
    }
}

/// A single subprocess to run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout of a successful command; warns about stderr noise like the shell helpers do.
    pub fn success_stdout(self, program: &str) -> Result<String, Error> {
        match (self.stderr.trim().is_empty(), self.success()) {
            (true, true) => Ok(self.stdout),
            (false, true) => {
                tracing::warn!(cmd = %program, stderr = %self.stderr.trim(), "Non empty stderr on successful command");
                Ok(self.stdout)
            }
            (_, false) => {
                tracing::error!(cmd = %program, status_code = ?self.status, stderr = %self.stderr.trim(), "Error executing command");
                Err(Error::CommandFailed {
                    program: program.to_string(),
                    status: self.status,
                    stderr: self.stderr,
                })
            }
        }
    }
}

/// Subprocess execution seam, replaced by a scripted dataplane in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: Invocation) -> Result<Output, Error>;
}

/// Runs commands through tokio with a hard per-command timeout.
pub struct TokioRunner {
    timeout: Duration,
}

impl TokioRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for TokioRunner {
    async fn run(&self, invocation: Invocation) -> Result<Output, Error> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        // keep a handle able to kill the child while wait_with_output owns it
        let pid = child.id();
        let stdin = child.stdin.take();
        let input = invocation.stdin.clone();
        let exchange = async move {
            // stdin is fed while output is drained, a chatty child cannot stall on a full pipe
            let feed = async move {
                let (Some(mut stdin), Some(input)) = (stdin, input) else {
                    return Ok(());
                };
                match stdin.write_all(input.as_bytes()).await {
                    // the child stopped reading, its exit status tells what happened
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                    Err(e) => Err(e),
                    // dropping stdin closes the pipe so the child sees EOF
                    Ok(()) => stdin.shutdown().await,
                }
            };
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            match fed {
                Ok(()) => output,
                Err(e) => Err(e),
            }
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(res) => {
                let output = res?;
                Ok(Output {
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => {
                tracing::warn!(cmd = %invocation, timeout = %humantime::format_duration(self.timeout), "command timed out, killing it");
                kill(pid).map_err(|source| Error::Kill {
                    program: invocation.program.clone(),
                    source,
                })?;
                Err(Error::Timeout {
                    program: invocation.program,
                    after: self.timeout,
                })
            }
        }
    }
}

fn kill(pid: Option<u32>) -> Result<(), io::Error> {
    let Some(pid) = pid else {
        // already reaped
        return Ok(());
    };
    let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

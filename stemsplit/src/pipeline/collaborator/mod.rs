//! External collaborators: the downloader and the separator.
//!
//! Collaborators report what went wrong as a [`FailureCause`]. Whether that
//! cause is worth retrying is decided here, by [`classify`], and nowhere else.

mod demucs;
mod ytdlp;

pub use demucs::DemucsSeparator;
pub use ytdlp::YtDlpDownloader;

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use async_trait::async_trait;
use process_utils::OutputTail;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::progress::ProgressReporter;

/// What a collaborator observed when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureCause {
    /// Connection refused, reset, DNS failure and similar.
    Network,
    /// The remote side or the tool timed out.
    Timeout,
    /// The remote side asked us to slow down.
    RateLimited,
    /// Local resources ran out (memory, disk).
    ResourceExhausted,
    /// The input is not something the tool can handle.
    InvalidInput,
    /// The media exists but in a format the tool cannot process.
    UnsupportedFormat,
    /// The media is private, removed or region-locked.
    ContentUnavailable,
    /// The tool exited cleanly but produced nothing.
    NoOutput,
    /// The tool binary is missing or cannot be executed.
    ToolUnavailable,
    /// Local file handling failed.
    Io,
    /// The tool failed without a recognizable message.
    Unknown,
}

/// How the pipeline reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureClass {
    /// Requeue with backoff while attempts remain.
    Transient,
    /// Fail the job now.
    Permanent,
}

/// Decide whether a failure is worth retrying.
pub fn classify(cause: FailureCause) -> FailureClass {
    use FailureCause::*;
    match cause {
        Network | Timeout | RateLimited | ResourceExhausted | Io | Unknown => {
            FailureClass::Transient
        }
        InvalidInput | UnsupportedFormat | ContentUnavailable | NoOutput | ToolUnavailable => {
            FailureClass::Permanent
        }
    }
}

/// Error returned by a collaborator call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{cause}: {message}")]
pub struct CollaboratorError {
    pub cause: FailureCause,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        classify(self.cause)
    }

    /// Map a spawn/IO error; a missing binary is permanent.
    pub fn from_io(program: &str, error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::NotFound {
            Self::new(FailureCause::ToolUnavailable, format!("{program} not found"))
        } else {
            Self::new(FailureCause::Io, format!("{program}: {error}"))
        }
    }
}

/// One named output of the separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemOutput {
    pub name: String,
    pub path: PathBuf,
}

/// Fetches the media behind a URL as a local audio file.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download `url` and write the audio to exactly `dest`.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &ProgressReporter,
    ) -> Result<(), CollaboratorError>;
}

/// Splits a local audio file into stems.
#[async_trait]
pub trait Separator: Send + Sync {
    /// Separate `input`, writing results somewhere under `out_dir`.
    async fn transform(&self, input: &Path, out_dir: &Path)
    -> Result<Vec<StemOutput>, CollaboratorError>;
}

/// Exit status and the tail of both output streams.
#[derive(Debug)]
pub(crate) struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: OutputTail,
    pub stderr: OutputTail,
}

impl ToolOutput {
    pub fn contains_ignore_case(&self, needle: &str) -> bool {
        self.stderr.contains_ignore_case(needle) || self.stdout.contains_ignore_case(needle)
    }

    /// Short description for error messages.
    pub fn summary(&self) -> String {
        let tail = if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        match tail.last() {
            Some(line) => format!("{} ({})", self.status, line.trim()),
            None => self.status.to_string(),
        }
    }
}

/// Run `cmd` to completion, draining both pipes and feeding stdout lines to
/// `on_stdout`.
pub(crate) async fn run_tool<F>(mut cmd: Command, mut on_stdout: F) -> std::io::Result<ToolOutput>
where
    F: FnMut(&str) + Send,
{
    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let read_stdout = async move {
        let mut tail = OutputTail::default();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                on_stdout(&line);
                tail.push(line);
            }
        }
        tail
    };
    let read_stderr = async move {
        let mut tail = OutputTail::default();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tail.push(line);
            }
        }
        tail
    };

    let (stdout, stderr) = tokio::join!(read_stdout, read_stderr);
    let status = child.wait().await?;
    Ok(ToolOutput {
        status,
        stdout,
        stderr,
    })
}

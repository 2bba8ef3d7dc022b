//! Downloader backed by the `yt-dlp` command line tool.

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use super::{CollaboratorError, Downloader, FailureCause, ToolOutput, run_tool};
use crate::pipeline::progress::ProgressReporter;

static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[download\]\s+(\d{1,3}(?:\.\d+)?)%").unwrap());

/// `yt-dlp -x --audio-format wav` into a fixed destination.
#[derive(Debug, Clone)]
pub struct YtDlpDownloader {
    program: String,
}

impl YtDlpDownloader {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(url: &str, dest: &Path) -> Vec<String> {
        // yt-dlp picks the extension itself; the template pins the stem and
        // the audio format pins the final extension.
        let stem = dest
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audio");
        let template = dest.with_file_name(format!("{stem}.%(ext)s"));
        vec![
            "--format".into(),
            "bestaudio/best".into(),
            "--extract-audio".into(),
            "--audio-format".into(),
            "wav".into(),
            "--no-playlist".into(),
            "--newline".into(),
            "--no-part".into(),
            "--output".into(),
            template.to_string_lossy().into_owned(),
            "--".into(),
            url.to_string(),
        ]
    }
}

impl Default for YtDlpDownloader {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

/// Download percentage from a `[download]` progress line.
fn parse_progress(line: &str) -> Option<f32> {
    PROGRESS_RE
        .captures(line.trim_start())
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Map yt-dlp's error output to a failure cause.
fn failure_cause(output: &ToolOutput) -> FailureCause {
    let has = |needle: &str| output.contains_ignore_case(needle);

    if has("http error 429") || has("too many requests") {
        FailureCause::RateLimited
    } else if has("unsupported url") || has("is not a valid url") || has("invalid url") {
        FailureCause::InvalidInput
    } else if has("video unavailable")
        || has("private video")
        || has("has been removed")
        || has("not available in your country")
        || has("sign in to confirm your age")
        || has("members-only")
    {
        FailureCause::ContentUnavailable
    } else if has("requested format is not available") || has("no video formats found") {
        FailureCause::UnsupportedFormat
    } else if has("timed out") {
        FailureCause::Timeout
    } else if has("unable to download")
        || has("connection")
        || has("name resolution")
        || has("network is unreachable")
        || has("http error 5")
    {
        FailureCause::Network
    } else if has("no space left on device") {
        FailureCause::ResourceExhausted
    } else {
        FailureCause::Unknown
    }
}

#[async_trait]
impl Downloader for YtDlpDownloader {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &ProgressReporter,
    ) -> Result<(), CollaboratorError> {
        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| CollaboratorError::from_io(&self.program, e))?;
        }

        info!(job_id = %progress.job_id(), url, "Fetching audio");
        let cmd = process_utils::tool_command(&self.program, Self::args(url, dest));
        let output = run_tool(cmd, |line| {
            if let Some(percent) = parse_progress(line) {
                progress.report(percent);
            }
        })
        .await
        .map_err(|e| CollaboratorError::from_io(&self.program, e))?;

        if !output.status.success() {
            let cause = failure_cause(&output);
            debug!(job_id = %progress.job_id(), %cause, stderr = %output.stderr.joined(), "yt-dlp failed");
            return Err(CollaboratorError::new(
                cause,
                format!("{} failed: {}", self.program, output.summary()),
            ));
        }

        if !tokio::fs::try_exists(dest).await.unwrap_or(false) {
            return Err(CollaboratorError::new(
                FailureCause::NoOutput,
                format!("{} finished without writing {}", self.program, dest.display()),
            ));
        }

        progress.report(100.0);
        Ok(())
    }
}

//! Separator backed by the `demucs` command line tool.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{CollaboratorError, FailureCause, Separator, StemOutput, ToolOutput, run_tool};

/// Runs `demucs -n <model> -o <out_dir> <input>`.
///
/// Demucs writes `<out_dir>/<model>/<input stem>/<stem>.wav`; each wav found
/// there becomes one output named after its file stem.
#[derive(Debug, Clone)]
pub struct DemucsSeparator {
    program: String,
    model: String,
}

impl DemucsSeparator {
    pub fn new(program: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
        }
    }

    fn args(&self, input: &Path, out_dir: &Path) -> Vec<String> {
        vec![
            "-n".into(),
            self.model.clone(),
            "-o".into(),
            out_dir.to_string_lossy().into_owned(),
            input.to_string_lossy().into_owned(),
        ]
    }

    fn result_dir(&self, input: &Path, out_dir: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        out_dir.join(&self.model).join(stem)
    }
}

impl Default for DemucsSeparator {
    fn default() -> Self {
        Self::new("demucs", "htdemucs")
    }
}

fn failure_cause(output: &ToolOutput) -> FailureCause {
    let has = |needle: &str| output.contains_ignore_case(needle);

    if has("out of memory") || has("no space left on device") || has("cannot allocate memory") {
        FailureCause::ResourceExhausted
    } else if has("could not load file")
        || has("invalid data found")
        || has("format not recognised")
        || has("failed to load audio")
    {
        FailureCause::UnsupportedFormat
    } else if has("no such file") || has("does not exist") {
        FailureCause::InvalidInput
    } else if has("is not a valid model") || has("could not find pre-trained model") {
        FailureCause::ToolUnavailable
    } else {
        FailureCause::Unknown
    }
}

/// Collect `*.wav` files in `dir`, sorted by name.
async fn collect_stems(dir: &Path) -> std::io::Result<Vec<StemOutput>> {
    let mut stems = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stems),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_wav = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
        if !is_wav || !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
            stems.push(StemOutput {
                name: name.to_string(),
                path: path.clone(),
            });
        }
    }

    stems.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(stems)
}

#[async_trait]
impl Separator for DemucsSeparator {
    async fn transform(
        &self,
        input: &Path,
        out_dir: &Path,
    ) -> Result<Vec<StemOutput>, CollaboratorError> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|e| CollaboratorError::from_io(&self.program, e))?;

        info!(input = %input.display(), model = %self.model, "Separating stems");
        let cmd = process_utils::tool_command(&self.program, self.args(input, out_dir));
        let output = run_tool(cmd, |_| {})
            .await
            .map_err(|e| CollaboratorError::from_io(&self.program, e))?;

        if !output.status.success() {
            let cause = failure_cause(&output);
            debug!(%cause, stderr = %output.stderr.joined(), "demucs failed");
            return Err(CollaboratorError::new(
                cause,
                format!("{} failed: {}", self.program, output.summary()),
            ));
        }

        let result_dir = self.result_dir(input, out_dir);
        let stems = collect_stems(&result_dir)
            .await
            .map_err(|e| CollaboratorError::new(FailureCause::Io, e.to_string()))?;
        if stems.is_empty() {
            return Err(CollaboratorError::new(
                FailureCause::NoOutput,
                format!("no stems were written to {}", result_dir.display()),
            ));
        }

        debug!(count = stems.len(), "Stems written");
        Ok(stems)
    }
}

//! Artifact storage and access.
//!
//! Every job owns `<root>/<job id>/`. Downloads are resolved by matching the
//! requested name against the job's recorded artifact list; the client never
//! supplies a path. The resolved file must canonicalize to somewhere inside
//! the job's directory.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{Job, JobStatus};
use crate::{Error, Result};

/// File name the downloader writes inside a job directory.
pub const FETCHED_AUDIO_FILE: &str = "audio.wav";
/// Directory the separator writes into inside a job directory.
pub const STEMS_DIR: &str = "stems";

/// A validated artifact ready to stream.
#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Job directories under a storage root.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Directory owned by `job_id`. Callers pass ids the service generated.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    pub fn fetched_audio(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(FETCHED_AUDIO_FILE)
    }

    pub fn stems_dir(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(STEMS_DIR)
    }

    /// Express `path` relative to the job directory, rejecting anything
    /// that would point outside of it.
    pub fn relative_to_job(&self, job_id: &str, path: &Path) -> Result<String> {
        let job_dir = self.job_dir(job_id);
        let relative = path.strip_prefix(&job_dir).map_err(|_| {
            Error::Forbidden(format!("{} is outside the job directory", path.display()))
        })?;
        if !is_plain_relative(relative) {
            return Err(Error::Forbidden(format!(
                "{} is not a plain relative path",
                relative.display()
            )));
        }
        Ok(relative.to_string_lossy().replace('\\', "/"))
    }

    /// Find a downloadable artifact of `job` named exactly `name`.
    ///
    /// `NotFound` covers a job that is not completed, has expired at `now`, or
    /// has no artifact by that name. `Forbidden` means the recorded file
    /// resolves outside the job directory.
    pub async fn resolve(&self, job: &Job, name: &str, now: DateTime<Utc>) -> Result<ResolvedArtifact> {
        if job.status != JobStatus::Completed || job.is_expired_at(now) {
            return Err(Error::not_found("Artifact", format!("{}/{}", job.id, name)));
        }
        let artifact = job
            .artifact(name)
            .ok_or_else(|| Error::not_found("Artifact", format!("{}/{}", job.id, name)))?;

        if !is_plain_relative(Path::new(&artifact.file)) {
            warn!(job_id = %job.id, file = %artifact.file, "Recorded artifact path is not relative");
            return Err(Error::Forbidden("artifact path escapes job directory".to_string()));
        }

        let job_dir = self.job_dir(&job.id);
        let not_found = || Error::not_found("Artifact", format!("{}/{}", job.id, name));
        let canonical_root = tokio::fs::canonicalize(&job_dir)
            .await
            .map_err(|_| not_found())?;
        let canonical_file = tokio::fs::canonicalize(job_dir.join(&artifact.file))
            .await
            .map_err(|_| not_found())?;

        if !canonical_file.starts_with(&canonical_root) {
            warn!(
                job_id = %job.id,
                file = %canonical_file.display(),
                "Artifact resolves outside job directory"
            );
            return Err(Error::Forbidden("artifact path escapes job directory".to_string()));
        }

        let metadata = tokio::fs::metadata(&canonical_file).await?;
        if !metadata.is_file() {
            return Err(not_found());
        }

        Ok(ResolvedArtifact {
            name: artifact.name.clone(),
            path: canonical_file,
            size: metadata.len(),
        })
    }

    /// Delete a job's directory; a missing directory is not an error.
    pub async fn remove_job_dir(&self, job_id: &str) -> Result<bool> {
        let dir = self.job_dir(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(job_id, "Removed job directory");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a file inside a job directory; a missing file is not an error.
    pub async fn remove_file(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Parse a client-supplied job id; anything but a UUID is rejected.
pub fn parse_job_id(raw: &str) -> Result<String> {
    Uuid::parse_str(raw)
        .map(|id| id.to_string())
        .map_err(|_| Error::not_found("Job", raw))
}

fn is_plain_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Artifact;

    const JOB_ID: &str = "2f1c7a4e-3b9d-4c51-8e0f-6a7d2b9c1e44";

    fn completed_job(artifacts: Vec<Artifact>) -> Job {
        let now = Utc::now();
        Job {
            id: JOB_ID.to_string(),
            input_key: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
            source_url: "https://youtu.be/dQw4w9WgXcQ".to_string(),
            status: JobStatus::Completed,
            progress: 100,
            owner_client: "127.0.0.1".to_string(),
            attempt_count: 1,
            artifacts,
            error: None,
            created_at: now,
            updated_at: now,
            expires_at: Some(now + chrono::Duration::hours(1)),
            completed_at: Some(now),
        }
    }

    fn store_with_stem() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("jobs"));
        let stems = store.stems_dir(JOB_ID);
        std::fs::create_dir_all(&stems).unwrap();
        std::fs::write(stems.join("vocals.wav"), b"RIFF").unwrap();
        (dir, store)
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id(JOB_ID).unwrap(), JOB_ID);
        assert!(matches!(parse_job_id("../etc"), Err(Error::NotFound { .. })));
        assert!(parse_job_id("").is_err());
    }

    #[tokio::test]
    async fn test_resolve_recorded_artifact() {
        let (_dir, store) = store_with_stem();
        let job = completed_job(vec![Artifact::new("vocals", "stems/vocals.wav")]);

        let resolved = store.resolve(&job, "vocals", Utc::now()).await.unwrap();
        assert_eq!(resolved.name, "vocals");
        assert_eq!(resolved.size, 4);
    }

    #[tokio::test]
    async fn test_resolve_rejects_unrecorded_names() {
        let (_dir, store) = store_with_stem();
        let job = completed_job(vec![Artifact::new("vocals", "stems/vocals.wav")]);

        for name in ["../../etc/passwd", "vocals.wav", "VOCALS", "stems/vocals.wav", ""] {
            let err = store.resolve(&job, name, Utc::now()).await.unwrap_err();
            assert!(matches!(err, Error::NotFound { .. }), "{name}: {err}");
        }
    }

    #[tokio::test]
    async fn test_resolve_requires_completed_and_unexpired() {
        let (_dir, store) = store_with_stem();
        let mut job = completed_job(vec![Artifact::new("vocals", "stems/vocals.wav")]);

        let later = Utc::now() + chrono::Duration::hours(2);
        assert!(matches!(
            store.resolve(&job, "vocals", later).await,
            Err(Error::NotFound { .. })
        ));

        job.status = JobStatus::Transforming;
        assert!(matches!(
            store.resolve(&job, "vocals", Utc::now()).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_forbids_escaping_records() {
        let (_dir, store) = store_with_stem();
        let job = completed_job(vec![Artifact::new("passwd", "../../etc/passwd")]);
        assert!(matches!(
            store.resolve(&job, "passwd", Utc::now()).await,
            Err(Error::Forbidden(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_forbids_symlink_escape() {
        let (dir, store) = store_with_stem();
        let outside = dir.path().join("secret.txt");
        std::fs::write(&outside, b"secret").unwrap();
        std::os::unix::fs::symlink(&outside, store.stems_dir(JOB_ID).join("link.wav")).unwrap();

        let job = completed_job(vec![Artifact::new("link", "stems/link.wav")]);
        assert!(matches!(
            store.resolve(&job, "link", Utc::now()).await,
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn test_relative_to_job() {
        let store = ArtifactStore::new("/data/jobs");
        let inside = store.stems_dir(JOB_ID).join("htdemucs/audio/bass.wav");
        assert_eq!(
            store.relative_to_job(JOB_ID, &inside).unwrap(),
            "stems/htdemucs/audio/bass.wav"
        );
        assert!(store.relative_to_job(JOB_ID, Path::new("/etc/passwd")).is_err());
        let sneaky = store.job_dir(JOB_ID).join("../other/file.wav");
        assert!(store.relative_to_job(JOB_ID, &sneaky).is_err());
    }

    #[tokio::test]
    async fn test_remove_job_dir_is_idempotent() {
        let (_dir, store) = store_with_stem();
        assert!(store.remove_job_dir(JOB_ID).await.unwrap());
        assert!(!store.remove_job_dir(JOB_ID).await.unwrap());
    }
}

use attendance_core::{
    classify, validate_upload, Classification, ImageKind, RunReport, SuccessPolicy, UploadError,
};
use attendance_runner::{Runner, RunnerError};
use axum::body::Bytes;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    InvalidImage(#[from] UploadError),
    #[error(transparent)]
    Admission(#[from] RunnerError),
    #[error("failed to save uploaded image: {0}")]
    ImageSave(#[source] std::io::Error),
}

/// The image part of one submission, as received.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Result of one recognition run, with its classification.
#[derive(Debug)]
pub struct Verdict {
    pub report: RunReport,
    pub classification: Classification,
}

/// Turns one upload into exactly one recognition run.
pub struct Relay {
    runner: Runner,
    upload_dir: PathBuf,
    max_upload_bytes: usize,
    policy: SuccessPolicy,
}

impl Relay {
    pub fn new(runner: Runner, upload_dir: PathBuf, max_upload_bytes: usize, policy: SuccessPolicy) -> Self {
        Self {
            runner,
            upload_dir,
            max_upload_bytes,
            policy,
        }
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Validate, admit, persist, run and classify.
    ///
    /// Validation failures return before anything touches the disk or a
    /// recognition slot. The upload file lives only for the duration of the
    /// run.
    pub async fn submit(&self, upload: &Upload) -> Result<Verdict, RelayError> {
        let kind = validate_upload(
            upload.file_name.as_deref(),
            upload.content_type.as_deref(),
            &upload.bytes,
            self.max_upload_bytes,
        )?;

        let slot = self.runner.admit().await?;

        let stored = StoredUpload::write(&self.upload_dir, kind, &upload.bytes)
            .await
            .map_err(RelayError::ImageSave)?;
        tracing::info!(
            path = %stored.path().display(),
            bytes = upload.bytes.len(),
            "upload persisted"
        );

        let report = self.runner.run(&slot, stored.path()).await;
        drop(slot);
        stored.remove().await;

        let classification = classify(&report, self.policy);
        if classification.ambiguous {
            tracing::warn!(
                outcome = %classification.kind,
                "recognition exited 0 without any success or failure marker"
            );
        }
        tracing::info!(
            outcome = %classification.kind,
            decided_by = ?classification.decided_by,
            exit_code = ?report.exit_code,
            "recognition classified"
        );

        Ok(Verdict {
            report,
            classification,
        })
    }
}

/// A per-request upload file, removed when the run is over or the request
/// is dropped.
struct StoredUpload {
    path: PathBuf,
    removed: bool,
}

impl StoredUpload {
    async fn write(dir: &Path, kind: ImageKind, bytes: &[u8]) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.{}", Uuid::new_v4(), kind.extension()));
        let stored = Self {
            path,
            removed: false,
        };
        tokio::fs::write(&stored.path, bytes).await?;

        if !tokio::fs::try_exists(&stored.path).await? {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} missing after write", stored.path.display()),
            ));
        }
        Ok(stored)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(mut self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove upload");
        }
        self.removed = true;
    }
}

impl Drop for StoredUpload {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

//! Filesystem path helpers (XDG-aware) for the LMDB store and job artifacts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid job id `{job_id}`; expected a non-empty path-safe identifier")]
    InvalidJobId { job_id: String },
}

/// Container providing filesystem paths for the application. In production this
/// is rooted at `$XDG_DATA_HOME/concord`; tests may construct custom instances.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    /// Construct paths rooted under `$XDG_DATA_HOME/concord`.
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs =
            ProjectDirs::from("io", "concord", "concord").ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    /// Base data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// LMDB environment directory (`.../lmdb/app`).
    pub fn lmdb_env_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["lmdb", "app"])
    }

    /// Base directory for per-job output artifacts (`.../jobs`).
    pub fn jobs_base_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["jobs"])
    }

    /// Output directory for one job (`.../jobs/{job_id}`), with the stable
    /// `images/` and `tables/` children created alongside.
    pub fn job_output_dir(&self, job_id: &str) -> Result<PathBuf, PathError> {
        validate_job_id(job_id)?;
        let dir = self.ensure_dynamic(&["jobs".to_string(), job_id.to_string()])?;
        ensure_dir(&dir.join("images"))?;
        ensure_dir(&dir.join("tables"))?;
        Ok(dir)
    }

    /// Path of the merged Markdown artifact for a job.
    pub fn job_document_path(&self, job_id: &str) -> Result<PathBuf, PathError> {
        Ok(self.job_output_dir(job_id)?.join("document.md"))
    }

    /// Path of the metadata artifact for a job.
    pub fn job_metadata_path(&self, job_id: &str) -> Result<PathBuf, PathError> {
        Ok(self.job_output_dir(job_id)?.join("metadata.json"))
    }

    /// Path of the extraction report (candidates, divergences, aggregation).
    pub fn job_report_path(&self, job_id: &str) -> Result<PathBuf, PathError> {
        Ok(self.job_output_dir(job_id)?.join("extraction_report.json"))
    }

    /// Staging directory for uploaded or fetched source documents.
    pub fn incoming_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["incoming"])
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            debug_assert!(!segment.is_empty());
            path.push(segment);
        }
        ensure_dir(&path)?;
        Ok(path)
    }

    fn ensure_dynamic(&self, segments: &[String]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            debug_assert!(!segment.is_empty());
            path.push(segment);
        }
        ensure_dir(&path)?;
        Ok(path)
    }
}

fn validate_job_id(job_id: &str) -> Result<(), PathError> {
    let ok = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(PathError::InvalidJobId {
            job_id: job_id.to_string(),
        })
    }
}

fn ensure_dir(path: &Path) -> Result<(), PathError> {
    fs::create_dir_all(path).map_err(|source| PathError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn job_output_dir_creates_stable_children() {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");

        let dir = paths.job_output_dir("job-123").expect("job dir");
        assert!(dir.join("images").is_dir());
        assert!(dir.join("tables").is_dir());
        assert!(dir.ends_with("jobs/job-123"));
    }

    #[test]
    fn job_id_with_path_separator_is_rejected() {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");

        let err = paths.job_output_dir("../escape").expect_err("must reject");
        assert!(matches!(err, PathError::InvalidJobId { .. }));
    }
}

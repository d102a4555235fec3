use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;
use vto_protocol::Job;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job id {job_id:?} is not a valid file name")]
    InvalidJobId { job_id: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode snapshot for {job_id}: {source}")]
    Encode {
        job_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable snapshot store, one JSON file per job under a root directory.
/// Writes go through a temp file and rename so a crash mid-write never
/// leaves a truncated snapshot behind.
#[derive(Debug, Clone)]
pub struct PersistentJobStore {
    root: PathBuf,
}

impl PersistentJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Write {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    fn snapshot_path(&self, job_id: &str) -> Result<PathBuf, StoreError> {
        if job_id.is_empty()
            || !job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(StoreError::InvalidJobId {
                job_id: job_id.to_string(),
            });
        }
        Ok(self.root.join(format!("{job_id}.json")))
    }

    pub fn save(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.snapshot_path(&job.id)?;
        let json = serde_json::to_vec_pretty(job).map_err(|source| StoreError::Encode {
            job_id: job.id.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        write_atomically(&tmp, &path, &json).map_err(|source| StoreError::Write { path, source })
    }

    pub fn load(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let path = self.snapshot_path(job_id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        let job = serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
            path,
            source,
        })?;
        Ok(Some(job))
    }

    pub fn remove(&self, job_id: &str) -> Result<(), StoreError> {
        let path = self.snapshot_path(job_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Write { path, source }),
        }
    }

    /// Every decodable snapshot under the root. Corrupt files are skipped
    /// with a warning rather than failing the whole scan.
    pub fn list_all(&self) -> Result<Vec<Job>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|source| StoreError::Read {
            path: self.root.clone(),
            source,
        })?;
        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Read {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable snapshot");
                    continue;
                }
            };
            match serde_json::from_slice::<Job>(&bytes) {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping undecodable snapshot");
                }
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}

fn write_atomically(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    {
        let mut file = File::create(tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(tmp, path)
}

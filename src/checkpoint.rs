// ABOUTME: Durable resume point stored inside a job's checkpoint_data document
// ABOUTME: Records the phase, working directory and last revision confirmed on disk

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::MigratorError;
use crate::models::{JobId, JobPhase};
use crate::store::Store;

/// Diagnostic left behind by the last failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointError {
    pub kind: String,
    pub class: String,
    pub message: String,
    pub resumable: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase: JobPhase,
    pub working_directory: PathBuf,
    /// Never ahead of what the working directory actually contains.
    #[serde(default)]
    pub last_fetched_revision: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CheckpointError>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Checkpoint {
    pub fn new(phase: JobPhase, working_directory: &Path) -> Self {
        Self {
            phase,
            working_directory: working_directory.to_path_buf(),
            last_fetched_revision: None,
            timestamp: Utc::now(),
            error: None,
            metadata: Map::new(),
        }
    }

    /// First revision a resumed fetch should request.
    pub fn next_revision(&self) -> u64 {
        self.last_fetched_revision.map(|r| r + 1).unwrap_or(1)
    }

    fn from_value(value: &Value) -> Result<Option<Self>> {
        match value {
            Value::Object(map) if map.contains_key("phase") => {
                let checkpoint = serde_json::from_value(value.clone())
                    .context("Checkpoint data is not a valid checkpoint")?;
                Ok(Some(checkpoint))
            }
            _ => Ok(None),
        }
    }
}

/// Reads and writes the checkpoint of one job.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Store,
    job_id: JobId,
}

impl CheckpointStore {
    pub fn new(store: Store, job_id: JobId) -> Self {
        Self { store, job_id }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let job = self.store.job(self.job_id)?;
        Checkpoint::from_value(&job.checkpoint_data)
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let value = serde_json::to_value(checkpoint).context("Failed to encode checkpoint")?;
        self.store.save_checkpoint_data(self.job_id, &value)
    }

    /// Persists the new phase before any of its work starts.
    pub fn enter_phase(&self, phase: JobPhase, working_directory: &Path) -> Result<Checkpoint> {
        let mut checkpoint = self
            .load()?
            .unwrap_or_else(|| Checkpoint::new(phase, working_directory));
        checkpoint.phase = phase;
        checkpoint.working_directory = working_directory.to_path_buf();
        checkpoint.timestamp = Utc::now();
        self.save(&checkpoint)?;
        self.store.set_phase(self.job_id, phase)?;
        debug!(job_id = self.job_id, phase = %phase, "entered phase");
        Ok(checkpoint)
    }

    /// Call only after `revision` is confirmed present in the working directory.
    pub fn record_revision(&self, revision: u64) -> Result<()> {
        let Some(mut checkpoint) = self.load()? else {
            anyhow::bail!("Job {} has no checkpoint to advance", self.job_id);
        };
        checkpoint.last_fetched_revision = Some(revision);
        checkpoint.timestamp = Utc::now();
        self.save(&checkpoint)
    }

    /// Forget fetched revisions, used when the working directory is rebuilt.
    pub fn reset_revision(&self, revision: Option<u64>) -> Result<()> {
        if let Some(mut checkpoint) = self.load()? {
            checkpoint.last_fetched_revision = revision;
            checkpoint.timestamp = Utc::now();
            self.save(&checkpoint)?;
        }
        Ok(())
    }

    pub fn set_metadata(&self, key: &str, value: Value) -> Result<()> {
        if let Some(mut checkpoint) = self.load()? {
            checkpoint.metadata.insert(key.to_string(), value);
            self.save(&checkpoint)?;
        }
        Ok(())
    }

    pub fn record_error(&self, error: &MigratorError, working_directory: &Path) -> Result<()> {
        let job = self.store.job(self.job_id)?;
        let mut checkpoint = Checkpoint::from_value(&job.checkpoint_data)?
            .unwrap_or_else(|| Checkpoint::new(job.phase, working_directory));
        checkpoint.error = Some(CheckpointError {
            kind: error.kind().to_string(),
            class: error.class().to_string(),
            message: error.to_string(),
            resumable: error.is_resumable(),
            recorded_at: Utc::now(),
        });
        checkpoint.timestamp = Utc::now();
        self.save(&checkpoint)
    }

    pub fn clear_error(&self) -> Result<()> {
        if let Some(mut checkpoint) = self.load()? {
            if checkpoint.error.take().is_some() {
                self.save(&checkpoint)?;
            }
        }
        Ok(())
    }
}

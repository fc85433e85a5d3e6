// ABOUTME: Job and repository records shared by the engine, the store and the CLI
// ABOUTME: Status and phase enums serialize to the snake_case strings persisted in the database

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type JobId = i64;
pub type RepositoryId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Cursor within a running job. Ordered: a later phase compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Pending,
    Cloning,
    ApplyingStrategy,
    Pushing,
    Completed,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Pending => "pending",
            JobPhase::Cloning => "cloning",
            JobPhase::ApplyingStrategy => "applying_strategy",
            JobPhase::Pushing => "pushing",
            JobPhase::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Migration,
    IncrementalSync,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Migration => "migration",
            JobKind::IncrementalSync => "incremental_sync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// Latest snapshot only.
    Shallow,
    /// Replay every revision.
    FullHistory,
}

impl MigrationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationMode::Shallow => "shallow",
            MigrationMode::FullHistory => "full_history",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    Standard,
    PartialStandard,
    NonStandard,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == $ty::$variant.as_str() {
                        return Ok($ty::$variant);
                    }
                )+
                anyhow::bail!("unknown {} value '{}'", stringify!($ty), s)
            }
        }
    };
}

str_enum!(JobStatus { Pending, Running, Completed, Failed, Cancelled });
str_enum!(JobPhase { Pending, Cloning, ApplyingStrategy, Pushing, Completed });
str_enum!(JobKind { Migration, IncrementalSync });
str_enum!(MigrationMode { Shallow, FullHistory });

/// Trunk/branches/tags paths relative to the repository root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub trunk: Option<String>,
    pub branches: Option<String>,
    pub tags: Option<String>,
}

impl Layout {
    pub fn standard() -> Self {
        Self {
            trunk: Some("trunk".to_string()),
            branches: Some("branches".to_string()),
            tags: Some("tags".to_string()),
        }
    }

    pub fn is_standard(&self) -> bool {
        *self == Self::standard()
    }
}

/// What the structure-discovery helper reports before a repository is registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureReport {
    pub trunk: Option<String>,
    pub branches: Option<String>,
    pub tags: Option<String>,
    pub layout: LayoutKind,
    #[serde(default)]
    pub authors: Vec<String>,
}

impl StructureReport {
    pub fn layout(&self) -> Layout {
        Layout {
            trunk: self.trunk.clone(),
            branches: self.branches.clone(),
            tags: self.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
    pub source_url: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub mode: MigrationMode,
    pub target_project_id: String,
    pub working_directory: PathBuf,
    pub layout: Layout,
    pub authors_file: Option<PathBuf>,
    pub last_synced_revision: Option<u64>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Input for registering a repository.
#[derive(Debug, Clone)]
pub struct NewRepository {
    pub name: String,
    pub source_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub mode: MigrationMode,
    pub target_project_id: String,
    pub working_directory: PathBuf,
    pub layout: Layout,
    pub authors_file: Option<PathBuf>,
}

impl NewRepository {
    pub fn from_report(
        name: String,
        source_url: String,
        target_project_id: String,
        working_directory: PathBuf,
        mode: MigrationMode,
        report: &StructureReport,
    ) -> Self {
        Self {
            name,
            source_url,
            username: None,
            password: None,
            mode,
            target_project_id,
            working_directory,
            layout: report.layout(),
            authors_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub repository_id: RepositoryId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub phase: JobPhase,
    pub resumable: bool,
    pub retry_count: u32,
    pub parent_job_id: Option<JobId>,
    pub current_revision: Option<u64>,
    pub total_revisions: Option<u64>,
    pub progress: u8,
    pub processing_speed: Option<f64>,
    pub eta_seconds: Option<u64>,
    pub checkpoint_data: serde_json::Value,
    pub output_log: String,
    pub error_log: String,
    pub result_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

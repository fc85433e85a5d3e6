// ABOUTME: SQLite persistence for repositories and migration jobs
// ABOUTME: Job rows carry the checkpoint document, counters and append-only logs the engine writes

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::models::{
    Job, JobId, JobKind, JobPhase, JobStatus, Layout, NewRepository, Repository, RepositoryId,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    source_url TEXT NOT NULL,
    username TEXT,
    password TEXT,
    mode TEXT NOT NULL,
    target_project_id TEXT NOT NULL,
    working_directory TEXT NOT NULL,
    trunk_path TEXT,
    branches_path TEXT,
    tags_path TEXT,
    authors_file TEXT,
    last_synced_revision INTEGER,
    last_synced_at TEXT
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository_id INTEGER NOT NULL REFERENCES repositories(id),
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    phase TEXT NOT NULL,
    resumable INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    parent_job_id INTEGER REFERENCES jobs(id),
    current_revision INTEGER,
    total_revisions INTEGER,
    progress INTEGER NOT NULL DEFAULT 0,
    processing_speed REAL,
    eta_seconds INTEGER,
    checkpoint_data TEXT NOT NULL DEFAULT '{}',
    output_log TEXT NOT NULL DEFAULT '',
    error_log TEXT NOT NULL DEFAULT '',
    result_url TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS jobs_repository_status ON jobs(repository_id, status);
"#;

const JOB_COLUMNS: &str = "id, repository_id, kind, status, phase, resumable, retry_count, \
    parent_job_id, current_revision, total_revisions, progress, processing_speed, eta_seconds, \
    checkpoint_data, output_log, error_log, result_url, created_at, started_at, finished_at, updated_at";

const REPOSITORY_COLUMNS: &str = "id, name, source_url, username, password, mode, \
    target_project_id, working_directory, trunk_path, branches_path, tags_path, authors_file, \
    last_synced_revision, last_synced_at";

const ACTIVE_STATUSES: &str = "('pending', 'running')";

/// Counters written by the progress tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressUpdate {
    pub current_revision: Option<u64>,
    pub total_revisions: Option<u64>,
    pub progress: u8,
    pub processing_speed: Option<f64>,
    pub eta_seconds: Option<u64>,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open job database {}", path.display()))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .context("Failed to enable WAL journal mode")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .context("Failed to configure database pragmas")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("job database lock poisoned"))?;
        Ok(f(&mut conn)?)
    }

    // Repositories

    pub fn insert_repository(&self, repo: &NewRepository) -> Result<Repository> {
        let id = self
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO repositories (name, source_url, username, password, mode, \
                     target_project_id, working_directory, trunk_path, branches_path, tags_path, authors_file) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        repo.name,
                        repo.source_url,
                        repo.username,
                        repo.password,
                        repo.mode.as_str(),
                        repo.target_project_id,
                        repo.working_directory.to_string_lossy(),
                        repo.layout.trunk,
                        repo.layout.branches,
                        repo.layout.tags,
                        repo.authors_file.as_ref().map(|p| p.to_string_lossy().into_owned()),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .with_context(|| format!("Failed to register repository '{}'", repo.name))?;
        self.repository(id)
    }

    pub fn repository(&self, id: RepositoryId) -> Result<Repository> {
        let sql = format!("SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE id = ?1");
        let raw = self.with_conn(|conn| {
            conn.query_row(&sql, [id], RawRepository::from_row).optional()
        })?;
        raw.ok_or_else(|| anyhow!("Repository {} not found", id))?
            .into_repository()
    }

    /// Look up by numeric id or by name.
    pub fn find_repository(&self, key: &str) -> Result<Repository> {
        if let Ok(id) = key.parse::<RepositoryId>() {
            return self.repository(id);
        }
        let sql = format!("SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE name = ?1");
        let raw = self.with_conn(|conn| {
            conn.query_row(&sql, [key], RawRepository::from_row).optional()
        })?;
        raw.ok_or_else(|| anyhow!("Repository '{}' not found. Register it with add-repo first", key))?
            .into_repository()
    }

    pub fn list_repositories(&self) -> Result<Vec<Repository>> {
        let sql = format!("SELECT {REPOSITORY_COLUMNS} FROM repositories ORDER BY id");
        let raws = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], RawRepository::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        raws.into_iter().map(RawRepository::into_repository).collect()
    }

    pub fn record_synced_revision(&self, id: RepositoryId, revision: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE repositories SET last_synced_revision = ?1, last_synced_at = ?2 WHERE id = ?3",
                params![revision as i64, Utc::now().to_rfc3339(), id],
            )
        })?;
        Ok(())
    }

    // Jobs

    pub fn create_job(&self, repository_id: RepositoryId, kind: JobKind) -> Result<Job> {
        let id = self.with_conn(|conn| insert_job(conn, repository_id, kind, None))?;
        self.job(id)
    }

    /// New record that copies the failed job's parameters and starts from scratch.
    pub fn create_retry_job(&self, original: &Job) -> Result<Job> {
        let id = self.with_conn(|conn| {
            insert_job(conn, original.repository_id, original.kind, Some(original.id))
        })?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET retry_count = ?1 WHERE id = ?2",
                params![original.retry_count + 1, id],
            )
        })?;
        self.job(id)
    }

    /// Creates a sync job unless one is already active; check and insert share a transaction.
    pub fn create_sync_job_if_idle(&self, repository_id: RepositoryId) -> Result<Option<Job>> {
        let id = self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let active: Option<JobId> = tx
                .query_row(
                    &format!(
                        "SELECT id FROM jobs WHERE repository_id = ?1 AND kind = ?2 AND status IN {ACTIVE_STATUSES} LIMIT 1"
                    ),
                    params![repository_id, JobKind::IncrementalSync.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if active.is_some() {
                return Ok(None);
            }
            let id = insert_job(&tx, repository_id, JobKind::IncrementalSync, None)?;
            tx.commit()?;
            Ok(Some(id))
        })?;
        id.map(|id| self.job(id)).transpose()
    }

    pub fn job(&self, id: JobId) -> Result<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let raw = self.with_conn(|conn| conn.query_row(&sql, [id], RawJob::from_row).optional())?;
        raw.ok_or_else(|| anyhow!("Job {} not found", id))?.into_job()
    }

    pub fn list_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id DESC LIMIT ?1");
        let raws = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([limit as i64], RawJob::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        raws.into_iter().map(RawJob::into_job).collect()
    }

    pub fn count_jobs(&self, repository_id: RepositoryId) -> Result<usize> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE repository_id = ?1",
                [repository_id],
                |row| row.get(0),
            )
        })?;
        Ok(count as usize)
    }

    /// Any pending or running job on the repository other than `except`.
    pub fn active_job_for_repository(
        &self,
        repository_id: RepositoryId,
        except: Option<JobId>,
    ) -> Result<Option<JobId>> {
        let sql = format!(
            "SELECT id FROM jobs WHERE repository_id = ?1 AND status IN {ACTIVE_STATUSES} AND id != ?2 ORDER BY id LIMIT 1"
        );
        self.with_conn(|conn| {
            conn.query_row(&sql, params![repository_id, except.unwrap_or(-1)], |row| {
                row.get(0)
            })
            .optional()
        })
    }

    pub fn is_cancelled(&self, id: JobId) -> Result<bool> {
        let status: String = self.with_conn(|conn| {
            conn.query_row("SELECT status FROM jobs WHERE id = ?1", [id], |row| row.get(0))
        })?;
        Ok(status == JobStatus::Cancelled.as_str())
    }

    /// Moves a pending or resumable job to running. Returns false if the job is not eligible.
    pub fn mark_running(&self, id: JobId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'running', started_at = COALESCE(started_at, ?1), \
                 finished_at = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND (status = 'pending' OR (status IN ('failed', 'cancelled') AND resumable = 1))",
                params![now, id],
            )
        })?;
        Ok(changed == 1)
    }

    pub fn increment_retry_count(&self, id: JobId) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET retry_count = retry_count + 1 WHERE id = ?1",
                [id],
            )
        })?;
        Ok(())
    }

    pub fn set_phase(&self, id: JobId, phase: JobPhase) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET phase = ?1, updated_at = ?2 WHERE id = ?3",
                params![phase.as_str(), Utc::now().to_rfc3339(), id],
            )
        })?;
        Ok(())
    }

    pub fn set_total_revisions(&self, id: JobId, total: u64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET total_revisions = ?1 WHERE id = ?2",
                params![total as i64, id],
            )
        })?;
        Ok(())
    }

    /// Progress never moves backwards, even if a stale update arrives late.
    pub fn update_progress(&self, id: JobId, update: &ProgressUpdate) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET current_revision = COALESCE(?1, current_revision), \
                 total_revisions = COALESCE(?2, total_revisions), progress = MAX(progress, ?3), \
                 processing_speed = COALESCE(?4, processing_speed), eta_seconds = ?5, updated_at = ?6 \
                 WHERE id = ?7",
                params![
                    update.current_revision.map(|r| r as i64),
                    update.total_revisions.map(|r| r as i64),
                    update.progress,
                    update.processing_speed,
                    update.eta_seconds.map(|s| s as i64),
                    Utc::now().to_rfc3339(),
                    id,
                ],
            )
        })?;
        Ok(())
    }

    pub fn save_checkpoint_data(&self, id: JobId, data: &serde_json::Value) -> Result<()> {
        let text = serde_json::to_string(data).context("Failed to serialize checkpoint")?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET checkpoint_data = ?1, updated_at = ?2 WHERE id = ?3",
                params![text, Utc::now().to_rfc3339(), id],
            )
        })
        .with_context(|| format!("Failed to persist checkpoint for job {}", id))?;
        Ok(())
    }

    pub fn append_output(&self, id: JobId, text: &str) -> Result<()> {
        self.append_log(id, "output_log", text)
    }

    pub fn append_error(&self, id: JobId, text: &str) -> Result<()> {
        self.append_log(id, "error_log", text)
    }

    fn append_log(&self, id: JobId, column: &'static str, text: &str) -> Result<()> {
        let mut line = text.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let sql = format!("UPDATE jobs SET {column} = {column} || ?1 WHERE id = ?2");
        self.with_conn(|conn| conn.execute(&sql, params![line, id]))?;
        Ok(())
    }

    pub fn mark_completed(&self, id: JobId, result_url: Option<&str>) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'completed', phase = 'completed', progress = 100, \
                 resumable = 0, eta_seconds = NULL, result_url = ?1, finished_at = ?2, updated_at = ?2 \
                 WHERE id = ?3 AND status IN ('pending', 'running')",
                params![result_url, now, id],
            )
        })?;
        Ok(changed == 1)
    }

    pub fn mark_failed(&self, id: JobId, resumable: bool) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'failed', resumable = ?1, finished_at = ?2, updated_at = ?2 \
                 WHERE id = ?3 AND status IN ('pending', 'running')",
                params![resumable, now, id],
            )
        })?;
        debug!(job_id = id, resumable, changed, "marked job failed");
        Ok(changed == 1)
    }

    /// Cancellation is recorded immediately; the engine honours it at its next checkpoint.
    pub fn mark_cancelled(&self, id: JobId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'cancelled', resumable = 1, finished_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND status IN ('pending', 'running')",
                params![now, id],
            )
        })?;
        Ok(changed == 1)
    }

    /// A `running` job whose worker died. It becomes a resumable failure so it can be picked up again.
    pub fn mark_interrupted(&self, id: JobId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'failed', resumable = 1, finished_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'running'",
                params![now, id],
            )
        })?;
        Ok(changed == 1)
    }
}

fn insert_job(
    conn: &Connection,
    repository_id: RepositoryId,
    kind: JobKind,
    parent: Option<JobId>,
) -> rusqlite::Result<JobId> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO jobs (repository_id, kind, status, phase, parent_job_id, created_at, updated_at) \
         VALUES (?1, ?2, 'pending', 'pending', ?3, ?4, ?4)",
        params![repository_id, kind.as_str(), parent, now],
    )?;
    Ok(conn.last_insert_rowid())
}

fn parse_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("invalid timestamp '{}'", s))
        })
        .transpose()
}

struct RawRepository {
    id: RepositoryId,
    name: String,
    source_url: String,
    username: Option<String>,
    password: Option<String>,
    mode: String,
    target_project_id: String,
    working_directory: String,
    trunk: Option<String>,
    branches: Option<String>,
    tags: Option<String>,
    authors_file: Option<String>,
    last_synced_revision: Option<i64>,
    last_synced_at: Option<String>,
}

impl RawRepository {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            source_url: row.get(2)?,
            username: row.get(3)?,
            password: row.get(4)?,
            mode: row.get(5)?,
            target_project_id: row.get(6)?,
            working_directory: row.get(7)?,
            trunk: row.get(8)?,
            branches: row.get(9)?,
            tags: row.get(10)?,
            authors_file: row.get(11)?,
            last_synced_revision: row.get(12)?,
            last_synced_at: row.get(13)?,
        })
    }

    fn into_repository(self) -> Result<Repository> {
        Ok(Repository {
            id: self.id,
            name: self.name,
            source_url: self.source_url,
            username: self.username,
            password: self.password,
            mode: self.mode.parse()?,
            target_project_id: self.target_project_id,
            working_directory: self.working_directory.into(),
            layout: Layout {
                trunk: self.trunk,
                branches: self.branches,
                tags: self.tags,
            },
            authors_file: self.authors_file.map(Into::into),
            last_synced_revision: self.last_synced_revision.map(|r| r as u64),
            last_synced_at: parse_time(self.last_synced_at)?,
        })
    }
}

struct RawJob {
    id: JobId,
    repository_id: RepositoryId,
    kind: String,
    status: String,
    phase: String,
    resumable: bool,
    retry_count: u32,
    parent_job_id: Option<JobId>,
    current_revision: Option<i64>,
    total_revisions: Option<i64>,
    progress: u8,
    processing_speed: Option<f64>,
    eta_seconds: Option<i64>,
    checkpoint_data: String,
    output_log: String,
    error_log: String,
    result_url: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    updated_at: String,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repository_id: row.get(1)?,
            kind: row.get(2)?,
            status: row.get(3)?,
            phase: row.get(4)?,
            resumable: row.get(5)?,
            retry_count: row.get(6)?,
            parent_job_id: row.get(7)?,
            current_revision: row.get(8)?,
            total_revisions: row.get(9)?,
            progress: row.get(10)?,
            processing_speed: row.get(11)?,
            eta_seconds: row.get(12)?,
            checkpoint_data: row.get(13)?,
            output_log: row.get(14)?,
            error_log: row.get(15)?,
            result_url: row.get(16)?,
            created_at: row.get(17)?,
            started_at: row.get(18)?,
            finished_at: row.get(19)?,
            updated_at: row.get(20)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let checkpoint_data = serde_json::from_str(&self.checkpoint_data)
            .with_context(|| format!("Job {} has unreadable checkpoint data", self.id))?;
        Ok(Job {
            id: self.id,
            repository_id: self.repository_id,
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            phase: self.phase.parse()?,
            resumable: self.resumable,
            retry_count: self.retry_count,
            parent_job_id: self.parent_job_id,
            current_revision: self.current_revision.map(|r| r as u64),
            total_revisions: self.total_revisions.map(|r| r as u64),
            progress: self.progress,
            processing_speed: self.processing_speed,
            eta_seconds: self.eta_seconds.map(|s| s as u64),
            checkpoint_data,
            output_log: self.output_log,
            error_log: self.error_log,
            result_url: self.result_url,
            created_at: parse_time(Some(self.created_at))?.unwrap_or_else(Utc::now),
            started_at: parse_time(self.started_at)?,
            finished_at: parse_time(self.finished_at)?,
            updated_at: parse_time(Some(self.updated_at))?.unwrap_or_else(Utc::now),
        })
    }
}

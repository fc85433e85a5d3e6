// ABOUTME: Phase state machine driving a migration job from validation to completion
// ABOUTME: Chooses fresh start or resume, persists each phase before its work, owns the resumable decision

pub mod push;
pub mod strategy;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::classifier::classify_message;
use crate::context::EngineContext;
use crate::error::MigratorError;
use crate::fetch::{BatchFetchEngine, FetchPlan, FetchReport, FetchSettings, GitSvnRunner};
use crate::models::{Job, JobId, JobPhase, MigrationMode, Repository};
use crate::progress::{
    ProgressTracker, FETCH_BAND, PUSH_BAND, SETUP_BAND, STRATEGY_BAND, VALIDATION_BAND,
};
use crate::supervisor::repair::{MetadataInspector, MetadataStatus};
use crate::tools::parse_revision;

/// What a finished job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub result_url: Option<String>,
    pub last_revision: Option<u64>,
}

/// Where a job picks up. `Fresh` starts over from validation.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryPoint {
    Fresh,
    Resume(Checkpoint),
}

/// Resume iff the job got past `pending`, left a checkpoint, and the checkpoint's
/// working directory is the repository's and still exists.
pub fn entry_point(job: &Job, checkpoint: Option<Checkpoint>, repo: &Repository) -> EntryPoint {
    if job.phase == JobPhase::Pending {
        return EntryPoint::Fresh;
    }
    match checkpoint {
        Some(checkpoint)
            if checkpoint.phase != JobPhase::Pending
                && checkpoint.working_directory == repo.working_directory
                && repo.working_directory.is_dir() =>
        {
            EntryPoint::Resume(checkpoint)
        }
        _ => EntryPoint::Fresh,
    }
}

/// Runs a migration job. Errors are recorded on the job before being returned.
pub async fn execute(ctx: &EngineContext, job_id: JobId) -> Result<JobOutcome> {
    let (mut run, job) = JobRun::start(ctx, job_id)?;
    let entry = entry_point(&job, run.checkpoints.load()?, &run.repo);

    let result = match entry {
        EntryPoint::Fresh => {
            info!(job_id, repository = %run.repo.name, "starting migration");
            run.fresh().await
        }
        EntryPoint::Resume(checkpoint) => {
            info!(
                job_id,
                phase = %checkpoint.phase,
                last_revision = ?checkpoint.last_fetched_revision,
                "resuming migration"
            );
            run.resume(checkpoint, job.total_revisions).await
        }
    };

    match result {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            if let Err(record_err) = run.fail(&err) {
                error!(job_id, error = %record_err, "could not record job failure");
            }
            Err(err)
        }
    }
}

/// State shared by every phase of one job attempt.
pub(crate) struct JobRun<'a> {
    pub ctx: &'a EngineContext,
    pub job_id: JobId,
    pub repo: Repository,
    pub checkpoints: CheckpointStore,
    pub tracker: ProgressTracker,
}

impl<'a> JobRun<'a> {
    /// Claims the job for this worker and checks nobody else owns the working directory.
    pub(crate) fn start(ctx: &'a EngineContext, job_id: JobId) -> Result<(Self, Job)> {
        let job = ctx.store.job(job_id)?;
        let repo = ctx.store.repository(job.repository_id)?;
        if !ctx.store.mark_running(job_id)? {
            return Err(MigratorError::Validation(format!(
                "Job {} is {} and cannot be started. Only pending jobs and resumable failures can run",
                job_id, job.status
            ))
            .into());
        }
        let run = Self {
            ctx,
            job_id,
            repo,
            checkpoints: CheckpointStore::new(ctx.store.clone(), job_id),
            tracker: ctx.tracker(job_id, job.progress),
        };
        if let Err(err) = run.ensure_exclusive() {
            if let Err(record_err) = run.fail(&err) {
                error!(job_id, error = %record_err, "could not record job failure");
            }
            return Err(err);
        }
        Ok((run, job))
    }

    pub(crate) fn dir(&self) -> PathBuf {
        self.repo.working_directory.clone()
    }

    pub(crate) fn ensure_exclusive(&self) -> Result<()> {
        if let Some(other) = self
            .ctx
            .store
            .active_job_for_repository(self.repo.id, Some(self.job_id))?
        {
            return Err(MigratorError::Busy(format!(
                "Job {} is already working on repository '{}'",
                other, self.repo.name
            ))
            .into());
        }
        Ok(())
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.ctx.store.is_cancelled(self.job_id)? {
            return Err(MigratorError::Cancelled.into());
        }
        Ok(())
    }

    async fn fresh(&mut self) -> Result<JobOutcome> {
        let total = self.validate().await?;
        self.check_cancelled()?;

        self.checkpoints.enter_phase(JobPhase::Cloning, &self.dir())?;
        self.prepare_working_copy().await?;
        self.checkpoints.reset_revision(None)?;
        self.fetch(total, 1).await?;

        self.strategy_then_push().await
    }

    async fn resume(&mut self, checkpoint: Checkpoint, known_total: Option<u64>) -> Result<JobOutcome> {
        self.checkpoints.clear_error()?;
        match checkpoint.phase {
            JobPhase::Pending | JobPhase::Cloning => {
                let total = match known_total {
                    Some(total) => total,
                    None => self.source_total().await?,
                };
                self.tracker.set_total(Some(total));
                self.checkpoints.enter_phase(JobPhase::Cloning, &self.dir())?;

                let ctx = self.ctx;
                let dir = self.dir();
                let status = MetadataInspector::new(&ctx.supervisor, &ctx.tools)
                    .check(&dir, false)
                    .await;
                let start = match status {
                    MetadataStatus::Missing => {
                        // Interrupted before the working copy was initialised.
                        self.prepare_working_copy().await?;
                        self.checkpoints.reset_revision(None)?;
                        1
                    }
                    _ => checkpoint.next_revision(),
                };
                self.fetch(total, start).await?;
                self.strategy_then_push().await
            }
            JobPhase::ApplyingStrategy => self.strategy_then_push().await,
            JobPhase::Pushing => {
                let url = self.push().await?;
                self.complete(Some(url))
            }
            JobPhase::Completed => {
                let url = self.ctx.store.job(self.job_id)?.result_url;
                self.complete(url)
            }
        }
    }

    async fn strategy_then_push(&mut self) -> Result<JobOutcome> {
        self.apply_strategy().await?;
        let url = self.push().await?;
        self.complete(Some(url))
    }

    /// Checks the source and target before anything is touched on disk.
    pub(crate) async fn validate(&mut self) -> Result<u64> {
        self.tracker.enter_band(VALIDATION_BAND)?;
        let total = self.source_total().await?;
        self.tracker.set_total(Some(total));

        let user = self.ctx.target.validate_connection().await?;
        let project = self
            .ctx
            .target
            .fetch_project(&self.repo.target_project_id)
            .await?;
        info!(
            job_id = self.job_id,
            total_revisions = total,
            target_user = %user.username,
            project = %project.web_url,
            "source and target validated"
        );
        self.tracker.finish_band()?;
        Ok(total)
    }

    pub(crate) async fn source_total(&self) -> Result<u64> {
        let total = latest_revision(self.ctx, &self.repo).await?;
        self.ctx.store.set_total_revisions(self.job_id, total)?;
        Ok(total)
    }

    /// Rebuilds the working directory and initialises the replay tool in it.
    pub(crate) async fn prepare_working_copy(&mut self) -> Result<()> {
        self.tracker.enter_band(SETUP_BAND)?;
        let dir = self.dir();
        if dir.exists() {
            self.ensure_exclusive()?;
            warn!(job_id = self.job_id, dir = %dir.display(), "removing existing working directory");
            tokio::fs::remove_dir_all(&dir).await.map_err(|err| {
                MigratorError::Validation(format!(
                    "Could not remove working directory {}: {}",
                    dir.display(),
                    err
                ))
            })?;
        }
        tokio::fs::create_dir_all(&dir).await.map_err(|err| {
            MigratorError::Validation(format!(
                "Could not create working directory {}: {}",
                dir.display(),
                err
            ))
        })?;

        let supervisor = &self.ctx.supervisor;
        let tools = &self.ctx.tools;
        supervisor.run_checked(&tools.svn_init(&self.repo, &dir)).await?;
        if let Some(authors) = &self.repo.authors_file {
            if !authors.is_file() {
                return Err(MigratorError::Validation(format!(
                    "Authors file {} does not exist",
                    authors.display()
                ))
                .into());
            }
            supervisor
                .run_checked(&tools.set_authors_file(&dir, authors))
                .await?;
        }
        self.tracker.finish_band()?;
        info!(job_id = self.job_id, dir = %dir.display(), "working copy initialised");
        Ok(())
    }

    /// Fetches `start..=total` (or the shallow tail) inside the fetch band.
    pub(crate) async fn fetch(&mut self, total: u64, start: u64) -> Result<FetchReport> {
        let plan = match self.repo.mode {
            MigrationMode::Shallow => {
                let mut plan = FetchPlan::shallow(total, self.ctx.config.shallow_revisions);
                plan.start = plan.start.max(start);
                plan
            }
            MigrationMode::FullHistory => FetchPlan::full(start, total),
        };
        self.fetch_plan(plan).await
    }

    pub(crate) async fn fetch_plan(&mut self, plan: FetchPlan) -> Result<FetchReport> {
        self.tracker.enter_band(FETCH_BAND)?;
        let dir = self.dir();
        let engine = BatchFetchEngine::new(
            self.ctx.store.clone(),
            self.checkpoints.clone(),
            self.ctx.health(),
            FetchSettings::from(self.ctx.config.as_ref()),
        );
        let runner = GitSvnRunner::new(
            self.ctx.supervisor.clone(),
            self.ctx.tools.clone(),
            &dir,
            Duration::from_secs(self.ctx.config.stale_lock_secs),
        );
        let report = engine.fetch(&runner, plan, &mut self.tracker).await?;
        self.tracker.finish_band()?;
        Ok(report)
    }

    pub(crate) async fn apply_strategy(&mut self) -> Result<()> {
        self.check_cancelled()?;
        let dir = self.dir();
        self.checkpoints.enter_phase(JobPhase::ApplyingStrategy, &dir)?;
        self.tracker.enter_band(STRATEGY_BAND)?;
        strategy::apply_strategy(&self.ctx.supervisor, &self.ctx.tools, &dir, &self.repo.layout)
            .await?;
        self.tracker.finish_band()
    }

    pub(crate) async fn push(&mut self) -> Result<String> {
        self.check_cancelled()?;
        let dir = self.dir();
        self.checkpoints.enter_phase(JobPhase::Pushing, &dir)?;
        self.tracker.enter_band(PUSH_BAND)?;
        push::push_to_target(
            &self.ctx.supervisor,
            &self.ctx.tools,
            self.ctx.target.as_ref(),
            &self.repo,
            &dir,
        )
        .await
    }

    pub(crate) fn complete(&mut self, result_url: Option<String>) -> Result<JobOutcome> {
        let checkpoint = self.checkpoints.enter_phase(JobPhase::Completed, &self.dir())?;
        self.tracker.enter_band(PUSH_BAND)?;
        self.tracker.finish_band()?;
        if !self
            .ctx
            .store
            .mark_completed(self.job_id, result_url.as_deref())?
        {
            // Cancelled while the last phase was running.
            return Err(MigratorError::Cancelled.into());
        }

        let last_revision = checkpoint.last_fetched_revision;
        if let (MigrationMode::FullHistory, Some(revision)) = (self.repo.mode, last_revision) {
            self.ctx.store.record_synced_revision(self.repo.id, revision)?;
        }
        info!(job_id = self.job_id, result = ?result_url, last_revision = ?last_revision, "job completed");
        Ok(JobOutcome {
            job_id: self.job_id,
            result_url,
            last_revision,
        })
    }

    /// Classifies `err`, appends a diagnostic line and marks the job failed.
    pub(crate) fn fail(&self, err: &anyhow::Error) -> Result<()> {
        record_failure(self.ctx, self.job_id, &self.repo.working_directory, err)
    }
}

/// Single place where an error becomes the job's `resumable` flag and terminal status.
pub(crate) fn record_failure(
    ctx: &EngineContext,
    job_id: JobId,
    working_directory: &Path,
    err: &anyhow::Error,
) -> Result<()> {
    let fallback;
    let error = match err.downcast_ref::<MigratorError>() {
        Some(error) => error,
        None => {
            let message = format!("{:#}", err);
            let class = classify_message(&message).class;
            fallback = MigratorError::migration(message, class);
            &fallback
        }
    };
    let resumable = error.is_resumable();
    let checkpoints = CheckpointStore::new(ctx.store.clone(), job_id);
    let phase = ctx.store.job(job_id)?.phase;

    if let MigratorError::Cancelled = error {
        warn!(job_id, %phase, "job cancelled");
        ctx.store.append_error(
            job_id,
            &format!("[{}] cancelled during {}", Utc::now().to_rfc3339(), phase),
        )?;
        return checkpoints.record_error(error, working_directory);
    }

    ctx.store.append_error(
        job_id,
        &format!(
            "[{}] {} {} failure during {} ({}): {}",
            Utc::now().to_rfc3339(),
            error.class(),
            error.kind(),
            phase,
            if resumable { "resumable" } else { "not resumable" },
            error
        ),
    )?;
    checkpoints.record_error(error, working_directory)?;
    ctx.store.mark_failed(job_id, resumable)?;
    error!(job_id, %phase, class = %error.class(), resumable, "job failed: {}", error);
    Ok(())
}

/// Youngest revision of the source repository; also proves the credentials work.
pub(crate) async fn latest_revision(ctx: &EngineContext, repo: &Repository) -> Result<u64> {
    let captured = ctx
        .supervisor
        .run_checked(&ctx.tools.latest_revision(repo))
        .await?;
    parse_revision(&captured.stdout).ok_or_else(|| {
        MigratorError::Validation(format!(
            "Could not read the latest revision of {} from: {}",
            repo.source_url,
            captured.stdout.trim()
        ))
        .into()
    })
}

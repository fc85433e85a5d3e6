// ABOUTME: Incremental sync of an already migrated repository
// ABOUTME: Single-flight per repository; fetches new revisions, rebases the default branch and pushes again

use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::context::EngineContext;
use crate::error::{ErrorClass, MigratorError};
use crate::fetch::FetchPlan;
use crate::models::{JobId, JobPhase, MigrationMode, RepositoryId};
use crate::phases::{JobOutcome, JobRun};
use crate::progress::SETUP_BAND;
use crate::supervisor::repair::{MetadataInspector, MetadataStatus};

/// Starts a sync unless one is already active for the repository, in which case
/// nothing is created and `None` is returned.
pub async fn start_sync(ctx: &EngineContext, repository_id: RepositoryId) -> Result<Option<JobOutcome>> {
    let repo = ctx.store.repository(repository_id)?;
    let Some(job) = ctx.store.create_sync_job_if_idle(repo.id)? else {
        info!(repository = %repo.name, "a sync is already active for this repository");
        return Ok(None);
    };
    info!(job_id = job.id, repository = %repo.name, "starting incremental sync");
    execute_sync(ctx, job.id).await.map(Some)
}

/// Runs an existing sync job record, fresh or resumed.
pub async fn execute_sync(ctx: &EngineContext, job_id: JobId) -> Result<JobOutcome> {
    let (mut run, _) = JobRun::start(ctx, job_id)?;
    match sync_repository(&mut run).await {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            if let Err(record_err) = run.fail(&err) {
                error!(job_id, error = %record_err, "could not record job failure");
            }
            Err(err)
        }
    }
}

/// First revision to fetch when the working copy has to be rebuilt.
pub fn lookback_start(latest: u64, lookback: u64) -> u64 {
    latest.saturating_sub(lookback).max(1)
}

async fn sync_repository(run: &mut JobRun<'_>) -> Result<JobOutcome> {
    if run.repo.mode != MigrationMode::FullHistory {
        return Err(MigratorError::Validation(format!(
            "Repository '{}' was migrated in {} mode and has no history to extend. Run a full_history migration first",
            run.repo.name, run.repo.mode
        ))
        .into());
    }

    let latest = run.validate().await?;
    run.check_cancelled()?;

    let dir = run.dir();
    run.checkpoints.enter_phase(JobPhase::Cloning, &dir)?;
    run.tracker.enter_band(SETUP_BAND)?;

    let ctx = run.ctx;
    let inspector = MetadataInspector::new(&ctx.supervisor, &ctx.tools);
    let mut status = inspector.check(&dir, true).await;
    if let MetadataStatus::Damaged(reason) = &status {
        warn!(job_id = run.job_id, %reason, "working copy metadata damaged, attempting repair");
        inspector
            .repair(&dir, Duration::from_secs(ctx.config.stale_lock_secs))
            .await;
        status = inspector.check(&dir, true).await;
    }

    let start = match status {
        MetadataStatus::Healthy => {
            let resumed = run.checkpoints.load()?.and_then(|c| c.last_fetched_revision);
            resumed
                .max(run.repo.last_synced_revision)
                .map_or(1, |r| r + 1)
        }
        MetadataStatus::Missing | MetadataStatus::Damaged(_) => {
            let start = lookback_start(latest, ctx.config.sync_lookback_revisions);
            warn!(
                job_id = run.job_id,
                dir = %dir.display(),
                start,
                "working copy unusable, re-cloning recent history"
            );
            run.prepare_working_copy().await?;
            run.checkpoints.reset_revision(None)?;
            start
        }
    };
    run.tracker.finish_band()?;

    if start > latest {
        info!(job_id = run.job_id, latest, "repository already up to date");
        run.checkpoints.record_revision(start - 1)?;
        return run.complete(None);
    }

    let report = run.fetch_plan(FetchPlan::full(start, latest)).await?;
    info!(
        job_id = run.job_id,
        from = start,
        to = ?report.last_revision,
        windows = report.windows,
        "fetched new revisions"
    );

    run.check_cancelled()?;
    run.checkpoints.enter_phase(JobPhase::ApplyingStrategy, &dir)?;
    rebase_local(ctx, &dir).await?;
    run.apply_strategy().await?;

    let url = run.push().await?;
    run.complete(Some(url))
}

/// Replays the default branch on top of the new history. A rebase that stops
/// half-way is aborted and reported as fatal.
async fn rebase_local(ctx: &EngineContext, dir: &std::path::Path) -> Result<()> {
    let captured = ctx.supervisor.capture(&ctx.tools.svn_rebase_local(dir)).await?;
    if captured.outcome.success() {
        return Ok(());
    }

    match ctx.supervisor.capture(&ctx.tools.rebase_abort(dir)).await {
        Ok(abort) if abort.outcome.success() => info!(dir = %dir.display(), "aborted rebase"),
        _ => warn!(dir = %dir.display(), "rebase --abort did not succeed"),
    }
    let detail = captured
        .stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no error output")
        .to_string();
    Err(MigratorError::migration(
        format!(
            "Rebase onto the new history could not complete automatically and was aborted: {}",
            detail
        ),
        ErrorClass::Fatal,
    )
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::models::{JobKind, JobStatus, Layout, NewRepository};
    use crate::store::tests::sample_repository;
    use crate::store::Store;
    use std::path::Path;

    #[test]
    fn test_lookback_start() {
        assert_eq!(lookback_start(1000, 100), 900);
        assert_eq!(lookback_start(40, 100), 1);
        assert_eq!(lookback_start(0, 100), 1);
    }

    #[tokio::test]
    async fn test_second_sync_request_is_a_noop() {
        let store = Store::open_in_memory().unwrap();
        let repo = sample_repository(&store, Path::new("/work/legacy"));
        let active = store.create_sync_job_if_idle(repo.id).unwrap().unwrap();
        let ctx = test_context(store.clone());

        let outcome = start_sync(&ctx, repo.id).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(store.count_jobs(repo.id).unwrap(), 1);
        assert_eq!(store.job(active.id).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_shallow_repository_fails_fatally() {
        let store = Store::open_in_memory().unwrap();
        let repo = store
            .insert_repository(&NewRepository {
                name: "snapshot".to_string(),
                source_url: "https://svn.example.com/repos/snapshot".to_string(),
                username: None,
                password: None,
                mode: MigrationMode::Shallow,
                target_project_id: "9".to_string(),
                working_directory: Path::new("/work/snapshot").to_path_buf(),
                layout: Layout::standard(),
                authors_file: None,
            })
            .unwrap();
        let ctx = test_context(store.clone());

        let err = start_sync(&ctx, repo.id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MigratorError>(),
            Some(MigratorError::Validation(_))
        ));
        let job = store.list_jobs(1).unwrap().remove(0);
        assert_eq!(job.kind, JobKind::IncrementalSync);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!job.resumable);
        assert!(job.error_log.contains("not resumable"));
    }
}

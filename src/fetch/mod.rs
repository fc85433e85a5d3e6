// ABOUTME: Advances a git-svn working copy through a revision range in adaptively sized windows
// ABOUTME: Checkpoints after every confirmed revision batch and shrinks the window on failure

pub mod parser;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::classifier::{classify, BatchHint};
use crate::config::EngineConfig;
use crate::error::{ErrorClass, MigratorError};
use crate::models::JobId;
use crate::progress::ProgressTracker;
use crate::store::Store;
use crate::supervisor::health::ProcessHealth;
use crate::supervisor::repair::{MetadataInspector, MetadataStatus};
use crate::supervisor::{RunOutcome, StreamLine, Supervisor};
use crate::tools::Tools;
use parser::{parse_line, OutputEvent};

/// Window used when host memory runs low.
const LOW_MEMORY_WINDOW: u64 = 5;
/// Clean windows in a row before the window is allowed to grow again.
const REGROW_AFTER: u32 = 3;
/// Buffered log lines before they are flushed to the job record.
const LOG_FLUSH_LINES: usize = 64;

/// One tool invocation's revision range. `end == None` means up to the youngest revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: u64,
    pub end: Option<u64>,
}

impl Window {
    pub fn size(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start) + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchEnd {
    Bounded(u64),
    Latest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    pub start: u64,
    pub end: FetchEnd,
    /// Exactly one window, no shrinking.
    pub shallow: bool,
}

impl FetchPlan {
    pub fn full(start: u64, total: u64) -> Self {
        Self {
            start,
            end: FetchEnd::Bounded(total),
            shallow: false,
        }
    }

    /// The most recent `tail` revisions of `total`.
    pub fn shallow(total: u64, tail: u64) -> Self {
        Self {
            start: total.saturating_sub(tail.max(1)) + 1,
            end: FetchEnd::Bounded(total),
            shallow: true,
        }
    }

    pub fn to_latest(start: u64) -> Self {
        Self {
            start,
            end: FetchEnd::Latest,
            shallow: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub last_revision: Option<u64>,
    pub windows: u32,
    pub failed_windows: u32,
    pub final_batch_size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub batch_size: u64,
    pub min_batch_size: u64,
    pub low_memory_mb: u64,
    pub critical_memory_mb: u64,
    pub checkpoint_every: u64,
}

impl From<&EngineConfig> for FetchSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            min_batch_size: config.min_batch_size.clamp(1, config.batch_size.max(1)),
            low_memory_mb: config.low_memory_mb,
            critical_memory_mb: config.critical_memory_mb,
            checkpoint_every: config.checkpoint_every.max(1),
        }
    }
}

/// Runs the replay tool for one window.
#[async_trait]
pub trait WindowRunner: Send + Sync {
    /// Health check and bounded repair before a window starts.
    async fn preflight(&self) -> Result<()> {
        Ok(())
    }

    async fn run_window(
        &self,
        window: Window,
        lines: mpsc::UnboundedSender<StreamLine>,
    ) -> Result<RunOutcome>;
}

/// Drives `git svn fetch` through the process supervisor.
pub struct GitSvnRunner {
    supervisor: Supervisor,
    tools: Tools,
    dir: PathBuf,
    stale_lock_after: Duration,
}

impl GitSvnRunner {
    pub fn new(supervisor: Supervisor, tools: Tools, dir: &Path, stale_lock_after: Duration) -> Self {
        Self {
            supervisor,
            tools,
            dir: dir.to_path_buf(),
            stale_lock_after,
        }
    }
}

#[async_trait]
impl WindowRunner for GitSvnRunner {
    async fn preflight(&self) -> Result<()> {
        let inspector = MetadataInspector::new(&self.supervisor, &self.tools);
        match inspector.check(&self.dir, false).await {
            MetadataStatus::Healthy => Ok(()),
            MetadataStatus::Missing => Err(MigratorError::Validation(format!(
                "No git repository in {}; the working copy must be initialised before fetching",
                self.dir.display()
            ))
            .into()),
            MetadataStatus::Damaged(reason) => {
                warn!(dir = %self.dir.display(), %reason, "working copy metadata needs repair");
                inspector.repair(&self.dir, self.stale_lock_after).await;
                Ok(())
            }
        }
    }

    async fn run_window(
        &self,
        window: Window,
        lines: mpsc::UnboundedSender<StreamLine>,
    ) -> Result<RunOutcome> {
        let command = self.tools.svn_fetch(&self.dir, window.start, window.end);
        self.supervisor.run(&command, lines).await
    }
}

pub struct BatchFetchEngine {
    job_id: JobId,
    store: Store,
    checkpoints: CheckpointStore,
    health: Arc<dyn ProcessHealth>,
    settings: FetchSettings,
}

impl BatchFetchEngine {
    pub fn new(
        store: Store,
        checkpoints: CheckpointStore,
        health: Arc<dyn ProcessHealth>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            job_id: checkpoints.job_id(),
            store,
            checkpoints,
            health,
            settings,
        }
    }

    pub async fn fetch(
        &self,
        runner: &dyn WindowRunner,
        plan: FetchPlan,
        tracker: &mut ProgressTracker,
    ) -> Result<FetchReport> {
        let floor = self.settings.min_batch_size;
        let mut batch = self.settings.batch_size;
        let mut current = plan.start.max(1);
        let mut confirmed = plan.start.checked_sub(1).filter(|r| *r > 0);
        let mut clean_streak = 0u32;
        let mut report = FetchReport::default();

        info!(job_id = self.job_id, start = current, end = ?plan.end, shallow = plan.shallow, "starting fetch");

        loop {
            if let FetchEnd::Bounded(total) = plan.end {
                if current > total {
                    break;
                }
            }
            if self.store.is_cancelled(self.job_id)? {
                return Err(MigratorError::Cancelled.into());
            }

            runner.preflight().await?;

            let size = if plan.shallow {
                batch
            } else {
                self.memory_adjusted(batch)?
            };
            let window = match plan.end {
                FetchEnd::Bounded(total) if plan.shallow => Window {
                    start: current,
                    end: Some(total),
                },
                FetchEnd::Bounded(total) => Window {
                    start: current,
                    end: Some(total.min(current + size - 1)),
                },
                FetchEnd::Latest => Window {
                    start: current,
                    end: None,
                },
            };

            debug!(job_id = self.job_id, ?window, "fetching window");
            let (tx, rx) = mpsc::unbounded_channel();
            let mut consumer = WindowConsumer::new(self, tracker, window.start);
            let (outcome, consumed) = tokio::join!(runner.run_window(window, tx), consumer.consume(rx));
            consumed?;
            let reached = consumer.reached;
            let completed_marker = consumer.completed_marker;
            let outcome = outcome?;
            report.windows += 1;

            if outcome.success() {
                let done = match window.end {
                    // A clean exit confirms the whole window; empty revisions print no marker.
                    Some(end) => reached.map_or(end, |r| r.max(end)),
                    None => match reached.or(confirmed) {
                        Some(r) => r,
                        None => {
                            report.final_batch_size = batch;
                            report.last_revision = confirmed;
                            return Ok(report);
                        }
                    },
                };
                self.checkpoints.record_revision(done)?;
                tracker.observe(done)?;
                confirmed = Some(done);
                current = done + 1;

                clean_streak += 1;
                if clean_streak >= REGROW_AFTER && batch < self.settings.batch_size {
                    batch = (batch * 2).min(self.settings.batch_size);
                    clean_streak = 0;
                    debug!(job_id = self.job_id, batch, "growing window");
                }

                if plan.shallow || window.end.is_none() {
                    debug!(job_id = self.job_id, completed_marker, "single-window fetch done");
                    break;
                }
                continue;
            }

            report.failed_windows += 1;
            clean_streak = 0;
            let diagnostic = outcome.diagnostic();
            let classification = classify(&diagnostic, outcome.termination);
            let progressed = reached.filter(|r| *r >= window.start);
            if let Some(r) = progressed {
                self.checkpoints.record_revision(r)?;
                confirmed = Some(r);
            }

            let summary = format!(
                "window r{}:{} failed ({}: {}), reached {}",
                window.start,
                window.end.map_or("HEAD".to_string(), |e| e.to_string()),
                classification.class,
                classification.reason,
                progressed.map_or("nothing".to_string(), |r| format!("r{}", r)),
            );
            warn!(job_id = self.job_id, "{}", summary);
            self.store.append_error(self.job_id, &summary)?;

            let last_line = diagnostic
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no error output")
                .to_string();
            let failure = |class: ErrorClass, message: String| MigratorError::Migration {
                message,
                class,
                last_revision: confirmed,
            };

            match classification.class {
                ErrorClass::Fatal => {
                    return Err(failure(ErrorClass::Fatal, last_line).into());
                }
                ErrorClass::Unknown if progressed.is_none() => {
                    return Err(failure(ErrorClass::Fatal, last_line).into());
                }
                _ => {}
            }

            if plan.shallow {
                return Err(failure(classification.class, last_line).into());
            }

            if let Some(r) = progressed {
                current = r + 1;
            } else if size <= floor {
                // At the floor with nothing to show: stop here. Network trouble stays resumable.
                let class = if classification.network {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                };
                return Err(failure(
                    class,
                    format!("no progress with a {}-revision window: {}", size, last_line),
                )
                .into());
            }

            batch = (size / 2).max(floor);
            match classification.batch_hint {
                Some(BatchHint::Minimal) => batch = floor,
                Some(BatchHint::Small) => batch = batch.min(LOW_MEMORY_WINDOW).max(floor),
                None => {}
            }
            self.checkpoints
                .set_metadata("batch_size", serde_json::Value::from(batch))?;
            info!(job_id = self.job_id, batch, next = current, "retrying with smaller window");
        }

        report.final_batch_size = batch;
        report.last_revision = confirmed;
        info!(job_id = self.job_id, last_revision = ?confirmed, windows = report.windows, "fetch finished");
        Ok(report)
    }

    fn memory_adjusted(&self, batch: u64) -> Result<u64> {
        let Some(available) = self.health.available_memory_mb() else {
            return Ok(batch);
        };
        let (size, reason) = if available < self.settings.critical_memory_mb {
            (self.settings.min_batch_size, "critical")
        } else if available < self.settings.low_memory_mb {
            (batch.min(LOW_MEMORY_WINDOW), "low")
        } else {
            return Ok(batch);
        };
        if size < batch {
            warn!(job_id = self.job_id, available_mb = available, size, "{} memory, shrinking window", reason);
            self.checkpoints.set_metadata(
                "batch_reason",
                serde_json::Value::from(format!("{} memory: {} MB available", reason, available)),
            )?;
        }
        Ok(size.min(batch))
    }
}

/// Consumes one window's output while the tool runs.
struct WindowConsumer<'a> {
    engine: &'a BatchFetchEngine,
    tracker: &'a mut ProgressTracker,
    window_start: u64,
    reached: Option<u64>,
    last_checkpointed: Option<u64>,
    completed_marker: bool,
    stdout: Vec<String>,
    stderr: Vec<String>,
}

impl<'a> WindowConsumer<'a> {
    fn new(engine: &'a BatchFetchEngine, tracker: &'a mut ProgressTracker, window_start: u64) -> Self {
        Self {
            engine,
            tracker,
            window_start,
            reached: None,
            last_checkpointed: window_start.checked_sub(1),
            completed_marker: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    async fn consume(&mut self, mut rx: mpsc::UnboundedReceiver<StreamLine>) -> Result<()> {
        while let Some(line) = rx.recv().await {
            match line {
                StreamLine::Stdout(text) => {
                    match parse_line(&text) {
                        OutputEvent::Revision(marker) => self.on_revision(marker.revision)?,
                        OutputEvent::Completed => self.completed_marker = true,
                        OutputEvent::Warning(warning) => debug!(%warning, "tool warning"),
                        OutputEvent::Other => {}
                    }
                    self.stdout.push(text);
                }
                StreamLine::Stderr(text) => self.stderr.push(text),
            }
            if self.stdout.len() + self.stderr.len() >= LOG_FLUSH_LINES {
                self.flush()?;
            }
        }
        self.flush()
    }

    fn on_revision(&mut self, revision: u64) -> Result<()> {
        // Markers below the window belong to branch-point lookups, not new history.
        if revision < self.window_start {
            return Ok(());
        }
        if self.reached.map_or(true, |r| revision > r) {
            self.reached = Some(revision);
        }
        self.tracker.observe(revision)?;

        let since = revision.saturating_sub(self.last_checkpointed.unwrap_or(0));
        if since >= self.engine.settings.checkpoint_every {
            self.flush()?;
            self.engine.checkpoints.record_revision(revision)?;
            self.last_checkpointed = Some(revision);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let store = &self.engine.store;
        let job_id = self.engine.job_id;
        if !self.stdout.is_empty() {
            store.append_output(job_id, &self.stdout.join("\n"))?;
            self.stdout.clear();
        }
        if !self.stderr.is_empty() {
            store.append_error(job_id, &self.stderr.join("\n"))?;
            self.stderr.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Termination;
    use crate::models::{JobKind, JobPhase};
    use crate::progress::{RecordingChannel, TrackerSettings, FETCH_BAND};
    use crate::store::tests::sample_repository;
    use crate::supervisor::health::PortableHealth;
    use std::sync::Mutex;

    /// What a scripted window does: print markers up to `reach`, then exit.
    struct Step {
        reach: Option<u64>,
        stderr: &'static str,
        termination: Termination,
    }

    fn ok_to(reach: u64) -> Step {
        Step {
            reach: Some(reach),
            stderr: "",
            termination: Termination::exited(0),
        }
    }

    fn fail(reach: Option<u64>, stderr: &'static str) -> Step {
        Step {
            reach,
            stderr,
            termination: Termination::exited(1),
        }
    }

    struct ScriptedRunner {
        steps: Mutex<Vec<Step>>,
        windows: Mutex<Vec<Window>>,
    }

    impl ScriptedRunner {
        fn new(mut steps: Vec<Step>) -> Self {
            steps.reverse();
            Self {
                steps: Mutex::new(steps),
                windows: Mutex::new(Vec::new()),
            }
        }

        fn windows(&self) -> Vec<Window> {
            self.windows.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WindowRunner for ScriptedRunner {
        async fn run_window(
            &self,
            window: Window,
            lines: mpsc::UnboundedSender<StreamLine>,
        ) -> Result<RunOutcome> {
            self.windows.lock().unwrap().push(window);
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| ok_to(window.end.unwrap_or(window.start)));
            if let Some(reach) = step.reach {
                for rev in window.start..=reach {
                    let _ = lines.send(StreamLine::Stdout(format!(
                        "r{} = {:040x} (refs/remotes/origin/trunk)",
                        rev, rev
                    )));
                }
            }
            if !step.stderr.is_empty() {
                let _ = lines.send(StreamLine::Stderr(step.stderr.to_string()));
            }
            Ok(RunOutcome {
                termination: step.termination,
                stderr_tail: step.stderr.to_string(),
                stdout_lines: 0,
                intervention: None,
                elapsed: Duration::from_millis(1),
            })
        }
    }

    struct Harness {
        store: Store,
        checkpoints: CheckpointStore,
        engine: BatchFetchEngine,
        tracker: ProgressTracker,
    }

    fn harness(batch_size: u64, min_batch_size: u64) -> Harness {
        let store = Store::open_in_memory().unwrap();
        let repo = sample_repository(&store, Path::new("/work/legacy"));
        let job = store.create_job(repo.id, JobKind::Migration).unwrap();
        store.mark_running(job.id).unwrap();
        let checkpoints = CheckpointStore::new(store.clone(), job.id);
        checkpoints
            .enter_phase(JobPhase::Cloning, Path::new("/work/legacy"))
            .unwrap();
        let settings = FetchSettings {
            batch_size,
            min_batch_size,
            low_memory_mb: 0,
            critical_memory_mb: 0,
            checkpoint_every: 50,
        };
        let engine = BatchFetchEngine::new(
            store.clone(),
            checkpoints.clone(),
            Arc::new(PortableHealth),
            settings,
        );
        let mut tracker = ProgressTracker::new(
            job.id,
            store.clone(),
            Arc::new(RecordingChannel::default()),
            TrackerSettings::default(),
            0,
        );
        tracker.enter_band(FETCH_BAND).unwrap();
        Harness {
            store,
            checkpoints,
            engine,
            tracker,
        }
    }

    fn last_fetched(h: &Harness) -> Option<u64> {
        h.checkpoints.load().unwrap().unwrap().last_fetched_revision
    }

    #[tokio::test]
    async fn test_clean_run_walks_windows() {
        let mut h = harness(100, 1);
        h.tracker.set_total(Some(250));
        let runner = ScriptedRunner::new(vec![]);
        let report = h
            .engine
            .fetch(&runner, FetchPlan::full(1, 250), &mut h.tracker)
            .await
            .unwrap();

        let windows = runner.windows();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], Window { start: 1, end: Some(100) });
        assert_eq!(windows[2], Window { start: 201, end: Some(250) });
        assert_eq!(report.last_revision, Some(250));
        assert_eq!(last_fetched(&h), Some(250));
        assert_eq!(h.tracker.progress(), 70);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_progress_and_halves_window() {
        let mut h = harness(100, 1);
        h.tracker.set_total(Some(250));
        let runner = ScriptedRunner::new(vec![fail(
            Some(140),
            "svn: E000104: Connection reset by peer",
        )]);
        let report = h
            .engine
            .fetch(&runner, FetchPlan::full(1, 250), &mut h.tracker)
            .await
            .unwrap();

        let windows = runner.windows();
        assert_eq!(windows[1], Window { start: 141, end: Some(190) });
        assert_eq!(report.failed_windows, 1);
        assert_eq!(report.last_revision, Some(250));
        assert_eq!(h.tracker.progress(), 70);
        let job = h.store.job(h.checkpoints.job_id()).unwrap();
        assert!(job.error_log.contains("Connection reset by peer"));
    }

    #[tokio::test]
    async fn test_zero_progress_transient_retries_same_start() {
        let mut h = harness(100, 1);
        h.tracker.set_total(Some(100));
        let runner = ScriptedRunner::new(vec![fail(None, "Connection reset by peer")]);
        h.engine
            .fetch(&runner, FetchPlan::full(1, 100), &mut h.tracker)
            .await
            .unwrap();

        let windows = runner.windows();
        assert_eq!(windows[0], Window { start: 1, end: Some(100) });
        assert_eq!(windows[1], Window { start: 1, end: Some(50) });
    }

    #[tokio::test]
    async fn test_fatal_error_fails_without_shrinking() {
        let mut h = harness(100, 1);
        h.tracker.set_total(Some(300));
        let runner = ScriptedRunner::new(vec![fail(Some(30), "svn: E170001: 403 Forbidden")]);
        let err = h
            .engine
            .fetch(&runner, FetchPlan::full(1, 300), &mut h.tracker)
            .await
            .unwrap_err();

        let err = err.downcast_ref::<MigratorError>().unwrap();
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(!err.is_resumable());
        assert_eq!(runner.windows().len(), 1);
        assert_eq!(last_fetched(&h), Some(30));
    }

    #[tokio::test]
    async fn test_shrink_stops_at_floor() {
        let mut h = harness(8, 2);
        h.tracker.set_total(Some(100));
        let steps = (0..10).map(|_| fail(None, "disk full")).collect();
        let runner = ScriptedRunner::new(steps);
        let err = h
            .engine
            .fetch(&runner, FetchPlan::full(1, 100), &mut h.tracker)
            .await
            .unwrap_err();

        let sizes: Vec<u64> = runner.windows().iter().filter_map(Window::size).collect();
        assert_eq!(sizes, vec![8, 4, 2]);
        let err = err.downcast_ref::<MigratorError>().unwrap();
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_network_failure_at_floor_stays_resumable() {
        let mut h = harness(2, 1);
        h.tracker.set_total(Some(10));
        let steps = (0..5).map(|_| fail(None, "Could not resolve host: svn.example.com")).collect();
        let runner = ScriptedRunner::new(steps);
        let err = h
            .engine
            .fetch(&runner, FetchPlan::full(1, 10), &mut h.tracker)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<MigratorError>().unwrap().is_resumable());
        assert_eq!(runner.windows().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_failure_without_progress_is_fatal() {
        let mut h = harness(10, 1);
        h.tracker.set_total(Some(10));
        let runner = ScriptedRunner::new(vec![fail(None, "")]);
        let err = h
            .engine
            .fetch(&runner, FetchPlan::full(1, 10), &mut h.tracker)
            .await
            .unwrap_err();
        assert!(!err.downcast_ref::<MigratorError>().unwrap().is_resumable());
    }

    #[tokio::test]
    async fn test_resume_never_rerequests_fetched_revisions() {
        let mut h = harness(50, 1);
        h.tracker.set_total(Some(200));
        h.checkpoints.record_revision(120).unwrap();
        let start = h.checkpoints.load().unwrap().unwrap().next_revision();
        let runner = ScriptedRunner::new(vec![]);
        h.engine
            .fetch(&runner, FetchPlan::full(start, 200), &mut h.tracker)
            .await
            .unwrap();
        assert!(runner.windows().iter().all(|w| w.start > 120));
        assert_eq!(runner.windows()[0].start, 121);
    }

    #[tokio::test]
    async fn test_shallow_runs_exactly_one_window() {
        let mut h = harness(100, 1);
        h.tracker.set_total(Some(500));
        let runner = ScriptedRunner::new(vec![fail(None, "Connection reset by peer")]);
        let err = h
            .engine
            .fetch(&runner, FetchPlan::shallow(500, 10), &mut h.tracker)
            .await
            .unwrap_err();
        assert_eq!(runner.windows(), vec![Window { start: 491, end: Some(500) }]);
        assert!(err.downcast_ref::<MigratorError>().unwrap().is_resumable());
    }

    #[tokio::test]
    async fn test_sigkill_drops_to_minimal_window() {
        let mut h = harness(100, 1);
        h.tracker.set_total(Some(200));
        let runner = ScriptedRunner::new(vec![Step {
            reach: Some(10),
            stderr: "",
            termination: Termination::signalled(9),
        }]);
        h.engine
            .fetch(&runner, FetchPlan::full(1, 200), &mut h.tracker)
            .await
            .unwrap();
        assert_eq!(runner.windows()[1], Window { start: 11, end: Some(11) });
    }

    #[tokio::test]
    async fn test_cancelled_job_stops_before_next_window() {
        let mut h = harness(100, 1);
        h.tracker.set_total(Some(200));
        h.store.mark_cancelled(h.checkpoints.job_id()).unwrap();
        let runner = ScriptedRunner::new(vec![]);
        let err = h
            .engine
            .fetch(&runner, FetchPlan::full(1, 200), &mut h.tracker)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MigratorError>(),
            Some(MigratorError::Cancelled)
        ));
        assert!(runner.windows().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_never_exceeds_markers_on_failure() {
        let mut h = harness(100, 1);
        h.tracker.set_total(Some(100));
        let runner = ScriptedRunner::new(vec![fail(Some(73), "Connection closed")]);
        h.engine
            .fetch(&runner, FetchPlan::full(1, 100), &mut h.tracker)
            .await
            .unwrap();
        let job = h.store.job(h.checkpoints.job_id()).unwrap();
        assert!(job.error_log.contains("reached r73"));
    }
}

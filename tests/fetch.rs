// ABOUTME: End-to-end test of the batch fetch engine driving a fake git-svn through the supervisor
// ABOUTME: The fake tool drops its connection once mid-window to exercise partial-progress recovery

#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::{fast_limits, supervisor, write_script};
use svn_git_migrator::checkpoint::CheckpointStore;
use svn_git_migrator::fetch::{BatchFetchEngine, FetchPlan, FetchSettings, GitSvnRunner};
use svn_git_migrator::models::{Job, JobKind, JobPhase, Layout, MigrationMode, NewRepository};
use svn_git_migrator::progress::{ProgressTracker, RecordingChannel, TrackerSettings, FETCH_BAND};
use svn_git_migrator::store::Store;
use svn_git_migrator::supervisor::health::PortableHealth;
use svn_git_migrator::tools::Tools;

/// Fake `git`: answers rev-parse, and for `svn fetch -r S:E` prints one marker per
/// revision. The first window containing `fail_at` stops just before it with a
/// network error; a marker file makes the failure happen only once.
fn fake_git(bin: &Path, head: u64, fail_at: u64) -> PathBuf {
    let flag = bin.join("failed-once");
    let body = format!(
        r#"calls="{calls}"
echo "$*" >> "$calls"
case "$1" in
  rev-parse) echo .git; exit 0 ;;
  svn)
    range="$4"
    start="${{range%%:*}}"
    end="${{range#*:}}"
    if [ "$end" = "HEAD" ]; then end={head}; fi
    i="$start"
    while [ "$i" -le "$end" ]; do
      if [ "$i" -eq {fail_at} ] && [ ! -f "{flag}" ]; then
        touch "{flag}"
        echo "svn: E000104: Connection reset by peer" >&2
        exit 1
      fi
      echo "r$i = $(printf '%040d' "$i") (refs/remotes/origin/trunk)"
      i=$((i + 1))
    done
    echo "Checked out HEAD:"
    exit 0 ;;
esac
exit 0"#,
        calls = bin.join("calls").display(),
        head = head,
        fail_at = fail_at,
        flag = flag.display(),
    );
    write_script(bin, "git", &body)
}

fn fetch_calls(bin: &Path) -> Vec<String> {
    std::fs::read_to_string(bin.join("calls"))
        .unwrap_or_default()
        .lines()
        .filter(|l| l.starts_with("svn fetch"))
        .map(str::to_string)
        .collect()
}

fn fixture(work: &Path) -> (Store, Job, CheckpointStore) {
    let store = Store::open_in_memory().unwrap();
    let repo = store
        .insert_repository(&NewRepository {
            name: "legacy".to_string(),
            source_url: "https://svn.example.com/repos/legacy".to_string(),
            username: None,
            password: None,
            mode: MigrationMode::FullHistory,
            target_project_id: "42".to_string(),
            working_directory: work.to_path_buf(),
            layout: Layout::standard(),
            authors_file: None,
        })
        .unwrap();
    let job = store.create_job(repo.id, JobKind::Migration).unwrap();
    store.mark_running(job.id).unwrap();
    let checkpoints = CheckpointStore::new(store.clone(), job.id);
    checkpoints.enter_phase(JobPhase::Cloning, work).unwrap();

    (store, job, checkpoints)
}

fn settings() -> FetchSettings {
    FetchSettings {
        batch_size: 10,
        min_batch_size: 1,
        low_memory_mb: 0,
        critical_memory_mb: 0,
        checkpoint_every: 50,
    }
}

#[tokio::test]
async fn test_fetch_recovers_from_mid_window_failure() {
    let bin = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    std::fs::create_dir(work.path().join(".git")).unwrap();
    let git = fake_git(bin.path(), 25, 14);

    let (store, job, checkpoints) = fixture(work.path());

    let tools = Tools {
        git,
        svn: PathBuf::from("svn"),
    };
    let runner = GitSvnRunner::new(
        supervisor(fast_limits()),
        tools,
        work.path(),
        Duration::from_secs(600),
    );
    let engine = BatchFetchEngine::new(
        store.clone(),
        checkpoints.clone(),
        Arc::new(PortableHealth),
        settings(),
    );
    let channel = Arc::new(RecordingChannel::default());
    let mut tracker = ProgressTracker::new(
        job.id,
        store.clone(),
        channel.clone(),
        TrackerSettings::default(),
        0,
    );
    tracker.set_total(Some(25));
    tracker.enter_band(FETCH_BAND).unwrap();

    let report = engine
        .fetch(&runner, FetchPlan::full(1, 25), &mut tracker)
        .await
        .unwrap();

    assert_eq!(report.last_revision, Some(25));
    assert_eq!(report.failed_windows, 1);
    assert_eq!(
        fetch_calls(bin.path()),
        vec![
            "svn fetch -r 1:10",
            "svn fetch -r 11:20",
            "svn fetch -r 14:18",
            "svn fetch -r 19:23",
            "svn fetch -r 24:25",
        ]
    );

    let checkpoint = checkpoints.load().unwrap().unwrap();
    assert_eq!(checkpoint.last_fetched_revision, Some(25));

    let job = store.job(job.id).unwrap();
    assert_eq!(job.progress, 70);
    assert!(job.error_log.contains("Connection reset by peer"));
    assert!(job.output_log.contains("r13 = "));

    let published: Vec<u8> = channel
        .snapshots()
        .iter()
        .map(|(_, s)| s.progress_percentage)
        .collect();
    assert!(published.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_open_ended_fetch_runs_to_head() {
    let bin = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    std::fs::create_dir(work.path().join(".git")).unwrap();
    let git = fake_git(bin.path(), 25, 0);
    let (store, job, checkpoints) = fixture(work.path());
    checkpoints.record_revision(20).unwrap();

    let runner = GitSvnRunner::new(
        supervisor(fast_limits()),
        Tools {
            git,
            svn: PathBuf::from("svn"),
        },
        work.path(),
        Duration::from_secs(600),
    );
    let engine = BatchFetchEngine::new(
        store.clone(),
        checkpoints.clone(),
        Arc::new(PortableHealth),
        settings(),
    );
    let mut tracker = ProgressTracker::new(
        job.id,
        store.clone(),
        Arc::new(RecordingChannel::default()),
        TrackerSettings::default(),
        20,
    );
    tracker.enter_band(FETCH_BAND).unwrap();

    let report = engine
        .fetch(&runner, FetchPlan::to_latest(21), &mut tracker)
        .await
        .unwrap();

    assert_eq!(report.windows, 1);
    assert_eq!(report.last_revision, Some(25));
    assert_eq!(fetch_calls(bin.path()), vec!["svn fetch -r 21:HEAD"]);
    assert_eq!(
        checkpoints.load().unwrap().unwrap().last_fetched_revision,
        Some(25)
    );
}

// ABOUTME: Pre-flight health check of the working copy's git and git-svn metadata
// ABOUTME: Best-effort repair removes stale lock files, refreshes the index and rebuilds revision maps

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::Supervisor;
use crate::tools::Tools;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataStatus {
    Healthy,
    /// No repository at all; nothing to repair.
    Missing,
    Damaged(String),
}

#[derive(Debug, Default, Clone)]
pub struct RepairReport {
    pub removed_locks: Vec<PathBuf>,
    pub kept_locks: Vec<PathBuf>,
    pub index_refreshed: bool,
    pub metadata_rebuilt: bool,
}

pub struct MetadataInspector<'a> {
    supervisor: &'a Supervisor,
    tools: &'a Tools,
}

impl<'a> MetadataInspector<'a> {
    pub fn new(supervisor: &'a Supervisor, tools: &'a Tools) -> Self {
        Self { supervisor, tools }
    }

    /// Lightweight check: repository present, git answers, no lock files, git-svn metadata
    /// present when `require_svn` is set.
    pub async fn check(&self, dir: &Path, require_svn: bool) -> MetadataStatus {
        let git_dir = dir.join(".git");
        if !git_dir.is_dir() {
            return MetadataStatus::Missing;
        }
        match self.supervisor.capture(&self.tools.rev_parse_git_dir(dir)).await {
            Ok(captured) if captured.outcome.success() => {}
            Ok(captured) => {
                return MetadataStatus::Damaged(format!(
                    "git rev-parse failed: {}",
                    captured.stderr.trim()
                ))
            }
            Err(err) => return MetadataStatus::Damaged(format!("git rev-parse failed: {err:#}")),
        }
        let locks = find_lock_files(&git_dir);
        if !locks.is_empty() {
            return MetadataStatus::Damaged(format!("{} lock file(s) present", locks.len()));
        }
        if require_svn && !git_dir.join("svn").is_dir() {
            return MetadataStatus::Damaged("git-svn metadata directory missing".to_string());
        }
        MetadataStatus::Healthy
    }

    /// Removes lock files older than `stale_after` when no process is working inside `dir`,
    /// then refreshes the index and asks git-svn to rebuild its revision map.
    pub async fn repair(&self, dir: &Path, stale_after: Duration) -> RepairReport {
        let git_dir = dir.join(".git");
        let mut report = RepairReport::default();
        let busy = self.supervisor.health().has_process_in(dir);

        for lock in find_lock_files(&git_dir) {
            let age = lock_age(&lock);
            let stale = !busy && age.map_or(false, |age| age >= stale_after);
            if !stale {
                debug!(lock = %lock.display(), ?age, busy, "keeping lock file");
                report.kept_locks.push(lock);
                continue;
            }
            match std::fs::remove_file(&lock) {
                Ok(()) => {
                    info!(lock = %lock.display(), "removed stale lock file");
                    report.removed_locks.push(lock);
                }
                Err(err) => {
                    warn!(lock = %lock.display(), error = %err, "could not remove lock file");
                    report.kept_locks.push(lock);
                }
            }
        }

        report.index_refreshed = matches!(
            self.supervisor.capture(&self.tools.update_index_refresh(dir)).await,
            Ok(c) if c.outcome.success()
        );
        if git_dir.join("svn").is_dir() {
            report.metadata_rebuilt = matches!(
                self.supervisor.capture(&self.tools.svn_info_local(dir)).await,
                Ok(c) if c.outcome.success()
            );
        }
        info!(
            dir = %dir.display(),
            removed = report.removed_locks.len(),
            kept = report.kept_locks.len(),
            index_refreshed = report.index_refreshed,
            metadata_rebuilt = report.metadata_rebuilt,
            "metadata repair finished"
        );
        report
    }
}

fn find_lock_files(git_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(git_dir)
        .max_depth(6)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map_or(false, |name| name.ends_with(".lock"))
        })
        .map(|entry| entry.into_path())
        .collect()
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_lock_files() {
        let dir = tempfile::tempdir().unwrap();
        let git = dir.path().join(".git");
        std::fs::create_dir_all(git.join("refs/heads")).unwrap();
        std::fs::write(git.join("index.lock"), b"").unwrap();
        std::fs::write(git.join("refs/heads/main.lock"), b"").unwrap();
        std::fs::write(git.join("HEAD"), b"ref: refs/heads/main").unwrap();

        let mut locks = find_lock_files(&git);
        locks.sort();
        assert_eq!(locks.len(), 2);
        assert!(locks.iter().all(|p| p.extension().unwrap() == "lock"));
    }

    #[test]
    fn test_fresh_lock_has_small_age() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("index.lock");
        std::fs::write(&lock, b"").unwrap();
        let age = lock_age(&lock).unwrap();
        assert!(age < Duration::from_secs(60));
    }
}

// ABOUTME: Argument-vector builders for git, git-svn and svn invocations
// ABOUTME: Resolves tool binaries with `which` so a missing tool fails validation early

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::EngineConfig;
use crate::error::MigratorError;
use crate::models::{Layout, Repository};
use crate::supervisor::ToolCommand;

/// Prefix for the remote-tracking refs the replay tool writes.
pub const SVN_REMOTE_PREFIX: &str = "origin/";
pub const TARGET_REMOTE: &str = "target";

#[derive(Debug, Clone)]
pub struct Tools {
    pub git: PathBuf,
    pub svn: PathBuf,
}

impl Tools {
    /// Uses the configured names as given, without checking they exist.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            git: PathBuf::from(&config.git_binary),
            svn: PathBuf::from(&config.svn_binary),
        }
    }

    pub fn resolve(config: &EngineConfig) -> Result<Self> {
        let find = |name: &str| {
            which::which(name).map_err(|_| {
                MigratorError::Validation(format!(
                    "Required tool '{}' was not found on PATH. Install it or set its path in the configuration",
                    name
                ))
            })
        };
        Ok(Self {
            git: find(&config.git_binary)?,
            svn: find(&config.svn_binary)?,
        })
    }

    pub fn git(&self, dir: &Path) -> ToolCommand {
        ToolCommand::new(&self.git)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
    }

    /// `svn info` on the source URL; prints the youngest revision.
    pub fn latest_revision(&self, repo: &Repository) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.svn).args([
            "info",
            "--show-item",
            "revision",
            "--non-interactive",
        ]);
        if let Some(user) = &repo.username {
            cmd = cmd.args(["--username", user.as_str()]);
        }
        if let Some(password) = &repo.password {
            cmd = cmd.args(["--password", password.as_str()]);
        }
        cmd.arg(repo.source_url.as_str())
    }

    pub fn svn_init(&self, repo: &Repository, dir: &Path) -> ToolCommand {
        let mut cmd = self
            .git(dir)
            .args(["svn", "init"])
            .arg(format!("--prefix={}", SVN_REMOTE_PREFIX));
        cmd = cmd.args(layout_args(&repo.layout));
        if let Some(user) = &repo.username {
            cmd = cmd.arg(format!("--username={}", user));
        }
        cmd.arg(repo.source_url.as_str())
    }

    pub fn set_authors_file(&self, dir: &Path, authors: &Path) -> ToolCommand {
        self.git(dir)
            .args(["config", "svn.authorsfile"])
            .arg(authors.to_string_lossy().into_owned())
    }

    /// Fetches `start..=end`, or `start..HEAD` when `end` is open.
    pub fn svn_fetch(&self, dir: &Path, start: u64, end: Option<u64>) -> ToolCommand {
        let range = match end {
            Some(end) => format!("{}:{}", start, end),
            None => format!("{}:HEAD", start),
        };
        self.git(dir).args(["svn", "fetch", "-r"]).arg(range)
    }

    pub fn svn_info_local(&self, dir: &Path) -> ToolCommand {
        self.git(dir).args(["svn", "info"])
    }

    pub fn svn_rebase_local(&self, dir: &Path) -> ToolCommand {
        self.git(dir).args(["svn", "rebase", "--local"])
    }

    pub fn rebase_abort(&self, dir: &Path) -> ToolCommand {
        self.git(dir).args(["rebase", "--abort"])
    }

    pub fn rev_parse_git_dir(&self, dir: &Path) -> ToolCommand {
        self.git(dir).args(["rev-parse", "--git-dir"])
    }

    pub fn update_index_refresh(&self, dir: &Path) -> ToolCommand {
        self.git(dir).args(["update-index", "-q", "--refresh"])
    }

    pub fn remote_refs(&self, dir: &Path) -> ToolCommand {
        self.git(dir).args([
            "for-each-ref",
            "--format=%(refname)",
            "refs/remotes/origin",
        ])
    }

    pub fn force_branch(&self, dir: &Path, name: &str, target: &str) -> ToolCommand {
        self.git(dir).args(["branch", "-f", name, target])
    }

    pub fn force_tag(&self, dir: &Path, name: &str, target: &str) -> ToolCommand {
        self.git(dir).args(["tag", "-f", name, target])
    }

    /// Creates or resets `branch` to `target` and checks it out.
    pub fn checkout_reset(&self, dir: &Path, branch: &str, target: &str) -> ToolCommand {
        self.git(dir).args(["checkout", "-q", "-B", branch, target])
    }

    pub fn remote_remove(&self, dir: &Path, name: &str) -> ToolCommand {
        self.git(dir).args(["remote", "remove", name])
    }

    pub fn remote_add(&self, dir: &Path, name: &str, url: &str) -> ToolCommand {
        self.git(dir).args(["remote", "add", name, url])
    }

    pub fn push_branches(&self, dir: &Path, remote: &str) -> ToolCommand {
        self.git(dir).args(["push", "--all", remote])
    }

    pub fn push_tags(&self, dir: &Path, remote: &str) -> ToolCommand {
        self.git(dir).args(["push", "--tags", remote])
    }
}

fn layout_args(layout: &Layout) -> Vec<String> {
    if layout.is_standard() {
        return vec!["--stdlayout".to_string()];
    }
    let mut args = Vec::new();
    if let Some(trunk) = &layout.trunk {
        args.push(format!("--trunk={}", trunk));
    }
    if let Some(branches) = &layout.branches {
        args.push(format!("--branches={}", branches));
    }
    if let Some(tags) = &layout.tags {
        args.push(format!("--tags={}", tags));
    }
    args
}

/// Remote-tracking ref holding the main line of development.
pub fn trunk_ref(layout: &Layout) -> String {
    if layout.trunk.is_some() {
        format!("refs/remotes/{}trunk", SVN_REMOTE_PREFIX)
    } else {
        format!("refs/remotes/{}git-svn", SVN_REMOTE_PREFIX)
    }
}

/// Parses `svn info --show-item revision` output.
pub fn parse_revision(stdout: &str) -> Option<u64> {
    stdout.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MigrationMode;

    fn repo(layout: Layout) -> Repository {
        Repository {
            id: 1,
            name: "legacy".to_string(),
            source_url: "https://svn.example.com/repos/legacy".to_string(),
            username: Some("alice".to_string()),
            password: Some("secret".to_string()),
            mode: MigrationMode::FullHistory,
            target_project_id: "7".to_string(),
            working_directory: PathBuf::from("/work/legacy"),
            layout,
            authors_file: None,
            last_synced_revision: None,
            last_synced_at: None,
        }
    }

    fn tools() -> Tools {
        Tools {
            git: PathBuf::from("git"),
            svn: PathBuf::from("svn"),
        }
    }

    #[test]
    fn test_fetch_range() {
        let cmd = tools().svn_fetch(Path::new("/w"), 141, Some(190));
        assert_eq!(cmd.args, vec!["svn", "fetch", "-r", "141:190"]);
        let cmd = tools().svn_fetch(Path::new("/w"), 7, None);
        assert_eq!(cmd.args.last().map(String::as_str), Some("7:HEAD"));
    }

    #[test]
    fn test_init_uses_stdlayout_for_standard() {
        let cmd = tools().svn_init(&repo(Layout::standard()), Path::new("/w"));
        assert!(cmd.args.contains(&"--stdlayout".to_string()));
        assert_eq!(cmd.args.last().unwrap(), "https://svn.example.com/repos/legacy");
    }

    #[test]
    fn test_init_with_custom_layout() {
        let layout = Layout {
            trunk: Some("main".to_string()),
            branches: None,
            tags: Some("releases".to_string()),
        };
        let cmd = tools().svn_init(&repo(layout.clone()), Path::new("/w"));
        assert!(cmd.args.contains(&"--trunk=main".to_string()));
        assert!(cmd.args.contains(&"--tags=releases".to_string()));
        assert!(!cmd.args.iter().any(|a| a.starts_with("--branches")));
        assert_eq!(trunk_ref(&layout), "refs/remotes/origin/trunk");
        assert_eq!(trunk_ref(&Layout::default()), "refs/remotes/origin/git-svn");
    }

    #[test]
    fn test_latest_revision_is_non_interactive() {
        let cmd = tools().latest_revision(&repo(Layout::standard()));
        assert!(cmd.args.contains(&"--non-interactive".to_string()));
        assert!(!cmd.display().contains("secret"));
    }

    #[test]
    fn test_parse_revision() {
        assert_eq!(parse_revision("1234\n"), Some(1234));
        assert_eq!(parse_revision("svn: E170013"), None);
    }
}

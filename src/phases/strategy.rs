// ABOUTME: Turns the replay tool's remote-tracking refs into local branches and tags
// ABOUTME: Idempotent, so a resumed job can re-run it safely

use std::path::Path;

use anyhow::Result;
use tracing::{debug, info};

use crate::models::Layout;
use crate::supervisor::Supervisor;
use crate::tools::{trunk_ref, Tools};

pub const DEFAULT_BRANCH: &str = "main";

const REMOTE_PREFIX: &str = "refs/remotes/origin/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefMapping {
    Branch { name: String, source: String },
    Tag { name: String, source: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyReport {
    pub branches: Vec<String>,
    pub tags: Vec<String>,
}

/// Maps one remote-tracking ref. Trunk is handled separately; `name@rev` refs are
/// the replay tool's record of replaced paths and are skipped.
pub fn map_ref(refname: &str, trunk: &str) -> Option<RefMapping> {
    if refname == trunk {
        return None;
    }
    let rest = refname.strip_prefix(REMOTE_PREFIX)?;
    if rest.is_empty() || rest.contains('@') {
        return None;
    }
    if let Some(tag) = rest.strip_prefix("tags/") {
        if tag.is_empty() {
            return None;
        }
        return Some(RefMapping::Tag {
            name: tag.to_string(),
            source: refname.to_string(),
        });
    }
    Some(RefMapping::Branch {
        name: rest.to_string(),
        source: refname.to_string(),
    })
}

pub async fn apply_strategy(
    supervisor: &Supervisor,
    tools: &Tools,
    dir: &Path,
    layout: &Layout,
) -> Result<StrategyReport> {
    let trunk = trunk_ref(layout);
    let listed = supervisor.run_checked(&tools.remote_refs(dir)).await?;
    let refs: Vec<&str> = listed
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let mut report = StrategyReport::default();
    if refs.contains(&trunk.as_str()) {
        supervisor
            .run_checked(&tools.checkout_reset(dir, DEFAULT_BRANCH, &trunk))
            .await?;
        report.branches.push(DEFAULT_BRANCH.to_string());
    }

    for refname in refs {
        match map_ref(refname, &trunk) {
            Some(RefMapping::Branch { name, source }) => {
                if name == DEFAULT_BRANCH {
                    debug!(%source, "branch collides with the default branch, skipping");
                    continue;
                }
                supervisor
                    .run_checked(&tools.force_branch(dir, &name, &source))
                    .await?;
                report.branches.push(name);
            }
            Some(RefMapping::Tag { name, source }) => {
                supervisor
                    .run_checked(&tools.force_tag(dir, &name, &source))
                    .await?;
                report.tags.push(name);
            }
            None => {}
        }
    }

    info!(
        dir = %dir.display(),
        branches = report.branches.len(),
        tags = report.tags.len(),
        "applied branch and tag strategy"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRUNK: &str = "refs/remotes/origin/trunk";

    #[test]
    fn test_map_refs() {
        assert_eq!(map_ref(TRUNK, TRUNK), None);
        assert_eq!(
            map_ref("refs/remotes/origin/tags/v1.0", TRUNK),
            Some(RefMapping::Tag {
                name: "v1.0".to_string(),
                source: "refs/remotes/origin/tags/v1.0".to_string()
            })
        );
        assert_eq!(
            map_ref("refs/remotes/origin/feature-x", TRUNK),
            Some(RefMapping::Branch {
                name: "feature-x".to_string(),
                source: "refs/remotes/origin/feature-x".to_string()
            })
        );
    }

    #[test]
    fn test_replaced_path_refs_are_skipped() {
        assert_eq!(map_ref("refs/remotes/origin/tags/v1.0@120", TRUNK), None);
        assert_eq!(map_ref("refs/remotes/origin/trunk@33", TRUNK), None);
        assert_eq!(map_ref("refs/heads/main", TRUNK), None);
    }
}

// ABOUTME: Pushes branches and tags to the target project
// ABOUTME: The credential-bearing remote is removed again once the push is done

use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::models::Repository;
use crate::remote::TargetService;
use crate::supervisor::Supervisor;
use crate::tools::{Tools, TARGET_REMOTE};

/// Returns the project's web URL as the job's result reference.
pub async fn push_to_target(
    supervisor: &Supervisor,
    tools: &Tools,
    target: &dyn TargetService,
    repo: &Repository,
    dir: &Path,
) -> Result<String> {
    let project = target.fetch_project(&repo.target_project_id).await?;
    let push_url = target.push_url(&project)?;

    // A previous attempt may have left the remote behind.
    let _ = supervisor.capture(&tools.remote_remove(dir, TARGET_REMOTE)).await;
    supervisor
        .run_checked(&tools.remote_add(dir, TARGET_REMOTE, &push_url))
        .await?;

    let pushed = async {
        supervisor
            .run_checked(&tools.push_branches(dir, TARGET_REMOTE))
            .await?;
        supervisor
            .run_checked(&tools.push_tags(dir, TARGET_REMOTE))
            .await
    }
    .await;

    match supervisor.capture(&tools.remote_remove(dir, TARGET_REMOTE)).await {
        Ok(c) if c.outcome.success() => {}
        _ => warn!(dir = %dir.display(), "could not remove the target remote after pushing"),
    }
    pushed?;

    info!(project = %project.web_url, "pushed branches and tags");
    Ok(project.web_url)
}

// ABOUTME: Explicit collaborators handed to every engine entry point
// ABOUTME: Configuration, store, tool paths, supervisor, target service and progress channel

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::models::JobId;
use crate::progress::{ProgressChannel, ProgressTracker, TrackerSettings};
use crate::remote::TargetService;
use crate::store::Store;
use crate::supervisor::health::ProcessHealth;
use crate::supervisor::Supervisor;
use crate::tools::Tools;

#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub store: Store,
    pub tools: Tools,
    pub supervisor: Supervisor,
    pub target: Arc<dyn TargetService>,
    pub progress: Arc<dyn ProgressChannel>,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        store: Store,
        tools: Tools,
        health: Arc<dyn ProcessHealth>,
        target: Arc<dyn TargetService>,
        progress: Arc<dyn ProgressChannel>,
    ) -> Self {
        let supervisor = Supervisor::new(config.supervisor_limits(), health);
        Self {
            config: Arc::new(config),
            store,
            tools,
            supervisor,
            target,
            progress,
        }
    }

    pub fn health(&self) -> Arc<dyn ProcessHealth> {
        Arc::clone(self.supervisor.health())
    }

    pub fn tracker(&self, job_id: JobId, initial_progress: u8) -> ProgressTracker {
        ProgressTracker::new(
            job_id,
            self.store.clone(),
            Arc::clone(&self.progress),
            TrackerSettings {
                publish_every: self.config.progress_every,
                ..TrackerSettings::default()
            },
            initial_progress,
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::remote::{authenticated_url, TargetProject, TargetUser};
    use crate::progress::RecordingChannel;
    use crate::supervisor::health::PortableHealth;
    use anyhow::Result;
    use async_trait::async_trait;

    /// Target service that answers without a network.
    pub(crate) struct StubTarget;

    #[async_trait]
    impl TargetService for StubTarget {
        async fn validate_connection(&self) -> Result<TargetUser> {
            Ok(TargetUser {
                id: 1,
                username: "migrator".to_string(),
                name: None,
            })
        }

        async fn fetch_project(&self, project_id: &str) -> Result<TargetProject> {
            Ok(TargetProject {
                id: project_id.parse().unwrap_or(0),
                http_url: "https://git.example.com/group/legacy.git".to_string(),
                web_url: "https://git.example.com/group/legacy".to_string(),
                path_with_namespace: Some("group/legacy".to_string()),
                default_branch: None,
            })
        }

        fn push_url(&self, project: &TargetProject) -> Result<String> {
            authenticated_url(&project.http_url, "token")
        }
    }

    pub(crate) fn test_context(store: Store) -> EngineContext {
        let tools = Tools::from_config(&EngineConfig::default());
        test_context_with_tools(store, tools)
    }

    pub(crate) fn test_context_with_tools(store: Store, tools: Tools) -> EngineContext {
        let config = EngineConfig::default();
        EngineContext::new(
            config,
            store,
            tools,
            Arc::new(PortableHealth),
            Arc::new(StubTarget),
            Arc::new(RecordingChannel::default()),
        )
    }

    /// Writes an executable shell script standing in for an external tool.
    #[cfg(unix)]
    pub(crate) fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

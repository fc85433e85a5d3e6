// ABOUTME: Shared helpers for the end-to-end tests
// ABOUTME: Writes executable shell scripts that stand in for git and svn

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use svn_git_migrator::config::SupervisorLimits;
use svn_git_migrator::supervisor::health::PortableHealth;
use svn_git_migrator::supervisor::Supervisor;

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Limits small enough for tests to hit within a second or two.
pub fn fast_limits() -> SupervisorLimits {
    SupervisorLimits {
        monitor_interval: Duration::from_millis(100),
        warning_after: Duration::from_millis(200),
        stuck_after: Duration::from_millis(300),
        kill_after: Duration::from_millis(600),
        max_runtime: Duration::from_secs(30),
        kill_grace: Duration::from_millis(300),
        idle_cpu_percent: 1.0,
    }
}

pub fn supervisor(limits: SupervisorLimits) -> Supervisor {
    Supervisor::new(limits, Arc::new(PortableHealth))
}

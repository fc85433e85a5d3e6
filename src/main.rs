// ABOUTME: Command-line interface for the Subversion to Git migrator
// ABOUTME: Registers repositories and runs, resumes, retries, cancels and inspects migration jobs

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use svn_git_migrator::config::EngineConfig;
use svn_git_migrator::context::EngineContext;
use svn_git_migrator::models::{Job, JobKind, Layout, MigrationMode, NewRepository, StructureReport};
use svn_git_migrator::progress::{BarChannel, ProgressChannel, TracingChannel};
use svn_git_migrator::remote::RemoteClient;
use svn_git_migrator::store::Store;
use svn_git_migrator::supervisor::health::default_health;
use svn_git_migrator::tools::Tools;
use svn_git_migrator::worker::{self, RetryPolicy};
use svn_git_migrator::{phases::JobOutcome, MigratorError};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "svn-git-migrator")]
#[command(about = "Resumable Subversion to Git migration with incremental sync", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Job database (overrides the configuration)
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a Subversion repository and its migration target
    AddRepo {
        name: String,
        /// Subversion repository URL
        #[arg(long)]
        url: String,
        /// Target project id or full path
        #[arg(long)]
        target_project: String,
        /// Local working directory for the git-svn clone
        #[arg(long)]
        working_dir: PathBuf,
        /// shallow or full_history
        #[arg(long, default_value = "full_history")]
        mode: MigrationMode,
        #[arg(long)]
        username: Option<String>,
        /// Prompt for the Subversion password
        #[arg(long)]
        ask_password: bool,
        /// JSON report from the structure discovery helper
        #[arg(long, conflicts_with_all = ["trunk", "branches", "tags"])]
        structure: Option<PathBuf>,
        #[arg(long)]
        trunk: Option<String>,
        #[arg(long)]
        branches: Option<String>,
        #[arg(long)]
        tags: Option<String>,
        /// git-svn authors mapping file
        #[arg(long)]
        authors_file: Option<PathBuf>,
    },
    /// Create a migration job for a repository and run it
    Migrate {
        repository: String,
        /// Resume resumable failures up to this many times
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
    /// Run a pending job
    Run {
        job: i64,
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
    /// Continue a failed resumable job on the same record
    Resume {
        job: i64,
        /// Treat a job still marked running as interrupted
        #[arg(long)]
        force: bool,
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
    /// Start a finished job over on a new record
    Retry { job: i64 },
    /// Request cancellation of a job
    Cancel {
        job: i64,
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Fetch and push new revisions of an already migrated repository
    Sync { repository: String },
    /// Show one job
    Status {
        job: i64,
        /// Include the output and error logs
        #[arg(long)]
        logs: bool,
    },
    /// List recent jobs and registered repositories
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    let store = Store::open(&config.database_path)?;

    match cli.command {
        Commands::AddRepo {
            name,
            url,
            target_project,
            working_dir,
            mode,
            username,
            ask_password,
            structure,
            trunk,
            branches,
            tags,
            authors_file,
        } => {
            let password = if ask_password {
                Some(
                    dialoguer::Password::new()
                        .with_prompt(format!("Subversion password for {}", url))
                        .interact()
                        .context("Failed to read password")?,
                )
            } else {
                None
            };
            let mut repo = match structure {
                Some(path) => {
                    let text = std::fs::read_to_string(&path).with_context(|| {
                        format!("Failed to read structure report {}", path.display())
                    })?;
                    let report: StructureReport = serde_json::from_str(&text).with_context(|| {
                        format!("Structure report {} is not valid JSON", path.display())
                    })?;
                    println!(
                        "Detected {:?} layout with {} author(s)",
                        report.layout,
                        report.authors.len()
                    );
                    NewRepository::from_report(name, url, target_project, working_dir, mode, &report)
                }
                None => {
                    let layout = if trunk.is_none() && branches.is_none() && tags.is_none() {
                        Layout::standard()
                    } else {
                        Layout {
                            trunk,
                            branches,
                            tags,
                        }
                    };
                    NewRepository {
                        name,
                        source_url: url,
                        username: None,
                        password: None,
                        mode,
                        target_project_id: target_project,
                        working_directory: working_dir,
                        layout,
                        authors_file: None,
                    }
                }
            };
            repo.username = username;
            repo.password = password;
            repo.authors_file = authors_file;
            let repo = store.insert_repository(&repo)?;
            println!("Registered repository {} ({})", repo.id, repo.name);
        }
        Commands::Migrate {
            repository,
            retries,
        } => {
            let repo = store.find_repository(&repository)?;
            let (ctx, bar) = engine(config, store)?;
            let job = ctx.store.create_job(repo.id, JobKind::Migration)?;
            println!("Created job {} for {}", job.id, repo.name);
            let result = worker::run_with_retries(&ctx, job.id, RetryPolicy::with_retries(retries)).await;
            finish(job.id, result, bar.as_ref())?;
        }
        Commands::Run { job, retries } => {
            let (ctx, bar) = engine(config, store)?;
            let result = worker::run_with_retries(&ctx, job, RetryPolicy::with_retries(retries)).await;
            finish(job, result, bar.as_ref())?;
        }
        Commands::Resume {
            job,
            force,
            retries,
        } => {
            let (ctx, bar) = engine(config, store)?;
            worker::prepare_resume(&ctx, job, force)?;
            let result = worker::run_with_retries(&ctx, job, RetryPolicy::with_retries(retries)).await;
            finish(job, result, bar.as_ref())?;
        }
        Commands::Retry { job } => {
            let (ctx, bar) = engine(config, store)?;
            let retry = worker::prepare_retry(&ctx, job)?;
            println!("Created job {} as a retry of job {}", retry.id, job);
            let result = worker::run_job(&ctx, retry.id).await;
            finish(retry.id, result, bar.as_ref())?;
        }
        Commands::Cancel { job, yes } => {
            let record = store.job(job)?;
            if !yes {
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt(format!(
                        "Cancel job {} ({}, phase {})?",
                        job, record.status, record.phase
                    ))
                    .default(false)
                    .interact()
                    .context("Failed to read confirmation")?;
                if !confirmed {
                    println!("Not cancelled");
                    return Ok(());
                }
            }
            worker::cancel_job(&store, job)?;
            println!("Cancellation requested; the running worker stops at its next checkpoint");
        }
        Commands::Sync { repository } => {
            let repo = store.find_repository(&repository)?;
            let (ctx, bar) = engine(config, store)?;
            match svn_git_migrator::sync::start_sync(&ctx, repo.id).await {
                Ok(None) => println!("A sync of {} is already running; nothing to do", repo.name),
                Ok(Some(outcome)) => finish(outcome.job_id, Ok(outcome), bar.as_ref())?,
                Err(err) => {
                    if let Some(bar) = &bar {
                        bar.finish();
                    }
                    return Err(err);
                }
            }
        }
        Commands::Status { job, logs } => {
            let job = store.job(job)?;
            print_job(&job);
            if let Some(checkpoint) = job.checkpoint_data.as_object().filter(|m| !m.is_empty()) {
                println!("  checkpoint:  {}", serde_json::Value::Object(checkpoint.clone()));
            }
            if logs {
                println!("--- output ---\n{}", job.output_log);
                println!("--- errors ---\n{}", job.error_log);
            }
        }
        Commands::List { limit } => {
            let repos = store.list_repositories()?;
            if repos.is_empty() {
                println!("No repositories registered");
            }
            for repo in &repos {
                println!(
                    "repo {:>4}  {:<20} {:<13} synced: {}",
                    repo.id,
                    repo.name,
                    repo.mode,
                    repo.last_synced_revision
                        .map_or("-".to_string(), |r| format!("r{}", r))
                );
            }
            for job in store.list_jobs(limit)? {
                print_job(&job);
            }
        }
    }

    Ok(())
}

/// Builds the engine. Progress goes to a bar on a terminal and to the log otherwise.
fn engine(config: EngineConfig, store: Store) -> Result<(EngineContext, Option<Arc<BarChannel>>)> {
    let (Some(api_url), Some(token)) = (config.target.api_url.clone(), config.target.token.clone())
    else {
        bail!(
            "Target service not configured. Set target.api_url and target.token in the config file \
             or MIGRATOR_TARGET_URL and MIGRATOR_TARGET_TOKEN"
        );
    };
    let tools = Tools::resolve(&config)?;
    let target = Arc::new(RemoteClient::new(api_url, token)?);
    let bar = std::io::stderr().is_terminal().then(|| Arc::new(BarChannel::new()));
    let progress: Arc<dyn ProgressChannel> = match &bar {
        Some(bar) => bar.clone(),
        None => Arc::new(TracingChannel),
    };
    let ctx = EngineContext::new(config, store, tools, default_health(), target, progress);
    Ok((ctx, bar))
}

fn finish(job_id: i64, result: Result<JobOutcome>, bar: Option<&Arc<BarChannel>>) -> Result<()> {
    if let Some(bar) = bar {
        bar.finish();
    }
    match result {
        Ok(outcome) => {
            println!(
                "Job {} completed{}",
                outcome.job_id,
                outcome
                    .result_url
                    .map_or(String::new(), |url| format!(": {}", url))
            );
            Ok(())
        }
        Err(err) => {
            if let Some(error) = err.downcast_ref::<MigratorError>() {
                if matches!(error, MigratorError::Cancelled) {
                    println!("Job {} was cancelled. Resume it with: svn-git-migrator resume {}", job_id, job_id);
                    return Ok(());
                }
                if error.is_resumable() {
                    eprintln!(
                        "Job {} failed but can be resumed with: svn-git-migrator resume {}",
                        job_id, job_id
                    );
                }
            }
            Err(err)
        }
    }
}

fn print_job(job: &Job) {
    println!(
        "job {:>5}  repo {:<4} {:<16} {:<10} {:<18} {:>3}%  rev {}/{}{}",
        job.id,
        job.repository_id,
        job.kind.to_string(),
        job.status.to_string(),
        job.phase.to_string(),
        job.progress,
        job.current_revision.map_or("-".to_string(), |r| r.to_string()),
        job.total_revisions.map_or("-".to_string(), |r| r.to_string()),
        if job.resumable { "  (resumable)" } else { "" }
    );
    if let Some(url) = &job.result_url {
        println!("  result:      {}", url);
    }
    if let Some(parent) = job.parent_job_id {
        println!("  retry of:    job {}", parent);
    }
}

// ABOUTME: Runs external tools with closed stdin, streaming output and enforcing silence and runtime limits
// ABOUTME: A monitor task escalates from warning to SIGTERM to force-kill of the child's process group

pub mod health;
pub mod repair;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::classifier::Termination;
use crate::config::SupervisorLimits;
use crate::error::MigratorError;
use health::ProcessHealth;

const STDERR_TAIL_LINES: usize = 200;

/// One external tool invocation. Always an argument vector, never a shell string.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Printable form with anything that looks like a credential masked.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        let mut mask_next = false;
        for arg in &self.args {
            if mask_next {
                parts.push("****".to_string());
                mask_next = false;
                continue;
            }
            mask_next = arg == "--password";
            parts.push(mask_url_credentials(arg));
        }
        parts.join(" ")
    }
}

fn mask_url_credentials(arg: &str) -> String {
    match url::Url::parse(arg) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("****"));
            parsed.to_string()
        }
        _ => arg.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    Stdout(String),
    Stderr(String),
}

/// Why the supervisor stopped a child on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intervention {
    Stalled,
    RuntimeExceeded,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub termination: Termination,
    pub stderr_tail: String,
    pub stdout_lines: u64,
    pub intervention: Option<Intervention>,
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.intervention.is_none() && self.termination.exit_code == Some(0)
    }

    /// Text handed to the classifier: stderr plus a note about any intervention.
    pub fn diagnostic(&self) -> String {
        match self.intervention {
            Some(Intervention::Stalled) => {
                format!("{}\nprocess stalled and timed out", self.stderr_tail)
            }
            Some(Intervention::RuntimeExceeded) => {
                format!("{}\nprocess exceeded maximum runtime (timed out)", self.stderr_tail)
            }
            None => self.stderr_tail.clone(),
        }
    }
}

/// Output of a one-shot command.
#[derive(Debug, Clone)]
pub struct Captured {
    pub outcome: RunOutcome,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone)]
pub struct Supervisor {
    limits: SupervisorLimits,
    health: Arc<dyn ProcessHealth>,
}

impl Supervisor {
    pub fn new(limits: SupervisorLimits, health: Arc<dyn ProcessHealth>) -> Self {
        Self { limits, health }
    }

    pub fn health(&self) -> &Arc<dyn ProcessHealth> {
        &self.health
    }

    /// Runs `command` to completion, forwarding every output line to `lines`.
    ///
    /// The child leads its own process group so signals reach anything it forks.
    /// The stdout reader, stderr reader and monitor are all joined before this returns;
    /// pipes still held open by leftover descendants are closed after `kill_grace`.
    pub async fn run(
        &self,
        command: &ToolCommand,
        lines: mpsc::UnboundedSender<StreamLine>,
    ) -> Result<RunOutcome> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        debug!(command = %command.display(), "spawning tool");
        let mut child = cmd.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                anyhow::Error::new(MigratorError::Validation(format!(
                    "{} not found; install it or point the configuration at it",
                    command.program.display()
                )))
            } else {
                anyhow::Error::new(err)
                    .context(format!("Failed to start {}", command.display()))
            }
        })?;
        let pid = child.id();

        let started = Instant::now();
        let last_output = Arc::new(AtomicU64::new(0));
        let (exited_tx, exited_rx) = watch::channel(false);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let stdout = child.stdout.take().context("child stdout was not piped")?;
        let stderr = child.stderr.take().context("child stderr was not piped")?;

        let stdout_task = {
            let lines = lines.clone();
            let last_output = Arc::clone(&last_output);
            let mut stop = stop_rx.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                let mut count = 0u64;
                while let Some(line) = next_line(&mut reader, &mut stop).await {
                    count += 1;
                    last_output.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                    let _ = lines.send(StreamLine::Stdout(line));
                }
                count
            })
        };

        let stderr_task = {
            let lines = lines.clone();
            let mut stop = stop_rx;
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                while let Some(line) = next_line(&mut reader, &mut stop).await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                    let _ = lines.send(StreamLine::Stderr(line));
                }
                Vec::from(tail).join("\n")
            })
        };
        drop(lines);

        let monitor_task = {
            let monitor = Monitor {
                limits: self.limits,
                health: Arc::clone(&self.health),
                pid,
                started,
                last_output: Arc::clone(&last_output),
                kill_tx,
            };
            tokio::spawn(monitor.watch(exited_rx))
        };

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(()) = kill_rx.recv() => {
                    warn!(pid, "force-killing tool");
                    if let Some(pid) = pid {
                        signal_group(pid, Signal::Kill);
                    }
                    let _ = child.start_kill();
                }
            }
        };
        let _ = exited_tx.send(true);

        let intervention = monitor_task.await;

        let readers = async { futures::join!(stdout_task, stderr_task) };
        tokio::pin!(readers);
        let (stdout_lines, stderr_tail) =
            match tokio::time::timeout(self.limits.kill_grace, &mut readers).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(pid, "tool exited but its output is still held open, killing leftovers");
                    if let Some(pid) = pid {
                        signal_group(pid, Signal::Kill);
                    }
                    let _ = stop_tx.send(true);
                    readers.await
                }
            };
        let status = status.with_context(|| format!("Failed waiting for {}", command.display()))?;

        let outcome = RunOutcome {
            termination: termination_of(status),
            stderr_tail: stderr_tail.unwrap_or_default(),
            stdout_lines: stdout_lines.unwrap_or_default(),
            intervention: intervention.unwrap_or_default(),
            elapsed: started.elapsed(),
        };
        debug!(
            command = %command.display(),
            exit_code = ?outcome.termination.exit_code,
            signal = ?outcome.termination.signal,
            elapsed_secs = outcome.elapsed.as_secs(),
            "tool finished"
        );
        Ok(outcome)
    }

    /// Runs a short command and collects its output.
    pub async fn capture(&self, command: &ToolCommand) -> Result<Captured> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = self.run(command, tx).await?;
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Ok(line) = rx.try_recv() {
            let (buf, text) = match line {
                StreamLine::Stdout(text) => (&mut stdout, text),
                StreamLine::Stderr(text) => (&mut stderr, text),
            };
            buf.push_str(&text);
            buf.push('\n');
        }
        Ok(Captured {
            outcome,
            stdout,
            stderr,
        })
    }

    /// Like `capture`, but a non-zero exit becomes a `MigratorError` carrying its classification.
    pub async fn run_checked(&self, command: &ToolCommand) -> Result<Captured> {
        let captured = self.capture(command).await?;
        if !captured.outcome.success() {
            let text = captured.outcome.diagnostic();
            let classification =
                crate::classifier::classify(&text, captured.outcome.termination);
            let detail = text.lines().last().unwrap_or("no error output").to_string();
            return Err(MigratorError::migration(
                format!("{} failed: {}", command.display(), detail),
                classification.class,
            )
            .into());
        }
        Ok(captured)
    }
}

struct Monitor {
    limits: SupervisorLimits,
    health: Arc<dyn ProcessHealth>,
    pid: Option<u32>,
    started: Instant,
    last_output: Arc<AtomicU64>,
    kill_tx: mpsc::Sender<()>,
}

impl Monitor {
    async fn watch(self, mut exited: watch::Receiver<bool>) -> Option<Intervention> {
        let Some(pid) = self.pid else {
            return None;
        };
        let mut warned = false;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.limits.monitor_interval) => {}
                _ = exited.changed() => return None,
            }
            if *exited.borrow() || !self.health.is_alive(pid) {
                return None;
            }

            let runtime = self.started.elapsed();
            if runtime > self.limits.max_runtime {
                error!(pid, runtime_secs = runtime.as_secs(), "tool exceeded maximum runtime, terminating");
                self.terminate(pid, &mut exited).await;
                return Some(Intervention::RuntimeExceeded);
            }

            let last = Duration::from_millis(self.last_output.load(Ordering::Relaxed));
            let silence = runtime.saturating_sub(last);
            if silence < self.limits.warning_after {
                warned = false;
                continue;
            }

            let cpu = self.health.cpu_percent(pid);
            if !warned {
                warn!(
                    pid,
                    silence_secs = silence.as_secs(),
                    cpu_percent = ?cpu,
                    "no output from tool"
                );
                warned = true;
            }

            // Unknown CPU usage is treated as idle.
            let idle = cpu.map_or(true, |c| c < self.limits.idle_cpu_percent);
            if silence >= self.limits.stuck_after && idle {
                warn!(pid, silence_secs = silence.as_secs(), "tool looks stuck");
                if silence >= self.limits.kill_after {
                    error!(pid, silence_secs = silence.as_secs(), "killing stuck tool");
                    self.terminate(pid, &mut exited).await;
                    return Some(Intervention::Stalled);
                }
            }
        }
    }

    /// SIGTERM to the group, wait for the grace period, then force-kill.
    async fn terminate(&self, pid: u32, exited: &mut watch::Receiver<bool>) {
        signal_group(pid, Signal::Term);
        let gone = async {
            loop {
                let done = *exited.borrow();
                if done || exited.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.limits.kill_grace, gone).await.is_err() {
            info!(pid, "tool ignored SIGTERM");
            let _ = self.kill_tx.send(()).await;
        }
    }
}

/// Reads one line as lossy UTF-8 without its line ending. `None` at end of
/// stream, on a read error, or once `stop` is raised.
async fn next_line<R>(reader: &mut R, stop: &mut watch::Receiver<bool>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = tokio::select! {
        read = reader.read_until(b'\n', &mut buf) => read,
        _ = stop.changed() => return None,
    };
    match read {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(decode_line(&buf)),
    }
}

fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signals every process in the group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let signal = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    if let Ok(pid) = libc::pid_t::try_from(pid) {
        unsafe {
            libc::kill(-pid, signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

fn termination_of(status: ExitStatus) -> Termination {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        Termination {
            exit_code: status.code(),
            signal: status.signal(),
        }
    }
    #[cfg(not(unix))]
    {
        Termination {
            exit_code: status.code(),
            signal: None,
        }
    }
}

//! Start tools on demand: liveness check, one-time installation, launch, alive-at-probe check.
//!
//! A launch is judged by whether the process is still alive after a short grace
//! period, not by HTTP readiness. A tool that binds its port slowly is reported
//! as started; one that exits inside the window is a failure even with status 0.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ToolDescriptor;
use crate::tools::client::ToolClient;

/// How long a freshly spawned tool must survive before it counts as started.
pub const LAUNCH_GRACE: Duration = Duration::from_secs(2);
/// Directory inside `command_directory` whose presence means installation already ran.
pub const INSTALL_MARKER: &str = "node_modules";

const STDERR_READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Stderr lines kept for a launch failure report.
pub const STDERR_TAIL_LINES: usize = 50;
const STDERR_LINE_MAX: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Directory {} does not exist", .0.display())]
    DirectoryNotFound(PathBuf),
    #[error("Tool {0} has no start command")]
    MissingStartCommand(String),
    #[error("Error installing {tool} (exit {code:?}): {stderr}")]
    InstallationFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Error starting {tool} (exit {code:?}): {stderr}")]
    LaunchFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Failed to spawn {program} for {tool}: {source}")]
    Spawn {
        tool: String,
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// What `ensure_running` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// `/status` already answered; nothing was run.
    AlreadyRunning,
    /// The process was spawned and still alive at the probe. HTTP readiness is not implied.
    Started,
}

#[derive(Debug, Clone)]
pub struct LifecycleManager {
    http: reqwest::Client,
    launch_grace: Duration,
    install_marker: String,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl LifecycleManager {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            launch_grace: LAUNCH_GRACE,
            install_marker: INSTALL_MARKER.to_string(),
        }
    }

    /// Override the post-spawn wait.
    pub fn with_launch_grace(mut self, grace: Duration) -> Self {
        self.launch_grace = grace;
        self
    }

    pub fn with_install_marker(mut self, marker: impl Into<String>) -> Self {
        self.install_marker = marker.into();
        self
    }

    /// Make sure the tool described by `descriptor` is up, launching it if needed.
    ///
    /// Safe to call repeatedly: once `/status` answers, nothing is installed or spawned.
    pub async fn ensure_running(
        &self,
        descriptor: &ToolDescriptor,
    ) -> Result<EnsureOutcome, LifecycleError> {
        let client = ToolClient::new(descriptor.clone(), self.http.clone());
        if client.check_connection().await {
            debug!(tool = %descriptor.display_name(), "already running");
            return Ok(EnsureOutcome::AlreadyRunning);
        }

        let name = descriptor.display_name().to_string();
        let command_dir = descriptor.command_dir();
        if !command_dir.is_dir() {
            error!(tool = %name, dir = %command_dir.display(), "command directory does not exist");
            return Err(LifecycleError::DirectoryNotFound(command_dir));
        }

        if let Some(install) = descriptor
            .installation_command
            .as_ref()
            .filter(|c| !c.is_empty())
        {
            if command_dir.join(&self.install_marker).exists() {
                debug!(tool = %name, marker = %self.install_marker, "already installed");
            } else {
                self.install(&name, &install.shell_argv(), &descriptor.installation_dir())
                    .await?;
            }
        }

        let argv = descriptor
            .start_command
            .as_ref()
            .map(|c| c.argv())
            .unwrap_or_default();
        if argv.is_empty() {
            return Err(LifecycleError::MissingStartCommand(name));
        }
        self.launch(&name, &argv, &command_dir).await
    }

    async fn install(&self, tool: &str, argv: &[String], dir: &Path) -> Result<(), LifecycleError> {
        let (program, args) = split_argv(tool, argv)?;
        info!(tool, dir = %dir.display(), "installing");
        let output = Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| LifecycleError::Spawn {
                tool: tool.to_string(),
                program: program.to_string(),
                source,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(tool, status = %output.status, %stderr, "installation failed");
            return Err(LifecycleError::InstallationFailed {
                tool: tool.to_string(),
                code: output.status.code(),
                stderr,
            });
        }
        info!(tool, "installed");
        Ok(())
    }

    async fn launch(
        &self,
        tool: &str,
        argv: &[String],
        dir: &Path,
    ) -> Result<EnsureOutcome, LifecycleError> {
        let (program, args) = split_argv(tool, argv)?;
        info!(tool, program, dir = %dir.display(), "starting");
        let spawn_err = |source| LifecycleError::Spawn {
            tool: tool.to_string(),
            program: program.to_string(),
            source,
        };
        let mut child = Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        // Drain both pipes from spawn onwards; a full pipe blocks the tool.
        if let Some(out) = child.stdout.take() {
            forward_lines(tool.to_string(), "stdout", out, None);
        }
        let tail = StderrTail::default();
        let stderr_task = child
            .stderr
            .take()
            .map(|err| forward_lines(tool.to_string(), "stderr", err, Some(tail.clone())));

        tokio::time::sleep(self.launch_grace).await;

        match child.try_wait().map_err(spawn_err)? {
            Some(status) => {
                // Bounded: a grandchild may still hold the pipe open.
                if let Some(task) = stderr_task {
                    if tokio::time::timeout(STDERR_READ_TIMEOUT, task).await.is_err() {
                        warn!(tool, "timed out reading stderr of exited tool");
                    }
                }
                let stderr = tail.text();
                error!(tool, %status, %stderr, "tool exited during startup");
                Err(LifecycleError::LaunchFailed {
                    tool: tool.to_string(),
                    code: status.code(),
                    stderr,
                })
            }
            None => {
                info!(tool, pid = ?child.id(), "started");
                detach(tool.to_string(), child);
                Ok(EnsureOutcome::Started)
            }
        }
    }
}

fn split_argv<'a>(tool: &str, argv: &'a [String]) -> Result<(&'a str, &'a [String]), LifecycleError> {
    argv.split_first()
        .map(|(program, args)| (program.as_str(), args))
        .ok_or_else(|| LifecycleError::MissingStartCommand(tool.to_string()))
}

/// Last lines of a tool's stderr, capped in count and per-line length.
#[derive(Debug, Clone, Default)]
struct StderrTail(Arc<Mutex<VecDeque<String>>>);

impl StderrTail {
    fn push(&self, line: &str) {
        let mut end = line.len().min(STDERR_LINE_MAX);
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        let mut lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line[..end].to_string());
    }

    fn text(&self) -> String {
        let lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n").trim().to_string()
    }
}

/// Report when a live tool exits. Its pipes are already being forwarded.
fn detach(tool: String, mut child: Child) {
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => warn!(tool = %tool, %status, "tool process exited"),
            Err(e) => error!(tool = %tool, error = %e, "failed waiting on tool process"),
        }
    });
}

/// Log every line of `reader` until EOF, copying them into `tail` when given.
/// Invalid UTF-8 is replaced rather than ending the read.
fn forward_lines<R>(
    tool: String,
    stream: &'static str,
    reader: R,
    tail: Option<StderrTail>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end();
            debug!(tool = %tool, stream, "{line}");
            if let Some(tail) = &tail {
                tail.push(line);
            }
        }
    })
}

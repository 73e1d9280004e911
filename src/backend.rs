//! The LLM runtime process (`ollama serve`): start when unreachable, stop only what we started.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::llm::OllamaClient;

const DEFAULT_PROGRAM: &str = "ollama";
const START_POLLS: u32 = 5;
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Handle to the backend process this control plane launched, if any.
#[derive(Debug)]
pub struct LlmBackend {
    llm: OllamaClient,
    program: String,
    child: Option<Child>,
    poll_interval: Duration,
}

impl LlmBackend {
    pub fn new(llm: OllamaClient) -> Self {
        Self {
            llm,
            program: DEFAULT_PROGRAM.to_string(),
            child: None,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Binary to run as `<program> serve`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// True when this handle owns a spawned process.
    #[inline]
    pub fn is_managed(&self) -> bool {
        self.child.is_some()
    }

    /// Make the backend reachable. `Ok(true)` once it answers, `Ok(false)` if spawned but still warming up.
    pub async fn start(&mut self) -> Result<bool, BackendError> {
        if self.llm.is_running().await {
            info!(url = %self.llm.base_url(), "LLM backend already running");
            return Ok(true);
        }
        if self.child.is_none() {
            info!(program = %self.program, "starting LLM backend");
            let child = Command::new(&self.program)
                .arg("serve")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|source| BackendError::Spawn {
                    program: self.program.clone(),
                    source,
                })?;
            self.child = Some(child);
        }
        for _ in 0..START_POLLS {
            if self.llm.is_running().await {
                info!("LLM backend is running");
                return Ok(true);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        warn!("LLM backend not answering yet");
        Ok(false)
    }

    /// Terminate the process started by [`LlmBackend::start`]. A backend we did not start is left alone.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        info!("stopping LLM backend");
        if let Err(e) = child.start_kill() {
            warn!(error = %e, "failed to signal LLM backend");
            return;
        }
        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "LLM backend stopped"),
            Ok(Err(e)) => warn!(error = %e, "failed waiting for LLM backend"),
            Err(_) => warn!("LLM backend did not exit in time"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let llm = OllamaClient::new("http://127.0.0.1:9").unwrap();
        let mut backend = LlmBackend::new(llm).with_program("napier-no-such-binary");
        let err = backend.start().await.unwrap_err();
        assert!(err.to_string().contains("napier-no-such-binary"));
        assert!(!backend.is_managed());
    }

    #[tokio::test]
    async fn stop_without_child_is_noop() {
        let llm = OllamaClient::new("http://127.0.0.1:9").unwrap();
        let mut backend = LlmBackend::new(llm);
        backend.stop().await;
        assert!(!backend.is_managed());
    }
}

//! Agent bridge: executes control-plane commands inside the sandbox.
//!
//! Commands are handled strictly one at a time. Each handler reports its
//! outcome as events on the [`EventSink`]; nothing is returned to the caller
//! except whether the run loop should continue.

pub mod agent;
pub mod git;
pub mod protocol;
pub mod transport;

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::agent::{AgentClient, PromptRequest};
use self::git::{resolve_identity, GitIdentity, GitRunner, FALLBACK_GIT_USER};
use self::protocol::{BridgeEvent, Command, PromptCommand, PushSpec};
use self::transport::EventSink;
use crate::process::ProcessGuard;

pub const PUSH_AUTH_HINT: &str = "Push failed - authentication may be required";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub sandbox_id: String,
    /// Git checkout commands operate on.
    pub repo_dir: PathBuf,
    pub fallback_identity: GitIdentity,
    pub push_timeout: Duration,
    /// How long a timed-out push may take to honour SIGTERM before it is killed.
    pub push_terminate_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sandbox_id: String::new(),
            repo_dir: PathBuf::from("/workspace"),
            fallback_identity: FALLBACK_GIT_USER.to_identity(),
            push_timeout: Duration::from_secs(120),
            push_terminate_grace: Duration::from_secs(5),
        }
    }
}

/// Why [`AgentBridge::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The control plane asked the bridge to stop.
    Shutdown,
    /// The command stream ended without a shutdown.
    Disconnected,
}

pub struct AgentBridge {
    config: BridgeConfig,
    events: Arc<dyn EventSink>,
    git: Arc<dyn GitRunner>,
    agent: Arc<dyn AgentClient>,
}

impl AgentBridge {
    pub fn new(
        config: BridgeConfig,
        events: Arc<dyn EventSink>,
        git: Arc<dyn GitRunner>,
        agent: Arc<dyn AgentClient>,
    ) -> Self {
        Self {
            config,
            events,
            git,
            agent,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Handle commands in arrival order until shutdown or end of stream.
    pub async fn run<S>(&mut self, mut commands: S) -> RunOutcome
    where
        S: Stream<Item = Command> + Unpin,
    {
        while let Some(command) = commands.next().await {
            if self.handle_command(command).await.is_break() {
                info!(sandbox_id = %self.config.sandbox_id, "Shutdown requested");
                return RunOutcome::Shutdown;
            }
        }
        warn!(sandbox_id = %self.config.sandbox_id, "Command stream ended");
        RunOutcome::Disconnected
    }

    pub async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        debug!(command = command.kind(), "Handling command");
        match command {
            Command::Prompt(prompt) => self.handle_prompt(prompt).await,
            Command::Push { push_spec } => self.handle_push(push_spec).await,
            Command::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    async fn handle_prompt(&mut self, prompt: PromptCommand) {
        let message_id = prompt.message_id.clone();
        info!(message_id = %message_id, model = ?prompt.model, "Processing prompt");

        let identity = resolve_identity(&prompt.author, &self.config.fallback_identity);
        if let Err(e) = self
            .git
            .configure_identity(&self.config.repo_dir, &identity)
            .await
        {
            warn!(message_id = %message_id, error = %e, "Failed to configure git identity");
        }

        let request = PromptRequest {
            message_id: message_id.clone(),
            content: prompt.content,
            model: prompt.model,
        };
        let mut response = self.agent.stream_response(&request);
        let mut success = true;
        while let Some(chunk) = response.next().await {
            match chunk {
                Ok(data) => {
                    self.emit(BridgeEvent::AgentEvent {
                        message_id: message_id.clone(),
                        data,
                    })
                    .await;
                }
                Err(e) => {
                    error!(
                        message_id = %message_id,
                        error = %format!("{e:#}"),
                        "Agent response failed"
                    );
                    self.emit(BridgeEvent::Error {
                        message_id: Some(message_id.clone()),
                        error: format!("{e:#}"),
                    })
                    .await;
                    success = false;
                    break;
                }
            }
        }

        self.emit(BridgeEvent::ExecutionComplete {
            message_id,
            success,
        })
        .await;
    }

    async fn handle_push(&mut self, spec: PushSpec) {
        let branch_name = spec.target_branch.clone();
        info!(
            branch = %branch_name,
            remote = %spec.redacted_remote_url,
            "Pushing branch"
        );

        let event = match self.push(&spec).await {
            Ok(()) => {
                info!(branch = %branch_name, "Push complete");
                BridgeEvent::PushComplete { branch_name }
            }
            Err(error) => {
                warn!(branch = %branch_name, error = %error, "Push failed");
                BridgeEvent::PushError { error, branch_name }
            }
        };
        self.emit(event).await;
    }

    /// Run one `git push` to completion. The child never outlives this call.
    async fn push(&self, spec: &PushSpec) -> Result<(), String> {
        let mut process = self
            .git
            .spawn_push(&self.config.repo_dir, spec)
            .map_err(|e| format!("Push failed - {e}"))?;
        let mut guard = ProcessGuard::new(process.as_mut());

        match tokio::time::timeout(self.config.push_timeout, guard.wait()).await {
            Ok(Ok(0)) => Ok(()),
            Ok(Ok(exit_code)) => {
                debug!(exit_code, "git push exited with failure");
                Err(PUSH_AUTH_HINT.to_string())
            }
            Ok(Err(e)) => Err(format!("Push failed - {e}")),
            Err(_) => {
                warn!(
                    timeout_secs = self.config.push_timeout.as_secs_f64(),
                    "git push timed out, terminating"
                );
                if let Err(e) = guard.stop(self.config.push_terminate_grace).await {
                    warn!(error = %e, "Failed to reap timed-out git push");
                }
                Err(format!(
                    "Push failed - git push timed out after {}s",
                    format_secs(self.config.push_timeout)
                ))
            }
        }
    }

    async fn emit(&self, event: BridgeEvent) {
        if let Err(e) = self.events.send(event).await {
            warn!(error = %e, "Failed to send event");
        }
    }
}

/// Whole seconds print without a fractional part.
fn format_secs(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs.fract() == 0.0 {
        format!("{}", duration.as_secs())
    } else {
        format!("{secs}")
    }
}

/// Send `heartbeat` events every `interval` until `cancel` fires.
pub fn spawn_heartbeat(
    events: Arc<dyn EventSink>,
    sandbox_id: String,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; `ready` already announced us.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let event = BridgeEvent::Heartbeat {
                        sandbox_id: sandbox_id.clone(),
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    };
                    if let Err(e) = events.send(event).await {
                        warn!(error = %e, "Failed to send heartbeat");
                        break;
                    }
                }
            }
        }
    })
}

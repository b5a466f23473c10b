//! Sandbox supervisor: owns the coding agent and the bridge.
//!
//! The bridge is restarted with capped exponential backoff when it crashes.
//! A clean bridge exit means the control plane asked the sandbox to stop.
//! When restarts run out, or the agent dies, the supervisor reports a fatal
//! error to the control plane and shuts the sandbox down.

pub mod git_sync;
pub mod launcher;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{exponential_delay, Sleeper, TokioSleeper};
use crate::process::{stop_process, ManagedProcess};

pub use self::launcher::{ControlPlaneReporter, ProcessLauncher};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub backoff_base: f64,
    pub backoff_max: Duration,
    pub poll_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL when stopping children.
    pub terminate_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            backoff_base: 2.0,
            backoff_max: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    Running,
    Restarting { attempt: u32, delay: Duration },
    Fatal,
    ShutDown,
}

impl SupervisorConfig {
    /// Phase after observing the bridge's exit status. `restart_count` is the
    /// number of restarts already performed.
    pub fn next_phase(&self, restart_count: u32, bridge_exit: Option<i32>) -> SupervisorPhase {
        match bridge_exit {
            None => SupervisorPhase::Running,
            Some(0) => SupervisorPhase::ShutDown,
            Some(_) if restart_count < self.max_restarts => {
                let attempt = restart_count + 1;
                SupervisorPhase::Restarting {
                    attempt,
                    delay: exponential_delay(self.backoff_base, attempt).min(self.backoff_max),
                }
            }
            Some(_) => SupervisorPhase::Fatal,
        }
    }
}

/// Starts bridge processes.
#[async_trait]
pub trait BridgeLauncher: Send + Sync {
    async fn start_bridge(&self) -> Result<Box<dyn ManagedProcess>>;
}

/// Receives unrecoverable sandbox errors.
#[async_trait]
pub trait FatalReporter: Send + Sync {
    async fn report_fatal(&self, message: &str);
}

pub struct SandboxSupervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn BridgeLauncher>,
    reporter: Arc<dyn FatalReporter>,
    sleeper: Arc<dyn Sleeper>,
    bridge: Option<Box<dyn ManagedProcess>>,
    agent: Option<Box<dyn ManagedProcess>>,
    restart_count: u32,
    shutdown: CancellationToken,
}

impl SandboxSupervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn BridgeLauncher>,
        reporter: Arc<dyn FatalReporter>,
    ) -> Self {
        Self {
            config,
            launcher,
            reporter,
            sleeper: Arc::new(TokioSleeper),
            bridge: None,
            agent: None,
            restart_count: 0,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the sleeper used for restart backoff.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn set_agent(&mut self, agent: Box<dyn ManagedProcess>) {
        self.agent = Some(agent);
    }

    pub fn set_bridge(&mut self, bridge: Box<dyn ManagedProcess>) {
        self.bridge = Some(bridge);
    }

    /// Token that stops the supervisor when cancelled. Never reset.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Launch a bridge and make it the supervised one.
    pub async fn start_bridge(&mut self) -> Result<()> {
        let bridge = self.launcher.start_bridge().await?;
        info!(pid = ?bridge.id(), "Bridge started");
        self.bridge = Some(bridge);
        Ok(())
    }

    /// Poll both children until the sandbox should stop.
    pub async fn monitor_processes(&mut self) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if let Some(code) = self.agent.as_mut().and_then(|agent| agent.exit_code()) {
                self.fatal(&format!("Agent process exited with code {code}")).await;
                break;
            }

            let bridge_exit = self.bridge.as_mut().and_then(|bridge| bridge.exit_code());
            match self.config.next_phase(self.restart_count, bridge_exit) {
                SupervisorPhase::Running => {}
                SupervisorPhase::ShutDown => {
                    info!("Bridge exited cleanly, shutting down");
                    self.shutdown.cancel();
                    break;
                }
                SupervisorPhase::Restarting { attempt, delay } => {
                    warn!(
                        exit_code = ?bridge_exit,
                        attempt,
                        max_restarts = self.config.max_restarts,
                        delay_secs = delay.as_secs_f64(),
                        "Bridge crashed, restarting"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.sleeper.sleep(delay) => {}
                    }
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    self.restart_count = attempt;
                    if let Err(e) = self.start_bridge().await {
                        error!(error = %format!("{e:#}"), attempt, "Failed to restart bridge");
                    }
                    continue;
                }
                SupervisorPhase::Fatal => {
                    let message = format!(
                        "Bridge crashed after {} restarts (exit code {})",
                        self.restart_count,
                        bridge_exit.unwrap_or_default()
                    );
                    self.fatal(&message).await;
                    break;
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn fatal(&self, message: &str) {
        error!(error = %message, "Fatal sandbox error");
        self.shutdown.cancel();
        self.reporter.report_fatal(message).await;
    }

    /// Stop both children, bridge first.
    pub async fn shutdown_processes(&mut self) {
        self.shutdown.cancel();
        for (name, process) in [("bridge", self.bridge.take()), ("agent", self.agent.take())] {
            let Some(mut process) = process else {
                continue;
            };
            match stop_process(process.as_mut(), self.config.terminate_grace).await {
                Ok(code) => info!(process = name, exit_code = code, "Process stopped"),
                Err(e) => warn!(process = name, error = %e, "Failed to stop process"),
            }
        }
    }

    /// Start the bridge, supervise until shutdown, then stop both children.
    pub async fn run(&mut self) -> Result<()> {
        if self.bridge.is_none() {
            if let Err(e) = self.start_bridge().await {
                self.shutdown_processes().await;
                return Err(e.context("Failed to start bridge"));
            }
        }
        self.monitor_processes().await;
        self.shutdown_processes().await;
        Ok(())
    }
}

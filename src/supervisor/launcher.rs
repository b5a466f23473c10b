//! Child process launching and control-plane error reporting.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{BridgeLauncher, FatalReporter};
use crate::process::{ManagedProcess, TokioProcess};

/// Spawns a configured program with inherited stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env_vars: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env_vars: Vec::new(),
        }
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable for the child.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn spawn(&self) -> Result<TokioProcess> {
        info!(
            process = %self.name,
            program = %self.program.display(),
            args = ?self.args,
            "Spawning process"
        );

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.env_vars {
            command.env(key, value);
        }

        TokioProcess::spawn(self.name.clone(), command)
            .with_context(|| format!("Failed to spawn {}", self.name))
    }
}

#[async_trait]
impl BridgeLauncher for ProcessLauncher {
    async fn start_bridge(&self) -> Result<Box<dyn ManagedProcess>> {
        Ok(Box::new(self.spawn()?))
    }
}

/// Poll `url` until it answers with a 2xx status.
pub async fn wait_for_http(url: &str, timeout: Duration) -> Result<()> {
    let http = Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .context("Failed to build health check client")?;
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match http.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, "Health check passed");
                return Ok(());
            }
            Ok(response) => debug!(url = %url, status = %response.status(), "Not ready yet"),
            Err(e) => debug!(url = %url, error = %e, "Not reachable yet"),
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("{url} did not become healthy within {}s", timeout.as_secs());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FatalErrorReport<'a> {
    sandbox_id: &'a str,
    error: &'a str,
}

/// Reports fatal errors to `{control_plane_url}/sandboxes/{sandbox_id}/error`.
#[derive(Clone)]
pub struct ControlPlaneReporter {
    http: Client,
    control_plane_url: String,
    sandbox_id: String,
    auth_token: String,
}

impl ControlPlaneReporter {
    pub fn new(
        control_plane_url: impl Into<String>,
        sandbox_id: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build reporter HTTP client, using defaults");
                Client::new()
            });
        Self {
            http,
            control_plane_url: control_plane_url.into().trim_end_matches('/').to_string(),
            sandbox_id: sandbox_id.into(),
            auth_token: auth_token.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/sandboxes/{}/error", self.control_plane_url, self.sandbox_id)
    }

    async fn post(&self, message: &str) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.auth_token))
            .json(&FatalErrorReport {
                sandbox_id: &self.sandbox_id,
                error: message,
            })
            .send()
            .await
            .context("Failed to send fatal error report")?;
        if !response.status().is_success() {
            bail!("control plane rejected fatal error report: {}", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl FatalReporter for ControlPlaneReporter {
    async fn report_fatal(&self, message: &str) {
        if self.control_plane_url.is_empty() {
            warn!(error = %message, "No control plane configured, fatal error not reported");
            return;
        }
        match self.post(message).await {
            Ok(()) => info!(sandbox_id = %self.sandbox_id, "Reported fatal error"),
            Err(e) => error!(
                sandbox_id = %self.sandbox_id,
                error = %format!("{e:#}"),
                "Failed to report fatal error"
            ),
        }
    }
}

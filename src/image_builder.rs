//! Asynchronous sandbox image builds.
//!
//! A build runs the supervisor in image-build mode inside a build sandbox. The
//! sandbox's stdout is a stream of JSON log lines; two milestones matter here:
//!
//! - `git.sync_complete` carries the `head_sha` that was built,
//! - `image_build.complete` marks a finished build.
//!
//! The outcome is combined with the sandbox exit status and reported to the
//! control plane through [`CallbackRetrier`].

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tracing::{debug, error, info, warn};

use crate::callback::CallbackRetrier;
use crate::process::{ManagedProcess, ProcessGuard, TokioProcess};

pub const EVENT_SYNC_COMPLETE: &str = "git.sync_complete";
pub const EVENT_BUILD_COMPLETE: &str = "image_build.complete";

/// Milestones extracted from a build log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Commit built, from the first `git.sync_complete` event. Empty if none.
    pub head_sha: String,
    /// Whether `image_build.complete` was observed.
    pub complete: bool,
}

/// One structured log line. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct BuildLogEvent {
    /// Loggers disagree on the type (`"info"` vs `30`), so it is kept raw.
    #[serde(default)]
    level: Option<serde_json::Value>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    head_sha: Option<String>,
}

/// Consume build log lines until completion is observed or the stream ends.
///
/// Lines that are not JSON objects are skipped, even if they mention a
/// milestone. A stream error stops consumption and yields an incomplete
/// outcome that keeps any commit already captured.
pub async fn stream_build_logs<S>(lines: S) -> BuildOutcome
where
    S: Stream<Item = io::Result<String>>,
{
    futures::pin_mut!(lines);
    let mut outcome = BuildOutcome::default();

    while let Some(item) = lines.next().await {
        let line = match item {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, head_sha = %outcome.head_sha, "Build log stream failed");
                return BuildOutcome {
                    complete: false,
                    ..outcome
                };
            }
        };

        let Ok(event) = serde_json::from_str::<BuildLogEvent>(&line) else {
            continue;
        };
        debug!(level = ?event.level, event = ?event.event, "Build log event");

        match event.event.as_deref() {
            Some(EVENT_SYNC_COMPLETE) if outcome.head_sha.is_empty() => {
                if let Some(sha) = event.head_sha {
                    info!(head_sha = %sha, "Build synced repository");
                    outcome.head_sha = sha;
                }
            }
            Some(EVENT_BUILD_COMPLETE) => {
                outcome.complete = true;
                break;
            }
            _ => {}
        }
    }

    outcome
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to start build sandbox: {0}")]
    Spawn(String),

    #[error("sandbox exited with code {exit_code}")]
    SandboxFailed { exit_code: i32 },

    #[error("build did not complete (sandbox exit code {exit_code})")]
    Incomplete { exit_code: i32 },

    #[error("build timed out after {0:?}")]
    TimedOut(Duration),

    #[error("failed to wait for build sandbox: {0}")]
    Wait(#[from] io::Error),
}

/// A build to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub build_id: String,
    pub repo_owner: String,
    pub repo_name: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub callback_url: String,
}

/// A successful build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltImage {
    pub build_id: String,
    pub head_sha: String,
    pub duration: Duration,
}

/// A started build sandbox: its log lines and its process.
pub struct RunningBuild {
    pub logs: BoxStream<'static, io::Result<String>>,
    pub process: Box<dyn ManagedProcess>,
}

/// Platform capability: run a build sandbox and expose its stdout.
#[async_trait]
pub trait BuildSandbox: Send + Sync {
    async fn start(&self, request: &BuildRequest) -> Result<RunningBuild, BuildError>;
}

/// Runs the build as a local process.
#[derive(Debug, Clone)]
pub struct ProcessBuildSandbox {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env_vars: Vec<(String, String)>,
}

impl ProcessBuildSandbox {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
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

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl BuildSandbox for ProcessBuildSandbox {
    async fn start(&self, request: &BuildRequest) -> Result<RunningBuild, BuildError> {
        info!(
            build_id = %request.build_id,
            program = %self.program,
            repo = %format!("{}/{}", request.repo_owner, request.repo_name),
            "Starting build sandbox"
        );

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .env("SANDBOX_ID", format!("build-{}", request.build_id))
            .env("REPO_OWNER", &request.repo_owner)
            .env("REPO_NAME", &request.repo_name)
            .env("IMAGE_BUILD_MODE", "true");
        if let Some(branch) = &request.branch {
            command.env("REPO_BRANCH", branch);
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.env_vars {
            command.env(key, value);
        }

        let mut process = TokioProcess::spawn(self.program.clone(), command)
            .map_err(|e| BuildError::Spawn(e.to_string()))?;
        let stdout = process
            .child_mut()
            .stdout
            .take()
            .ok_or_else(|| BuildError::Spawn("build sandbox stdout not available".to_string()))?;

        Ok(RunningBuild {
            logs: line_stream(stdout),
            process: Box::new(process),
        })
    }
}

fn line_stream(stdout: ChildStdout) -> BoxStream<'static, io::Result<String>> {
    let lines = BufReader::new(stdout).lines();
    stream::unfold(lines, |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), lines)),
            Ok(None) => None,
            Err(e) => Some((Err(e), lines)),
        }
    })
    .boxed()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Success,
    Failed,
}

/// Body of the build callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCallbackPayload {
    pub build_id: String,
    pub status: BuildStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_duration_seconds: Option<f64>,
}

impl BuildCallbackPayload {
    pub fn from_result(build_id: &str, result: &Result<BuiltImage, BuildError>) -> Self {
        match result {
            Ok(image) => Self {
                build_id: build_id.to_string(),
                status: BuildStatus::Success,
                head_sha: Some(image.head_sha.clone()).filter(|sha| !sha.is_empty()),
                error: None,
                build_duration_seconds: Some(image.duration.as_secs_f64()),
            },
            Err(e) => Self {
                build_id: build_id.to_string(),
                status: BuildStatus::Failed,
                head_sha: None,
                error: Some(e.to_string()),
                build_duration_seconds: None,
            },
        }
    }
}

/// Drives builds and reports their outcome.
pub struct ImageBuilder {
    sandbox: Arc<dyn BuildSandbox>,
    callback: CallbackRetrier,
    callback_secret: String,
    build_timeout: Duration,
    exit_timeout: Duration,
}

impl ImageBuilder {
    pub fn new(
        sandbox: Arc<dyn BuildSandbox>,
        callback: CallbackRetrier,
        callback_secret: impl Into<String>,
    ) -> Self {
        Self {
            sandbox,
            callback,
            callback_secret: callback_secret.into(),
            build_timeout: Duration::from_secs(30 * 60),
            exit_timeout: Duration::from_secs(30),
        }
    }

    /// Upper bound on log streaming for a single build.
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    /// How long to wait for the sandbox to exit once its logs end.
    pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }

    /// Run a build to completion.
    pub async fn build(&self, request: &BuildRequest) -> Result<BuiltImage, BuildError> {
        let started = Instant::now();
        let RunningBuild { logs, mut process } = self.sandbox.start(request).await?;
        let mut guard = ProcessGuard::new(process.as_mut());

        let outcome = match tokio::time::timeout(self.build_timeout, stream_build_logs(logs)).await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(build_id = %request.build_id, "Build timed out");
                guard.stop(Duration::from_secs(5)).await?;
                return Err(BuildError::TimedOut(self.build_timeout));
            }
        };

        let exit_code = match tokio::time::timeout(self.exit_timeout, guard.wait()).await {
            Ok(code) => code?,
            Err(_) => {
                warn!(build_id = %request.build_id, "Build sandbox did not exit, stopping it");
                guard.stop(Duration::from_secs(5)).await?
            }
        };

        info!(
            build_id = %request.build_id,
            head_sha = %outcome.head_sha,
            complete = outcome.complete,
            exit_code,
            "Build sandbox finished"
        );

        if exit_code != 0 {
            return Err(BuildError::SandboxFailed { exit_code });
        }
        if !outcome.complete {
            return Err(BuildError::Incomplete { exit_code });
        }

        Ok(BuiltImage {
            build_id: request.build_id.clone(),
            head_sha: outcome.head_sha,
            duration: started.elapsed(),
        })
    }

    /// Run a build and report the result to `request.callback_url`.
    ///
    /// Returns whether the callback was delivered.
    pub async fn build_and_report(&self, request: &BuildRequest) -> bool {
        let result = self.build(request).await;
        if let Err(e) = &result {
            error!(build_id = %request.build_id, error = %e, "Image build failed");
        }

        let payload = BuildCallbackPayload::from_result(&request.build_id, &result);
        self.callback
            .deliver(&request.callback_url, &payload, &self.callback_secret)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lines(values: Vec<String>) -> impl Stream<Item = io::Result<String>> {
        stream::iter(values.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_returns_sha_and_complete() {
        let log = vec![
            json!({"level": "info", "event": "supervisor.start"}).to_string(),
            json!({"level": "info", "event": "git.clone_start"}).to_string(),
            json!({"level": "info", "event": "git.sync_complete", "head_sha": "abc123def456"})
                .to_string(),
            json!({"level": "info", "event": "image_build.complete", "duration_ms": 5000})
                .to_string(),
        ];
        let outcome = stream_build_logs(lines(log)).await;
        assert_eq!(outcome.head_sha, "abc123def456");
        assert!(outcome.complete);
    }

    #[tokio::test]
    async fn test_complete_without_sha() {
        let log = vec![
            json!({"level": "info", "event": "supervisor.start"}).to_string(),
            json!({"level": "info", "event": "image_build.complete"}).to_string(),
        ];
        let outcome = stream_build_logs(lines(log)).await;
        assert_eq!(outcome.head_sha, "");
        assert!(outcome.complete);
    }

    #[tokio::test]
    async fn test_incomplete_when_sandbox_exits() {
        let log = vec![
            json!({"level": "info", "event": "supervisor.start"}).to_string(),
            json!({"level": "info", "event": "git.sync_complete", "head_sha": "abc123"})
                .to_string(),
            json!({"level": "error", "event": "git.clone_error"}).to_string(),
        ];
        let outcome = stream_build_logs(lines(log)).await;
        assert_eq!(outcome.head_sha, "abc123");
        assert!(!outcome.complete);
    }

    #[tokio::test]
    async fn test_returns_incomplete_on_stream_error() {
        let failing = stream::iter(vec![Err(io::Error::other("stream error"))]);
        let outcome = stream_build_logs(failing).await;
        assert_eq!(outcome, BuildOutcome::default());
    }

    #[tokio::test]
    async fn test_stream_error_keeps_captured_sha() {
        let items = vec![
            Ok(json!({"event": "git.sync_complete", "head_sha": "abc123"}).to_string()),
            Err(io::Error::other("connection reset")),
            Ok(json!({"event": "image_build.complete"}).to_string()),
        ];
        let outcome = stream_build_logs(stream::iter(items)).await;
        assert_eq!(outcome.head_sha, "abc123");
        assert!(!outcome.complete);
    }

    #[tokio::test]
    async fn test_handles_malformed_json() {
        let log = vec![
            "not json but has git.sync_complete in it".to_string(),
            json!({"level": "info", "event": "git.sync_complete", "head_sha": "abc123"})
                .to_string(),
            json!({"level": "info", "event": "image_build.complete"}).to_string(),
        ];
        let outcome = stream_build_logs(lines(log)).await;
        assert_eq!(outcome.head_sha, "abc123");
        assert!(outcome.complete);
    }

    #[tokio::test]
    async fn test_accepts_numeric_levels() {
        let log = vec![
            json!({"level": 30, "event": "git.sync_complete", "head_sha": "abc123"}).to_string(),
            json!({"level": 30, "event": "image_build.complete"}).to_string(),
        ];
        let outcome = stream_build_logs(lines(log)).await;
        assert_eq!(outcome.head_sha, "abc123");
        assert!(outcome.complete);
    }

    #[tokio::test]
    async fn test_first_sync_sha_wins() {
        let log = vec![
            json!({"event": "git.sync_complete", "head_sha": "first"}).to_string(),
            json!({"event": "git.sync_complete", "head_sha": "second"}).to_string(),
        ];
        let outcome = stream_build_logs(lines(log)).await;
        assert_eq!(outcome.head_sha, "first");
    }

    #[tokio::test]
    async fn test_stops_consuming_after_completion() {
        let log = stream::iter(vec![
            Ok(json!({"event": "image_build.complete"}).to_string()),
            Err(io::Error::other("never read")),
        ]);
        let outcome = stream_build_logs(log).await;
        assert!(outcome.complete);
    }

    #[test]
    fn test_build_error_messages() {
        let err = BuildError::SandboxFailed { exit_code: 1 };
        assert_eq!(err.to_string(), "sandbox exited with code 1");
    }

    #[test]
    fn test_callback_payload_serialization() {
        let success = BuildCallbackPayload::from_result(
            "build-1",
            &Ok(BuiltImage {
                build_id: "build-1".to_string(),
                head_sha: "abc".to_string(),
                duration: Duration::from_secs(2),
            }),
        );
        let json = serde_json::to_value(&success).unwrap();
        assert_eq!(json["buildId"], "build-1");
        assert_eq!(json["status"], "success");
        assert_eq!(json["headSha"], "abc");
        assert!(json.get("error").is_none());

        let failed = BuildCallbackPayload::from_result(
            "build-2",
            &Err(BuildError::Incomplete { exit_code: 0 }),
        );
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert!(json["error"].as_str().unwrap().contains("did not complete"));
        assert!(json.get("headSha").is_none());
    }
}

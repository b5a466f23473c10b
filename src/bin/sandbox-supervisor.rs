//! sandbox-supervisor binary entry point.
//!
//! Runs as the sandbox's main process. In runtime mode it syncs the
//! repository, starts the coding agent and the bridge, and supervises both.
//! With `--image-build` it only prepares the workspace and exits, emitting
//! JSON logs that the image build pipeline parses.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use open_inspect_sandbox::process::stop_process;
use open_inspect_sandbox::supervisor::git_sync::{repo_dir, sync_repository, RepoSpec};
use open_inspect_sandbox::supervisor::launcher::wait_for_http;
use open_inspect_sandbox::supervisor::{
    ControlPlaneReporter, FatalReporter, ProcessLauncher, SandboxSupervisor, SupervisorConfig,
};
use open_inspect_sandbox::tools::{install_tools, ToolSources};

/// Sandbox process supervisor.
#[derive(Parser, Debug)]
#[command(name = "sandbox-supervisor")]
#[command(about = "Supervises the coding agent and control-plane bridge inside a sandbox")]
struct Args {
    #[arg(long, env = "SANDBOX_ID")]
    sandbox_id: String,

    /// Session the bridge attaches to
    #[arg(long, env = "SESSION_ID", default_value = "")]
    session_id: String,

    #[arg(long, env = "CONTROL_PLANE_URL", default_value = "")]
    control_plane_url: String,

    /// Token the sandbox authenticates to the control plane with
    #[arg(long, env = "SANDBOX_AUTH_TOKEN", default_value = "")]
    auth_token: String,

    #[arg(long, env = "REPO_OWNER")]
    repo_owner: String,

    #[arg(long, env = "REPO_NAME")]
    repo_name: String,

    #[arg(long, env = "REPO_BRANCH", default_value = "main")]
    repo_branch: String,

    /// GitHub token for cloning private repositories
    #[arg(long, env = "GITHUB_APP_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    #[arg(long, env = "WORKSPACE_DIR", default_value = "/workspace")]
    workspace: PathBuf,

    /// Prepare the workspace for an image snapshot and exit
    #[arg(long, env = "IMAGE_BUILD_MODE")]
    image_build: bool,

    /// Path to the bridge binary
    #[arg(long, env = "SANDBOX_BRIDGE_BIN", default_value = "sandbox-bridge")]
    bridge_bin: PathBuf,

    #[arg(long, env = "OPENCODE_PORT", default_value = "4096")]
    opencode_port: u16,

    /// Seconds to wait for the agent server to come up
    #[arg(long, env = "OPENCODE_READY_TIMEOUT", default_value = "60")]
    agent_ready_timeout: u64,

    #[arg(long, env = "SUPERVISOR_MAX_RESTARTS", default_value = "5")]
    max_restarts: u32,

    /// Emit JSON logs
    #[arg(long, env = "LOG_JSON")]
    json_logs: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::default().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()))
    };

    if json {
        tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

fn shutdown_on_signal(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        token.cancel();
    });
    Ok(())
}

async fn image_build(args: &Args, repo: &RepoSpec) -> Result<()> {
    let started = Instant::now();
    sync_repository(repo, &args.workspace)
        .await
        .context("Repository sync failed")?;
    install_tools(&repo_dir(repo, &args.workspace), &ToolSources::default())
        .context("Tool installation failed")?;
    info!(
        event = "image_build.complete",
        duration_ms = started.elapsed().as_millis() as u64,
        "Image build complete"
    );
    Ok(())
}

async fn run_sandbox(args: &Args, repo: &RepoSpec) -> Result<()> {
    let reporter = Arc::new(ControlPlaneReporter::new(
        args.control_plane_url.clone(),
        args.sandbox_id.clone(),
        args.auth_token.clone(),
    ));

    // A snapshot may already hold the checkout, so a failed sync is survivable.
    if let Err(e) = sync_repository(repo, &args.workspace).await {
        warn!(error = %e, "Continuing with existing workspace");
    }
    let workdir = repo_dir(repo, &args.workspace);
    let workdir = if workdir.is_dir() {
        workdir
    } else {
        args.workspace.clone()
    };
    if let Err(e) = install_tools(&workdir, &ToolSources::default()) {
        warn!(error = %e, "Failed to install agent tools");
    }

    let opencode_url = format!("http://127.0.0.1:{}", args.opencode_port);
    let spawned = ProcessLauncher::new("opencode", "opencode")
        .with_args([
            "serve".to_string(),
            "--port".to_string(),
            args.opencode_port.to_string(),
            "--hostname".to_string(),
            "127.0.0.1".to_string(),
        ])
        .with_cwd(&workdir)
        .spawn();
    let mut agent = match spawned {
        Ok(agent) => agent,
        Err(e) => {
            let message = format!("Failed to start agent: {e:#}");
            reporter.report_fatal(&message).await;
            anyhow::bail!(message);
        }
    };

    let ready_timeout = Duration::from_secs(args.agent_ready_timeout);
    if let Err(e) = wait_for_http(&format!("{opencode_url}/session"), ready_timeout).await {
        let message = format!("Agent did not become ready: {e:#}");
        reporter.report_fatal(&message).await;
        if let Err(e) = stop_process(&mut agent, Duration::from_secs(5)).await {
            warn!(error = %e, "Failed to stop agent");
        }
        anyhow::bail!(message);
    }
    info!(url = %opencode_url, "Agent ready");

    let bridge = ProcessLauncher::new("bridge", args.bridge_bin.clone())
        .with_cwd(&args.workspace)
        .with_env("SANDBOX_ID", &args.sandbox_id)
        .with_env("SESSION_ID", &args.session_id)
        .with_env("CONTROL_PLANE_URL", &args.control_plane_url)
        .with_env("SANDBOX_AUTH_TOKEN", &args.auth_token)
        .with_env("OPENCODE_URL", &opencode_url)
        .with_env("WORKSPACE_DIR", args.workspace.to_string_lossy());

    let config = SupervisorConfig {
        max_restarts: args.max_restarts,
        ..SupervisorConfig::default()
    };
    let mut supervisor = SandboxSupervisor::new(config, Arc::new(bridge), reporter);
    supervisor.set_agent(Box::new(agent));
    shutdown_on_signal(supervisor.shutdown_token())?;

    supervisor.run().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.json_logs || args.image_build);

    info!(
        sandbox_id = %args.sandbox_id,
        repo = %format!("{}/{}", args.repo_owner, args.repo_name),
        branch = %args.repo_branch,
        image_build = args.image_build,
        "Starting sandbox-supervisor"
    );

    let repo = RepoSpec::new(&args.repo_owner, &args.repo_name)
        .with_branch(&args.repo_branch)
        .with_token(args.github_token.clone());

    let result = if args.image_build {
        image_build(&args, &repo).await
    } else {
        run_sandbox(&args, &repo).await
    };

    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "Supervisor exited with error");
    }
    result
}

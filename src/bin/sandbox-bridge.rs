//! sandbox-bridge binary entry point.
//!
//! Connects to the control plane and executes its commands against the
//! workspace checkout and the local coding agent. Exits 0 on a requested
//! shutdown and non-zero when the connection is lost, so the supervisor
//! knows whether to restart it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use open_inspect_sandbox::bridge::agent::{OpenCodeClient, DEFAULT_OPENCODE_BASE_URL};
use open_inspect_sandbox::bridge::git::{find_repo_dir, CliGit};
use open_inspect_sandbox::bridge::protocol::BridgeEvent;
use open_inspect_sandbox::bridge::transport::{ChannelConfig, EventSink, WebSocketChannel};
use open_inspect_sandbox::bridge::{spawn_heartbeat, AgentBridge, BridgeConfig, RunOutcome};

/// Control-plane bridge for a sandbox.
#[derive(Parser, Debug)]
#[command(name = "sandbox-bridge")]
#[command(about = "Executes control-plane commands inside a sandbox")]
struct Args {
    #[arg(long, env = "SANDBOX_ID")]
    sandbox_id: String,

    #[arg(long, env = "SESSION_ID")]
    session_id: String,

    #[arg(long, env = "CONTROL_PLANE_URL")]
    control_plane_url: String,

    #[arg(long, env = "SANDBOX_AUTH_TOKEN", hide_env_values = true)]
    auth_token: String,

    /// Base URL of the agent server
    #[arg(long, env = "OPENCODE_URL", default_value = DEFAULT_OPENCODE_BASE_URL)]
    opencode_url: String,

    #[arg(long, env = "WORKSPACE_DIR", default_value = "/workspace")]
    workspace: PathBuf,

    /// Seconds a git push may run before it is terminated
    #[arg(long, env = "GIT_PUSH_TIMEOUT_SECONDS", default_value = "120")]
    push_timeout: u64,

    #[arg(long, env = "HEARTBEAT_INTERVAL_SECONDS", default_value = "30")]
    heartbeat_interval: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::default().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let repo_dir = find_repo_dir(&args.workspace).unwrap_or_else(|| {
        warn!(workspace = %args.workspace.display(), "No git checkout found in workspace");
        args.workspace.clone()
    });

    info!(
        sandbox_id = %args.sandbox_id,
        session_id = %args.session_id,
        repo_dir = %repo_dir.display(),
        "Starting sandbox-bridge"
    );

    let mut channel = WebSocketChannel::connect(&ChannelConfig {
        control_plane_url: args.control_plane_url.clone(),
        session_id: args.session_id.clone(),
        sandbox_id: args.sandbox_id.clone(),
        auth_token: args.auth_token.clone(),
    })
    .await?;
    let events: Arc<dyn EventSink> = Arc::new(channel.sink.clone());

    events
        .send(BridgeEvent::Ready {
            sandbox_id: args.sandbox_id.clone(),
        })
        .await?;

    let heartbeat_cancel = CancellationToken::new();
    let heartbeat = spawn_heartbeat(
        events.clone(),
        args.sandbox_id.clone(),
        Duration::from_secs(args.heartbeat_interval),
        heartbeat_cancel.clone(),
    );

    let config = BridgeConfig {
        sandbox_id: args.sandbox_id.clone(),
        repo_dir,
        push_timeout: Duration::from_secs(args.push_timeout),
        ..BridgeConfig::default()
    };
    let mut bridge = AgentBridge::new(
        config,
        events,
        Arc::new(CliGit),
        Arc::new(OpenCodeClient::new(args.opencode_url.clone())),
    );

    let outcome = bridge.run(&mut channel.commands).await;

    heartbeat_cancel.cancel();
    if let Err(e) = heartbeat.await {
        warn!(error = %e, "Heartbeat task failed");
    }
    drop(bridge);
    channel.close().await;

    match outcome {
        RunOutcome::Shutdown => {
            info!("Bridge shut down");
            Ok(())
        }
        RunOutcome::Disconnected => bail!("Control plane connection lost"),
    }
}

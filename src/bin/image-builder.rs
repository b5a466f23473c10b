//! image-builder binary entry point.
//!
//! Runs one image build and reports it to the control plane's build callback.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use open_inspect_sandbox::image_builder::{BuildRequest, ImageBuilder, ProcessBuildSandbox};
use open_inspect_sandbox::{CallbackConfig, CallbackRetrier};

/// Build a sandbox image for a repository.
#[derive(Parser, Debug)]
#[command(name = "image-builder")]
#[command(about = "Builds a sandbox image and reports the result")]
struct Args {
    /// Build identifier; generated when not supplied
    #[arg(long, env = "BUILD_ID")]
    build_id: Option<String>,

    #[arg(long, env = "REPO_OWNER")]
    repo_owner: String,

    #[arg(long, env = "REPO_NAME")]
    repo_name: String,

    #[arg(long, env = "REPO_BRANCH")]
    branch: Option<String>,

    /// Where the build result is POSTed
    #[arg(long, env = "BUILD_CALLBACK_URL")]
    callback_url: String,

    /// Shared secret for signing callback tokens
    #[arg(long, env = "INTERNAL_CALLBACK_SECRET", hide_env_values = true)]
    callback_secret: String,

    /// Program that performs the build inside the sandbox
    #[arg(long, env = "BUILD_SANDBOX_PROGRAM", default_value = "sandbox-supervisor")]
    sandbox_program: String,

    /// Arguments for the build program
    #[arg(long = "sandbox-arg", default_values_t = vec!["--image-build".to_string()])]
    sandbox_args: Vec<String>,

    /// Upper bound on a single build, in seconds
    #[arg(long, env = "BUILD_TIMEOUT_SECONDS", default_value = "1800")]
    build_timeout: u64,

    #[arg(long, env = "CALLBACK_MAX_RETRIES", default_value = "3")]
    callback_max_retries: u32,

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

    let build_id = args
        .build_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        build_id = %build_id,
        repo = %format!("{}/{}", args.repo_owner, args.repo_name),
        branch = ?args.branch,
        "Starting image build"
    );

    let sandbox = ProcessBuildSandbox::new(args.sandbox_program.clone())
        .with_args(args.sandbox_args.clone());
    let callback = CallbackRetrier::new(CallbackConfig {
        max_retries: args.callback_max_retries,
        ..CallbackConfig::default()
    });
    let builder = ImageBuilder::new(Arc::new(sandbox), callback, args.callback_secret.clone())
        .with_build_timeout(Duration::from_secs(args.build_timeout));

    let request = BuildRequest {
        build_id: build_id.clone(),
        repo_owner: args.repo_owner.clone(),
        repo_name: args.repo_name.clone(),
        branch: args.branch.clone(),
        callback_url: args.callback_url.clone(),
    };

    if !builder.build_and_report(&request).await {
        bail!("Build callback for {build_id} was not delivered");
    }
    Ok(())
}

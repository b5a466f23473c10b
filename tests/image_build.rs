//! End-to-end image builds against a scripted build sandbox.
//!
//! The build sandbox is `sh -c <script>`, standing in for the supervisor in
//! image-build mode. Callbacks land on a local recording server.


use std::sync::Arc;
use std::time::Duration;

use open_inspect_sandbox::clock::RecordingSleeper;
use open_inspect_sandbox::image_builder::{
    BuildError, BuildRequest, ImageBuilder, ProcessBuildSandbox,
};
use open_inspect_sandbox::{verify_internal_token, CallbackConfig, CallbackRetrier};
use test_utils::RecordingServer;

const SECRET: &str = "build-secret";

const SUCCESSFUL_BUILD: &str = r#"
echo '{"level":"info","event":"supervisor.start"}'
echo 'cloning into /workspace/repo'
echo '{"level":"info","event":"git.sync_complete","head_sha":"abc123def456"}'
echo '{"level":"info","event":"image_build.complete","duration_ms":1200}'
"#;

fn builder(script: &str, sleeper: &RecordingSleeper) -> ImageBuilder {
    let sandbox = ProcessBuildSandbox::new("sh").with_args(["-c", script]);
    let callback =
        CallbackRetrier::new(CallbackConfig::default()).with_sleeper(Arc::new(sleeper.clone()));
    ImageBuilder::new(Arc::new(sandbox), callback, SECRET)
}

fn request(callback_url: String) -> BuildRequest {
    BuildRequest {
        build_id: "build-1".to_string(),
        repo_owner: "acme".to_string(),
        repo_name: "widgets".to_string(),
        branch: Some("main".to_string()),
        callback_url,
    }
}

#[tokio::test]
async fn test_build_returns_head_sha() {
    let sleeper = RecordingSleeper::new();
    let image = builder(SUCCESSFUL_BUILD, &sleeper)
        .build(&request("http://unused".to_string()))
        .await
        .unwrap();

    assert_eq!(image.build_id, "build-1");
    assert_eq!(image.head_sha, "abc123def456");
}

#[tokio::test]
async fn test_build_passes_repo_to_sandbox() {
    let script = r#"
test "$REPO_OWNER/$REPO_NAME@$REPO_BRANCH" = "acme/widgets@main" || exit 9
test "$IMAGE_BUILD_MODE" = "true" || exit 9
echo '{"event":"image_build.complete"}'
"#;
    let sleeper = RecordingSleeper::new();
    let image = builder(script, &sleeper)
        .build(&request("http://unused".to_string()))
        .await
        .unwrap();

    assert_eq!(image.head_sha, "");
}

#[tokio::test]
async fn test_nonzero_exit_fails_even_when_complete() {
    let script = r#"
echo '{"event":"git.sync_complete","head_sha":"abc"}'
echo '{"event":"image_build.complete"}'
exit 3
"#;
    let sleeper = RecordingSleeper::new();
    let err = builder(script, &sleeper)
        .build(&request("http://unused".to_string()))
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::SandboxFailed { exit_code: 3 }));
}

#[tokio::test]
async fn test_clean_exit_without_completion_is_incomplete() {
    let script = r#"
echo '{"event":"git.sync_complete","head_sha":"abc"}'
echo '{"level":"error","event":"git.clone_error"}'
"#;
    let sleeper = RecordingSleeper::new();
    let err = builder(script, &sleeper)
        .build(&request("http://unused".to_string()))
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Incomplete { exit_code: 0 }));
}

#[tokio::test]
async fn test_build_timeout_stops_sandbox() {
    let sleeper = RecordingSleeper::new();
    let err = builder("exec sleep 30", &sleeper)
        .with_build_timeout(Duration::from_millis(200))
        .build(&request("http://unused".to_string()))
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::TimedOut(_)));
}

#[tokio::test]
async fn test_missing_program_is_spawn_error() {
    let sandbox = ProcessBuildSandbox::new("/nonexistent/build-sandbox");
    let builder = ImageBuilder::new(
        Arc::new(sandbox),
        CallbackRetrier::new(CallbackConfig::default()),
        SECRET,
    );
    let err = builder
        .build(&request("http://unused".to_string()))
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Spawn(_)));
}

#[tokio::test]
async fn test_success_is_reported_with_token() {
    let server = RecordingServer::start(0).await;
    let sleeper = RecordingSleeper::new();

    let delivered = builder(SUCCESSFUL_BUILD, &sleeper)
        .build_and_report(&request(server.url("/builds/callback")))
        .await;

    assert!(delivered);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let callback = &requests[0];
    assert_eq!(callback.path, "/builds/callback");
    assert!(verify_internal_token(
        callback.authorization.as_deref().unwrap(),
        SECRET
    ));
    assert_eq!(callback.body["buildId"], "build-1");
    assert_eq!(callback.body["status"], "success");
    assert_eq!(callback.body["headSha"], "abc123def456");
}

#[tokio::test]
async fn test_failure_is_reported() {
    let server = RecordingServer::start(1).await;
    let sleeper = RecordingSleeper::new();

    let delivered = builder("exit 1", &sleeper)
        .build_and_report(&request(server.url("/builds/callback")))
        .await;

    assert!(delivered);
    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(sleeper.delays(), vec![Duration::from_secs(2)]);
    let body = &requests[1].body;
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "sandbox exited with code 1");
    assert!(body.get("headSha").is_none());
}

#[tokio::test]
async fn test_undelivered_callback_returns_false() {
    let server = RecordingServer::start(usize::MAX).await;
    let sleeper = RecordingSleeper::new();

    let delivered = builder(SUCCESSFUL_BUILD, &sleeper)
        .build_and_report(&request(server.url("/builds/callback")))
        .await;

    assert!(!delivered);
    assert_eq!(server.requests().len(), 3);
}

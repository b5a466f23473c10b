//! Callback delivery against a local server.


use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use open_inspect_sandbox::clock::RecordingSleeper;
use open_inspect_sandbox::{verify_internal_token, CallbackConfig, CallbackRetrier};
use test_utils::{unreachable_url, RecordingServer};

const SECRET: &str = "callback-secret";

fn retrier(sleeper: &RecordingSleeper) -> CallbackRetrier {
    CallbackRetrier::new(CallbackConfig::default()).with_sleeper(Arc::new(sleeper.clone()))
}

#[tokio::test]
async fn test_delivers_after_transient_failures() {
    for failures in 0..3usize {
        let server = RecordingServer::start(failures).await;
        let sleeper = RecordingSleeper::new();
        let payload = json!({"buildId": "build-1", "status": "success"});

        let delivered = retrier(&sleeper)
            .deliver(&server.url("/callback"), &payload, SECRET)
            .await;

        assert!(delivered);
        let requests = server.requests();
        assert_eq!(requests.len(), failures + 1);
        let expected: Vec<Duration> = (1..=failures as u32)
            .map(|n| Duration::from_secs(2u64.pow(n)))
            .collect();
        assert_eq!(sleeper.delays(), expected);
        assert!(requests.iter().all(|r| r.body == payload));
    }
}

#[tokio::test]
async fn test_gives_up_after_max_retries() {
    let server = RecordingServer::start(usize::MAX).await;
    let sleeper = RecordingSleeper::new();

    let delivered = retrier(&sleeper)
        .deliver(&server.url("/callback"), &json!({"ok": false}), SECRET)
        .await;

    assert!(!delivered);
    assert_eq!(server.requests().len(), 3);
    assert_eq!(
        sleeper.delays(),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );
}

#[tokio::test]
async fn test_transport_errors_are_retried() {
    let sleeper = RecordingSleeper::new();

    let delivered = retrier(&sleeper)
        .deliver(&unreachable_url(), &json!({}), SECRET)
        .await;

    assert!(!delivered);
    assert_eq!(sleeper.delays().len(), 2);
}

#[tokio::test]
async fn test_every_attempt_carries_a_valid_token() {
    let server = RecordingServer::start(2).await;
    let sleeper = RecordingSleeper::new();

    assert!(
        retrier(&sleeper)
            .deliver(&server.url("/callback"), &json!({}), SECRET)
            .await
    );

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    for request in requests {
        let header = request.authorization.expect("authorization header");
        assert!(verify_internal_token(&header, SECRET));
        assert!(!verify_internal_token(&header, "other-secret"));
    }
}

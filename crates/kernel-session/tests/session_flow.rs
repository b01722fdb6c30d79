//! End-to-end session flow against the scripted backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use kernel_session::{
    ExecuteOptions, KernelSpec, LaunchOptions, OutputMessage, ScriptedBackend,
    ScriptedConnection, Session, SessionError, SessionLauncher, SessionStatus, SpecResolver,
    StreamName, WireMessage,
};
use tokio::time::{sleep, timeout};

fn stdout(text: &str) -> OutputMessage {
    OutputMessage::Stream {
        name: StreamName::Stdout,
        text: text.to_string(),
    }
}

async fn start(backend: &ScriptedBackend) -> Session<ScriptedConnection> {
    SessionLauncher::new(backend)
        .start(&LaunchOptions::new("python3"))
        .await
        .unwrap()
}

/// Wait for the router to move the session into `status`.
async fn wait_for_status(session: &Session<ScriptedConnection>, status: SessionStatus) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if session.status() == status {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_list_start_execute_shutdown() {
    let backend = ScriptedBackend::python().reply(
        "print(1)",
        vec![WireMessage::stream(StreamName::Stdout, "1\n")],
    );

    let specs = SpecResolver::new(&backend).list_specs().await.unwrap();
    assert_eq!(specs.default_name, "python3");
    assert!(specs.specs.contains_key("python3"));

    let mut session = SessionLauncher::new(&backend)
        .start(&LaunchOptions::new(specs.default_name.clone()))
        .await
        .unwrap();
    assert_eq!(session.status(), SessionStatus::Ready);
    assert_eq!(session.kernel_name(), "python3");

    let mut future = session.execute("print(1)").await.unwrap();
    assert_eq!(future.next().await.unwrap().unwrap(), stdout("1\n"));
    assert_eq!(
        future.next().await.unwrap().unwrap(),
        OutputMessage::ExecutionComplete {
            execution_count: Some(1)
        }
    );
    assert!(future.next().await.is_none());

    session.shutdown().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Closed);
    assert_eq!(backend.shutdowns(), 1);
}

#[tokio::test]
async fn test_list_specs_unreachable() {
    let backend = ScriptedBackend::python();
    backend.set_unreachable(true);

    let err = SpecResolver::new(&backend).list_specs().await.unwrap_err();
    assert!(matches!(err, SessionError::SpecUnavailable(_)));
}

#[tokio::test]
async fn test_default_not_in_listing_is_reported() {
    let backend = ScriptedBackend::python().with_default("julia-1.10");

    let err = SpecResolver::new(&backend).list_specs().await.unwrap_err();
    assert!(matches!(err, SessionError::TransportError(_)));
}

#[tokio::test]
async fn test_default_spec() {
    let backend = ScriptedBackend::python()
        .with_spec(KernelSpec::new("deno", "Deno", Some("typescript")))
        .with_default("deno");

    let spec = SpecResolver::new(&backend).default_spec().await.unwrap();
    assert_eq!(spec.display_name, "Deno");
}

#[tokio::test]
async fn test_start_unknown_kernel_fails() {
    let backend = ScriptedBackend::python();

    let err = SessionLauncher::new(&backend)
        .start(&LaunchOptions::new("nonexistent"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SessionError::LaunchFailure(_)));

    let err = SessionLauncher::new(&backend)
        .start(&LaunchOptions::new(""))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SessionError::LaunchFailure(_)));
    assert_eq!(backend.launched(), 0);
}

#[tokio::test]
async fn test_null_code_sends_nothing() {
    let backend = ScriptedBackend::python();
    let mut session = start(&backend).await;

    let options: ExecuteOptions = serde_json::from_str(r#"{"code": null}"#).unwrap();
    let err = session.submit(options).await.err().unwrap();

    assert!(matches!(err, SessionError::InvalidArgument(_)));
    assert!(backend.sent().is_empty());
    assert_eq!(session.status(), SessionStatus::Ready);
}

#[tokio::test]
async fn test_empty_code_is_a_noop_execution() {
    let backend = ScriptedBackend::python();
    let mut session = start(&backend).await;

    let result = session.run("").await.unwrap();

    assert!(result.success);
    assert_eq!(
        result.outputs,
        vec![OutputMessage::ExecutionComplete {
            execution_count: Some(1)
        }]
    );
    assert_eq!(backend.sent().len(), 1);
}

#[tokio::test]
async fn test_concurrent_execute_is_busy() {
    let backend = ScriptedBackend::python();
    backend.set_hold_replies(true);
    let mut session = start(&backend).await;

    let first = session.execute("import time; time.sleep(1)").await.unwrap();
    assert_eq!(session.status(), SessionStatus::Executing);

    let err = session.execute("print(2)").await.err().unwrap();
    assert!(matches!(err, SessionError::SessionBusy { .. }));
    assert_eq!(backend.sent().len(), 1);

    backend.release_held().await;
    let result = first.wait().await.unwrap();
    assert!(result.success);
    assert!(wait_for_status(&session, SessionStatus::Ready).await);

    assert!(session.run("print(2)").await.is_ok());
}

#[tokio::test]
async fn test_serial_executions_reuse_the_session() {
    let backend = ScriptedBackend::python()
        .reply("a", vec![WireMessage::stream(StreamName::Stdout, "A")])
        .reply("b", vec![WireMessage::stream(StreamName::Stdout, "B")])
        .reply("c", vec![WireMessage::stream(StreamName::Stdout, "C")]);
    let mut session = start(&backend).await;

    let mut seen = Vec::new();
    for code in ["a", "b", "c"] {
        let result = session.run(code).await.unwrap();
        seen.push((result.stdout(), result.execution_count));
        assert!(wait_for_status(&session, SessionStatus::Ready).await);
    }

    assert_eq!(
        seen,
        vec![
            ("A".to_string(), Some(1)),
            ("B".to_string(), Some(2)),
            ("C".to_string(), Some(3)),
        ]
    );
    assert_eq!(backend.launched(), 1);
}

#[tokio::test]
async fn test_error_output_is_terminal() {
    let backend = ScriptedBackend::python().reply(
        "1/0",
        vec![
            WireMessage::stream(StreamName::Stderr, "about to fail\n"),
            WireMessage::error(
                "ZeroDivisionError",
                "division by zero",
                vec!["Traceback".to_string()],
            ),
            WireMessage::stream(StreamName::Stdout, "never delivered"),
        ],
    );
    let mut session = start(&backend).await;

    let result = session.run("1/0").await.unwrap();

    assert!(!result.success);
    assert_eq!(result.stderr(), "about to fail\n");
    assert_eq!(result.stdout(), "");
    assert!(matches!(
        result.error(),
        Some(OutputMessage::Error { ename, .. }) if ename == "ZeroDivisionError"
    ));
    assert!(wait_for_status(&session, SessionStatus::Ready).await);
}

#[tokio::test]
async fn test_subscribe_delivers_until_terminal() {
    let backend = ScriptedBackend::python().reply(
        "x",
        vec![
            WireMessage::stream(StreamName::Stdout, "one"),
            WireMessage::stream(StreamName::Stdout, "two"),
        ],
    );
    let mut session = start(&backend).await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let subscription = session
        .execute("x")
        .await
        .unwrap()
        .subscribe(move |item| sink.lock().unwrap().push(item.unwrap()));

    subscription.finished().await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 3);
    assert_eq!(received[0], stdout("one"));
    assert_eq!(received[1], stdout("two"));
    assert!(received[2].is_terminal());
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery_but_not_the_kernel() {
    let backend = ScriptedBackend::python()
        .reply("slow", vec![WireMessage::stream(StreamName::Stdout, "late")]);
    backend.set_hold_replies(true);
    let mut session = start(&backend).await;

    let calls = Arc::new(Mutex::new(0usize));
    let counter = calls.clone();
    let subscription = session
        .execute("slow")
        .await
        .unwrap()
        .subscribe(move |_| *counter.lock().unwrap() += 1);
    subscription.unsubscribe();

    // Still busy until the kernel reports the terminal message
    assert_eq!(session.status(), SessionStatus::Executing);

    backend.release_held().await;
    assert!(wait_for_status(&session, SessionStatus::Ready).await);
    assert_eq!(*calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_execute_after_shutdown_fails() {
    let backend = ScriptedBackend::python();
    let mut session = start(&backend).await;

    session.shutdown().await.unwrap();

    for _ in 0..3 {
        let err = session.execute("print(1)").await.err().unwrap();
        assert!(matches!(err, SessionError::SessionClosed { .. }));
    }
    assert!(backend.sent().is_empty());
    assert!(session.kernel_id().is_none());
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let backend = ScriptedBackend::python();
    let mut session = start(&backend).await;

    session.shutdown().await.unwrap();
    session.shutdown().await.unwrap();

    assert_eq!(session.status(), SessionStatus::Closed);
    assert_eq!(backend.shutdowns(), 1);
}

#[tokio::test]
async fn test_rejected_shutdown_leaves_session_unknown() {
    let backend = ScriptedBackend::python();
    backend.set_reject_shutdown(true);
    let mut session = start(&backend).await;

    let err = session.shutdown().await.unwrap_err();
    assert!(matches!(err, SessionError::TeardownFailure(_)));
    assert_eq!(session.status(), SessionStatus::Unknown);

    // Not retried, and the handle stays unusable
    let err = session.shutdown().await.unwrap_err();
    assert!(matches!(err, SessionError::SessionClosed { .. }));
    let err = session.execute("print(1)").await.err().unwrap();
    assert!(matches!(err, SessionError::SessionClosed { .. }));
    assert_eq!(backend.shutdowns(), 0);
}

#[tokio::test]
async fn test_shutdown_releases_inflight_execution() {
    let backend = ScriptedBackend::python();
    backend.set_hold_replies(true);
    let mut session = start(&backend).await;

    let future = session.execute("while True: pass").await.unwrap();
    session.shutdown().await.unwrap();

    let err = future.wait().await.unwrap_err();
    assert!(matches!(err, SessionError::SessionClosed { .. }));
}

#[tokio::test]
async fn test_submit_forwards_options() {
    let backend = ScriptedBackend::python();
    let mut session = start(&backend).await;

    let options = ExecuteOptions {
        silent: true,
        store_history: false,
        ..ExecuteOptions::new("x = 1")
    };
    let future = session.submit(options).await.unwrap();
    let msg_id = future.msg_id().to_string();
    future.wait().await.unwrap();

    let sent = backend.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].msg_id, msg_id);
    assert_eq!(sent[0].code, "x = 1");
    assert!(sent[0].silent);
    assert!(!sent[0].store_history);
}

#[tokio::test]
async fn test_cancelled_execute_frees_the_session() {
    let outputs = (0..100)
        .map(|i| WireMessage::stream(StreamName::Stdout, &format!("{}\n", i)))
        .collect();
    let backend = ScriptedBackend::python().reply("big", outputs);
    let mut session = start(&backend).await;

    // The reply overflows the inbound queue, so the send is still pending
    // when the call is dropped
    assert!(session.execute("big").now_or_never().is_none());
    assert_eq!(session.status(), SessionStatus::Ready);

    // Leftover output from the dropped request is not attributed here
    let result = session.run("print(2)").await.unwrap();
    assert!(result.success);
    assert_eq!(result.stdout(), "");
    assert_eq!(backend.sent().len(), 2);
}

#[tokio::test]
async fn test_abandoned_shutdown_leaves_session_unknown() {
    let backend = ScriptedBackend::python();
    backend.set_hang_shutdown(true);
    let mut session = start(&backend).await;

    let elapsed = timeout(Duration::from_millis(50), session.shutdown()).await;
    assert!(elapsed.is_err());
    assert_eq!(session.status(), SessionStatus::Unknown);

    let err = session.execute("print(1)").await.err().unwrap();
    assert!(matches!(err, SessionError::SessionClosed { .. }));
    let err = session.shutdown().await.unwrap_err();
    assert!(matches!(err, SessionError::SessionClosed { .. }));
    assert_eq!(backend.shutdowns(), 0);
}

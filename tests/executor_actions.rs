//! Real notification and mutation actions against a local HTTP listener and
//! shell scripts.

mod common;

use std::time::Duration;

use common::{shell_mutation, write_script, MockHttpServer};
use scan_relay::config::{NotificationConfig, RelayConfig};
use scan_relay::executor::{ActionExecutor, HttpNotifier, OutcomeKind, ProcessMutation, ScanAction};
use scan_relay::messaging::ScanEvent;

fn event() -> ScanEvent {
    ScanEvent::new("OP7", "S500").unwrap()
}

fn notifier(url: &str) -> HttpNotifier {
    HttpNotifier::from_config(&NotificationConfig {
        base_url: url.to_string(),
        timeout_ms: 2_000,
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_notification_sends_canonical_event_as_query() {
    let server = MockHttpServer::start(&[], 200).await;
    let outcome = notifier(&server.url).run(&event()).await;

    assert_eq!(outcome.kind, OutcomeKind::Success);
    assert_eq!(outcome.detail, "HTTP 200");
    assert_eq!(server.requests(), vec!["/?query=OP7%2CS500".to_string()]);
}

#[tokio::test]
async fn test_notification_status_classification() {
    let cases = [
        (200, OutcomeKind::Success),
        (204, OutcomeKind::Success),
        (302, OutcomeKind::Success),
        (400, OutcomeKind::PermanentFailure),
        (404, OutcomeKind::PermanentFailure),
        (429, OutcomeKind::TransientFailure),
        (500, OutcomeKind::TransientFailure),
        (503, OutcomeKind::TransientFailure),
    ];
    let statuses: Vec<u16> = cases.iter().map(|(status, _)| *status).collect();
    let server = MockHttpServer::start(&statuses, 200).await;
    let notifier = notifier(&server.url);

    for (status, expected) in cases {
        let outcome = notifier.run(&event()).await;
        assert_eq!(outcome.kind, expected, "HTTP {status}");
        assert_eq!(outcome.detail, format!("HTTP {status}"));
    }
}

#[tokio::test]
async fn test_notification_connection_refused_is_transient() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    drop(listener);

    let outcome = notifier(&url).run(&event()).await;
    assert_eq!(outcome.kind, OutcomeKind::TransientFailure);
}

#[cfg(unix)]
#[tokio::test]
async fn test_mutation_passes_area_only() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    let script = write_script(
        dir.path(),
        "db.sh",
        &format!("echo \"$@\" >> '{}'", log.display()),
    );

    let mutation = ProcessMutation::from_config(&shell_mutation(&script, 2_000));
    let outcome = mutation.run(&event()).await;

    assert_eq!(outcome.kind, OutcomeKind::Success);
    assert_eq!(outcome.detail, "exit code 0");
    let calls = std::fs::read_to_string(&log).unwrap();
    assert_eq!(calls.trim(), "--add --db OP7");
}

#[cfg(unix)]
#[tokio::test]
async fn test_mutation_exit_code_classification() {
    let dir = tempfile::tempdir().unwrap();
    let cases = [
        ("exit 0", OutcomeKind::Success),
        ("exit 1", OutcomeKind::TransientFailure),
        ("exit 64", OutcomeKind::PermanentFailure),
        ("exit 65", OutcomeKind::PermanentFailure),
        ("echo 'database locked' >&2; exit 3", OutcomeKind::TransientFailure),
        ("kill -9 $$", OutcomeKind::TransientFailure),
    ];

    for (index, (body, expected)) in cases.into_iter().enumerate() {
        let script = write_script(dir.path(), &format!("case{index}.sh"), body);
        let mutation = ProcessMutation::from_config(&shell_mutation(&script, 2_000));
        let outcome = mutation.run(&event()).await;
        assert_eq!(outcome.kind, expected, "script {body:?}: {}", outcome.detail);
    }
}

#[tokio::test]
async fn test_mutation_spawn_failure_is_transient() {
    let mut config = RelayConfig::default().mutation;
    config.program = "/nonexistent/scan-relay-db-tool".to_string();
    config.args.clear();

    let outcome = ProcessMutation::from_config(&config).run(&event()).await;
    assert_eq!(outcome.kind, OutcomeKind::TransientFailure);
    assert!(outcome.detail.starts_with("failed to spawn"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_executor_times_out_slow_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "slow.sh", "sleep 5");
    let server = MockHttpServer::start(&[], 200).await;

    let mut config = RelayConfig::default();
    config.notification.base_url = server.url.clone();
    config.mutation = shell_mutation(&script, 100);
    let executor = ActionExecutor::from_config(&config).unwrap();

    let started = std::time::Instant::now();
    let result = executor.execute(&event()).await;
    assert!(started.elapsed() < Duration::from_secs(3));

    assert_eq!(result.kind, OutcomeKind::TransientFailure);
    assert!(result.detail().contains("timed out after 100ms"), "{}", result.detail());
}

#[cfg(unix)]
#[tokio::test]
async fn test_executor_combines_real_actions() {
    let dir = tempfile::tempdir().unwrap();
    let ok = write_script(dir.path(), "ok.sh", "exit 0");
    let server = MockHttpServer::start(&[404], 200).await;

    let mut config = RelayConfig::default();
    config.notification.base_url = server.url.clone();
    config.mutation = shell_mutation(&ok, 2_000);
    let executor = ActionExecutor::from_config(&config).unwrap();

    let first = executor.execute(&event()).await;
    assert_eq!(first.kind, OutcomeKind::PermanentFailure);
    assert!(first.detail().contains("HTTP 404"));

    let second = executor.execute(&event()).await;
    assert!(second.is_success());
}

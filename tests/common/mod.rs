//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use scan_relay::config::MutationConfig;
use scan_relay::executor::{ActionOutcome, OutcomeKind, ScanAction};
use scan_relay::messaging::ScanEvent;

/// Action returning scripted outcomes, then `fallback` forever
pub struct ScriptedAction {
    name: &'static str,
    script: Mutex<VecDeque<OutcomeKind>>,
    fallback: OutcomeKind,
    calls: AtomicU64,
    seen: Mutex<Vec<String>>,
}

impl ScriptedAction {
    pub fn new(name: &'static str, script: &[OutcomeKind], fallback: OutcomeKind) -> Arc<Self> {
        Arc::new(Self {
            name,
            script: Mutex::new(script.iter().copied().collect()),
            fallback,
            calls: AtomicU64::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn always(name: &'static str, kind: OutcomeKind) -> Arc<Self> {
        Self::new(name, &[], kind)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Canonical events passed to `run`, in call order
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ScanAction for ScriptedAction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn run(&self, event: &ScanEvent) -> ActionOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(event.canonical());
        let kind = self.script.lock().pop_front().unwrap_or(self.fallback);
        match kind {
            OutcomeKind::Success => ActionOutcome::success(self.name, "scripted success"),
            OutcomeKind::TransientFailure => {
                ActionOutcome::transient(self.name, "scripted transient")
            }
            OutcomeKind::PermanentFailure => {
                ActionOutcome::permanent(self.name, "scripted permanent")
            }
        }
    }
}

/// Poll `condition` every 5ms until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Run `fut` with a test-friendly timeout
pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, fut)
        .await
        .expect("operation timed out")
}

/// Minimal HTTP/1.1 server answering each request with the next scripted status
pub struct MockHttpServer {
    pub url: String,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl MockHttpServer {
    /// Bind on an ephemeral port; after the script runs out every reply is `fallback`
    pub async fn start(script: &[u16], fallback: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let statuses = Arc::new(Mutex::new(script.iter().copied().collect::<VecDeque<_>>()));

        let recorded = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let recorded = Arc::clone(&recorded);
                let statuses = Arc::clone(&statuses);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut reader = BufReader::new(read_half);
                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).await.is_err() {
                        return;
                    }
                    // Drain headers
                    loop {
                        let mut line = String::new();
                        match reader.read_line(&mut line).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) if line == "\r\n" || line == "\n" => break,
                            Ok(_) => {}
                        }
                    }

                    let target = request_line
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or_default()
                        .to_string();
                    recorded.lock().push(target);

                    let status = statuses.lock().pop_front().unwrap_or(fallback);
                    let response = format!(
                        "HTTP/1.1 {status} Scripted\r\n\
                         content-length: 0\r\nconnection: close\r\n\r\n"
                    );
                    let _ = write_half.write_all(response.as_bytes()).await;
                    let _ = write_half.shutdown().await;
                });
            }
        });

        Self {
            url,
            requests,
            task,
        }
    }

    /// Request targets (path and query) received so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Write a shell script to be run as `/bin/sh <path> <args...>`
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("{body}\n")).unwrap();
    path
}

/// Mutation settings running `script` through `/bin/sh`
pub fn shell_mutation(script: &Path, timeout_ms: u64) -> MutationConfig {
    MutationConfig {
        program: "/bin/sh".to_string(),
        args: vec![script.display().to_string()],
        timeout_ms,
        permanent_exit_codes: vec![64, 65],
    }
}

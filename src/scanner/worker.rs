//! Out-of-process NLP worker host.
//!
//! The entity-recognition model lives in a separate OS process so that the
//! model load is amortised over the worker lifetime and a slow or hanging
//! analysis can never block the request-handling runtime. The host speaks a
//! length-prefixed JSON protocol over the worker's stdin/stdout:
//!
//! ```text
//! frame := u32 (big-endian payload length) ++ payload (JSON, UTF-8)
//! → {"op":"init","entities":["CREDIT_CARD",…]}
//! ← {"ok":true}
//! → {"op":"scan","text":"…"}
//! ← {"ok":true,"entities":[{"entity_type":"US_SSN","start":4,"end":15,"score":0.85}]}
//! → {"op":"shutdown"}
//! ```
//!
//! The worker is single-concurrency: a mutex around the pipe pair funnels
//! every submission through one in-flight request, matching the one-request
//! capacity of the analyzer process. Scale by adding worker processes, never
//! by threading inside one.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// Upper bound on a single response frame. A scan response is a list of
/// entity spans — anything larger means a corrupted length prefix.
const MAX_FRAME_BYTES: u32 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The initializer has not completed; the safe-scan gate maps this to
    /// `SCANNER_ERROR`.
    #[error("NLP worker not initialized")]
    NotInitialized,

    #[error("worker i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker protocol violation: {0}")]
    Protocol(String),

    #[error("worker error: {0}")]
    Remote(String),
}

/// One detected entity. Plain data — it crosses the process boundary as JSON
/// and carries no analyzer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: String,
    pub start: usize,
    pub end: usize,
    pub score: f64,
}

/// The entity-detection seam the scan pipeline depends on. The production
/// implementation is [`NlpWorker`]; tests substitute scripted scanners.
#[async_trait]
pub trait EntityScanner: Send + Sync {
    async fn scan(&self, text: &str) -> Result<Vec<EntityRecord>, WorkerError>;
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum WorkerRequest<'a> {
    Init { entities: &'a [String] },
    Scan { text: &'a str },
    Shutdown,
}

#[derive(Debug, Deserialize)]
struct WorkerResponse {
    ok: bool,
    #[serde(default)]
    entities: Vec<EntityRecord>,
    #[serde(default)]
    error: Option<String>,
}

struct WorkerIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    child: Child,
}

/// Host handle for one worker process.
pub struct NlpWorker {
    io: Mutex<WorkerIo>,
    initialized: AtomicBool,
}

impl NlpWorker {
    /// Spawn the worker subprocess. The command comes from configuration
    /// (`scanner.worker_cmd`); stderr is inherited so worker logs land in
    /// the proxy's log stream.
    pub fn spawn(cmd: &[String]) -> Result<Self, WorkerError> {
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| WorkerError::Protocol("empty worker command".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Protocol("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Protocol("worker stdout unavailable".into()))?;

        Ok(Self {
            io: Mutex::new(WorkerIo {
                stdin,
                stdout: BufReader::new(stdout),
                child,
            }),
            initialized: AtomicBool::new(false),
        })
    }

    /// Initialize the worker: loads the language model, builds the
    /// recognizer registry (US-only phone detection) and runs its internal
    /// warmup. Called exactly once per worker process.
    pub async fn init(&self, entities: &[String]) -> Result<(), WorkerError> {
        let response = self
            .roundtrip(&WorkerRequest::Init { entities })
            .await?;
        if !response.ok {
            return Err(WorkerError::Remote(
                response.error.unwrap_or_else(|| "init failed".into()),
            ));
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Scan text for entities. Fails with `NotInitialized` until `init`
    /// has completed — the caller maps that to `SCANNER_ERROR`.
    pub async fn scan(&self, text: &str) -> Result<Vec<EntityRecord>, WorkerError> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(WorkerError::NotInitialized);
        }
        let response = self.roundtrip(&WorkerRequest::Scan { text }).await?;
        if !response.ok {
            return Err(WorkerError::Remote(
                response.error.unwrap_or_else(|| "scan failed".into()),
            ));
        }
        Ok(response.entities)
    }

    /// Graceful shutdown: ask the worker to exit, then wait for it.
    pub async fn shutdown(&self) {
        let mut io = self.io.lock().await;
        if let Ok(frame) = serde_json::to_vec(&WorkerRequest::Shutdown) {
            let _ = write_frame(&mut io.stdin, &frame).await;
        }
        let _ = io.stdin.shutdown().await;
        match tokio::time::timeout(std::time::Duration::from_secs(5), io.child.wait()).await {
            Ok(Ok(status)) => tracing::info!(?status, "NLP worker exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "NLP worker wait failed"),
            Err(_) => {
                tracing::warn!("NLP worker did not exit in time — killing");
                let _ = io.child.kill().await;
            }
        }
    }

    async fn roundtrip(&self, request: &WorkerRequest<'_>) -> Result<WorkerResponse, WorkerError> {
        let frame = serde_json::to_vec(request)
            .map_err(|e| WorkerError::Protocol(format!("encode: {e}")))?;

        let mut io = self.io.lock().await;
        write_frame(&mut io.stdin, &frame).await?;
        let payload = read_frame(&mut io.stdout).await?;
        serde_json::from_slice(&payload).map_err(|e| WorkerError::Protocol(format!("decode: {e}")))
    }
}

#[async_trait]
impl EntityScanner for NlpWorker {
    async fn scan(&self, text: &str) -> Result<Vec<EntityRecord>, WorkerError> {
        NlpWorker::scan(self, text).await
    }
}

async fn write_frame(stdin: &mut ChildStdin, payload: &[u8]) -> Result<(), WorkerError> {
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| WorkerError::Protocol("frame too large".into()))?;
    stdin.write_u32(len).await?;
    stdin.write_all(payload).await?;
    stdin.flush().await?;
    Ok(())
}

async fn read_frame(stdout: &mut BufReader<ChildStdout>) -> Result<Vec<u8>, WorkerError> {
    let len = stdout.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(WorkerError::Protocol(format!(
            "frame length {len} exceeds limit"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    stdout.read_exact(&mut payload).await?;
    Ok(payload)
}

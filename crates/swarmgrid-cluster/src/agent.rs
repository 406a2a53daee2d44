//! Worker agent: announces this host to the manager.
//!
//! The agent POSTs a [`JoinRequest`] to the manager's `/join` endpoint.
//! Storage failures on the manager and transport errors are retried with
//! exponential backoff; a validation rejection is final.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use swarmgrid_api::handlers::JoinErrorBody;
use swarmgrid_api::{JoinAck, JoinRequest};
use swarmgrid_state::{ResourceInventory, WorkerIdentity};

/// Configuration for the worker agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// `host:port` of the manager API.
    pub manager_addr: String,
    /// Give up after this many attempts.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Per-attempt connect and response timeout.
    pub request_timeout: Duration,
}

impl AgentConfig {
    pub fn new(manager_addr: impl Into<String>) -> Self {
        Self {
            manager_addr: manager_addr.into(),
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Doubling delay, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max,
        }
    }

    /// Delay to wait now; the following one is doubled.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Outcome of a single failed attempt.
#[derive(Debug)]
enum AttemptError {
    /// The manager refused the request. Retrying will not help.
    Rejected(String),
    Retryable(String),
}

/// Joins this worker to the manager.
pub struct WorkerAgent {
    config: AgentConfig,
}

impl WorkerAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Announce `identity` with `inventory`, retrying until accepted.
    pub async fn join(
        &self,
        identity: &WorkerIdentity,
        inventory: &ResourceInventory,
    ) -> anyhow::Result<JoinAck> {
        info!(
            worker = %identity,
            manager = %self.config.manager_addr,
            cpus = inventory.cpu_count,
            gpus = inventory.gpus.len(),
            "joining manager"
        );
        self.submit(&JoinRequest::new(identity, inventory)).await
    }

    /// Submit a prepared request, retrying transient failures.
    pub async fn submit(&self, request: &JoinRequest) -> anyhow::Result<JoinAck> {
        let body = serde_json::to_vec(request)?;
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let attempts = self.config.max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.attempt(&body).await {
                Ok(ack) => {
                    info!(attempt, status = %ack.status, "joined manager");
                    return Ok(ack);
                }
                Err(AttemptError::Rejected(reason)) => {
                    anyhow::bail!("manager rejected join: {reason}");
                }
                Err(AttemptError::Retryable(reason)) if attempt < attempts => {
                    let delay = backoff.next_delay();
                    warn!(attempt, error = %reason, retry_in = ?delay, "join failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError::Retryable(reason)) => {
                    anyhow::bail!("join failed after {attempts} attempts: {reason}");
                }
            }
        }
        anyhow::bail!("join failed after {attempts} attempts")
    }

    async fn attempt(&self, body: &[u8]) -> Result<JoinAck, AttemptError> {
        let timeout = self.config.request_timeout;
        let (status, bytes) = tokio::time::timeout(timeout, self.post_join(body))
            .await
            .map_err(|_| AttemptError::Retryable(format!("timed out after {timeout:?}")))??;
        debug!(%status, "join response");

        if status.is_success() {
            return serde_json::from_slice::<JoinAck>(&bytes)
                .map_err(|e| AttemptError::Retryable(format!("bad join ack: {e}")));
        }

        let detail = serde_json::from_slice::<JoinErrorBody>(&bytes)
            .map(|b| {
                if b.fields.is_empty() {
                    format!("{}: {}", b.error_kind, b.detail)
                } else {
                    let fields: Vec<&str> = b.fields.iter().map(|f| f.field.as_str()).collect();
                    format!("{}: {} [{}]", b.error_kind, b.detail, fields.join(", "))
                }
            })
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).to_string());

        if status.is_server_error() {
            Err(AttemptError::Retryable(format!("{status}: {detail}")))
        } else {
            Err(AttemptError::Rejected(format!("{status}: {detail}")))
        }
    }

    async fn post_join(&self, body: &[u8]) -> Result<(http::StatusCode, Bytes), AttemptError> {
        let stream = TcpStream::connect(&self.config.manager_addr)
            .await
            .map_err(|e| AttemptError::Retryable(format!("connect {}: {e}", self.config.manager_addr)))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| AttemptError::Retryable(e.to_string()))?;

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("POST")
            .uri("/join")
            .header("host", self.config.manager_addr.as_str())
            .header("content-type", "application/json")
            .header("user-agent", "swarmgrid-worker/0.1")
            .body(Full::new(Bytes::copy_from_slice(body)))
            .map_err(|e| AttemptError::Retryable(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| AttemptError::Retryable(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| AttemptError::Retryable(e.to_string()))?
            .to_bytes();
        Ok((status, bytes))
    }
}

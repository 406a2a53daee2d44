//! Docker Engine API client, the orchestrator side of SwarmGrid.
//!
//! Talks HTTP/1.1 over the engine's unix socket. Each call opens its own
//! connection; the event stream keeps its connection for as long as the
//! subscription lives.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use swarmgrid_api::{BoxFuture, JoinToken, JoinTokenSource, TokenRole};

use crate::event::{EventSubscription, LifecycleEvent};

/// Default location of the Docker Engine socket.
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// `filters={"type":["node"]}`, URL-encoded.
const NODE_EVENTS_PATH: &str = "/events?filters=%7B%22type%22%3A%5B%22node%22%5D%7D";

/// Errors talking to the Docker Engine.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("cannot reach docker at {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http error: {0}")]
    Http(String),

    #[error("docker api returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected docker response: {0}")]
    Decode(String),

    #[error("this engine is not part of a swarm")]
    NotInSwarm,
}

impl DockerError {
    /// Whether a swarm join failed only because the engine already joined.
    pub fn is_already_in_swarm(&self) -> bool {
        matches!(self, DockerError::Api { message, .. } if message.contains("already part of a swarm"))
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct SwarmInspect {
    #[serde(rename = "JoinTokens")]
    join_tokens: JoinTokens,
}

#[derive(Debug, Deserialize)]
struct JoinTokens {
    #[serde(rename = "Worker")]
    worker: String,
    #[serde(rename = "Manager")]
    manager: String,
}

#[derive(Debug, Deserialize)]
struct SystemInfo {
    #[serde(rename = "Swarm", default)]
    swarm: Option<SwarmLocal>,
}

#[derive(Debug, Deserialize)]
struct SwarmLocal {
    #[serde(rename = "NodeID", default)]
    node_id: String,
}

/// Client for the local Docker Engine.
#[derive(Debug, Clone)]
pub struct DockerClient {
    socket: PathBuf,
}

impl Default for DockerClient {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET)
    }
}

impl DockerClient {
    pub fn new(socket: impl AsRef<Path>) -> Self {
        Self {
            socket: socket.as_ref().to_path_buf(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send one request on a fresh connection.
    async fn send(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<http::Response<Incoming>, DockerError> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|source| DockerError::Connect {
                path: self.socket.display().to_string(),
                source,
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "docker connection closed with error");
            }
        });

        let payload = match &body {
            Some(value) => Bytes::from(
                serde_json::to_vec(value).map_err(|e| DockerError::Decode(e.to_string()))?,
            ),
            None => Bytes::new(),
        };

        let req = http::Request::builder()
            .method(method)
            .uri(path)
            .header("host", "docker")
            .header("user-agent", "swarmgrid/0.1")
            .header("content-type", "application/json")
            .body(Full::new(payload))
            .map_err(|e| DockerError::Http(e.to_string()))?;

        sender
            .send_request(req)
            .await
            .map_err(|e| DockerError::Http(e.to_string()))
    }

    /// Send a request and read the whole response body, failing on non-2xx.
    async fn call(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Bytes, DockerError> {
        let resp = self.send(method, path, body).await?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| DockerError::Http(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            let message = serde_json::from_slice::<ApiMessage>(&bytes)
                .map(|m| m.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).to_string());
            return Err(DockerError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(bytes)
    }

    // ── Swarm bootstrap ────────────────────────────────────────────

    /// Current worker and manager join tokens of the swarm this engine manages.
    pub async fn join_tokens(&self) -> Result<(JoinToken, JoinToken), DockerError> {
        let bytes = self.call("GET", "/swarm", None).await?;
        let inspect: SwarmInspect =
            serde_json::from_slice(&bytes).map_err(|e| DockerError::Decode(e.to_string()))?;
        Ok((
            JoinToken {
                role: TokenRole::Worker,
                token: inspect.join_tokens.worker,
            },
            JoinToken {
                role: TokenRole::Manager,
                token: inspect.join_tokens.manager,
            },
        ))
    }

    /// Swarm node id of this engine.
    pub async fn local_node_id(&self) -> Result<String, DockerError> {
        let bytes = self.call("GET", "/info", None).await?;
        let info: SystemInfo =
            serde_json::from_slice(&bytes).map_err(|e| DockerError::Decode(e.to_string()))?;
        match info.swarm {
            Some(swarm) if !swarm.node_id.is_empty() => Ok(swarm.node_id),
            _ => Err(DockerError::NotInSwarm),
        }
    }

    /// Join this engine to the swarm managed at `remote_addr`.
    pub async fn swarm_join(&self, remote_addr: &str, token: &str) -> Result<(), DockerError> {
        let body = serde_json::json!({
            "ListenAddr": "0.0.0.0:2377",
            "RemoteAddrs": [remote_addr],
            "JoinToken": token,
        });
        self.call("POST", "/swarm/join", Some(body)).await?;
        info!(%remote_addr, "joined swarm");
        Ok(())
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Subscribe to node lifecycle events.
    ///
    /// Only events emitted after the call are delivered. The stream ends
    /// when the engine closes the connection or the subscription is closed.
    pub async fn subscribe_node_events(
        &self,
        buffer: usize,
    ) -> Result<EventSubscription, DockerError> {
        let resp = self.send("GET", NODE_EVENTS_PATH, None).await?;
        if !resp.status().is_success() {
            return Err(DockerError::Api {
                status: resp.status().as_u16(),
                message: "event subscription refused".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(buffer);
        let producer = tokio::spawn(async move {
            let mut body = resp.into_body();
            let mut pending: Vec<u8> = Vec::new();

            while let Some(frame) = body.frame().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "docker event stream failed");
                        return;
                    }
                };
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                pending.extend_from_slice(&data);

                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let line = line.trim_ascii();
                    if line.is_empty() {
                        continue;
                    }
                    match LifecycleEvent::from_docker_line(line) {
                        Ok(Some(event)) => {
                            if tx.send(event).await.is_err() {
                                // Subscriber went away.
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "skipping unparsable docker event"),
                    }
                }
            }
            debug!("docker event stream ended");
        });

        info!(socket = ?self.socket, "subscribed to docker node events");
        Ok(EventSubscription::new(rx, producer))
    }
}

impl JoinTokenSource for DockerClient {
    fn join_token(&self, role: TokenRole) -> BoxFuture<'_, Result<JoinToken, String>> {
        Box::pin(async move {
            let (worker, manager) = self.join_tokens().await.map_err(|e| e.to_string())?;
            Ok(match role {
                TokenRole::Worker => worker,
                TokenRole::Manager => manager,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_socket() -> DockerClient {
        DockerClient::new("/nonexistent/swarmgrid-test.sock")
    }

    #[tokio::test]
    async fn unreachable_engine_is_connect_error() {
        let err = missing_socket().local_node_id().await.unwrap_err();
        assert!(matches!(err, DockerError::Connect { .. }));
    }

    #[tokio::test]
    async fn subscribe_fails_without_engine() {
        assert!(missing_socket().subscribe_node_events(8).await.is_err());
    }

    #[tokio::test]
    async fn token_source_reports_errors_as_strings() {
        let client = missing_socket();
        let err = client.join_token(TokenRole::Worker).await.unwrap_err();
        assert!(err.contains("cannot reach docker"));
    }

    #[test]
    fn already_in_swarm_detection() {
        let err = DockerError::Api {
            status: 503,
            message: "This node is already part of a swarm. Use \"docker swarm leave\" to leave this swarm and join another one.".to_string(),
        };
        assert!(err.is_already_in_swarm());
        assert!(!DockerError::NotInSwarm.is_already_in_swarm());
    }

    #[test]
    fn decodes_swarm_inspect() {
        let json = br#"{"ID":"abc","JoinTokens":{"Worker":"SWMTKN-1-w","Manager":"SWMTKN-1-m"}}"#;
        let inspect: SwarmInspect = serde_json::from_slice(json).unwrap();
        assert_eq!(inspect.join_tokens.worker, "SWMTKN-1-w");
        assert_eq!(inspect.join_tokens.manager, "SWMTKN-1-m");
    }

    #[test]
    fn decodes_node_id_from_info() {
        let json = br#"{"Name":"w1","Swarm":{"NodeID":"n1","LocalNodeState":"active"}}"#;
        let info: SystemInfo = serde_json::from_slice(json).unwrap();
        assert_eq!(info.swarm.unwrap().node_id, "n1");
    }
}

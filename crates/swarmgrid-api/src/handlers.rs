//! REST API handlers.
//!
//! `POST /join` speaks the worker join protocol (`{status}` on success,
//! `{error_kind, detail}` on failure, including bodies that do not decode).
//! The read-only endpoints wrap their payload in [`ApiResponse`].

use std::net::SocketAddr;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{Extensions, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use swarmgrid_state::*;
use tracing::warn;

use crate::join::{FieldError, JoinError, JoinRequest};
use crate::tokens::TokenRole;
use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Error body of the join protocol.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct JoinErrorBody {
    pub error_kind: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}

impl IntoResponse for JoinError {
    fn into_response(self) -> Response {
        let (status, error_kind) = match &self {
            JoinError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            JoinError::Registry(StateError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            JoinError::Registry(StateError::Storage(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "storage_error")
            }
        };
        let detail = self.to_string();
        let fields = match self {
            JoinError::Validation(fields) => fields,
            JoinError::Registry(_) => Vec::new(),
        };
        (
            status,
            Json(JoinErrorBody {
                error_kind: error_kind.to_string(),
                detail,
                fields,
            }),
        )
            .into_response()
    }
}

/// A join body axum could not decode. Reported with axum's status
/// (`400` bad JSON, `415` wrong content type, `422` missing or mistyped
/// field) but in the join protocol's error shape.
fn rejected_join(rejection: JsonRejection) -> Response {
    let detail = rejection.body_text();
    warn!(status = %rejection.status(), %detail, "join body rejected");
    let fields = rejected_field(&detail).into_iter().collect();
    (
        rejection.status(),
        Json(JoinErrorBody {
            error_kind: "validation_error".to_string(),
            detail,
            fields,
        }),
    )
        .into_response()
}

/// Pull the offending field out of a serde decode message such as
/// "missing field `cpu_count`" or "ram_bytes: invalid value: ...".
fn rejected_field(detail: &str) -> Option<FieldError> {
    let cause = detail
        .split_once("target type: ")
        .map_or(detail, |(_, cause)| cause);

    if let Some((parent, rest)) = cause.split_once("missing field `") {
        let name = rest.split('`').next()?;
        let parent = parent.trim_end().trim_end_matches(':');
        let field = if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}.{name}")
        };
        return Some(FieldError {
            field,
            reason: "is required".to_string(),
        });
    }

    let (path, reason) = cause.split_once(": ")?;
    if path.is_empty() || path.contains(' ') {
        return None;
    }
    Some(FieldError {
        field: path.to_string(),
        reason: reason.to_string(),
    })
}

// ── Join ───────────────────────────────────────────────────────

/// POST /join
pub async fn join(
    State(state): State<ApiState>,
    extensions: Extensions,
    payload: Result<Json<JoinRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => return rejected_join(rejection),
    };
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    match state.join.join(req, peer).await {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Workers ────────────────────────────────────────────────────

/// GET /workers
pub async fn list_workers(State(state): State<ApiState>) -> impl IntoResponse {
    let registry = state.registry.clone();
    match tokio::task::spawn_blocking(move || registry.list_active()).await {
        Ok(Ok(workers)) => ApiResponse::ok(workers).into_response(),
        Ok(Err(e)) => error_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /workers/:hostname
pub async fn get_worker(
    State(state): State<ApiState>,
    Path(hostname): Path<String>,
) -> impl IntoResponse {
    let registry = state.registry.clone();
    let host = hostname.clone();
    match tokio::task::spawn_blocking(move || registry.records_for_hostname(&host)).await {
        Ok(Ok(records)) if records.is_empty() => {
            error_response(&format!("worker {hostname} not found"), StatusCode::NOT_FOUND)
                .into_response()
        }
        Ok(Ok(records)) => ApiResponse::ok(records).into_response(),
        Ok(Err(e)) => error_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Join tokens ────────────────────────────────────────────────

/// GET /join-token/:role
pub async fn join_token(
    State(state): State<ApiState>,
    Path(role): Path<String>,
) -> impl IntoResponse {
    let role: TokenRole = match role.parse() {
        Ok(role) => role,
        Err(e) => return error_response(&e, StatusCode::NOT_FOUND).into_response(),
    };
    let Some(tokens) = state.tokens.as_ref() else {
        return error_response("no orchestrator configured", StatusCode::SERVICE_UNAVAILABLE)
            .into_response();
    };
    match tokens.join_token(role).await {
        Ok(token) => ApiResponse::ok(token).into_response(),
        Err(e) => error_response(&e, StatusCode::SERVICE_UNAVAILABLE).into_response(),
    }
}

// ── Liveness ───────────────────────────────────────────────────

/// GET /healthz, POST /ready
pub async fn ready() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ready" }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::join::{IdentityClaim, JoinService};
    use crate::tokens::{BoxFuture, JoinToken, JoinTokenSource};

    struct StaticTokens;

    impl JoinTokenSource for StaticTokens {
        fn join_token(&self, role: TokenRole) -> BoxFuture<'_, Result<JoinToken, String>> {
            Box::pin(async move {
                Ok(JoinToken {
                    role,
                    token: "SWMTKN-1-test".to_string(),
                })
            })
        }
    }

    fn test_state() -> ApiState {
        let registry = WorkerRegistry::open_in_memory().unwrap();
        ApiState {
            join: JoinService::new(registry.clone()),
            registry,
            tokens: Some(Arc::new(StaticTokens)),
        }
    }

    fn join_request(hostname: &str, cpu_count: i64) -> JoinRequest {
        JoinRequest {
            identity_claim: IdentityClaim {
                hostname: hostname.to_string(),
                node_id: "n1".to_string(),
            },
            cpu_count,
            ram_bytes: 1024,
            gpu_ids: vec![],
            gpus: vec![],
            nfs_root: None,
            host: None,
        }
    }

    #[tokio::test]
    async fn join_ok() {
        let state = test_state();
        let resp = join(State(state), Extensions::new(), Ok(Json(join_request("w1", 4)))).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn join_validation_is_422() {
        let state = test_state();
        let resp = join(State(state), Extensions::new(), Ok(Json(join_request("w1", 0)))).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn join_records_peer_address() {
        let state = test_state();
        let mut ext = Extensions::new();
        ext.insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 40000))));
        join(State(state.clone()), ext, Ok(Json(join_request("w1", 4)))).await;

        let record = state
            .registry
            .get(&WorkerIdentity::new("w1", "n1"))
            .unwrap()
            .unwrap();
        assert_eq!(record.external_addr.as_deref(), Some("10.1.2.3"));
    }

    async fn post_raw(body: &str) -> (StatusCode, JoinErrorBody) {
        use tower::ServiceExt;

        let registry = WorkerRegistry::open_in_memory().unwrap();
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/join")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap();
        let resp = crate::build_router(registry, None).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn undecodable_bodies_use_the_join_error_shape() {
        let (status, body) = post_raw(r#"{"identity_claim":{"hostname":"w1","node_id":"n1"},"ram_bytes":1}"#).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.error_kind, "validation_error");
        assert_eq!(body.fields[0].field, "cpu_count");

        let (status, body) = post_raw(
            r#"{"identity_claim":{"hostname":"w1","node_id":"n1"},"cpu_count":2,"ram_bytes":-5}"#,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.fields[0].field, "ram_bytes");

        let (status, body) = post_raw("{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error_kind, "validation_error");
        assert!(body.fields.is_empty());
    }

    #[test]
    fn rejected_field_reads_serde_messages() {
        let missing = "Failed to deserialize the JSON body into the target type: missing field `cpu_count` at line 1 column 60";
        assert_eq!(rejected_field(missing).unwrap().field, "cpu_count");

        let mistyped = "Failed to deserialize the JSON body into the target type: gpu_ids[0]: invalid type: integer `3`, expected a string at line 1 column 9";
        let field = rejected_field(mistyped).unwrap();
        assert_eq!(field.field, "gpu_ids[0]");
        assert!(field.reason.starts_with("invalid type"));

        assert!(rejected_field("Failed to parse the request body as JSON: EOF").is_none());
    }

    #[test]
    fn storage_error_maps_to_503() {
        let resp = JoinError::Registry(StateError::Storage("disk gone".into())).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn list_workers_empty() {
        let resp = list_workers(State(test_state())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_unknown_worker_is_404() {
        let resp = get_worker(State(test_state()), Path("ghost".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn join_token_roles() {
        let state = test_state();
        let resp = join_token(State(state.clone()), Path("worker".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = join_token(State(state), Path("admin".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn join_token_without_orchestrator() {
        let mut state = test_state();
        state.tokens = None;
        let resp = join_token(State(state), Path("worker".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

//! swarmgrid-api: REST API of the SwarmGrid manager.
//!
//! Hosts the join service that workers call to announce themselves, plus
//! read-only views of the worker registry.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/join` | Register or refresh a worker |
//! | GET | `/workers` | List active workers |
//! | GET | `/workers/:hostname` | All records of a hostname |
//! | GET | `/join-token/:role` | Orchestrator join token (`worker`/`manager`) |
//! | GET | `/healthz` | Liveness |
//! | POST | `/ready` | Liveness |

pub mod handlers;
pub mod join;
pub mod tokens;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use swarmgrid_state::WorkerRegistry;

pub use join::{FieldError, IdentityClaim, JoinAck, JoinError, JoinRequest, JoinService};
pub use tokens::{BoxFuture, JoinToken, JoinTokenSource, TokenRole};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub join: JoinService,
    pub registry: WorkerRegistry,
    pub tokens: Option<Arc<dyn JoinTokenSource>>,
}

/// Build the manager API router.
pub fn build_router(registry: WorkerRegistry, tokens: Option<Arc<dyn JoinTokenSource>>) -> Router {
    let state = ApiState {
        join: JoinService::new(registry.clone()),
        registry,
        tokens,
    };

    Router::new()
        .route("/join", post(handlers::join))
        .route("/workers", get(handlers::list_workers))
        .route("/workers/{hostname}", get(handlers::get_worker))
        .route("/join-token/{role}", get(handlers::join_token))
        .route("/healthz", get(handlers::ready))
        .route("/ready", post(handlers::ready))
        .with_state(state)
}

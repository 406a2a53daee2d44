//! swarmgrid-cluster: keeps the worker registry in line with the swarm.
//!
//! # Architecture
//!
//! ```text
//! Manager
//!   ├── DockerClient (unix socket)
//!   │   ├── subscribe_node_events() → EventSubscription
//!   │   └── join tokens (JoinTokenSource for the API)
//!   └── Reconciler
//!       ├── MemberTracker (last applied state, for logs)
//!       ├── DuplicatePolicy (which stale node to remove)
//!       └── WorkerRegistry (injected)
//!
//! Worker
//!   └── WorkerAgent
//!       └── POST /join with backoff
//! ```

pub mod agent;
pub mod docker;
pub mod event;
pub mod policy;
pub mod reconciler;

pub use agent::{AgentConfig, Backoff, WorkerAgent};
pub use docker::{DockerClient, DockerError};
pub use event::{EventKind, EventSubscription, LifecycleEvent, NodeState};
pub use policy::{DuplicateContext, DuplicatePolicy, HostnameCountPolicy};
pub use reconciler::{
    DuplicateNode, MemberState, MemberTracker, Outcome, Reconciler, RunExit, SkipReason,
};

//! Join tokens issued by the cluster bootstrap layer.
//!
//! Tokens are opaque: they are fetched from the orchestrator and handed to
//! workers unmodified.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role a join token admits a node as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenRole {
    Worker,
    Manager,
}

impl FromStr for TokenRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(TokenRole::Worker),
            "manager" => Ok(TokenRole::Manager),
            other => Err(format!("unknown token role: {other}")),
        }
    }
}

/// An opaque orchestrator join credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinToken {
    pub role: TokenRole,
    pub token: String,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Something that can hand out join tokens (the orchestrator).
pub trait JoinTokenSource: Send + Sync {
    fn join_token(&self, role: TokenRole) -> BoxFuture<'_, Result<JoinToken, String>>;
}

mod consul;
mod memory;

use async_trait::async_trait;
pub use consul::ConsulRouter;
pub use memory::MemoryRouter;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uptermd_common::SessionId;
use uuid::Uuid;

pub type NodeAddr = String;

/// The value stored in the directory for a live session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRoute {
    pub node_addr: NodeAddr,
    pub ssh_user: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Proof of a successful publish; required to release the entry.
#[derive(Clone, Debug)]
pub struct RouteLease {
    pub session_id: SessionId,
    pub(crate) token: Uuid,
}

#[derive(thiserror::Error, Debug)]
pub enum RoutingError {
    #[error("session {0} is already published")]
    AlreadyExists(SessionId),
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("routing backend error: {0}")]
    Backend(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteEvent {
    Present(NodeAddr),
    Gone,
}

/// Stream of ownership changes for one session id.
pub struct RouteWatch {
    rx: mpsc::UnboundedReceiver<RouteEvent>,
}

impl RouteWatch {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<RouteEvent>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<RouteEvent> {
        self.rx.recv().await
    }
}

/// The cluster-wide session directory. At any instant at most one node
/// holds a given session id; a session exists here iff its owning
/// reverse connection is live.
#[async_trait]
pub trait SessionRouter: Send + Sync {
    /// Claim a session id for this node. Fails with `AlreadyExists` when
    /// the id is held by a different live owner.
    async fn publish(
        &self,
        session_id: &str,
        route: SessionRoute,
    ) -> Result<RouteLease, RoutingError>;

    async fn resolve(&self, session_id: &str) -> Result<SessionRoute, RoutingError>;

    /// Idempotent; releasing a dead or foreign lease is not an error.
    async fn release(&self, lease: &RouteLease) -> Result<(), RoutingError>;

    /// Observe ownership changes; the current state is delivered first.
    async fn watch(&self, session_id: &str) -> Result<RouteWatch, RoutingError>;
}

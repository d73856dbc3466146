//! Explicit request context.
//!
//! Every business call receives the acting identity as a parameter instead of
//! reading it from ambient per-thread state. The context travels with the
//! transaction and ends up in published event envelopes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::UserId;

/// Category of the actor issuing a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    System,
    Admin,
    User,
    Api,
}

/// Who is acting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    user_id: Option<UserId>,
    username: String,
    kind: ActorKind,
}

impl Actor {
    pub fn new(user_id: UserId, username: impl Into<String>, kind: ActorKind) -> Self {
        Self {
            user_id: Some(user_id),
            username: username.into(),
            kind,
        }
    }

    /// The background/system identity (scheduler sweeps, compensations).
    pub fn system() -> Self {
        Self {
            user_id: None,
            username: "system".to_string(),
            kind: ActorKind::System,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn kind(&self) -> ActorKind {
        self.kind
    }
}

/// Per-request context: actor plus a correlation id for log stitching.
///
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    actor: Actor,
    correlation_id: Uuid,
}

impl RequestContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            correlation_id: Uuid::now_v7(),
        }
    }

    pub fn with_correlation_id(actor: Actor, correlation_id: Uuid) -> Self {
        Self {
            actor,
            correlation_id,
        }
    }

    pub fn system() -> Self {
        Self::new(Actor::system())
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

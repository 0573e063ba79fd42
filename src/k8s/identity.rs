//! Who is asking. Mutations run as the calling actor so the target cluster's
//! own RBAC decides whether they are allowed.
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// An authenticated user of the API layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// Stable identifier used to look up group memberships
    pub id: String,
    /// Identity presented to clusters as `Impersonate-User`
    pub identity: String,
}

impl Actor {
    #[must_use]
    pub fn new(id: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            identity: identity.into(),
        }
    }
}

/// Per-request data handed to mutating calls
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    actor: Option<Actor>,
}

impl RequestContext {
    #[must_use]
    pub const fn with_actor(actor: Actor) -> Self {
        Self { actor: Some(actor) }
    }

    #[must_use]
    pub const fn anonymous() -> Self {
        Self { actor: None }
    }

    /// # Errors
    ///
    /// Returns `Error::Unauthenticated` when the request carries no actor
    pub fn actor(&self) -> Result<&Actor> {
        self.actor.as_ref().ok_or(Error::Unauthenticated)
    }
}

/// Resolves the groups an actor belongs to, for `Impersonate-Group`
#[async_trait]
pub trait GroupResolver: Send + Sync {
    async fn groups_for(&self, actor: &Actor) -> Result<Vec<String>>;
}

/// Fixed membership table keyed by actor id; unknown actors have no groups
#[derive(Debug, Clone, Default)]
pub struct StaticGroupResolver {
    groups: HashMap<String, Vec<String>>,
}

impl StaticGroupResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_member(mut self, actor_id: impl Into<String>, groups: &[&str]) -> Self {
        self.groups.insert(
            actor_id.into(),
            groups.iter().map(|g| (*g).to_string()).collect(),
        );
        self
    }
}

#[async_trait]
impl GroupResolver for StaticGroupResolver {
    async fn groups_for(&self, actor: &Actor) -> Result<Vec<String>> {
        Ok(self.groups.get(&actor.id).cloned().unwrap_or_default())
    }
}

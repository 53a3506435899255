//! Fixed actor directory.

use std::collections::HashMap;

use async_trait::async_trait;

use cbugg_core::{ActorInfo, ActorResolver, Error, Result};

/// [`ActorResolver`] backed by a map built at startup.
///
/// Addresses under an internal domain resolve as internal even when they are
/// not listed explicitly.
#[derive(Debug, Clone, Default)]
pub struct StaticActorResolver {
    actors: HashMap<String, ActorInfo>,
    internal_domain: Option<String>,
}

impl StaticActorResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actor(mut self, actor: ActorInfo) -> Self {
        self.insert(actor);
        self
    }

    /// Treat every `*@<domain>` address as internal.
    pub fn with_internal_domain(mut self, domain: impl Into<String>) -> Self {
        self.internal_domain = Some(domain.into());
        self
    }

    pub fn insert(&mut self, actor: ActorInfo) {
        self.actors.insert(actor.id.clone(), actor);
    }

    fn in_internal_domain(&self, id: &str) -> bool {
        match (&self.internal_domain, id.rsplit_once('@')) {
            (Some(domain), Some((_, host))) => host.eq_ignore_ascii_case(domain),
            _ => false,
        }
    }
}

#[async_trait]
impl ActorResolver for StaticActorResolver {
    async fn resolve(&self, id: &str) -> Result<ActorInfo> {
        if let Some(actor) = self.actors.get(id) {
            return Ok(actor.clone());
        }
        if self.in_internal_domain(id) {
            return Ok(ActorInfo::internal(id));
        }
        Err(Error::NotFound(format!("actor {id}")))
    }
}

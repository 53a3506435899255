//! Collaborator traits for cbugg.
//!
//! The engine talks to its document store, its outbound notification channel
//! and its user directory only through these interfaces, so backends can be
//! swapped and tests can substitute recording doubles.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::models::ActorInfo;

// =============================================================================
// DOCUMENT STORE
// =============================================================================

/// What a CAS transform wants done with the document it was shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasDecision {
    /// Replace the document with `value`. `companions` are extra documents
    /// written in the same commit; they are discarded if the attempt loses a
    /// race and the transform runs again.
    Write {
        value: Vec<u8>,
        companions: Vec<(String, Vec<u8>)>,
    },
    /// Leave the document untouched and stop retrying.
    Cancel,
}

impl CasDecision {
    /// Write `value` with no companion documents.
    pub fn write(value: Vec<u8>) -> Self {
        CasDecision::Write {
            value,
            companions: Vec::new(),
        }
    }
}

/// Terminal result of a CAS update that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Committed,
    Cancelled,
}

/// Transform run by [`DocumentStore::update`]. Receives the current bytes
/// (`None` if the key is absent) and may run more than once.
pub type CasTransform<'a> = dyn FnMut(Option<&[u8]>) -> Result<CasDecision> + Send + 'a;

/// Key/value document store over opaque byte blobs.
///
/// Writes to a single key are linearizable. `update` owns the retry loop:
/// callers never re-run a CAS themselves.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert only if the key is absent. Returns whether the insert happened.
    async fn add(&self, key: &str, value: Vec<u8>) -> Result<bool>;

    /// Unconditional write.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove a document. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All documents whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Compare-and-swap update.
    ///
    /// Reads the current value, runs `transform`, and commits only if the
    /// document did not change in between; otherwise the transform runs
    /// again against the fresh value. An `Err` from the transform aborts
    /// immediately and is returned unchanged.
    async fn update(&self, key: &str, transform: &mut CasTransform<'_>) -> Result<CasOutcome>;
}

// =============================================================================
// ACTOR RESOLUTION
// =============================================================================

/// Directory lookup for actor flags used by visibility checks.
#[async_trait]
pub trait ActorResolver: Send + Sync {
    /// Look an actor up.
    async fn resolve(&self, id: &str) -> Result<ActorInfo>;

    /// Look an actor up, treating any failure as an unprivileged actor.
    async fn resolve_or_default(&self, id: &str) -> ActorInfo {
        match self.resolve(id).await {
            Ok(actor) => actor,
            Err(e) => {
                tracing::debug!(actor = id, error = %e, "Actor lookup failed, treating as plain user");
                ActorInfo::user(id)
            }
        }
    }
}

// =============================================================================
// OUTBOUND NOTIFICATIONS
// =============================================================================

/// Message kinds the outbound channel knows how to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    Comment,
    Attachment,
    BugChanged,
    Assigned,
    TagAssigned,
    Ping,
}

impl Template {
    pub fn name(&self) -> &'static str {
        match self {
            Template::Comment => "comment",
            Template::Attachment => "attachment",
            Template::BugChanged => "bug_changed",
            Template::Assigned => "assigned",
            Template::TagAssigned => "tag_assigned",
            Template::Ping => "ping",
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outbound notification channel (mail, audit log).
///
/// Called from background tasks. Delivery failures are reported but never
/// retried by the engine.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(
        &self,
        template: Template,
        recipients: Vec<String>,
        context: JsonValue,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct FailingResolver;

    #[async_trait]
    impl ActorResolver for FailingResolver {
        async fn resolve(&self, id: &str) -> Result<ActorInfo> {
            Err(Error::NotFound(id.to_string()))
        }
    }

    #[tokio::test]
    async fn test_resolve_or_default_falls_back_to_plain_user() {
        let actor = FailingResolver.resolve_or_default("ghost@example.com").await;
        assert_eq!(actor.id, "ghost@example.com");
        assert!(!actor.internal);
        assert!(!actor.admin);
    }

    #[test]
    fn test_template_names() {
        assert_eq!(Template::BugChanged.name(), "bug_changed");
        assert_eq!(Template::TagAssigned.to_string(), "tag_assigned");
        assert_eq!(
            serde_json::to_string(&Template::Assigned).unwrap(),
            r#""assigned""#
        );
    }

    #[test]
    fn test_cas_write_has_no_companions() {
        assert_eq!(
            CasDecision::write(b"x".to_vec()),
            CasDecision::Write {
                value: b"x".to_vec(),
                companions: vec![],
            }
        );
    }
}

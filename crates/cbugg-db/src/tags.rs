//! Tag subscription repository.

use std::sync::Arc;

use tracing::info;

use cbugg_core::{
    tag_key, CasDecision, CasOutcome, Document, DocumentStore, Error, Result, Tag,
};

/// Repository for tag documents and who follows them.
#[derive(Clone)]
pub struct TagRepository {
    store: Arc<dyn DocumentStore>,
}

impl TagRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Fetch a tag, `None` if nobody has ever subscribed to it.
    pub async fn get(&self, name: &str) -> Result<Option<Tag>> {
        match self.store.get(&tag_key(name)).await? {
            Some(bytes) => decode_tag(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Addresses following `name`.
    pub async fn subscribers(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .get(name)
            .await?
            .map(|tag| tag.subscribers)
            .unwrap_or_default())
    }

    /// Follow a tag, creating its document on first use. Returns whether
    /// anything changed.
    pub async fn subscribe(&self, name: &str, actor: &str) -> Result<bool> {
        if name.is_empty() {
            return Err(Error::InvalidInput("empty tag name".to_string()));
        }
        let changed = self
            .update(name, |tag| {
                if tag.subscribers.iter().any(|s| s == actor) {
                    return false;
                }
                tag.subscribers.push(actor.to_string());
                true
            })
            .await?;
        if changed {
            info!(tag = name, actor, "Subscribed to tag");
        }
        Ok(changed)
    }

    /// Stop following a tag. Returns whether anything changed.
    pub async fn unsubscribe(&self, name: &str, actor: &str) -> Result<bool> {
        let changed = self
            .update(name, |tag| {
                let before = tag.subscribers.len();
                tag.subscribers.retain(|s| s != actor);
                tag.subscribers.len() != before
            })
            .await?;
        if changed {
            info!(tag = name, actor, "Unsubscribed from tag");
        }
        Ok(changed)
    }

    async fn update<F>(&self, name: &str, mut edit: F) -> Result<bool>
    where
        F: FnMut(&mut Tag) -> bool + Send,
    {
        let mut transform = |current: Option<&[u8]>| -> Result<CasDecision> {
            let mut tag = match current {
                Some(bytes) => decode_tag(bytes)?,
                None => Tag {
                    name: name.to_string(),
                    subscribers: Vec::new(),
                },
            };
            if !edit(&mut tag) {
                return Ok(CasDecision::Cancel);
            }
            Ok(CasDecision::write(Document::Tag(tag).encode()?))
        };
        let outcome = self.store.update(&tag_key(name), &mut transform).await?;
        Ok(outcome == CasOutcome::Committed)
    }
}

fn decode_tag(bytes: &[u8]) -> Result<Tag> {
    match Document::decode(bytes)? {
        Document::Tag(tag) => Ok(tag),
        other => Err(Error::Internal(format!(
            "expected tag document, found {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn test_subscribe_creates_tag() {
        let repo = TagRepository::new(Arc::new(MemoryStore::new()));
        assert!(repo.get("ui").await.unwrap().is_none());
        assert!(repo.subscribers("ui").await.unwrap().is_empty());

        assert!(repo.subscribe("ui", "a@example.com").await.unwrap());
        assert!(!repo.subscribe("ui", "a@example.com").await.unwrap());
        assert!(repo.subscribe("ui", "b@example.com").await.unwrap());

        let tag = repo.get("ui").await.unwrap().unwrap();
        assert_eq!(tag.name, "ui");
        assert_eq!(
            tag.subscribers,
            vec!["a@example.com".to_string(), "b@example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_tag_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let repo = TagRepository::new(store.clone());
        assert!(!repo.unsubscribe("ghost", "a@example.com").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_actor() {
        let repo = TagRepository::new(Arc::new(MemoryStore::new()));
        repo.subscribe("perf", "a@example.com").await.unwrap();
        assert!(repo.unsubscribe("perf", "a@example.com").await.unwrap());
        assert!(repo.subscribers("perf").await.unwrap().is_empty());
    }
}

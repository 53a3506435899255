//! Comment repository.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use cbugg_core::{
    comment_prefix, ActorInfo, CasDecision, Comment, Document, Error, PartiallyVisible, Result,
};

use crate::bugs::BugRepository;

/// Repository for comments on bugs.
#[derive(Clone)]
pub struct CommentRepository {
    bugs: BugRepository,
}

impl CommentRepository {
    pub fn new(bugs: BugRepository) -> Self {
        Self { bugs }
    }

    /// Add a comment to a bug `actor` can see.
    pub async fn create(
        &self,
        bug_id: &str,
        actor: &ActorInfo,
        text: &str,
        private: bool,
    ) -> Result<Comment> {
        self.bugs.get_for(bug_id, actor).await?;
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("empty comment".to_string()));
        }

        let comment = Comment {
            id: format!("{}{}", comment_prefix(bug_id), Uuid::now_v7()),
            bug_id: bug_id.to_string(),
            user: actor.id.clone(),
            text: text.to_string(),
            created_at: Utc::now(),
            private,
            deleted: false,
        };

        let stored = self
            .bugs
            .store()
            .add(&comment.id, Document::Comment(comment.clone()).encode()?)
            .await?;
        if !stored {
            return Err(Error::IdCollision(comment.id));
        }
        info!(bug_id, comment_id = %comment.id, actor = %actor.id, private, "Comment added");

        self.bugs.notifier().comment_created(comment.clone()).await;
        Ok(comment)
    }

    /// Comments on a bug that `viewer` may read, oldest first. Deleted
    /// comments are omitted.
    pub async fn list(&self, bug_id: &str, viewer: &ActorInfo) -> Result<Vec<Comment>> {
        self.bugs.get_for(bug_id, viewer).await?;

        let mut comments = Vec::new();
        for (key, bytes) in self.bugs.store().scan_prefix(&comment_prefix(bug_id)).await? {
            match Document::decode(&bytes) {
                Ok(Document::Comment(c)) if !c.deleted && c.is_visible_to(viewer) => {
                    comments.push(c)
                }
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable comment"),
            }
        }
        Ok(comments)
    }

    /// Mark a comment deleted or restore it. Only its author may do this.
    pub async fn set_deleted(
        &self,
        comment_id: &str,
        actor: &ActorInfo,
        deleted: bool,
    ) -> Result<Comment> {
        let comment = self
            .edit(comment_id, actor, |c| {
                let changed = c.deleted != deleted;
                c.deleted = deleted;
                Ok(changed)
            })
            .await?;
        info!(comment_id, actor = %actor.id, deleted, "Comment deletion flag set");
        Ok(comment)
    }

    /// Replace a comment's text. Only its author may do this.
    pub async fn update(&self, comment_id: &str, actor: &ActorInfo, text: &str) -> Result<Comment> {
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("empty comment".to_string()));
        }
        let comment = self
            .edit(comment_id, actor, |c| {
                let changed = c.text != text;
                c.text = text.to_string();
                Ok(changed)
            })
            .await?;
        info!(comment_id, actor = %actor.id, "Comment updated");
        Ok(comment)
    }

    /// Apply `edit` to a comment in one CAS round. `edit` reports whether it
    /// changed anything; an unchanged comment is not rewritten.
    async fn edit<F>(&self, comment_id: &str, actor: &ActorInfo, mut edit: F) -> Result<Comment>
    where
        F: FnMut(&mut Comment) -> Result<bool> + Send,
    {
        let mut last: Option<Comment> = None;
        let mut transform = |current: Option<&[u8]>| -> Result<CasDecision> {
            let bytes = current.ok_or_else(|| Error::NotFound(comment_id.to_string()))?;
            let mut comment = match Document::decode(bytes)? {
                Document::Comment(c) => c,
                _ => return Err(Error::NotFound(comment_id.to_string())),
            };
            if comment.user != actor.id {
                return Err(Error::Forbidden(format!(
                    "{} is not the author of {comment_id}",
                    actor.id
                )));
            }

            let decision = if edit(&mut comment)? {
                CasDecision::write(Document::Comment(comment.clone()).encode()?)
            } else {
                CasDecision::Cancel
            };
            last = Some(comment);
            Ok(decision)
        };

        self.bugs.store().update(comment_id, &mut transform).await?;
        last.ok_or_else(|| Error::Internal(format!("update of {comment_id} ran no transform")))
    }
}

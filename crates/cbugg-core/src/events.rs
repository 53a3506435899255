//! Change events and the typed channels that carry them to the dispatch loop.
//!
//! Writers hold a cheap, cloneable [`Notifier`]; the dispatch loop owns the
//! matching [`NotificationReceivers`]. Every payload kind has its own bounded
//! channel so the loop can multiplex them with a single `select!`.

use std::collections::BTreeSet;

use tokio::sync::mpsc;
use tracing::warn;

use crate::models::{Attachment, BugField, Comment, Ping};

/// One committed mutation, or an exclusion marker, for a single bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub bug_id: String,
    /// Who made the change. `None` for pure exclusion markers.
    pub actor: Option<String>,
    /// Fields touched. Empty for bug creation and exclusion markers.
    pub fields: BTreeSet<String>,
    /// Address to leave out of the generic notification for this burst.
    pub except: Option<String>,
}

impl ChangeEvent {
    /// A committed change of `field` by `actor`.
    pub fn changed(bug_id: impl Into<String>, field: BugField, actor: impl Into<String>) -> Self {
        Self {
            bug_id: bug_id.into(),
            actor: Some(actor.into()),
            fields: BTreeSet::from([field.as_str().to_string()]),
            except: None,
        }
    }

    /// The bug was just filed by `actor`.
    pub fn created(bug_id: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            bug_id: bug_id.into(),
            actor: Some(actor.into()),
            fields: BTreeSet::new(),
            except: None,
        }
    }

    /// Keep `who` out of the generic notification for the current burst.
    pub fn except(bug_id: impl Into<String>, who: impl Into<String>) -> Self {
        Self {
            bug_id: bug_id.into(),
            actor: None,
            fields: BTreeSet::new(),
            except: Some(who.into()),
        }
    }

    /// Markers only steer the debouncer and have no live representation.
    pub fn is_exception_marker(&self) -> bool {
        self.actor.is_none() && self.fields.is_empty()
    }
}

/// A bug was handed to a new owner by someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub bug_id: String,
    pub owner: String,
    pub actor: String,
}

/// A tag was newly applied to a bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagAssignment {
    pub bug_id: String,
    pub tag: String,
    pub actor: String,
}

/// Sending half of the notification channels.
#[derive(Debug, Clone)]
pub struct Notifier {
    comments: mpsc::Sender<Comment>,
    attachments: mpsc::Sender<Attachment>,
    assignments: mpsc::Sender<Assignment>,
    changes: mpsc::Sender<ChangeEvent>,
    tags: mpsc::Sender<TagAssignment>,
    pings: mpsc::Sender<Ping>,
}

/// Receiving half of the notification channels, consumed by the dispatch loop.
#[derive(Debug)]
pub struct NotificationReceivers {
    pub comments: mpsc::Receiver<Comment>,
    pub attachments: mpsc::Receiver<Attachment>,
    pub assignments: mpsc::Receiver<Assignment>,
    pub changes: mpsc::Receiver<ChangeEvent>,
    pub tags: mpsc::Receiver<TagAssignment>,
    pub pings: mpsc::Receiver<Ping>,
}

/// Create the typed notification channels, each buffered to `capacity`.
pub fn notification_channels(capacity: usize) -> (Notifier, NotificationReceivers) {
    let capacity = capacity.max(1);
    let (comments_tx, comments_rx) = mpsc::channel(capacity);
    let (attachments_tx, attachments_rx) = mpsc::channel(capacity);
    let (assignments_tx, assignments_rx) = mpsc::channel(capacity);
    let (changes_tx, changes_rx) = mpsc::channel(capacity);
    let (tags_tx, tags_rx) = mpsc::channel(capacity);
    let (pings_tx, pings_rx) = mpsc::channel(capacity);

    (
        Notifier {
            comments: comments_tx,
            attachments: attachments_tx,
            assignments: assignments_tx,
            changes: changes_tx,
            tags: tags_tx,
            pings: pings_tx,
        },
        NotificationReceivers {
            comments: comments_rx,
            attachments: attachments_rx,
            assignments: assignments_rx,
            changes: changes_rx,
            tags: tags_rx,
            pings: pings_rx,
        },
    )
}

async fn deliver<T>(tx: &mpsc::Sender<T>, item: T, kind: &'static str) {
    if tx.send(item).await.is_err() {
        warn!(kind, "Notification dispatcher is gone, dropping event");
    }
}

impl Notifier {
    pub async fn comment_created(&self, comment: Comment) {
        deliver(&self.comments, comment, "comment").await;
    }

    pub async fn attachment_created(&self, attachment: Attachment) {
        deliver(&self.attachments, attachment, "attachment").await;
    }

    pub async fn bug_changed(&self, event: ChangeEvent) {
        deliver(&self.changes, event, "bug_change").await;
    }

    /// Announce an assignment and keep the new owner out of the generic
    /// change mail for this burst; they get the dedicated message instead.
    pub async fn bug_assigned(&self, bug_id: &str, owner: &str, actor: &str) {
        deliver(
            &self.assignments,
            Assignment {
                bug_id: bug_id.to_string(),
                owner: owner.to_string(),
                actor: actor.to_string(),
            },
            "assignment",
        )
        .await;
        deliver(&self.changes, ChangeEvent::except(bug_id, owner), "bug_change").await;
    }

    pub async fn tag_assigned(&self, bug_id: &str, tag: &str, actor: &str) {
        deliver(
            &self.tags,
            TagAssignment {
                bug_id: bug_id.to_string(),
                tag: tag.to_string(),
                actor: actor.to_string(),
            },
            "tag",
        )
        .await;
    }

    pub async fn bug_pinged(&self, ping: Ping) {
        deliver(&self.pings, ping, "ping").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_event_constructors() {
        let changed = ChangeEvent::changed("bug-1", BugField::Status, "a@x");
        assert_eq!(changed.actor.as_deref(), Some("a@x"));
        assert!(changed.fields.contains("status"));
        assert!(!changed.is_exception_marker());

        let created = ChangeEvent::created("bug-1", "a@x");
        assert!(created.fields.is_empty());
        assert!(!created.is_exception_marker());

        let except = ChangeEvent::except("bug-1", "b@x");
        assert!(except.is_exception_marker());
        assert_eq!(except.except.as_deref(), Some("b@x"));
    }

    #[tokio::test]
    async fn test_assignment_sends_assignment_then_exception() {
        let (notifier, mut rx) = notification_channels(8);
        notifier.bug_assigned("bug-4", "b@x", "a@x").await;

        let assignment = rx.assignments.recv().await.unwrap();
        assert_eq!(assignment.owner, "b@x");
        assert_eq!(assignment.actor, "a@x");

        let marker = rx.changes.recv().await.unwrap();
        assert_eq!(marker, ChangeEvent::except("bug-4", "b@x"));
    }

    #[tokio::test]
    async fn test_send_after_dispatcher_dropped_does_not_panic() {
        let (notifier, rx) = notification_channels(1);
        drop(rx);
        notifier
            .bug_changed(ChangeEvent::changed("bug-1", BugField::Title, "a@x"))
            .await;
        notifier.tag_assigned("bug-1", "ui", "a@x").await;
    }
}

//! Live events and their per-viewer rendering.
//!
//! The hub fans out [`LiveEvent`]s, which carry full bug snapshots. Each
//! connection turns them into [`ChangeNotification`]s for its own viewer,
//! which drops anything that viewer may not see and never exposes raw
//! addresses.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use cbugg_core::{ActorInfo, ActorView, Bug, BugView, Comment, PartiallyVisible, Ping};

/// Something that happened to a bug, as seen by the live feed.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    BugChanged {
        id: Uuid,
        bug: Bug,
        actor: String,
        /// Empty when the bug was just created.
        fields: Vec<String>,
        at: DateTime<Utc>,
    },
    Comment {
        id: Uuid,
        bug: Bug,
        comment: Comment,
    },
    Ping {
        id: Uuid,
        bug: Bug,
        ping: Ping,
    },
}

impl LiveEvent {
    pub fn bug_changed(bug: Bug, actor: impl Into<String>, fields: Vec<String>) -> Self {
        LiveEvent::BugChanged {
            id: Uuid::now_v7(),
            bug,
            actor: actor.into(),
            fields,
            at: Utc::now(),
        }
    }

    pub fn comment(bug: Bug, comment: Comment) -> Self {
        LiveEvent::Comment {
            id: Uuid::now_v7(),
            bug,
            comment,
        }
    }

    pub fn ping(bug: Bug, ping: Ping) -> Self {
        LiveEvent::Ping {
            id: Uuid::now_v7(),
            bug,
            ping,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            LiveEvent::BugChanged { id, .. }
            | LiveEvent::Comment { id, .. }
            | LiveEvent::Ping { id, .. } => *id,
        }
    }

    pub fn bug(&self) -> &Bug {
        match self {
            LiveEvent::BugChanged { bug, .. }
            | LiveEvent::Comment { bug, .. }
            | LiveEvent::Ping { bug, .. } => bug,
        }
    }

    /// Render this event for `viewer`. Empty if the viewer may not see it.
    pub fn notifications_for(&self, viewer: &ActorInfo) -> Vec<ChangeNotification> {
        let bug = self.bug();
        if !bug.is_visible_to(viewer) {
            return Vec::new();
        }

        match self {
            LiveEvent::BugChanged {
                actor, fields, at, ..
            } => {
                if fields.is_empty() {
                    return vec![ChangeNotification::new(bug, actor, "created", *at, bug.private)];
                }
                fields
                    .iter()
                    .map(|field| {
                        ChangeNotification::new(
                            bug,
                            actor,
                            &format!("changed {field}"),
                            *at,
                            bug.private,
                        )
                    })
                    .collect()
            }
            LiveEvent::Comment { comment, .. } => {
                if !comment.is_visible_to(viewer) {
                    return Vec::new();
                }
                vec![ChangeNotification::new(
                    bug,
                    &comment.user,
                    "commented on",
                    comment.created_at,
                    comment.private || bug.private,
                )]
            }
            LiveEvent::Ping { ping, .. } => vec![ChangeNotification::new(
                bug,
                &ping.from,
                "pinged",
                ping.created_at,
                bug.private,
            )],
        }
    }
}

/// One line of the live change feed, safe to send to its viewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeNotification {
    pub user: ActorView,
    pub action: String,
    pub bug: BugView,
    #[serde(rename = "bugid")]
    pub bug_id: String,
    pub time: DateTime<Utc>,
    pub title: String,
    pub private: bool,
}

impl ChangeNotification {
    fn new(bug: &Bug, actor: &str, action: &str, time: DateTime<Utc>, private: bool) -> Self {
        Self {
            user: ActorView::new(actor),
            action: action.to_string(),
            bug: BugView::from(bug),
            bug_id: bug.id.clone(),
            time,
            title: bug.title.clone(),
            private,
        }
    }
}

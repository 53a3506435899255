//! Domain models for bugs, their history, and the documents around them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tags::join_tags;

// =============================================================================
// STATUS & FIELDS
// =============================================================================

/// Workflow state of a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BugStatus {
    /// Freshly filed, nobody has looked at it yet.
    Inbox,
    /// Triaged.
    New,
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl BugStatus {
    /// All states in workflow order.
    pub const ALL: [BugStatus; 6] = [
        BugStatus::Inbox,
        BugStatus::New,
        BugStatus::Open,
        BugStatus::InProgress,
        BugStatus::Resolved,
        BugStatus::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BugStatus::Inbox => "inbox",
            BugStatus::New => "new",
            BugStatus::Open => "open",
            BugStatus::InProgress => "inprogress",
            BugStatus::Resolved => "resolved",
            BugStatus::Closed => "closed",
        }
    }

    /// States in which a bug no longer has an owner.
    pub fn clears_owner(&self) -> bool {
        matches!(self, BugStatus::Resolved | BugStatus::Closed)
    }
}

impl fmt::Display for BugStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BugStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BugStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown status: {s}")))
    }
}

/// A history-tracked field of a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BugField {
    Title,
    Description,
    Status,
    Owner,
    Tags,
    Private,
    /// Changed through the viewer operations, never through `mutate`.
    AlsoVisibleTo,
}

impl BugField {
    pub fn as_str(&self) -> &'static str {
        match self {
            BugField::Title => "title",
            BugField::Description => "description",
            BugField::Status => "status",
            BugField::Owner => "owner",
            BugField::Tags => "tags",
            BugField::Private => "private",
            BugField::AlsoVisibleTo => "also_visible_to",
        }
    }
}

impl fmt::Display for BugField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BugField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "title" => Ok(BugField::Title),
            "description" => Ok(BugField::Description),
            "status" => Ok(BugField::Status),
            "owner" => Ok(BugField::Owner),
            "tags" => Ok(BugField::Tags),
            "private" => Ok(BugField::Private),
            "also_visible_to" => Ok(BugField::AlsoVisibleTo),
            other => Err(Error::UnhandledField(other.to_string())),
        }
    }
}

// =============================================================================
// ACTORS
// =============================================================================

/// Whether an identity looks like a deliverable address.
pub fn is_well_formed_actor(id: &str) -> bool {
    id.contains('@')
}

/// A resolved actor with the flags visibility decisions need.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorInfo {
    pub id: String,
    /// Trusted actors see private bugs and comments.
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub admin: bool,
}

impl ActorInfo {
    /// A regular, untrusted actor.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            internal: false,
            admin: false,
        }
    }

    /// A trusted actor (staff, automation).
    pub fn internal(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            internal: true,
            admin: false,
        }
    }
}

// =============================================================================
// BUG
// =============================================================================

/// The mutable record at the center of the tracker.
///
/// `mod_type` and `parent` are only ever set together, through
/// [`Bug::record_modification`]; a freshly created bug has neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bug {
    pub id: String,
    /// Id of the most recent history entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: BugStatus,
    pub creator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default, rename = "modify_type", skip_serializing_if = "Option::is_none")]
    pub mod_type: Option<BugField>,
    #[serde(rename = "modified_by")]
    pub mod_by: String,
    #[serde(default)]
    pub subscribers: Vec<String>,
    #[serde(default)]
    pub also_visible_to: Vec<String>,
    #[serde(default)]
    pub private: bool,
}

impl Bug {
    /// Build a bug in the `inbox` state, subscribed to by its creator.
    pub fn new(id: impl Into<String>, req: NewBug, creator: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            parent: None,
            title: req.title,
            description: req.description,
            status: BugStatus::Inbox,
            creator: creator.to_string(),
            owner: None,
            tags: req.tags.into_iter().collect(),
            created_at: now,
            modified_at: now,
            mod_type: None,
            mod_by: creator.to_string(),
            subscribers: vec![creator.to_string()],
            also_visible_to: Vec::new(),
            private: req.private,
        }
    }

    /// Canonical text form of a field, as recorded in history entries.
    pub fn field_text(&self, field: BugField) -> String {
        match field {
            BugField::Title => self.title.clone(),
            BugField::Description => self.description.clone(),
            BugField::Status => self.status.to_string(),
            BugField::Owner => self.owner.clone().unwrap_or_default(),
            BugField::Tags => join_tags(&self.tags),
            BugField::Private => self.private.to_string(),
            BugField::AlsoVisibleTo => self.also_visible_to.join(","),
        }
    }

    pub fn is_subscribed(&self, who: &str) -> bool {
        self.subscribers.iter().any(|s| s == who)
    }

    /// Add a subscriber unless already present. Returns whether it was added.
    pub fn add_subscriber(&mut self, who: &str) -> bool {
        if self.is_subscribed(who) {
            return false;
        }
        self.subscribers.push(who.to_string());
        true
    }

    /// Remove a subscriber. Returns whether it was present.
    pub fn remove_subscriber(&mut self, who: &str) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s != who);
        before != self.subscribers.len()
    }

    /// Stamp the bug with the modification described by `entry`.
    pub fn record_modification(&mut self, entry: &HistoryEntry) {
        self.modified_at = entry.at;
        self.mod_by = entry.actor.clone();
        self.mod_type = Some(entry.field);
        self.parent = Some(entry.id.clone());
    }
}

/// Request for filing a new bug.
#[derive(Debug, Clone, Default)]
pub struct NewBug {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub private: bool,
}

// =============================================================================
// HISTORY
// =============================================================================

/// Immutable record of one committed field mutation.
///
/// Stores the value the field had *before* the mutation; the new value only
/// lives on the bug itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub bug_id: String,
    pub field: BugField,
    pub old_value: String,
    pub actor: String,
    pub at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(bug: &Bug, field: BugField, actor: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: history_id(&bug.id, at),
            bug_id: bug.id.clone(),
            field,
            old_value: bug.field_text(field),
            actor: actor.to_string(),
            at,
        }
    }
}

/// Fixed-width, nanosecond precision timestamp so ids sort chronologically.
pub fn timestamp_key(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Id of the history entry for a mutation of `bug_id` committed at `at`.
pub fn history_id(bug_id: &str, at: DateTime<Utc>) -> String {
    format!("{bug_id}-{}", timestamp_key(at))
}

/// Key prefix shared by every history entry of a bug.
pub fn history_prefix(bug_id: &str) -> String {
    format!("{bug_id}-")
}

// =============================================================================
// COMMENTS, ATTACHMENTS, PINGS, TAGS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub bug_id: String,
    pub user: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub deleted: bool,
}

/// Key prefix shared by every comment on a bug.
pub fn comment_prefix(bug_id: &str) -> String {
    format!("comment-{bug_id}-")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub bug_id: String,
    pub url: String,
    pub content_type: String,
    pub size: u64,
    pub filename: String,
    pub user: String,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    pub fn download_url(&self) -> String {
        format!(
            "/api/bug/{}/attachments/att-{}/{}",
            self.bug_id, self.id, self.filename
        )
    }
}

/// One actor drawing another's attention to a bug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub bug_id: String,
    pub from: String,
    pub to: String,
    pub created_at: DateTime<Utc>,
}

/// Key prefix shared by every ping on a bug.
pub fn ping_prefix(bug_id: &str) -> String {
    format!("ping-{bug_id}-")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    #[serde(default)]
    pub subscribers: Vec<String>,
}

pub fn tag_key(name: &str) -> String {
    format!("tag-{name}")
}

// =============================================================================
// STORED DOCUMENTS
// =============================================================================

/// Every JSON document the repositories write, tagged by `type` so prefix
/// scans can tell bugs and their history entries apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Document {
    Bug(Bug),
    #[serde(rename = "bughistory")]
    History(HistoryEntry),
    Comment(Comment),
    Ping(Ping),
    Tag(Tag),
}

impl Document {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Document::Bug(_) => "bug",
            Document::History(_) => "bughistory",
            Document::Comment(_) => "comment",
            Document::Ping(_) => "ping",
            Document::Tag(_) => "tag",
        }
    }
}

// =============================================================================
// MUTATION RESULTS & API VIEW
// =============================================================================

/// Outcome of a mutation that reached the record.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutated {
    /// The value changed; history was written and notifications fired.
    Changed(BugView),
    /// The submitted value equalled the current one; nothing was written.
    Unchanged(BugView),
}

impl Mutated {
    pub fn is_changed(&self) -> bool {
        matches!(self, Mutated::Changed(_))
    }

    pub fn view(&self) -> &BugView {
        match self {
            Mutated::Changed(v) | Mutated::Unchanged(v) => v,
        }
    }

    pub fn into_view(self) -> BugView {
        match self {
            Mutated::Changed(v) | Mutated::Unchanged(v) => v,
        }
    }
}

/// Public rendering of an actor address: local part plus avatar hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActorView {
    pub email: String,
    pub md5: String,
}

impl ActorView {
    pub fn new(address: &str) -> Self {
        let email = match address.find('@') {
            Some(at) => address[..at].to_string(),
            None => address.to_string(),
        };
        Self {
            email,
            md5: md5_hex(address),
        }
    }
}

/// Lowercase hex md5 of an address.
pub fn md5_hex(address: &str) -> String {
    format!("{:x}", md5::compute(address.as_bytes()))
}

/// Bug as returned to API callers; addresses are never exposed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BugView {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub title: String,
    pub description: String,
    pub status: BugStatus,
    pub creator: ActorView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<ActorView>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(rename = "modify_type", skip_serializing_if = "Option::is_none")]
    pub mod_type: Option<BugField>,
    #[serde(rename = "modified_by")]
    pub mod_by: ActorView,
    pub subscribers: Vec<ActorView>,
    pub also_visible_to: Vec<ActorView>,
    pub private: bool,
}

impl From<&Bug> for BugView {
    fn from(bug: &Bug) -> Self {
        Self {
            id: bug.id.clone(),
            parent: bug.parent.clone(),
            title: bug.title.clone(),
            description: bug.description.clone(),
            status: bug.status,
            creator: ActorView::new(&bug.creator),
            owner: bug.owner.as_deref().map(ActorView::new),
            tags: bug.tags.iter().cloned().collect(),
            created_at: bug.created_at,
            modified_at: bug.modified_at,
            mod_type: bug.mod_type,
            mod_by: ActorView::new(&bug.mod_by),
            subscribers: bug.subscribers.iter().map(|s| ActorView::new(s)).collect(),
            also_visible_to: bug
                .also_visible_to
                .iter()
                .map(|s| ActorView::new(s))
                .collect(),
            private: bug.private,
        }
    }
}

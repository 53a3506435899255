//! Bug repository: the record mutation engine.
//!
//! Every write to a bug goes through [`BugRepository::apply`], a single CAS
//! round in which the bug is decoded, checked for visibility, edited, and (for
//! tracked fields) paired with a history entry that commits together with the
//! winning attempt. Notifications are emitted only after the commit.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use cbugg_core::defaults::{BUG_ID_COUNTER_KEY, MIN_TITLE_LEN};
use cbugg_core::{
    added_tags, comment_prefix, history_prefix, is_well_formed_actor, md5_hex, parse_tags,
    ping_prefix, timestamp_key, ActorInfo, ActorResolver, Bug, BugField, BugStatus, BugView,
    CasDecision, CasOutcome, ChangeEvent, Document, DocumentStore, Error, HistoryEntry, Mutated,
    NewBug, Notifier, PartiallyVisible, Ping, Result,
};

/// What one attempt's edit did to the decoded bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    /// Nothing to write.
    None,
    /// Preference-only change: no history, no notification.
    Untracked,
    /// History-tracked change of a single field.
    Tracked(BugField),
}

/// State captured from the attempt that ended the CAS loop.
#[derive(Debug)]
struct Applied {
    before: Bug,
    after: Bug,
    change: Change,
    committed: bool,
}

/// Counts of documents removed alongside a bug.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub history: usize,
    pub comments: usize,
    pub pings: usize,
    /// Dependent documents that could not be removed.
    pub failed: usize,
}

/// Repository for bugs and their history.
#[derive(Clone)]
pub struct BugRepository {
    store: Arc<dyn DocumentStore>,
    notifier: Notifier,
    resolver: Arc<dyn ActorResolver>,
}

impl BugRepository {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        notifier: Notifier,
        resolver: Arc<dyn ActorResolver>,
    ) -> Self {
        Self {
            store,
            notifier,
            resolver,
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Fetch a bug without any visibility check.
    pub async fn get(&self, bug_id: &str) -> Result<Bug> {
        let bytes = self
            .store
            .get(bug_id)
            .await?
            .ok_or_else(|| Error::NotFound(bug_id.to_string()))?;
        decode_bug(&bytes)
    }

    /// Fetch a bug on behalf of `actor`.
    pub async fn get_for(&self, bug_id: &str, actor: &ActorInfo) -> Result<Bug> {
        let bug = self.get(bug_id).await?;
        if !bug.is_visible_to(actor) {
            return Err(Error::NotVisible(bug_id.to_string()));
        }
        Ok(bug)
    }

    /// History of a bug, oldest first.
    pub async fn history(&self, bug_id: &str, actor: &ActorInfo) -> Result<Vec<HistoryEntry>> {
        self.get_for(bug_id, actor).await?;

        let mut entries = Vec::new();
        for (key, bytes) in self.store.scan_prefix(&history_prefix(bug_id)).await? {
            match Document::decode(&bytes) {
                Ok(Document::History(entry)) if entry.bug_id == bug_id => entries.push(entry),
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable history document"),
            }
        }
        Ok(entries)
    }

    /// All bugs currently in `status`.
    pub async fn list_by_status(&self, status: BugStatus) -> Result<Vec<Bug>> {
        let mut bugs = Vec::new();
        for (key, bytes) in self.store.scan_prefix("bug-").await? {
            match Document::decode(&bytes) {
                Ok(Document::Bug(bug)) if bug.status == status => bugs.push(bug),
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable document"),
            }
        }
        Ok(bugs)
    }

    // =========================================================================
    // CREATE
    // =========================================================================

    /// File a new bug. It starts in `inbox` with its creator subscribed.
    pub async fn create(&self, req: NewBug, actor: &ActorInfo) -> Result<Bug> {
        if req.title.trim().chars().count() < MIN_TITLE_LEN {
            return Err(Error::InvalidInput(format!(
                "title must be at least {MIN_TITLE_LEN} characters"
            )));
        }

        let id = self.next_bug_id().await?;
        let bug = Bug::new(id.as_str(), req, &actor.id, Utc::now());

        if !self.store.add(&id, Document::Bug(bug.clone()).encode()?).await? {
            error!(bug_id = %id, "Freshly allocated bug id already exists");
            return Err(Error::IdCollision(id));
        }
        info!(bug_id = %bug.id, actor = %actor.id, "Bug created");

        self.notifier
            .bug_changed(ChangeEvent::created(bug.id.as_str(), actor.id.as_str()))
            .await;
        for tag in &bug.tags {
            self.notifier.tag_assigned(&bug.id, tag, &actor.id).await;
        }
        Ok(bug)
    }

    async fn next_bug_id(&self) -> Result<String> {
        let mut next: u64 = 0;
        let mut transform = |current: Option<&[u8]>| -> Result<CasDecision> {
            let last: u64 = match current {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => 0,
            };
            next = last + 1;
            Ok(CasDecision::write(serde_json::to_vec(&next)?))
        };
        self.store.update(BUG_ID_COUNTER_KEY, &mut transform).await?;
        Ok(format!("bug-{next}"))
    }

    // =========================================================================
    // MUTATION
    // =========================================================================

    /// Set `field` to `value` on behalf of `actor`.
    ///
    /// Submitting the current value is not an error: nothing is written and
    /// [`Mutated::Unchanged`] is returned.
    pub async fn mutate(
        &self,
        bug_id: &str,
        field: &str,
        value: &str,
        actor: &ActorInfo,
    ) -> Result<Mutated> {
        let applied = self
            .apply(bug_id, actor, |bug| apply_field(bug, field, value))
            .await?;
        Ok(self.announce(bug_id, applied, actor).await)
    }

    /// Grant `viewer` access to a private bug.
    pub async fn add_viewer(
        &self,
        bug_id: &str,
        viewer: &str,
        actor: &ActorInfo,
    ) -> Result<Mutated> {
        if !is_well_formed_actor(viewer) {
            return Err(Error::InvalidInput(format!("not an address: {viewer}")));
        }
        let applied = self
            .apply(bug_id, actor, |bug| {
                if bug.also_visible_to.iter().any(|v| v == viewer) {
                    return Ok(Change::None);
                }
                bug.also_visible_to.push(viewer.to_string());
                Ok(Change::Tracked(BugField::AlsoVisibleTo))
            })
            .await?;
        Ok(self.announce(bug_id, applied, actor).await)
    }

    /// Revoke access. `viewer` may be the address or its md5 hash, since
    /// API callers only ever see the hash.
    pub async fn remove_viewer(
        &self,
        bug_id: &str,
        viewer: &str,
        actor: &ActorInfo,
    ) -> Result<Mutated> {
        let applied = self
            .apply(bug_id, actor, |bug| {
                let before = bug.also_visible_to.len();
                bug.also_visible_to.retain(|v| v != viewer && md5_hex(v) != viewer);
                if bug.also_visible_to.len() == before {
                    Ok(Change::None)
                } else {
                    Ok(Change::Tracked(BugField::AlsoVisibleTo))
                }
            })
            .await?;
        Ok(self.announce(bug_id, applied, actor).await)
    }

    /// Subscribe `actor` to a bug. Returns whether anything changed.
    pub async fn subscribe(&self, bug_id: &str, actor: &ActorInfo) -> Result<bool> {
        let applied = self
            .apply(bug_id, actor, |bug| {
                Ok(if bug.add_subscriber(&actor.id) {
                    Change::Untracked
                } else {
                    Change::None
                })
            })
            .await?;
        Ok(applied.committed)
    }

    /// Unsubscribe `actor` from a bug. Returns whether anything changed.
    pub async fn unsubscribe(&self, bug_id: &str, actor: &ActorInfo) -> Result<bool> {
        let applied = self
            .apply(bug_id, actor, |bug| {
                Ok(if bug.remove_subscriber(&actor.id) {
                    Change::Untracked
                } else {
                    Change::None
                })
            })
            .await?;
        Ok(applied.committed)
    }

    /// Run `edit` against the current bug inside a single CAS round.
    ///
    /// The closure may run several times; it must derive everything from the
    /// bug it is handed.
    async fn apply<F>(&self, bug_id: &str, actor: &ActorInfo, mut edit: F) -> Result<Applied>
    where
        F: FnMut(&mut Bug) -> Result<Change> + Send,
    {
        let mut last: Option<(Bug, Bug, Change)> = None;
        let mut transform = |current: Option<&[u8]>| -> Result<CasDecision> {
            let bytes = current.ok_or_else(|| Error::NotFound(bug_id.to_string()))?;
            let before = decode_bug(bytes)?;
            if !before.is_visible_to(actor) {
                return Err(Error::NotVisible(bug_id.to_string()));
            }

            let mut after = before.clone();
            let change = edit(&mut after)?;
            let decision = match change {
                Change::None => CasDecision::Cancel,
                Change::Untracked => CasDecision::write(Document::Bug(after.clone()).encode()?),
                Change::Tracked(field) => {
                    let at = next_modification_time(before.modified_at);
                    let entry = HistoryEntry::new(&before, field, &actor.id, at);
                    after.record_modification(&entry);
                    let companion = (entry.id.clone(), Document::History(entry).encode()?);
                    CasDecision::Write {
                        value: Document::Bug(after.clone()).encode()?,
                        companions: vec![companion],
                    }
                }
            };
            last = Some((before, after, change));
            Ok(decision)
        };

        let outcome = self.store.update(bug_id, &mut transform).await?;
        let (before, after, change) = last
            .ok_or_else(|| Error::Internal(format!("update of {bug_id} ran no transform")))?;
        Ok(Applied {
            before,
            after,
            change,
            committed: outcome == CasOutcome::Committed,
        })
    }

    /// Emit the notifications for a finished tracked update.
    async fn announce(&self, bug_id: &str, applied: Applied, actor: &ActorInfo) -> Mutated {
        let field = match (applied.committed, applied.change) {
            (true, Change::Tracked(field)) => field,
            _ => {
                debug!(bug_id, actor = %actor.id, "Submitted value matches current value");
                return Mutated::Unchanged(BugView::from(&applied.before));
            }
        };
        info!(bug_id, field = %field, actor = %actor.id, "Bug updated");

        self.notifier
            .bug_changed(ChangeEvent::changed(bug_id, field, actor.id.as_str()))
            .await;

        match field {
            BugField::Owner => {
                if let Some(owner) = applied.after.owner.as_deref() {
                    if owner != actor.id {
                        self.notifier.bug_assigned(bug_id, owner, &actor.id).await;
                    }
                }
            }
            BugField::Tags => {
                for tag in added_tags(&applied.before.tags, &applied.after.tags) {
                    self.notifier.tag_assigned(bug_id, &tag, &actor.id).await;
                }
            }
            _ => {}
        }

        Mutated::Changed(BugView::from(&applied.after))
    }

    // =========================================================================
    // PINGS
    // =========================================================================

    /// Draw `to`'s attention to a bug. The recipient must be able to see it.
    pub async fn ping(&self, bug_id: &str, from: &ActorInfo, to: &str) -> Result<Ping> {
        let bug = self.get_for(bug_id, from).await?;
        if !is_well_formed_actor(to) {
            return Err(Error::InvalidInput(format!("not an address: {to}")));
        }

        let recipient = self.resolver.resolve_or_default(to).await;
        if !bug.is_visible_to(&recipient) {
            return Err(Error::Forbidden(format!("{to} cannot see {bug_id}")));
        }

        let ping = Ping {
            bug_id: bug_id.to_string(),
            from: from.id.clone(),
            to: to.to_string(),
            created_at: Utc::now(),
        };
        let key = format!("{}{}", ping_prefix(bug_id), timestamp_key(ping.created_at));
        self.store
            .set(&key, Document::Ping(ping.clone()).encode()?)
            .await?;
        info!(bug_id, from = %from.id, to, "Bug pinged");

        self.notifier.bug_pinged(ping.clone()).await;
        Ok(ping)
    }

    // =========================================================================
    // DELETE
    // =========================================================================

    /// Remove a bug together with its history, comments and pings.
    ///
    /// Dependent documents are removed concurrently and best-effort; failures
    /// are logged and counted in the report. The bug itself goes last.
    pub async fn delete(&self, bug_id: &str, actor: &ActorInfo) -> Result<DeleteReport> {
        self.get_for(bug_id, actor).await?;

        let history_keys = history_prefix(bug_id);
        let comment_keys = comment_prefix(bug_id);
        let ping_keys = ping_prefix(bug_id);
        let (history, comments, pings) = futures::try_join!(
            self.store.scan_prefix(&history_keys),
            self.store.scan_prefix(&comment_keys),
            self.store.scan_prefix(&ping_keys),
        )?;

        let mut report = DeleteReport {
            history: history.len(),
            comments: comments.len(),
            pings: pings.len(),
            failed: 0,
        };

        let keys: Vec<String> = history
            .into_iter()
            .chain(comments)
            .chain(pings)
            .map(|(key, _)| key)
            .collect();
        let results = join_all(keys.iter().map(|key| self.store.delete(key))).await;
        for (key, result) in keys.iter().zip(results) {
            if let Err(e) = result {
                report.failed += 1;
                warn!(bug_id, key = %key, error = %e, "Failed to delete dependent document");
            }
        }

        self.store.delete(bug_id).await?;
        info!(
            bug_id,
            actor = %actor.id,
            history = report.history,
            comments = report.comments,
            pings = report.pings,
            failed = report.failed,
            "Bug deleted"
        );
        Ok(report)
    }
}

/// Apply a `mutate` request to a decoded bug.
fn apply_field(bug: &mut Bug, name: &str, value: &str) -> Result<Change> {
    let field: BugField = name.parse()?;
    let before = bug.field_text(field);

    match field {
        BugField::Title => bug.title = value.to_string(),
        BugField::Description => bug.description = value.to_string(),
        BugField::Private => bug.private = value == "true",
        BugField::Status => {
            let status: BugStatus = value.parse()?;
            bug.status = status;
            if status.clears_owner() {
                bug.owner = None;
            }
        }
        BugField::Owner => {
            bug.owner = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
            if is_well_formed_actor(value) {
                bug.add_subscriber(value);
            }
        }
        BugField::Tags => bug.tags = parse_tags(value),
        BugField::AlsoVisibleTo => return Err(Error::UnhandledField(name.to_string())),
    }

    if bug.field_text(field) == before {
        return Ok(Change::None);
    }

    // Someone is working on it, so it has been triaged.
    if matches!(field, BugField::Description | BugField::Owner) && bug.status == BugStatus::Inbox
    {
        bug.status = BugStatus::New;
    }
    Ok(Change::Tracked(field))
}

/// Strictly after `previous`, so history ids never collide or reorder.
fn next_modification_time(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    let floor = previous + Duration::nanoseconds(1);
    if now > floor {
        now
    } else {
        floor
    }
}

fn decode_bug(bytes: &[u8]) -> Result<Bug> {
    match Document::decode(bytes)? {
        Document::Bug(bug) => Ok(bug),
        other => Err(Error::Internal(format!(
            "expected bug document, found {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::resolver::StaticActorResolver;
    use cbugg_core::{notification_channels, NotificationReceivers};

    const ALICE: &str = "alice@example.com";
    const BOB: &str = "bob@example.com";
    const STAFF: &str = "staff@example.com";

    fn setup() -> (BugRepository, Arc<MemoryStore>, NotificationReceivers) {
        let store = Arc::new(MemoryStore::new());
        let (notifier, rx) = notification_channels(64);
        let resolver = StaticActorResolver::new()
            .with_actor(ActorInfo::internal(STAFF))
            .with_actor(ActorInfo::user(ALICE))
            .with_actor(ActorInfo::user(BOB));
        let repo = BugRepository::new(store.clone(), notifier, Arc::new(resolver));
        (repo, store, rx)
    }

    fn new_bug(title: &str) -> NewBug {
        NewBug {
            title: title.to_string(),
            description: "steps to reproduce".to_string(),
            ..Default::default()
        }
    }

    fn drain_changes(rx: &mut NotificationReceivers) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.changes.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_create_allocates_sequential_ids() {
        let (repo, _, mut rx) = setup();
        let alice = ActorInfo::user(ALICE);

        let first = repo.create(new_bug("first bug"), &alice).await.unwrap();
        let second = repo.create(new_bug("second bug"), &alice).await.unwrap();

        assert_eq!(first.id, "bug-1");
        assert_eq!(second.id, "bug-2");
        assert_eq!(first.status, BugStatus::Inbox);
        assert_eq!(first.subscribers, vec![ALICE.to_string()]);
        assert_eq!(
            drain_changes(&mut rx),
            vec![
                ChangeEvent::created("bug-1", ALICE),
                ChangeEvent::created("bug-2", ALICE)
            ]
        );
    }

    #[tokio::test]
    async fn test_create_rejects_short_title() {
        let (repo, store, _rx) = setup();
        let err = repo
            .create(new_bug("bug"), &ActorInfo::user(ALICE))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_create_detects_id_collision() {
        let (repo, store, _rx) = setup();
        store.set("bug-1", b"{}".to_vec()).await.unwrap();

        let err = repo
            .create(new_bug("colliding bug"), &ActorInfo::user(ALICE))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdCollision(id) if id == "bug-1"));
    }

    #[tokio::test]
    async fn test_create_announces_initial_tags() {
        let (repo, _, mut rx) = setup();
        let req = NewBug {
            tags: vec!["ui".to_string(), "perf".to_string()],
            ..new_bug("tagged bug")
        };
        repo.create(req, &ActorInfo::user(ALICE)).await.unwrap();

        let first = rx.tags.try_recv().unwrap();
        let second = rx.tags.try_recv().unwrap();
        assert_eq!((first.tag.as_str(), second.tag.as_str()), ("perf", "ui"));
    }

    #[tokio::test]
    async fn test_mutate_same_value_is_unchanged() {
        let (repo, store, mut rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let bug = repo.create(new_bug("a title"), &alice).await.unwrap();
        drain_changes(&mut rx);
        let docs_before = store.len();

        let result = repo.mutate(&bug.id, "title", "a title", &alice).await.unwrap();

        assert!(!result.is_changed());
        assert_eq!(store.len(), docs_before);
        assert!(drain_changes(&mut rx).is_empty());
        assert!(repo.history(&bug.id, &alice).await.unwrap().is_empty());
        assert_eq!(repo.get(&bug.id).await.unwrap(), bug);
    }

    #[tokio::test]
    async fn test_mutate_missing_bug_is_not_found() {
        let (repo, _, _rx) = setup();
        let err = repo
            .mutate("bug-99", "title", "x", &ActorInfo::user(ALICE))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(id) if id == "bug-99"));
    }

    #[tokio::test]
    async fn test_mutate_unknown_field_writes_nothing() {
        let (repo, store, mut rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let bug = repo.create(new_bug("a title"), &alice).await.unwrap();
        drain_changes(&mut rx);
        let docs_before = store.len();

        let err = repo.mutate(&bug.id, "color", "red", &alice).await.unwrap_err();
        assert!(matches!(err, Error::UnhandledField(f) if f == "color"));

        let err = repo
            .mutate(&bug.id, "also_visible_to", BOB, &alice)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnhandledField(_)));

        assert_eq!(store.len(), docs_before);
        assert!(drain_changes(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_mutate_invalid_status() {
        let (repo, _, _rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let bug = repo.create(new_bug("a title"), &alice).await.unwrap();
        let err = repo
            .mutate(&bug.id, "status", "wontfix", &alice)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_private_bug_is_invisible_to_outsiders() {
        let (repo, store, mut rx) = setup();
        let staff = ActorInfo::internal(STAFF);
        let bob = ActorInfo::user(BOB);
        let req = NewBug {
            private: true,
            ..new_bug("secret bug")
        };
        let bug = repo.create(req, &staff).await.unwrap();
        drain_changes(&mut rx);
        let docs_before = store.len();

        let err = repo.mutate(&bug.id, "title", "leaked", &bob).await.unwrap_err();
        assert!(matches!(err, Error::NotVisible(_)));
        assert!(matches!(
            repo.get_for(&bug.id, &bob).await,
            Err(Error::NotVisible(_))
        ));
        assert_eq!(store.len(), docs_before);
        assert!(drain_changes(&mut rx).is_empty());

        repo.add_viewer(&bug.id, BOB, &staff).await.unwrap();
        assert!(repo.mutate(&bug.id, "title", "shared", &bob).await.unwrap().is_changed());
    }

    #[tokio::test]
    async fn test_history_records_previous_values_in_order() {
        let (repo, _, _rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let bug = repo.create(new_bug("original"), &alice).await.unwrap();

        for title in ["second", "third", "fourth"] {
            repo.mutate(&bug.id, "title", title, &alice).await.unwrap();
        }

        let history = repo.history(&bug.id, &alice).await.unwrap();
        let old_values: Vec<&str> = history.iter().map(|h| h.old_value.as_str()).collect();
        assert_eq!(old_values, vec!["original", "second", "third"]);
        assert!(history.windows(2).all(|w| w[0].at < w[1].at));

        let current = repo.get(&bug.id).await.unwrap();
        assert_eq!(current.title, "fourth");
        assert_eq!(current.mod_type, Some(BugField::Title));
        assert_eq!(current.parent.as_deref(), Some(history[2].id.as_str()));
        assert_eq!(current.modified_at, history[2].at);
    }

    #[tokio::test]
    async fn test_status_resolution_clears_owner() {
        let (repo, _, _rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let bug = repo.create(new_bug("ownership"), &alice).await.unwrap();
        repo.mutate(&bug.id, "owner", ALICE, &alice).await.unwrap();

        let view = repo
            .mutate(&bug.id, "status", "resolved", &alice)
            .await
            .unwrap()
            .into_view();
        assert_eq!(view.status, BugStatus::Resolved);
        assert!(view.owner.is_none());
    }

    #[tokio::test]
    async fn test_owner_change_by_someone_else_notifies_assignment() {
        let (repo, _, mut rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let bug = repo.create(new_bug("assign me"), &alice).await.unwrap();
        drain_changes(&mut rx);

        let view = repo
            .mutate(&bug.id, "owner", BOB, &alice)
            .await
            .unwrap()
            .into_view();

        assert_eq!(view.status, BugStatus::New);
        assert_eq!(view.subscribers.len(), 2);
        assert_eq!(
            drain_changes(&mut rx),
            vec![
                ChangeEvent::changed(bug.id.as_str(), BugField::Owner, ALICE),
                ChangeEvent::except(bug.id.as_str(), BOB),
            ]
        );
        let assignment = rx.assignments.try_recv().unwrap();
        assert_eq!(assignment.owner, BOB);
    }

    #[tokio::test]
    async fn test_self_assignment_sends_no_assignment() {
        let (repo, _, mut rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let bug = repo.create(new_bug("mine"), &alice).await.unwrap();
        drain_changes(&mut rx);

        repo.mutate(&bug.id, "owner", ALICE, &alice).await.unwrap();

        assert_eq!(drain_changes(&mut rx).len(), 1);
        assert!(rx.assignments.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tag_change_announces_only_new_tags() {
        let (repo, _, mut rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let bug = repo.create(new_bug("tagging"), &alice).await.unwrap();
        repo.mutate(&bug.id, "tags", "ui", &alice).await.unwrap();
        rx.tags.try_recv().unwrap();

        repo.mutate(&bug.id, "tags", "ui, perf  docs", &alice)
            .await
            .unwrap();

        let mut added = vec![rx.tags.try_recv().unwrap().tag, rx.tags.try_recv().unwrap().tag];
        added.sort();
        assert_eq!(added, vec!["docs".to_string(), "perf".to_string()]);
        assert!(rx.tags.try_recv().is_err());
        assert_eq!(
            repo.get(&bug.id).await.unwrap().field_text(BugField::Tags),
            "docs,perf,ui"
        );
    }

    #[tokio::test]
    async fn test_viewer_removal_accepts_md5() {
        let (repo, _, _rx) = setup();
        let staff = ActorInfo::internal(STAFF);
        let bug = repo.create(new_bug("viewers"), &staff).await.unwrap();

        assert!(repo.add_viewer(&bug.id, BOB, &staff).await.unwrap().is_changed());
        assert!(!repo.add_viewer(&bug.id, BOB, &staff).await.unwrap().is_changed());

        let removed = repo
            .remove_viewer(&bug.id, &md5_hex(BOB), &staff)
            .await
            .unwrap();
        assert!(removed.is_changed());
        assert!(removed.view().also_visible_to.is_empty());

        let history = repo.history(&bug.id, &staff).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].old_value, BOB);
        assert_eq!(history[1].field, BugField::AlsoVisibleTo);
    }

    #[tokio::test]
    async fn test_subscription_is_untracked() {
        let (repo, _, mut rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let bob = ActorInfo::user(BOB);
        let bug = repo.create(new_bug("follow me"), &alice).await.unwrap();
        drain_changes(&mut rx);

        assert!(repo.subscribe(&bug.id, &bob).await.unwrap());
        assert!(!repo.subscribe(&bug.id, &bob).await.unwrap());
        assert!(repo.unsubscribe(&bug.id, &alice).await.unwrap());

        let current = repo.get(&bug.id).await.unwrap();
        assert_eq!(current.subscribers, vec![BOB.to_string()]);
        assert_eq!(current.modified_at, bug.modified_at);
        assert!(repo.history(&bug.id, &bob).await.unwrap().is_empty());
        assert!(drain_changes(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_ping_requires_recipient_visibility() {
        let (repo, _, mut rx) = setup();
        let staff = ActorInfo::internal(STAFF);
        let req = NewBug {
            private: true,
            ..new_bug("private ping")
        };
        let bug = repo.create(req, &staff).await.unwrap();

        let err = repo.ping(&bug.id, &staff, BOB).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let err = repo.ping(&bug.id, &staff, "bob").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let ping = repo.ping(&bug.id, &staff, "other@example.com").await;
        assert!(matches!(ping, Err(Error::Forbidden(_))));

        repo.add_viewer(&bug.id, BOB, &staff).await.unwrap();
        let ping = repo.ping(&bug.id, &staff, BOB).await.unwrap();
        assert_eq!(ping.to, BOB);
        assert_eq!(rx.pings.try_recv().unwrap(), ping);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (repo, store, _rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let keep = repo.create(new_bug("keep this one"), &alice).await.unwrap();
        let bug = repo.create(new_bug("delete me"), &alice).await.unwrap();
        repo.mutate(&bug.id, "title", "delete me now", &alice)
            .await
            .unwrap();
        repo.mutate(&keep.id, "title", "still here", &alice)
            .await
            .unwrap();
        repo.ping(&bug.id, &alice, BOB).await.unwrap();
        store
            .set(&format!("{}1", comment_prefix(&bug.id)), b"{}".to_vec())
            .await
            .unwrap();

        let report = repo.delete(&bug.id, &alice).await.unwrap();

        assert_eq!(
            report,
            DeleteReport {
                history: 1,
                comments: 1,
                pings: 1,
                failed: 0
            }
        );
        assert!(matches!(repo.get(&bug.id).await, Err(Error::NotFound(_))));
        assert_eq!(repo.history(&keep.id, &alice).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_by_status_skips_history() {
        let (repo, _, _rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let a = repo.create(new_bug("inbox one"), &alice).await.unwrap();
        let b = repo.create(new_bug("inbox two"), &alice).await.unwrap();
        repo.mutate(&b.id, "status", "open", &alice).await.unwrap();

        let inbox = repo.list_by_status(BugStatus::Inbox).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, a.id);

        let open = repo.list_by_status(BugStatus::Open).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, b.id);
    }

    #[tokio::test]
    async fn test_description_edit_triages_inbox_bug() {
        let (repo, _, _rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let bug = repo.create(new_bug("needs triage"), &alice).await.unwrap();

        let view = repo
            .mutate(&bug.id, "description", "now with a stack trace", &alice)
            .await
            .unwrap()
            .into_view();

        assert_eq!(view.status, BugStatus::New);
        assert_eq!(view.description, "now with a stack trace");
    }

    #[tokio::test]
    async fn test_description_edit_leaves_open_bug_open() {
        let (repo, _, _rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let bug = repo.create(new_bug("already open"), &alice).await.unwrap();
        repo.mutate(&bug.id, "status", "open", &alice).await.unwrap();

        let view = repo
            .mutate(&bug.id, "description", "more detail", &alice)
            .await
            .unwrap()
            .into_view();

        assert_eq!(view.status, BugStatus::Open);
    }

    #[tokio::test]
    async fn test_private_flag_is_tracked() {
        let (repo, _, mut rx) = setup();
        let staff = ActorInfo::internal(STAFF);
        let bug = repo.create(new_bug("goes private"), &staff).await.unwrap();
        drain_changes(&mut rx);

        let result = repo.mutate(&bug.id, "private", "true", &staff).await.unwrap();
        assert!(result.is_changed());
        assert!(result.view().private);

        let history = repo.history(&bug.id, &staff).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].field, BugField::Private);
        assert_eq!(history[0].old_value, "false");
        assert_eq!(
            drain_changes(&mut rx),
            vec![ChangeEvent::changed(bug.id.as_str(), BugField::Private, STAFF)]
        );

        // A user outside the grant list loses sight of it.
        assert!(matches!(
            repo.get_for(&bug.id, &ActorInfo::user(BOB)).await,
            Err(Error::NotVisible(_))
        ));
    }

    /// Serves reads from an inner store but fails every write.
    struct ReadOnlyStore(Arc<MemoryStore>);

    #[async_trait::async_trait]
    impl DocumentStore for ReadOnlyStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.0.get(key).await
        }

        async fn add(&self, _key: &str, _value: Vec<u8>) -> Result<bool> {
            Err(Error::Store("read-only".to_string()))
        }

        async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
            Err(Error::Store("read-only".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(Error::Store("read-only".to_string()))
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
            self.0.scan_prefix(prefix).await
        }

        async fn update(
            &self,
            _key: &str,
            _transform: &mut cbugg_core::CasTransform<'_>,
        ) -> Result<CasOutcome> {
            Err(Error::Store("read-only".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_propagates_without_notifying() {
        let (repo, store, _rx) = setup();
        let alice = ActorInfo::user(ALICE);
        let bug = repo.create(new_bug("written once"), &alice).await.unwrap();

        let (notifier, mut rx) = notification_channels(16);
        let resolver = StaticActorResolver::new().with_actor(alice.clone());
        let frozen = BugRepository::new(
            Arc::new(ReadOnlyStore(store)),
            notifier,
            Arc::new(resolver),
        );

        let err = frozen
            .mutate(&bug.id, "title", "rewritten title", &alice)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert!(!err.is_client_error());
        assert!(drain_changes(&mut rx).is_empty());

        assert_eq!(frozen.get_for(&bug.id, &alice).await.unwrap(), bug);
    }
}

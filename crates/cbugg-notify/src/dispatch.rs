//! Notification dispatch loop.
//!
//! One task drains the typed notification channels. Comments, pings and bug
//! changes are published to the live feed right away; bug changes are also
//! handed to the [`Debouncer`], and everything else is mailed from a spawned
//! task so a slow sink never holds up the loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use cbugg_core::{
    is_well_formed_actor, visible_recipients, ActorInfo, ActorResolver, Assignment, Attachment,
    Bug, ChangeEvent, Comment, Error, NotificationReceivers, NotificationSink, Ping, Result,
    TagAssignment, Template,
};
use cbugg_db::{BugRepository, Database, TagRepository};

use crate::config::NotifyConfig;
use crate::debounce::{CoalescedChange, Debouncer, FlushHandler};
use crate::hub::{BroadcastHub, SubscriberId, Subscription};
use crate::live::{ChangeNotification, LiveEvent};
use crate::ring::RingHandle;

/// Everything the dispatch loop can receive.
#[derive(Debug)]
pub enum Notification {
    Comment(Comment),
    Attachment(Attachment),
    Assigned(Assignment),
    Changed(ChangeEvent),
    TagAssigned(TagAssignment),
    Pinged(Ping),
}

async fn deliver(
    sink: &dyn NotificationSink,
    template: Template,
    recipients: Vec<String>,
    context: JsonValue,
) {
    if recipients.is_empty() {
        debug!(template = %template, "No eligible recipients");
        return;
    }
    let count = recipients.len();
    match sink.send(template, recipients, context).await {
        Ok(()) => debug!(template = %template, recipients = count, "Notification sent"),
        Err(e) => warn!(template = %template, error = %e, "Failed to send notification"),
    }
}

// =============================================================================
// BUG CHANGE MAIL
// =============================================================================

/// Mails a coalesced burst to the bug's subscribers.
pub struct BugChangeMailer {
    bugs: BugRepository,
    resolver: Arc<dyn ActorResolver>,
    sink: Arc<dyn NotificationSink>,
}

impl BugChangeMailer {
    pub fn new(
        bugs: BugRepository,
        resolver: Arc<dyn ActorResolver>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            bugs,
            resolver,
            sink,
        }
    }
}

#[async_trait]
impl FlushHandler for BugChangeMailer {
    async fn flush(&self, change: CoalescedChange) {
        if change.actors.is_empty() {
            debug!(bug_id = %change.bug_id, "Burst carried only exclusions");
            return;
        }

        let bug = match self.bugs.get(&change.bug_id).await {
            Ok(bug) => bug,
            Err(e) => {
                warn!(bug_id = %change.bug_id, error = %e, "Cannot load bug for change mail");
                return;
            }
        };

        let recipients = change.recipients(&bug, self.resolver.as_ref()).await;
        let context = json!({
            "bug": bug,
            "fields": change.fields,
            "actors": change.actors,
            "actors_string": change.actors_string(),
        });
        deliver(self.sink.as_ref(), Template::BugChanged, recipients, context).await;
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Everything a spawned send needs.
#[derive(Clone)]
struct Outbound {
    bugs: BugRepository,
    tags: TagRepository,
    resolver: Arc<dyn ActorResolver>,
    sink: Arc<dyn NotificationSink>,
}

impl Outbound {
    async fn load(&self, bug_id: &str) -> Option<Bug> {
        match self.bugs.get(bug_id).await {
            Ok(bug) => Some(bug),
            Err(e) => {
                warn!(bug_id, error = %e, "Cannot load bug for notification");
                None
            }
        }
    }

    async fn comment(self, bug: Bug, comment: Comment) {
        let can_see_bug =
            visible_recipients(&bug, bug.subscribers.clone(), self.resolver.as_ref()).await;
        let recipients = visible_recipients(&comment, can_see_bug, self.resolver.as_ref()).await;
        let context = json!({ "bug": bug, "comment": comment });
        deliver(self.sink.as_ref(), Template::Comment, recipients, context).await;
    }

    async fn attachment(self, attachment: Attachment) {
        let Some(bug) = self.load(&attachment.bug_id).await else {
            return;
        };
        let recipients =
            visible_recipients(&bug, bug.subscribers.clone(), self.resolver.as_ref()).await;
        let context = json!({
            "bug": bug,
            "attachment": attachment,
            "download_url": attachment.download_url(),
        });
        deliver(self.sink.as_ref(), Template::Attachment, recipients, context).await;
    }

    async fn assigned(self, assignment: Assignment) {
        if !is_well_formed_actor(&assignment.owner) {
            debug!(
                bug_id = %assignment.bug_id,
                owner = %assignment.owner,
                "Owner is not an address"
            );
            return;
        }
        let Some(bug) = self.load(&assignment.bug_id).await else {
            return;
        };
        let context = json!({ "bug": bug, "actor": assignment.actor });
        deliver(
            self.sink.as_ref(),
            Template::Assigned,
            vec![assignment.owner],
            context,
        )
        .await;
    }

    async fn tag_assigned(self, tagged: TagAssignment) {
        let Some(bug) = self.load(&tagged.bug_id).await else {
            return;
        };
        let followers = match self.tags.subscribers(&tagged.tag).await {
            Ok(followers) => followers,
            Err(e) => {
                warn!(tag = %tagged.tag, error = %e, "Cannot load tag followers");
                return;
            }
        };
        let candidates: Vec<String> = followers
            .into_iter()
            .filter(|f| *f != tagged.actor)
            .collect();
        let recipients = visible_recipients(&bug, candidates, self.resolver.as_ref()).await;
        let context = json!({ "bug": bug, "tag": tagged.tag, "actor": tagged.actor });
        deliver(self.sink.as_ref(), Template::TagAssigned, recipients, context).await;
    }

    async fn ping(self, bug: Bug, ping: Ping) {
        let recipients = vec![ping.to.clone()];
        let context = json!({ "bug": bug, "ping": ping });
        deliver(self.sink.as_ref(), Template::Ping, recipients, context).await;
    }
}

// =============================================================================
// LIVE FEED
// =============================================================================

/// Entry point for live subscribers: the hub plus the recent-change ring.
#[derive(Clone)]
pub struct LiveFeed {
    hub: BroadcastHub<LiveEvent>,
    ring: RingHandle<LiveEvent>,
    buffer: usize,
}

impl LiveFeed {
    /// Subscribe, returning recent events alongside the live channel.
    ///
    /// The subscription is registered before the backlog is read, so an
    /// event published in between may appear in both; dedupe on
    /// [`LiveEvent::id`].
    pub async fn connect(&self) -> Result<(Vec<LiveEvent>, Subscription<LiveEvent>)> {
        let subscription = self.hub.register(self.buffer).await?;
        let backlog = self.ring.snapshot().await;
        Ok((backlog, subscription))
    }

    pub fn disconnect(&self, id: SubscriberId) {
        self.hub.unregister(id);
    }

    /// The `n` most recent live events, oldest first.
    pub async fn recent(&self, n: usize) -> Vec<LiveEvent> {
        self.ring.latest(n).await
    }

    /// The `n` most recent change lines `viewer` may see, oldest first.
    pub async fn recent_for(&self, viewer: &ActorInfo, n: usize) -> Vec<ChangeNotification> {
        let mut notes: Vec<ChangeNotification> = self
            .ring
            .snapshot()
            .await
            .iter()
            .flat_map(|event| event.notifications_for(viewer))
            .collect();
        let excess = notes.len().saturating_sub(n);
        notes.drain(..excess);
        notes
    }

    pub async fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count().await
    }

    fn publish(&self, event: LiveEvent) {
        self.ring.add(event.clone());
        self.hub.submit(event);
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

/// Handle for controlling a running dispatcher.
pub struct DispatchHandle {
    shutdown_tx: mpsc::Sender<()>,
    feed: LiveFeed,
    debouncer: Debouncer,
    task: JoinHandle<()>,
}

impl DispatchHandle {
    /// Signal the dispatcher to stop after the notification in hand.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Wait for the dispatch task to exit.
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            warn!(error = ?e, "Dispatch task ended abnormally");
        }
    }

    pub fn feed(&self) -> &LiveFeed {
        &self.feed
    }

    /// Bugs with a change burst still inside its quiet window.
    pub fn pending_bursts(&self) -> usize {
        self.debouncer.pending()
    }
}

/// Routes notifications to the live feed, the debouncer and the sink.
pub struct Dispatcher {
    outbound: Outbound,
    feed: LiveFeed,
    debouncer: Debouncer,
}

impl Dispatcher {
    pub fn new(
        db: &Database,
        resolver: Arc<dyn ActorResolver>,
        sink: Arc<dyn NotificationSink>,
        config: &NotifyConfig,
    ) -> Self {
        let mailer = BugChangeMailer::new(db.bugs.clone(), resolver.clone(), sink.clone());
        Self {
            outbound: Outbound {
                bugs: db.bugs.clone(),
                tags: db.tags.clone(),
                resolver,
                sink,
            },
            feed: LiveFeed {
                hub: BroadcastHub::spawn(),
                ring: RingHandle::spawn(config.recent_capacity),
                buffer: config.live_buffer,
            },
            debouncer: Debouncer::new(config.notification_delay(), Arc::new(mailer)),
        }
    }

    /// Start the dispatch loop and return a handle for control.
    pub fn start(self, receivers: NotificationReceivers) -> DispatchHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let feed = self.feed.clone();
        let debouncer = self.debouncer.clone();
        let task = tokio::spawn(self.run(receivers, shutdown_rx));

        DispatchHandle {
            shutdown_tx,
            feed,
            debouncer,
            task,
        }
    }

    #[instrument(skip_all)]
    async fn run(self, mut rx: NotificationReceivers, mut shutdown_rx: mpsc::Receiver<()>) {
        info!("Notification dispatcher started");

        loop {
            let notification = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Notification dispatcher received shutdown signal");
                    break;
                }
                Some(c) = rx.comments.recv() => Notification::Comment(c),
                Some(a) = rx.attachments.recv() => Notification::Attachment(a),
                Some(a) = rx.assignments.recv() => Notification::Assigned(a),
                Some(c) = rx.changes.recv() => Notification::Changed(c),
                Some(t) = rx.tags.recv() => Notification::TagAssigned(t),
                Some(p) = rx.pings.recv() => Notification::Pinged(p),
                else => {
                    info!("All notification channels closed");
                    break;
                }
            };
            self.dispatch(notification).await;
        }

        info!("Notification dispatcher stopped");
    }

    async fn dispatch(&self, notification: Notification) {
        match notification {
            Notification::Comment(comment) => {
                let Some(bug) = self.outbound.load(&comment.bug_id).await else {
                    return;
                };
                self.feed.publish(LiveEvent::comment(bug.clone(), comment.clone()));
                tokio::spawn(self.outbound.clone().comment(bug, comment));
            }
            Notification::Attachment(attachment) => {
                tokio::spawn(self.outbound.clone().attachment(attachment));
            }
            Notification::Assigned(assignment) => {
                tokio::spawn(self.outbound.clone().assigned(assignment));
            }
            Notification::Changed(event) => {
                if !event.is_exception_marker() {
                    if let Some(bug) = self.outbound.load(&event.bug_id).await {
                        let actor = event.actor.clone().unwrap_or_default();
                        let fields = event.fields.iter().cloned().collect();
                        self.feed.publish(LiveEvent::bug_changed(bug, actor, fields));
                    }
                }
                self.debouncer.add_event(event);
            }
            Notification::TagAssigned(tagged) => {
                tokio::spawn(self.outbound.clone().tag_assigned(tagged));
            }
            Notification::Pinged(ping) => {
                let Some(bug) = self.outbound.load(&ping.bug_id).await else {
                    return;
                };
                self.feed.publish(LiveEvent::ping(bug.clone(), ping.clone()));
                tokio::spawn(self.outbound.clone().ping(bug, ping));
            }
        }
    }
}

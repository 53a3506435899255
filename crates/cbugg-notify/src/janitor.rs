//! Periodic inbox triage.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use cbugg_core::{ActorInfo, BugStatus, Error, Result};
use cbugg_db::BugRepository;

use crate::config::NotifyConfig;

/// Events emitted by the janitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JanitorEvent {
    Started,
    SweepCompleted { moved: usize },
    SweepFailed { error: String },
    Stopped,
}

/// Handle for controlling a running janitor.
pub struct JanitorHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<JanitorEvent>,
}

impl JanitorHandle {
    /// Signal the janitor to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    pub fn events(&self) -> broadcast::Receiver<JanitorEvent> {
        self.event_rx.resubscribe()
    }
}

/// Moves bugs that sat in `inbox` too long to `new`.
pub struct Janitor {
    bugs: BugRepository,
    actor: ActorInfo,
    interval: Duration,
    max_age: Duration,
    event_tx: broadcast::Sender<JanitorEvent>,
}

impl Janitor {
    pub fn new(bugs: BugRepository, config: &NotifyConfig) -> Self {
        let (event_tx, _) = broadcast::channel(16);
        Self {
            bugs,
            actor: ActorInfo::internal(config.mail_from.as_str()),
            interval: config.janitor_interval(),
            max_age: Duration::from_secs(config.inbox_max_age_secs),
            event_tx,
        }
    }

    /// Run one pass. Returns how many bugs were moved.
    ///
    /// A bug that fails to move is logged and skipped.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let inbox = self.bugs.list_by_status(BugStatus::Inbox).await?;

        let mut moved = 0;
        for bug in inbox {
            let old_enough = (now - bug.created_at)
                .to_std()
                .is_ok_and(|age| age >= self.max_age);
            if !old_enough {
                continue;
            }

            info!(bug_id = %bug.id, "Moving bug from inbox to new");
            match self
                .bugs
                .mutate(&bug.id, "status", BugStatus::New.as_str(), &self.actor)
                .await
            {
                Ok(result) if result.is_changed() => moved += 1,
                Ok(_) => debug!(bug_id = %bug.id, "Bug already left the inbox"),
                Err(e) => warn!(bug_id = %bug.id, error = %e, "Failed to move inbox bug"),
            }
        }
        Ok(moved)
    }

    /// Start the sweep loop and return a handle for control.
    pub fn start(self) -> JanitorHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(self.run(shutdown_rx));

        JanitorHandle {
            shutdown_tx,
            event_rx,
        }
    }

    #[instrument(skip_all)]
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Janitor started");
        let _ = self.event_tx.send(JanitorEvent::Started);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Janitor received shutdown signal");
                    break;
                }
                _ = sleep(self.interval) => {}
            }

            debug!("Janitoring");
            match self.sweep().await {
                Ok(moved) => {
                    let _ = self.event_tx.send(JanitorEvent::SweepCompleted { moved });
                }
                Err(e) => {
                    warn!(error = %e, "Inbox sweep failed");
                    let _ = self.event_tx.send(JanitorEvent::SweepFailed {
                        error: e.to_string(),
                    });
                }
            }
        }

        let _ = self.event_tx.send(JanitorEvent::Stopped);
        info!("Janitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cbugg_core::{notification_channels, NewBug, NotificationReceivers};
    use cbugg_db::{Database, MemoryStore, StaticActorResolver};

    fn database() -> (Database, NotificationReceivers) {
        let (notifier, rx) = notification_channels(64);
        let db = Database::new(
            Arc::new(MemoryStore::new()),
            notifier,
            Arc::new(StaticActorResolver::new()),
        );
        (db, rx)
    }

    async fn file_bug(db: &Database, title: &str) -> String {
        db.bugs
            .create(
                NewBug {
                    title: title.to_string(),
                    ..Default::default()
                },
                &ActorInfo::user("reporter@example.com"),
            )
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_sweep_moves_old_inbox_bugs() {
        let (db, _rx) = database();
        let id = file_bug(&db, "stale report").await;
        let config = NotifyConfig::default()
            .with_mail_from("cbugg@example.com")
            .with_inbox_max_age(0);
        let janitor = Janitor::new(db.bugs.clone(), &config);

        assert_eq!(janitor.sweep().await.unwrap(), 1);

        let bug = db.bugs.get(&id).await.unwrap();
        assert_eq!(bug.status, BugStatus::New);
        assert_eq!(bug.mod_by, "cbugg@example.com");

        // Nothing left to move.
        assert_eq!(janitor.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_leaves_young_bugs() {
        let (db, _rx) = database();
        let id = file_bug(&db, "fresh report").await;
        let janitor = Janitor::new(db.bugs.clone(), &NotifyConfig::default());

        assert_eq!(janitor.sweep().await.unwrap(), 0);
        assert_eq!(db.bugs.get(&id).await.unwrap().status, BugStatus::Inbox);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_sweeps_each_interval_and_shuts_down() {
        let (db, _rx) = database();
        file_bug(&db, "stale report").await;
        let config = NotifyConfig::default()
            .with_janitor_interval(60)
            .with_inbox_max_age(0);

        let handle = Janitor::new(db.bugs.clone(), &config).start();
        let mut events = handle.events();

        assert_eq!(events.recv().await.unwrap(), JanitorEvent::Started);
        assert_eq!(
            events.recv().await.unwrap(),
            JanitorEvent::SweepCompleted { moved: 1 }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            JanitorEvent::SweepCompleted { moved: 0 }
        );

        handle.shutdown().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), JanitorEvent::Stopped);
    }
}

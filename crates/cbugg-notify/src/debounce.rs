//! Per-bug change debouncer.
//!
//! Changes to the same bug that arrive within the quiet window collapse into
//! one [`CoalescedChange`]. Each bug with pending changes has its own worker
//! task and timer; the registry maps bug ids to live workers and is the only
//! lock in the pipeline. It is held for the lookup and a non-blocking send,
//! never across an await.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::debug;

use cbugg_core::{visible_recipients, ActorResolver, Bug, ChangeEvent};

/// Union of all change events for one bug within a quiet window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoalescedChange {
    pub bug_id: String,
    pub actors: BTreeSet<String>,
    pub fields: BTreeSet<String>,
    pub except: BTreeSet<String>,
}

impl CoalescedChange {
    pub fn new(bug_id: impl Into<String>) -> Self {
        Self {
            bug_id: bug_id.into(),
            ..Default::default()
        }
    }

    pub fn merge(&mut self, event: ChangeEvent) {
        if let Some(actor) = event.actor.filter(|a| !a.is_empty()) {
            self.actors.insert(actor);
        }
        self.fields.extend(event.fields);
        if let Some(except) = event.except {
            self.except.insert(except);
        }
    }

    /// Addresses left out of the mail. A lone actor already knows what they
    /// did; once several people touched the bug everyone hears about it.
    pub fn exclusions(&self) -> BTreeSet<String> {
        let mut excluded = self.except.clone();
        if self.actors.len() == 1 {
            excluded.extend(self.actors.iter().cloned());
        }
        excluded
    }

    /// Subscribers of `bug` who should be told, in subscription order.
    pub async fn recipients(&self, bug: &Bug, resolver: &dyn ActorResolver) -> Vec<String> {
        let excluded = self.exclusions();
        let candidates: Vec<String> = bug
            .subscribers
            .iter()
            .filter(|s| !excluded.contains(*s))
            .cloned()
            .collect();
        visible_recipients(bug, candidates, resolver).await
    }

    /// Actors joined for display, sorted.
    pub fn actors_string(&self) -> String {
        self.actors.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

/// Receives each burst once its quiet window expires.
#[async_trait]
pub trait FlushHandler: Send + Sync {
    async fn flush(&self, change: CoalescedChange);
}

struct WorkerEntry {
    generation: u64,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

struct Inner {
    workers: Mutex<HashMap<String, WorkerEntry>>,
    next_generation: AtomicU64,
    delay: Duration,
    handler: Arc<dyn FlushHandler>,
}

impl Inner {
    fn workers(&self) -> MutexGuard<'_, HashMap<String, WorkerEntry>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop the registry entry for `bug_id` if it still belongs to this
    /// worker. Once it is gone no new event can reach our channel.
    fn retire(&self, bug_id: &str, generation: u64) {
        let mut workers = self.workers();
        if workers
            .get(bug_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            workers.remove(bug_id);
        }
    }
}

/// Registry of per-bug debounce workers.
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<Inner>,
}

impl Debouncer {
    pub fn new(delay: Duration, handler: Arc<dyn FlushHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                workers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                delay,
                handler,
            }),
        }
    }

    /// Queue an event, starting a worker for its bug if none is running.
    pub fn add_event(&self, event: ChangeEvent) {
        let mut workers = self.inner.workers();

        let event = match workers.get(&event.bug_id) {
            Some(entry) => match entry.tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let bug_id = event.bug_id.clone();
        // The receiver is alive until the worker below exits.
        let _ = tx.send(event);
        workers.insert(bug_id.clone(), WorkerEntry { generation, tx });
        debug!(bug_id = %bug_id, generation, "Started debounce worker");

        tokio::spawn(run_worker(self.inner.clone(), bug_id, generation, rx));
    }

    /// Number of bugs with a burst in progress.
    pub fn pending(&self) -> usize {
        self.inner.workers().len()
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    bug_id: String,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
) {
    let mut pending = CoalescedChange::new(bug_id.as_str());
    let timer = sleep(inner.delay);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    pending.merge(event);
                    timer.as_mut().reset(Instant::now() + inner.delay);
                }
                None => break,
            },
            () = &mut timer => break,
        }
    }

    inner.retire(&bug_id, generation);
    while let Ok(event) = rx.try_recv() {
        pending.merge(event);
    }

    debug!(
        bug_id = %bug_id,
        actors = pending.actors.len(),
        fields = ?pending.fields,
        "Quiet window elapsed, flushing"
    );
    inner.handler.flush(pending).await;
}

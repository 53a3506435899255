//! In-process document store.
//!
//! Every document carries a CAS token that changes on each write. `update`
//! reads the document and its token, runs the transform without holding the
//! lock, and commits only if the token is unchanged, so concurrent writers
//! really do race and retry.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, warn};

use cbugg_core::defaults::STORE_MAX_CAS_RETRIES;
use cbugg_core::{CasDecision, CasOutcome, CasTransform, DocumentStore, Error, Result};

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    cas: u64,
}

#[derive(Debug, Default)]
struct Inner {
    docs: BTreeMap<String, Slot>,
    next_cas: u64,
}

impl Inner {
    fn put(&mut self, key: &str, value: Vec<u8>) {
        self.next_cas += 1;
        self.docs.insert(
            key.to_string(),
            Slot {
                value,
                cas: self.next_cas,
            },
        );
    }

    fn token(&self, key: &str) -> Option<u64> {
        self.docs.get(key).map(|slot| slot.cas)
    }
}

/// Ordered in-memory [`DocumentStore`] with real compare-and-swap semantics.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_retries: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_retries: STORE_MAX_CAS_RETRIES,
        }
    }

    /// Bound the number of attempts `update` makes before giving up.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking transform never runs under the lock, so the map is
        // consistent even if the mutex was poisoned.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rewrite a document in place, bumping its token. Lets tests lose a race
    /// on purpose.
    #[cfg(test)]
    fn touch(&self, key: &str) {
        let mut inner = self.lock();
        if let Some(value) = inner.docs.get(key).map(|slot| slot.value.clone()) {
            inner.put(key, value);
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().docs.get(key).map(|slot| slot.value.clone()))
    }

    async fn add(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let mut inner = self.lock();
        if inner.docs.contains_key(key) {
            return Ok(false);
        }
        inner.put(key, value);
        Ok(true)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.lock().put(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock().docs.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.lock();
        Ok(inner
            .docs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, slot)| (key.clone(), slot.value.clone()))
            .collect())
    }

    async fn update(&self, key: &str, transform: &mut CasTransform<'_>) -> Result<CasOutcome> {
        for attempt in 1..=self.max_retries {
            let (current, seen) = {
                let inner = self.lock();
                match inner.docs.get(key) {
                    Some(slot) => (Some(slot.value.clone()), Some(slot.cas)),
                    None => (None, None),
                }
            };

            let (value, companions) = match transform(current.as_deref())? {
                CasDecision::Cancel => return Ok(CasOutcome::Cancelled),
                CasDecision::Write { value, companions } => (value, companions),
            };

            {
                let mut inner = self.lock();
                if inner.token(key) == seen {
                    inner.put(key, value);
                    for (companion_key, companion) in companions {
                        inner.put(&companion_key, companion);
                    }
                    return Ok(CasOutcome::Committed);
                }
            }

            debug!(key, attempt, "CAS conflict, retrying");
            tokio::task::yield_now().await;
        }

        warn!(key, retries = self.max_retries, "CAS retry budget exhausted");
        Err(Error::Conflict(key.to_string()))
    }
}

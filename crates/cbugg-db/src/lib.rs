//! # cbugg-db
//!
//! Document store and record repositories for cbugg.
//!
//! This crate provides:
//! - An in-memory [`DocumentStore`] with compare-and-swap updates
//! - The bug repository, which is the record mutation engine
//! - Comment and tag repositories
//! - A static actor directory
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cbugg_db::{Database, MemoryStore, StaticActorResolver};
//!
//! let (notifier, receivers) = cbugg_core::notification_channels(100);
//! let db = Database::new(
//!     Arc::new(MemoryStore::new()),
//!     notifier,
//!     Arc::new(StaticActorResolver::new()),
//! );
//! let bug = db.bugs.create(new_bug, &actor).await?;
//! db.bugs.mutate(&bug.id, "status", "open", &actor).await?;
//! ```

use std::sync::Arc;

pub mod bugs;
pub mod comments;
pub mod memory;
pub mod resolver;
pub mod tags;

// Re-export core types
pub use cbugg_core::*;

pub use bugs::{BugRepository, DeleteReport};
pub use comments::CommentRepository;
pub use memory::MemoryStore;
pub use resolver::StaticActorResolver;
pub use tags::TagRepository;

/// Combined context with all repositories over one store.
#[derive(Clone)]
pub struct Database {
    /// The underlying document store.
    pub store: Arc<dyn DocumentStore>,
    /// Bug repository and mutation engine.
    pub bugs: BugRepository,
    /// Comment repository.
    pub comments: CommentRepository,
    /// Tag subscription repository.
    pub tags: TagRepository,
}

impl Database {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        notifier: Notifier,
        resolver: Arc<dyn ActorResolver>,
    ) -> Self {
        let bugs = BugRepository::new(store.clone(), notifier, resolver);
        Self {
            comments: CommentRepository::new(bugs.clone()),
            tags: TagRepository::new(store.clone()),
            bugs,
            store,
        }
    }
}

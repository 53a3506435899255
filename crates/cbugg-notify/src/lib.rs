//! # cbugg-notify
//!
//! Change notification pipeline for cbugg.
//!
//! This crate provides:
//! - A dispatch loop draining the typed notification channels
//! - A per-bug debouncer that coalesces bursts of edits into one mail
//! - A broadcast hub and recent-change ring feeding live subscribers
//! - Message templates and a logging sink
//! - A janitor that triages stale inbox bugs
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cbugg_db::{Database, MemoryStore, StaticActorResolver};
//! use cbugg_notify::{Dispatcher, LogSink, NotifyConfig};
//!
//! let config = NotifyConfig::from_env();
//! let resolver = Arc::new(StaticActorResolver::new());
//! let (notifier, receivers) = cbugg_core::notification_channels(config.channel_capacity);
//! let db = Database::new(Arc::new(MemoryStore::new()), notifier, resolver.clone());
//!
//! let handle = Dispatcher::new(&db, resolver, Arc::new(LogSink::new(&config)), &config)
//!     .start(receivers);
//!
//! // Live subscribers get the recent backlog plus a channel of new events.
//! let (backlog, subscription) = handle.feed().connect().await?;
//!
//! handle.shutdown().await?;
//! ```

pub mod config;
pub mod debounce;
pub mod dispatch;
pub mod hub;
pub mod janitor;
pub mod live;
pub mod ring;
pub mod sink;
pub mod templates;

pub use config::NotifyConfig;
pub use debounce::{CoalescedChange, Debouncer, FlushHandler};
pub use dispatch::{BugChangeMailer, DispatchHandle, Dispatcher, LiveFeed, Notification};
pub use hub::{BroadcastHub, SubscriberId, Subscription};
pub use janitor::{Janitor, JanitorEvent, JanitorHandle};
pub use live::{ChangeNotification, LiveEvent};
pub use ring::{ChangeRing, RingHandle};
pub use sink::LogSink;
pub use templates::{human_bytes, render, Envelope};

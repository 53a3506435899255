//! # cbugg-core
//!
//! Core types, traits, and change events for the cbugg issue tracker.
//!
//! This crate provides the record and history models, the error taxonomy,
//! the visibility rule, and the collaborator interfaces (document store,
//! notification sink, actor directory) the other cbugg crates build on.

pub mod defaults;
pub mod error;
pub mod events;
pub mod models;
pub mod tags;
pub mod traits;
pub mod visibility;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{
    notification_channels, Assignment, ChangeEvent, NotificationReceivers, Notifier,
    TagAssignment,
};
pub use models::*;
pub use tags::{added_tags, join_tags, parse_tags};
pub use traits::*;
pub use visibility::{visible_recipients, PartiallyVisible};

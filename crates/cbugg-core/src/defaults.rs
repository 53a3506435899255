//! Centralized default constants for cbugg.
//!
//! Every crate and the daemon reference these instead of defining their own
//! magic numbers.

// =============================================================================
// NOTIFICATION PIPELINE
// =============================================================================

/// Quiet window a bug must stay untouched before its change burst is mailed.
pub const NOTIFICATION_DELAY_MS: u64 = 10_000;

/// Buffer size of each typed notification channel feeding the dispatch loop.
pub const NOTIFY_CHANNEL_CAPACITY: usize = 100;

/// Outbound buffer per live subscriber. A subscriber that falls this far
/// behind is evicted.
pub const LIVE_SUBSCRIBER_BUFFER: usize = 256;

/// Number of recent live events kept for newly connected subscribers.
pub const RECENT_CHANGES_CAPACITY: usize = 100;

// =============================================================================
// STORE
// =============================================================================

/// CAS attempts the in-memory store makes before reporting a conflict.
pub const STORE_MAX_CAS_RETRIES: usize = 1_000;

/// Key of the counter document bug ids are drawn from.
pub const BUG_ID_COUNTER_KEY: &str = ".bugid";

// =============================================================================
// BUGS
// =============================================================================

/// Shortest accepted bug title, in characters.
pub const MIN_TITLE_LEN: usize = 4;

// =============================================================================
// JANITOR
// =============================================================================

/// How often the janitor sweeps the inbox.
pub const JANITOR_INTERVAL_SECS: u64 = 3_600;

/// Age after which an untouched inbox bug is moved to `new`.
pub const INBOX_MAX_AGE_SECS: u64 = 3_600;

// =============================================================================
// SERVER
// =============================================================================

/// Base URL used when rendering links in notifications.
pub const BASE_URL: &str = "http://localhost:8066";

//! Push-channel category and event name constants.
//!
//! Every inbound frame carries a category (which family of payloads it
//! belongs to) and an event name within that family. Subscribers key on
//! these constants rather than on string literals.

/// Generation job lifecycle updates (progress, completion, failure).
pub const CATEGORY_GENERATION: &str = "generation";

/// Export job progress. Not consumed by the task store.
pub const CATEGORY_EXPORT: &str = "export";

/// Generic user-facing notifications.
pub const CATEGORY_NOTIFICATION: &str = "notification";

/// Reserved for envelopes synthesised by the connection manager itself.
/// The server never sends frames in this category.
pub const CATEGORY_SYSTEM: &str = "system";

/// Key that matches every envelope regardless of category or event.
pub const WILDCARD: &str = "*";

// ---------------------------------------------------------------------------
// Generation events
// ---------------------------------------------------------------------------

/// Progress update during generation (percentage + current step).
pub const EVENT_PROGRESS: &str = "progress";

/// Generation completed successfully.
pub const EVENT_COMPLETED: &str = "completed";

/// Generation failed with an error.
pub const EVENT_FAILED: &str = "failed";

/// Generation was cancelled (by user or system).
pub const EVENT_CANCELLED: &str = "cancelled";

// ---------------------------------------------------------------------------
// System events
// ---------------------------------------------------------------------------

/// The push channel finished its handshake and is open.
pub const EVENT_CONNECTED: &str = "connected";

/// The push channel closed, deliberately or not.
pub const EVENT_DISCONNECTED: &str = "disconnected";

/// Reconnection gave up after exhausting its attempt budget.
pub const EVENT_RECONNECT_FAILED: &str = "reconnect_failed";

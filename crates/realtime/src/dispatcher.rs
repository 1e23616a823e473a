//! Typed publish/subscribe registry for push envelopes.
//!
//! [`EventDispatcher`] holds handlers keyed by [`SubscriptionKey`] and
//! delivers each envelope synchronously in three tiers: exact
//! `category:event` subscribers first, then bare-category subscribers, then
//! wildcard subscribers. Within a tier handlers run in registration order.
//! A failing or panicking handler is logged and skipped; the remaining
//! handlers still run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use anyhow::Context;
use serde::de::DeserializeOwned;

use mangaforge_core::events::WILDCARD;

use crate::envelope::{parse_envelope, Envelope};

/// Boxed subscriber callback.
pub type Handler = Arc<dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync>;

// ---------------------------------------------------------------------------
// SubscriptionKey
// ---------------------------------------------------------------------------

/// What a subscription matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    /// One event within one category.
    Exact { category: String, event: String },
    /// Every event of a category.
    Category(String),
    /// Every envelope.
    Wildcard,
}

impl SubscriptionKey {
    pub fn exact(category: impl Into<String>, event: impl Into<String>) -> Self {
        Self::Exact {
            category: category.into(),
            event: event.into(),
        }
    }

    pub fn category(category: impl Into<String>) -> Self {
        Self::Category(category.into())
    }
}

/// Parses the string forms `"*"`, `"category"` and `"category:event"`.
impl From<&str> for SubscriptionKey {
    fn from(value: &str) -> Self {
        if value == WILDCARD {
            return Self::Wildcard;
        }
        match value.split_once(':') {
            Some((category, event)) => Self::exact(category, event),
            None => Self::category(value),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact { category, event } => write!(f, "{category}:{event}"),
            Self::Category(category) => f.write_str(category),
            Self::Wildcard => f.write_str(WILDCARD),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Identifies one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<SubscriptionKey, Vec<(SubscriptionId, Handler)>>,
}

impl Registry {
    fn insert(&mut self, key: SubscriptionKey, handler: Handler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers.entry(key).or_default().push((id, handler));
        id
    }

    /// Remove one handler, dropping the key once its list is empty.
    fn remove(&mut self, key: &SubscriptionKey, id: SubscriptionId) -> bool {
        let Some(list) = self.handlers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.handlers.remove(key);
        }
        removed
    }
}

fn read(registry: &RwLock<Registry>) -> RwLockReadGuard<'_, Registry> {
    registry.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(registry: &RwLock<Registry>) -> RwLockWriteGuard<'_, Registry> {
    registry.write().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Subscription handle
// ---------------------------------------------------------------------------

/// Handle returned by [`EventDispatcher::on`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`unsubscribe`](Self::unsubscribe) to remove exactly this handler.
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Subscription {
    key: SubscriptionKey,
    id: SubscriptionId,
    registry: Weak<RwLock<Registry>>,
}

impl Subscription {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove this handler. Returns `false` if it was already removed
    /// (e.g. by [`EventDispatcher::off`]) or the dispatcher is gone.
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => write(&registry).remove(&self.key, self.id),
            None => false,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventDispatcher
// ---------------------------------------------------------------------------

/// Routes decoded envelopes to registered handlers.
///
/// Shared via `Arc<EventDispatcher>` between the connection manager (which
/// feeds it) and the components that subscribe.
#[derive(Default)]
pub struct EventDispatcher {
    registry: Arc<RwLock<Registry>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `key`.
    pub fn on<F>(&self, key: impl Into<SubscriptionKey>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let key = key.into();
        let id = write(&self.registry).insert(key.clone(), Arc::new(handler));
        tracing::trace!(key = %key, ?id, "Subscribed");
        Subscription {
            key,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Register a handler that receives the payload decoded as `T`.
    ///
    /// A payload that does not decode counts as a handler failure: it is
    /// logged and the other subscribers still run.
    pub fn on_typed<T, F>(&self, key: impl Into<SubscriptionKey>, handler: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T, &Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(key, move |envelope: &Envelope| {
            let payload = envelope.decode_data::<T>().with_context(|| {
                format!(
                    "payload of {}:{} does not match the expected shape",
                    envelope.category, envelope.event
                )
            })?;
            handler(payload, envelope)
        })
    }

    /// Remove one handler (`Some(id)`) or every handler (`None`) for `key`.
    ///
    /// Returns the number of handlers removed.
    pub fn off(&self, key: &SubscriptionKey, id: Option<SubscriptionId>) -> usize {
        let mut registry = write(&self.registry);
        match id {
            Some(id) => usize::from(registry.remove(key, id)),
            None => registry.handlers.remove(key).map_or(0, |list| list.len()),
        }
    }

    /// Deliver `envelope` to every matching handler.
    ///
    /// Returns the number of handlers that completed without error.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let targets = self.matching_handlers(envelope);
        if targets.is_empty() {
            tracing::trace!(
                category = %envelope.category,
                event = %envelope.event,
                "No subscribers for envelope",
            );
            return 0;
        }

        let mut delivered = 0;
        for (key, id, handler) in targets {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(
                        key = %key,
                        ?id,
                        category = %envelope.category,
                        event = %envelope.event,
                        error = %format_args!("{e:#}"),
                        "Event handler failed",
                    );
                }
                Err(_) => {
                    tracing::error!(
                        key = %key,
                        ?id,
                        category = %envelope.category,
                        event = %envelope.event,
                        "Event handler panicked",
                    );
                }
            }
        }
        delivered
    }

    /// Decode a raw text frame and dispatch it. Malformed frames are
    /// logged and dropped.
    pub fn dispatch_raw(&self, text: &str) -> usize {
        match parse_envelope(text) {
            Ok(envelope) => self.dispatch(&envelope),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    raw_message = %text,
                    "Dropping malformed push frame",
                );
                0
            }
        }
    }

    /// Total number of registered handlers across all keys.
    pub fn handler_count(&self) -> usize {
        read(&self.registry).handlers.values().map(Vec::len).sum()
    }

    /// Number of distinct keys with at least one handler.
    pub fn key_count(&self) -> usize {
        read(&self.registry).handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.registry).handlers.is_empty()
    }

    /// Snapshot the handlers for `envelope` in delivery order. The lock is
    /// released before any handler runs so handlers may (un)subscribe.
    fn matching_handlers(
        &self,
        envelope: &Envelope,
    ) -> Vec<(SubscriptionKey, SubscriptionId, Handler)> {
        let tiers = [
            SubscriptionKey::exact(envelope.category.as_str(), envelope.event.as_str()),
            SubscriptionKey::category(envelope.category.as_str()),
            SubscriptionKey::Wildcard,
        ];

        let registry = read(&self.registry);
        let mut targets = Vec::new();
        for key in tiers {
            if let Some(list) = registry.handlers.get(&key) {
                targets.extend(
                    list.iter()
                        .map(|(id, handler)| (key.clone(), *id, Arc::clone(handler))),
                );
            }
        }
        targets
    }
}

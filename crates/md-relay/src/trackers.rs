//! Small TTL tables kept next to the retry queue. They are swept on every
//! scheduler tick and lazily on writes.

use crate::{Jid, Message};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Map whose entries expire `ttl_ms` after their last write. Writes also
/// drop expired entries, at most once per `ttl_ms`, so the table stays
/// bounded when nothing calls [`TrackerTable::sweep`].
pub struct TrackerTable<K, V> {
    ttl_ms: u64,
    inner: Mutex<TableInner<K, V>>,
}

struct TableInner<K, V> {
    entries: HashMap<K, (V, u64)>,
    next_sweep_at: u64,
}

impl<K: Eq + Hash, V> TableInner<K, V> {
    fn sweep(&mut self, now: u64, ttl_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        self.next_sweep_at = now + ttl_ms;
        before - self.entries.len()
    }

    fn sweep_if_due(&mut self, now: u64, ttl_ms: u64) {
        if now >= self.next_sweep_at {
            self.sweep(now, ttl_ms);
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> TrackerTable<K, V> {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                next_sweep_at: 0,
            }),
        }
    }

    pub fn insert(&self, key: K, value: V, now: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.sweep_if_due(now, self.ttl_ms);
        inner.entries.insert(key, (value, now + self.ttl_ms));
    }

    pub fn get(&self, key: &K, now: u64) -> Option<V> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone())
    }

    /// Read-modify-write under one lock. Expired values are seen as absent.
    pub fn update<R>(&self, key: K, now: u64, f: impl FnOnce(Option<V>) -> (V, R)) -> R {
        let mut inner = self.inner.lock().unwrap();
        inner.sweep_if_due(now, self.ttl_ms);
        let current = inner
            .entries
            .remove(&key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value);
        let (next, out) = f(current);
        inner.entries.insert(key, (next, now + self.ttl_ms));
        out
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .remove(key)
            .map(|(value, _)| value)
    }

    pub fn sweep(&self, now: u64) -> usize {
        self.inner.lock().unwrap().sweep(now, self.ttl_ms)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Available,
    Unavailable,
    Composing,
    Recording,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub presence: Presence,
    pub at: u64,
}

pub struct PresenceTracker {
    table: TrackerTable<Jid, PresenceUpdate>,
}

impl PresenceTracker {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            table: TrackerTable::new(ttl_ms),
        }
    }

    pub fn update(&self, jid: &Jid, presence: Presence, now: u64) {
        self.table
            .insert(jid.to_non_device(), PresenceUpdate { presence, at: now }, now);
    }

    pub fn get(&self, jid: &Jid, now: u64) -> Option<PresenceUpdate> {
        self.table.get(&jid.to_non_device(), now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Edit,
    Revoke,
    Reaction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub kind: MutationKind,
    /// Id of the stanza that carried the mutation.
    pub message_id: String,
    pub at: u64,
}

/// Edits, deletes and reactions we sent, keyed by the message they target.
pub struct MutationTracker {
    table: TrackerTable<String, Vec<Mutation>>,
}

impl MutationTracker {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            table: TrackerTable::new(ttl_ms),
        }
    }

    /// Records `message` if it mutates another message.
    pub fn observe(&self, message_id: &str, message: &Message, now: u64) -> bool {
        let (target, kind) = match message {
            Message::Edit { key, .. } => (key.id.clone(), MutationKind::Edit),
            Message::Revoke { key } => (key.id.clone(), MutationKind::Revoke),
            Message::Reaction { key, .. } => (key.id.clone(), MutationKind::Reaction),
            _ => return false,
        };
        let mutation = Mutation {
            kind,
            message_id: message_id.to_string(),
            at: now,
        };
        self.table.update(target, now, |history| {
            let mut history = history.unwrap_or_default();
            history.push(mutation);
            (history, ())
        });
        true
    }

    pub fn history(&self, target_id: &str, now: u64) -> Vec<Mutation> {
        self.table
            .get(&target_id.to_string(), now)
            .unwrap_or_default()
    }
}

/// Messages we sent recently, kept so retry receipts can re-encrypt them.
pub struct RecentMessageCache {
    table: TrackerTable<(Jid, String), Message>,
}

impl RecentMessageCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            table: TrackerTable::new(ttl_ms),
        }
    }

    pub fn insert(&self, jid: &Jid, message_id: &str, message: Message, now: u64) {
        self.table
            .insert((jid.to_non_device(), message_id.to_string()), message, now);
    }

    pub fn get(&self, jid: &Jid, message_id: &str, now: u64) -> Option<Message> {
        self.table
            .get(&(jid.to_non_device(), message_id.to_string()), now)
    }
}

/// How many retry receipts each (message, device) pair has sent us.
pub struct RetryReceiptCounter {
    table: TrackerTable<String, u32>,
}

impl RetryReceiptCounter {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            table: TrackerTable::new(ttl_ms),
        }
    }

    /// Increments and returns the new count.
    pub fn bump(&self, message_id: &str, requester: &Jid, now: u64) -> u32 {
        self.table
            .update(format!("{message_id}/{requester}"), now, |count| {
                let next = count.unwrap_or(0) + 1;
                (next, next)
            })
    }
}

/// Every side table the relay maintains.
pub struct Trackers {
    pub presence: PresenceTracker,
    pub mutations: MutationTracker,
    pub recent: RecentMessageCache,
    pub retry_receipts: RetryReceiptCounter,
}

impl Trackers {
    pub fn new(config: &crate::RelayConfig) -> Self {
        Self {
            presence: PresenceTracker::new(config.presence_ttl_ms),
            mutations: MutationTracker::new(config.mutation_ttl_ms),
            recent: RecentMessageCache::new(config.recent_message_ttl_ms),
            retry_receipts: RetryReceiptCounter::new(config.retry_receipt_ttl_ms),
        }
    }

    pub fn sweep(&self, now: u64) -> usize {
        self.presence.table.sweep(now)
            + self.mutations.table.sweep(now)
            + self.recent.table.sweep(now)
            + self.retry_receipts.table.sweep(now)
    }
}

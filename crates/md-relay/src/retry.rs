use crate::relay::{MessageRelay, RelayOptions};
use crate::storage::put_json;
use crate::{Error, Jid, Message, Result, StorageAdapter};
use crossbeam_channel::{select, Sender};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    30 * 60 * 1000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_tick_interval_ms() -> u64 {
    10_000
}

fn default_inactive_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound of the random extra delay, as a fraction of the backoff.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How long an exhausted record is kept before it is purged.
    #[serde(default = "default_inactive_ttl_ms")]
    pub inactive_ttl_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_ratio: default_jitter_ratio(),
            tick_interval_ms: default_tick_interval_ms(),
            inactive_ttl_ms: default_inactive_ttl_ms(),
        }
    }
}

impl RetryConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Delay before attempt `attempt + 1`, without jitter.
    pub fn base_backoff(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms)
    }

    pub fn backoff(&self, attempt: u32) -> u64 {
        let base = self.base_backoff(attempt);
        let max_jitter = (base as f64 * self.jitter_ratio) as u64;
        if max_jitter == 0 {
            return base;
        }
        base + rand::thread_rng().gen_range(0..=max_jitter)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 || self.max_delay_ms < self.base_delay_ms {
            return Err(Error::Config(format!(
                "retry delays must satisfy 0 < base ({}) <= max ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(Error::Config(format!(
                "jitter_ratio {} outside 0..=1",
                self.jitter_ratio
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryState {
    Active,
    Inactive,
}

/// A message that has not been confirmed delivered yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRecord {
    pub message_id: String,
    pub jid: Jid,
    pub message: Message,
    pub options: RelayOptions,
    pub attempt_count: u32,
    pub next_attempt_at: u64,
    pub delay_ms: u64,
    pub errors: Vec<String>,
    pub state: RetryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_since: Option<u64>,
    pub created_at: u64,
    /// Set while some thread is delivering the record.
    #[serde(skip)]
    pub in_flight: bool,
}

impl RetryRecord {
    pub fn new(message_id: impl Into<String>, jid: Jid, message: Message, options: RelayOptions) -> Self {
        let now = now_ms();
        Self {
            message_id: message_id.into(),
            jid,
            message,
            options,
            attempt_count: 0,
            next_attempt_at: now,
            delay_ms: 0,
            errors: Vec::new(),
            state: RetryState::Active,
            inactive_since: None,
            created_at: now,
            in_flight: false,
        }
    }

    fn is_due(&self, now: u64) -> bool {
        self.state == RetryState::Active && !self.in_flight && self.next_attempt_at <= now
    }
}

/// Table of unconfirmed sends, optionally written through to storage under
/// `prefix`.
pub struct RetryQueue {
    config: RetryConfig,
    storage: Option<Arc<dyn StorageAdapter>>,
    prefix: String,
    records: Mutex<HashMap<String, RetryRecord>>,
}

impl RetryQueue {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            storage: None,
            prefix: String::new(),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// A queue persisted under `prefix`, seeded with whatever is stored.
    pub fn persistent(
        config: RetryConfig,
        storage: Arc<dyn StorageAdapter>,
        prefix: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix.into();
        let mut records = HashMap::new();
        for key in storage.list(&prefix)? {
            let Some(raw) = storage.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<RetryRecord>(&raw) {
                Ok(record) => {
                    records.insert(record.message_id.clone(), record);
                }
                Err(e) => warn!(key, error = %e, "dropping unreadable retry record"),
            }
        }
        if !records.is_empty() {
            info!(count = records.len(), "restored retry records");
        }
        Ok(Self {
            config,
            storage: Some(storage),
            prefix,
            records: Mutex::new(records),
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Adds a record that the caller is about to deliver itself.
    pub fn enqueue_in_flight(&self, mut record: RetryRecord) -> Result<()> {
        record.in_flight = true;
        self.persist(&record)?;
        self.records
            .lock()
            .unwrap()
            .insert(record.message_id.clone(), record);
        Ok(())
    }

    pub fn get(&self, message_id: &str) -> Option<RetryRecord> {
        self.records.lock().unwrap().get(message_id).cloned()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.records.lock().unwrap().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, message_id: &str) -> Result<Option<RetryRecord>> {
        let removed = self.records.lock().unwrap().remove(message_id);
        if removed.is_some() {
            self.unpersist(message_id)?;
        }
        Ok(removed)
    }

    /// Ids of active records due at `now`, oldest deadline first.
    pub fn due(&self, now: u64) -> Vec<String> {
        let records = self.records.lock().unwrap();
        let mut due: Vec<_> = records
            .values()
            .filter(|r| r.is_due(now))
            .map(|r| (r.next_attempt_at, r.message_id.clone()))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Marks a due record as in flight and returns a copy to deliver. `None`
    /// if it was removed, claimed elsewhere or is no longer due.
    pub fn claim(&self, message_id: &str, now: u64) -> Option<RetryRecord> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(message_id)?;
        if !record.is_due(now) {
            return None;
        }
        record.in_flight = true;
        Some(record.clone())
    }

    /// Books a failed attempt. Returns the resulting state, or `None` if the
    /// record is gone.
    pub fn record_failure(&self, message_id: &str, error: &str, now: u64) -> Result<Option<RetryState>> {
        let updated = {
            let mut records = self.records.lock().unwrap();
            let Some(record) = records.get_mut(message_id) else {
                return Ok(None);
            };
            record.in_flight = false;
            record.attempt_count += 1;
            record.errors.push(error.to_string());
            if record.attempt_count >= self.config.max_attempts {
                record.state = RetryState::Inactive;
                record.inactive_since = Some(now);
            } else {
                record.delay_ms = self.config.backoff(record.attempt_count);
                record.next_attempt_at = now + record.delay_ms;
            }
            record.clone()
        };
        self.persist(&updated)?;
        Ok(Some(updated.state))
    }

    /// Drops inactive records older than the configured TTL.
    pub fn purge(&self, now: u64) -> Result<usize> {
        let expired: Vec<String> = {
            let mut records = self.records.lock().unwrap();
            let ttl = self.config.inactive_ttl_ms;
            let expired: Vec<String> = records
                .values()
                .filter(|r| r.inactive_since.is_some_and(|since| since + ttl <= now))
                .map(|r| r.message_id.clone())
                .collect();
            for id in &expired {
                records.remove(id);
            }
            expired
        };
        for id in &expired {
            self.unpersist(id)?;
        }
        Ok(expired.len())
    }

    fn persist(&self, record: &RetryRecord) -> Result<()> {
        match &self.storage {
            Some(storage) => put_json(
                storage.as_ref(),
                &format!("{}{}", self.prefix, record.message_id),
                record,
            ),
            None => Ok(()),
        }
    }

    fn unpersist(&self, message_id: &str) -> Result<()> {
        match &self.storage {
            Some(storage) => storage.del(&format!("{}{}", self.prefix, message_id)),
            None => Ok(()),
        }
    }
}

/// Background thread that ticks the relay's retry queue. Stops when dropped.
pub struct RetryScheduler {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl RetryScheduler {
    pub(crate) fn spawn(relay: Weak<MessageRelay>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = std::thread::spawn(move || {
            let ticker = crossbeam_channel::tick(interval);
            info!(interval_ms = interval.as_millis() as u64, "retry scheduler started");
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        let Some(relay) = relay.upgrade() else {
                            break;
                        };
                        relay.run_retry_tick();
                    }
                }
            }
            info!("retry scheduler stopped");
        });
        Self {
            stop_tx,
            handle: Some(handle),
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            // The worker can end up dropping the last relay handle itself.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

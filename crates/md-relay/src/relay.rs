use crate::config::RelayConfig;
use crate::credentials::{Credentials, CredentialsHandle};
use crate::crypto::{CryptoPrimitives, CryptoRepository};
use crate::devices::DeviceDirectory;
use crate::groups::{AddressingMode, GroupDirectory};
use crate::message::generate_message_id;
use crate::retry::{now_ms, RetryQueue, RetryRecord, RetryScheduler, RetryState};
use crate::sender_key_memory::SenderKeyMemory;
use crate::session_store::{SenderKeyName, SessionStore};
use crate::sessions::SessionAssertion;
use crate::stanza::{participant_hash, DeviceCiphertext, StanzaBuilder};
use crate::trackers::{Presence, PresenceUpdate, Trackers};
use crate::{BinaryNode, Error, Jid, Message, Result, StorageAdapter, Transport};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const RETRY_QUEUE_PREFIX: &str = "v1/retry-queue/";

fn default_true() -> bool {
    true
}

/// Per-call knobs for [`MessageRelay::relay`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayOptions {
    /// Reuse this id instead of generating one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Deliver to exactly this device, typically in answer to a retry receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<Jid>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_attributes: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub use_user_devices_cache: bool,
    #[serde(default)]
    pub use_cached_group_metadata: bool,
    /// Recipients of a status or broadcast-list post.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status_jid_list: Vec<Jid>,
    /// Written as `count` on pairwise `enc` nodes when non-zero.
    #[serde(default)]
    pub retry_count: u32,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            message_id: None,
            participant: None,
            additional_attributes: BTreeMap::new(),
            use_user_devices_cache: true,
            use_cached_group_metadata: false,
            status_jid_list: Vec::new(),
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Group,
    /// Status updates and broadcast lists; both use sender keys.
    Status,
    Newsletter,
    Lid,
    Individual,
}

impl DestinationKind {
    pub fn classify(jid: &Jid) -> Self {
        if jid.is_group() {
            DestinationKind::Group
        } else if jid.is_broadcast() {
            DestinationKind::Status
        } else if jid.is_newsletter() {
            DestinationKind::Newsletter
        } else if jid.is_lid() {
            DestinationKind::Lid
        } else {
            DestinationKind::Individual
        }
    }

    fn uses_sender_key(&self) -> bool {
        matches!(self, DestinationKind::Group | DestinationKind::Status)
    }
}

/// One unit of outbound work.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub destination: Jid,
    pub kind: DestinationKind,
    pub message: Message,
    pub message_id: String,
    pub participant: Option<Jid>,
    pub attributes: BTreeMap<String, String>,
    pub count: Option<u32>,
}

/// Inbound request from a device that failed to decrypt one of our messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReceipt {
    pub message_id: String,
    /// Chat the original message was sent to.
    pub remote_jid: Jid,
    /// Requesting device. Defaults to `remote_jid` for 1:1 chats.
    pub participant: Option<Jid>,
    pub retry_count: u32,
}

/// Outcome of one pass over the retry queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
    pub purged: usize,
    pub swept: usize,
}

struct PreparedStanza {
    node: BinaryNode,
    /// Devices to mark in sender-key memory once the stanza is handed off.
    informed: Option<(Jid, Vec<Jid>)>,
}

/// Turns one logical message into a stanza addressed to every device that
/// should receive it, and keeps unconfirmed sends in the retry queue.
pub struct MessageRelay {
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialsHandle>,
    crypto: Arc<CryptoRepository>,
    devices: DeviceDirectory,
    sessions: SessionAssertion,
    groups: GroupDirectory,
    sender_keys: SenderKeyMemory,
    retry: RetryQueue,
    trackers: Trackers,
    tick_lock: Mutex<()>,
    scheduler: Mutex<Option<RetryScheduler>>,
}

impl MessageRelay {
    pub fn new(
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn StorageAdapter>,
        primitives: Arc<dyn CryptoPrimitives>,
        credentials: Arc<CredentialsHandle>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let crypto = Arc::new(CryptoRepository::new(
            SessionStore::new(storage.clone()),
            primitives,
        ));
        let retry = if config.persist_retry_queue {
            RetryQueue::persistent(config.retry.clone(), storage.clone(), RETRY_QUEUE_PREFIX)?
        } else {
            RetryQueue::new(config.retry.clone())
        };

        Ok(Arc::new(Self {
            devices: DeviceDirectory::new(transport.clone(), credentials.clone()),
            sessions: SessionAssertion::new(transport.clone(), crypto.clone()),
            groups: GroupDirectory::new(transport.clone()),
            sender_keys: SenderKeyMemory::new(storage),
            trackers: Trackers::new(&config),
            retry,
            crypto,
            credentials,
            transport,
            config,
            tick_lock: Mutex::new(()),
            scheduler: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialsHandle> {
        &self.credentials
    }

    pub fn crypto(&self) -> &Arc<CryptoRepository> {
        &self.crypto
    }

    pub fn devices(&self) -> &DeviceDirectory {
        &self.devices
    }

    pub fn sessions(&self) -> &SessionAssertion {
        &self.sessions
    }

    pub fn groups(&self) -> &GroupDirectory {
        &self.groups
    }

    pub fn sender_key_memory(&self) -> &SenderKeyMemory {
        &self.sender_keys
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    pub fn trackers(&self) -> &Trackers {
        &self.trackers
    }

    /// Encrypts `message` for every device behind `jid` and hands the stanza
    /// to the transport. Returns the message id.
    pub fn relay(&self, jid: &Jid, message: &Message, options: RelayOptions) -> Result<String> {
        let credentials = self.credentials.snapshot();
        let destination = jid.to_non_device();
        let ctx = RelayContext {
            kind: DestinationKind::classify(&destination),
            message_id: options
                .message_id
                .clone()
                .unwrap_or_else(|| generate_message_id(credentials.me.user())),
            message: message.clone(),
            participant: options.participant.clone(),
            attributes: options.additional_attributes.clone(),
            count: (options.retry_count > 0).then_some(options.retry_count),
            destination,
        };

        let prepared = match ctx.kind {
            DestinationKind::Group | DestinationKind::Status => {
                self.prepare_group(&ctx, &credentials, &options)?
            }
            DestinationKind::Newsletter => self.prepare_newsletter(&ctx, &credentials)?,
            DestinationKind::Individual | DestinationKind::Lid => {
                self.prepare_pairwise(&ctx, &credentials, &options)?
            }
        };

        self.transport.send(prepared.node)?;
        // Handed off: failures below are logged, not returned.
        if let Some((group, devices)) = prepared.informed {
            if let Err(e) = self.sender_keys.mark(&group, &devices) {
                warn!(message_id = %ctx.message_id, %group, error = %e, "failed to record sender-key recipients");
            }
        }

        let now = now_ms();
        self.trackers
            .recent
            .insert(&ctx.destination, &ctx.message_id, ctx.message.clone(), now);
        self.trackers.mutations.observe(&ctx.message_id, &ctx.message, now);
        debug!(message_id = %ctx.message_id, to = %ctx.destination, kind = ?ctx.kind, "relayed message");
        Ok(ctx.message_id)
    }

    /// Relays `message` and keeps it in the retry queue until it either goes
    /// through or fails in a way retrying cannot fix.
    pub fn send_message(&self, jid: &Jid, message: Message, mut options: RelayOptions) -> Result<String> {
        let message_id = options
            .message_id
            .get_or_insert_with(|| generate_message_id(self.credentials.me().user()))
            .clone();
        self.retry.enqueue_in_flight(RetryRecord::new(
            message_id.clone(),
            jid.clone(),
            message.clone(),
            options.clone(),
        ))?;

        match self.relay(jid, &message, options) {
            Ok(id) => {
                if let Err(e) = self.retry.remove(&id) {
                    warn!(message_id = %id, error = %e, "failed to drop delivered retry record");
                }
                Ok(id)
            }
            Err(e) => {
                self.settle_failure(&message_id, &e);
                Err(e)
            }
        }
    }

    /// Server ack for a message we sent.
    pub fn acknowledge(&self, message_id: &str) -> Result<bool> {
        Ok(self.retry.remove(message_id)?.is_some())
    }

    /// Re-sends a recent message to the one device that asked for it, on a
    /// freshly fetched session. Returns whether anything was sent.
    pub fn handle_retry_receipt(&self, receipt: &RetryReceipt) -> Result<bool> {
        let now = now_ms();
        let requester = receipt
            .participant
            .clone()
            .unwrap_or_else(|| receipt.remote_jid.clone());

        let count = self
            .trackers
            .retry_receipts
            .bump(&receipt.message_id, &requester, now);
        if count > self.config.max_retry_receipts {
            warn!(message_id = %receipt.message_id, %requester, count, "too many retry receipts");
            return Ok(false);
        }

        let Some(message) = self
            .trackers
            .recent
            .get(&receipt.remote_jid, &receipt.message_id, now)
        else {
            debug!(message_id = %receipt.message_id, "retry receipt for unknown message");
            return Ok(false);
        };

        self.sessions.ensure_sessions(std::slice::from_ref(&requester), true)?;
        let options = RelayOptions {
            message_id: Some(receipt.message_id.clone()),
            participant: Some(requester),
            retry_count: receipt.retry_count.max(1),
            ..Default::default()
        };
        self.relay(&receipt.remote_jid, &message, options)?;
        Ok(true)
    }

    pub fn invalidate_devices(&self, user: &Jid) {
        self.devices.invalidate(user);
    }

    pub fn invalidate_group(&self, group: &Jid) {
        self.groups.invalidate(group);
    }

    /// Rotates our sender key for `group`. The next relay creates a new key
    /// and distributes it to every device.
    pub fn reset_sender_keys(&self, group: &Jid) -> Result<()> {
        let credentials = self.credentials.snapshot();
        self.sender_keys.reset(group)?;
        let store = self.crypto.store();
        store.delete_sender_key(&SenderKeyName::new(group, &credentials.me))?;
        if let Some(lid) = &credentials.me_lid {
            store.delete_sender_key(&SenderKeyName::new(group, lid))?;
        }
        info!(%group, "sender key reset");
        Ok(())
    }

    pub fn update_presence(&self, jid: &Jid, presence: Presence) {
        self.trackers.presence.update(jid, presence, now_ms());
    }

    pub fn presence(&self, jid: &Jid) -> Option<PresenceUpdate> {
        self.trackers.presence.get(jid, now_ms())
    }

    /// Starts the background retry scheduler. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.scheduler.lock().unwrap();
        if slot.is_none() {
            *slot = Some(RetryScheduler::spawn(
                Arc::downgrade(self),
                self.config.retry.tick_interval(),
            ));
        }
    }

    pub fn stop(&self) {
        let scheduler = self.scheduler.lock().unwrap().take();
        drop(scheduler);
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.lock().unwrap().is_some()
    }

    /// One scheduler pass: purge expired records, sweep trackers and
    /// re-deliver whatever is due. Concurrent calls run one after another.
    pub fn run_retry_tick(&self) -> TickReport {
        let _tick = self.tick_lock.lock().unwrap();
        let now = now_ms();
        let mut report = TickReport {
            purged: self.retry.purge(now).unwrap_or_else(|e| {
                warn!(error = %e, "failed to purge retry records");
                0
            }),
            swept: self.trackers.sweep(now),
            ..Default::default()
        };

        for message_id in self.retry.due(now) {
            let Some(record) = self.retry.claim(&message_id, now) else {
                report.skipped += 1;
                continue;
            };
            match self.relay(&record.jid, &record.message, record.options.clone()) {
                Ok(_) => {
                    if let Err(e) = self.retry.remove(&message_id) {
                        warn!(%message_id, error = %e, "failed to drop delivered retry record");
                    }
                    report.delivered += 1;
                }
                Err(e) => {
                    self.settle_failure(&message_id, &e);
                    report.failed += 1;
                }
            }
        }
        if report.delivered + report.failed > 0 {
            debug!(?report, "retry tick");
        }
        report
    }

    fn settle_failure(&self, message_id: &str, error: &Error) {
        let outcome = if error.is_retryable() {
            self.retry
                .record_failure(message_id, &error.to_string(), now_ms())
                .map(|state| match state {
                    Some(RetryState::Active) => {
                        warn!(%message_id, %error, "send failed, will retry")
                    }
                    Some(RetryState::Inactive) => {
                        warn!(%message_id, %error, "send failed, giving up")
                    }
                    None => {}
                })
        } else {
            warn!(%message_id, %error, "send failed permanently");
            self.retry.remove(message_id).map(|_| ())
        };
        if let Err(e) = outcome {
            warn!(%message_id, error = %e, "failed to update retry record");
        }
    }

    fn header(&self, ctx: &RelayContext, credentials: &Credentials) -> StanzaBuilder {
        let mut builder =
            StanzaBuilder::new(&ctx.message_id, &ctx.destination, ctx.message.stanza_type())
                .attrs(&ctx.attributes);
        if let Some(edit) = ctx.message.edit_attribute(&ctx.destination) {
            builder = builder.attr("edit", edit);
        }
        if let Some(participant) = &ctx.participant {
            if ctx.kind.uses_sender_key() {
                builder = builder.attr("participant", participant.encode());
            } else {
                builder = builder.to(participant).attr("device_fanout", "false");
                if credentials.is_me(participant) {
                    builder = builder.attr("recipient", ctx.destination.encode());
                }
            }
        }
        builder
    }

    fn prepare_group(
        &self,
        ctx: &RelayContext,
        credentials: &Credentials,
        options: &RelayOptions,
    ) -> Result<PreparedStanza> {
        let group = &ctx.destination;
        let (members, addressing_mode) = match ctx.kind {
            DestinationKind::Group => {
                let metadata = self
                    .groups
                    .metadata(group, options.use_cached_group_metadata)?;
                (metadata.participant_jids(), Some(metadata.addressing_mode))
            }
            _ => {
                let mut members = options.status_jid_list.clone();
                members.push(credentials.me.to_non_device());
                (members, None)
            }
        };
        let sender = match (addressing_mode, &credentials.me_lid) {
            (Some(AddressingMode::Lid), Some(lid)) => lid.clone(),
            _ => credentials.me.clone(),
        };

        let targets: Vec<Jid> = match &ctx.participant {
            Some(participant) => vec![participant.clone()],
            None => self
                .devices
                .resolve_devices(&members, options.use_user_devices_cache, false)?
                .iter()
                .map(|entry| entry.to_jid())
                .collect::<Result<_>>()?,
        };

        let plaintext = ctx.message.encode()?;
        let group_ciphertext = self.crypto.encrypt_group_message(group, &sender, &plaintext)?;

        let needs_key = match &ctx.participant {
            Some(_) => targets.clone(),
            None => self.sender_keys.missing(group, &targets)?,
        };
        debug!(
            %group,
            devices = targets.len(),
            distributing = needs_key.len(),
            "group fan-out"
        );

        let mut ciphertexts = Vec::with_capacity(needs_key.len());
        if !needs_key.is_empty() {
            self.sessions.ensure_sessions(&needs_key, false)?;
            let distribution = Message::SenderKeyDistribution {
                group_id: group.clone(),
                distribution: base64::engine::general_purpose::STANDARD
                    .encode(&group_ciphertext.distribution),
            }
            .encode()?;
            for jid in &needs_key {
                ciphertexts.push(DeviceCiphertext {
                    jid: jid.clone(),
                    envelope: self.crypto.encrypt_message(jid, &distribution)?,
                });
            }
        }

        let media_type = ctx.message.media_type();
        let mut builder = self
            .header(ctx, credentials)
            .participants(&ciphertexts, media_type, ctx.count)
            .group_ciphertext(group_ciphertext.ciphertext, media_type)
            .attr("phash", participant_hash(&targets));
        if let Some(mode) = addressing_mode {
            builder = builder.attr("addressing_mode", mode.as_str());
        }

        Ok(PreparedStanza {
            node: builder.build(&credentials.signed_device_identity),
            informed: Some((group.clone(), needs_key)),
        })
    }

    fn prepare_newsletter(&self, ctx: &RelayContext, credentials: &Credentials) -> Result<PreparedStanza> {
        let body = serde_json::to_vec(&ctx.message)?;
        let node = self
            .header(ctx, credentials)
            .plaintext(body, ctx.message.media_type())
            .build(&[]);
        Ok(PreparedStanza {
            node,
            informed: None,
        })
    }

    fn prepare_pairwise(
        &self,
        ctx: &RelayContext,
        credentials: &Credentials,
        options: &RelayOptions,
    ) -> Result<PreparedStanza> {
        let destination = &ctx.destination;
        let me = credentials.identity_for(destination).to_non_device();

        let targets: Vec<Jid> = match &ctx.participant {
            Some(participant) => vec![participant.clone()],
            None => {
                let mut candidates = vec![destination.clone()];
                if !destination.is_same_user(&me) {
                    candidates.push(me.clone());
                }
                let extra = self.devices.resolve_devices(
                    &[me.clone(), destination.clone()],
                    options.use_user_devices_cache,
                    true,
                )?;
                for entry in &extra {
                    candidates.push(entry.to_jid()?);
                }

                let mut seen = BTreeSet::new();
                candidates
                    .into_iter()
                    .filter(|jid| !credentials.is_own_device(jid))
                    .filter(|jid| seen.insert(jid.clone()))
                    .collect()
            }
        };

        let (mine, others): (Vec<Jid>, Vec<Jid>) =
            targets.iter().cloned().partition(|jid| credentials.is_me(jid));
        let fetched = self.sessions.ensure_sessions(&targets, false)?;
        debug!(
            to = %destination,
            own_devices = mine.len(),
            peer_devices = others.len(),
            fetched,
            "pairwise fan-out"
        );

        let mut ciphertexts = Vec::with_capacity(targets.len());
        if !mine.is_empty() {
            let wrapped = Message::device_sent(destination.clone(), ctx.message.clone()).encode()?;
            for jid in &mine {
                ciphertexts.push(DeviceCiphertext {
                    jid: jid.clone(),
                    envelope: self.crypto.encrypt_message(jid, &wrapped)?,
                });
            }
        }
        if !others.is_empty() {
            let plaintext = ctx.message.encode()?;
            for jid in &others {
                ciphertexts.push(DeviceCiphertext {
                    jid: jid.clone(),
                    envelope: self.crypto.encrypt_message(jid, &plaintext)?,
                });
            }
        }

        let media_type = ctx.message.media_type();
        let builder = self.header(ctx, credentials);
        let builder = match (&ctx.participant, ciphertexts.as_slice()) {
            (Some(_), [single]) => builder.direct(single, media_type, ctx.count),
            _ => builder.participants(&ciphertexts, media_type, ctx.count),
        };
        Ok(PreparedStanza {
            node: builder.build(&credentials.signed_device_identity),
            informed: None,
        })
    }
}

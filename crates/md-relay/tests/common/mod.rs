#![allow(dead_code)]

use md_relay::test_utils::{LoopbackCrypto, MockTransport};
use md_relay::{
    BinaryNode, CiphertextType, CredentialsHandle, Credentials, CryptoRepository, Envelope,
    InMemoryStorage, Jid, Message, MessageRelay, RelayConfig, RetryConfig, SessionStore,
    StorageAdapter,
};
use std::sync::Arc;

pub struct Harness {
    pub relay: Arc<MessageRelay>,
    pub transport: Arc<MockTransport>,
    pub storage: Arc<InMemoryStorage>,
}

pub fn jid(raw: &str) -> Jid {
    Jid::decode(raw).unwrap()
}

pub fn harness(me: &str) -> Harness {
    harness_with(Credentials::new(jid(me), vec![0xd1, 0xd2]), RelayConfig::default())
}

pub fn harness_with(credentials: Credentials, config: RelayConfig) -> Harness {
    harness_on(Arc::new(InMemoryStorage::new()), credentials, config)
}

pub fn harness_on(storage: Arc<InMemoryStorage>, credentials: Credentials, config: RelayConfig) -> Harness {
    let transport = Arc::new(MockTransport::new());
    let handle = Arc::new(CredentialsHandle::new(storage.clone(), credentials));
    let relay = MessageRelay::new(
        config,
        transport.clone(),
        storage.clone(),
        Arc::new(LoopbackCrypto::new()),
        handle,
    )
    .unwrap();
    Harness {
        relay,
        transport,
        storage,
    }
}

/// Millisecond backoff without jitter, so tests can wait for records to come due.
pub fn fast_retry_config() -> RelayConfig {
    RelayConfig {
        retry: RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 50,
            jitter_ratio: 0.0,
            tick_interval_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn wait_until_due() {
    std::thread::sleep(std::time::Duration::from_millis(60));
}

/// `jid` of every `to` under `participants`.
pub fn participant_targets(stanza: &BinaryNode) -> Vec<String> {
    stanza
        .child("participants")
        .map(|p| {
            p.children_with_tag("to")
                .filter_map(|to| to.attr("jid"))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn enc_for<'a>(stanza: &'a BinaryNode, target: &str) -> &'a BinaryNode {
    stanza
        .require_child("participants")
        .unwrap()
        .children_with_tag("to")
        .find(|to| to.attr("jid") == Some(target))
        .and_then(|to| to.child("enc"))
        .unwrap()
}

/// Decrypts a pairwise `enc` node the way a fresh receiving device would.
pub fn open_pairwise(receiver: &CryptoRepository, enc: &BinaryNode, sender: &Jid) -> Message {
    let envelope = Envelope {
        kind: CiphertextType::parse(enc.attr("type").unwrap()).unwrap(),
        body: enc.content_bytes().unwrap().to_vec(),
    };
    let plaintext = receiver.decrypt_message(sender, &envelope).unwrap();
    Message::decode(&plaintext).unwrap()
}

pub fn receiver() -> CryptoRepository {
    CryptoRepository::new(
        SessionStore::new(Arc::new(InMemoryStorage::new()) as Arc<dyn StorageAdapter>),
        Arc::new(LoopbackCrypto::new()),
    )
}

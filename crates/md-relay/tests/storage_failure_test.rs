mod common;

use common::{jid, participant_targets};
use md_relay::test_utils::{LoopbackCrypto, MockTransport};
use md_relay::{
    AddressingMode, Credentials, CredentialsHandle, Error, ErrorKind, InMemoryStorage, Jid,
    Message, MessageRelay, RelayConfig, RelayOptions, Result, StorageAdapter,
};
use std::sync::{Arc, Mutex};

/// In-memory store whose writes and deletes fail under one key prefix.
#[derive(Default)]
struct FlakyStorage {
    inner: InMemoryStorage,
    broken_prefix: Mutex<Option<String>>,
}

impl FlakyStorage {
    /// `""` breaks every key.
    fn break_prefix(&self, prefix: &str) {
        *self.broken_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    fn heal(&self) {
        *self.broken_prefix.lock().unwrap() = None;
    }

    fn check(&self, key: &str) -> Result<()> {
        match self.broken_prefix.lock().unwrap().as_deref() {
            Some(prefix) if key.starts_with(prefix) => {
                Err(Error::Storage(format!("disk full: {key}")))
            }
            _ => Ok(()),
        }
    }
}

impl StorageAdapter for FlakyStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        self.check(key)?;
        self.inner.put(key, value)
    }

    fn del(&self, key: &str) -> Result<()> {
        self.check(key)?;
        self.inner.del(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }
}

fn relay_on(storage: &Arc<FlakyStorage>, me: &str) -> Result<(Arc<MessageRelay>, Arc<MockTransport>)> {
    let transport = Arc::new(MockTransport::new());
    let credentials = Arc::new(CredentialsHandle::new(
        storage.clone(),
        Credentials::new(jid(me), vec![1]),
    ));
    let relay = MessageRelay::new(
        RelayConfig::default(),
        transport.clone(),
        storage.clone(),
        Arc::new(LoopbackCrypto::new()),
        credentials,
    )?;
    Ok((relay, transport))
}

#[test]
fn test_credentials_update_is_dropped_when_write_fails() {
    let storage = Arc::new(FlakyStorage::default());
    let handle = CredentialsHandle::new(
        storage.clone(),
        Credentials::new(jid("100:2@s.whatsapp.net"), vec![1, 2]),
    );

    storage.break_prefix("");
    let committed = handle.update(|c| {
        c.me_lid = Some(jid("900:2@lid"));
        Ok(())
    });
    assert!(!committed);
    assert!(!handle.save());
    assert_eq!(handle.snapshot().me_lid, None);

    storage.heal();
    assert!(handle.update(|c| {
        c.me_lid = Some(jid("900:2@lid"));
        Ok(())
    }));
    assert_eq!(handle.snapshot().me_lid, Some(jid("900:2@lid")));
}

#[test]
fn test_send_fails_locally_when_retry_record_cannot_be_written() -> Result<()> {
    let storage = Arc::new(FlakyStorage::default());
    let (relay, transport) = relay_on(&storage, "100@s.whatsapp.net")?;

    storage.break_prefix("");
    let err = relay
        .send_message(&jid("200@s.whatsapp.net"), Message::text("hi"), RelayOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Local);
    assert!(transport.sent().is_empty());
    assert!(relay.retry_queue().is_empty());
    Ok(())
}

#[test]
fn test_group_relay_succeeds_when_sender_key_memory_write_fails() -> Result<()> {
    let storage = Arc::new(FlakyStorage::default());
    let (relay, transport) = relay_on(&storage, "100:1@s.whatsapp.net")?;
    let group = jid("120363-9@g.us");
    transport.set_group(
        &group,
        AddressingMode::Pn,
        &[jid("200@s.whatsapp.net"), jid("300@s.whatsapp.net")],
    );

    storage.break_prefix("v1/sender-key-memory/");
    let id = relay.relay(&group, &Message::text("one"), RelayOptions::default())?;
    assert_eq!(transport.sent().len(), 1);
    assert_eq!(transport.last_sent().unwrap().attr("id"), Some(id.as_str()));
    assert!(relay.sender_key_memory().snapshot(&group)?.is_empty());

    storage.heal();
    relay.relay(&group, &Message::text("two"), RelayOptions::default())?;
    assert_eq!(participant_targets(&transport.last_sent().unwrap()).len(), 2);
    Ok(())
}

#[test]
fn test_delivered_send_is_ok_when_retry_record_cannot_be_dropped() -> Result<()> {
    let storage = Arc::new(FlakyStorage::default());
    let (relay, transport) = relay_on(&storage, "100@s.whatsapp.net")?;

    // Enrollment writes under the same prefix, so break it only once sent.
    let hook_storage = storage.clone();
    transport.on_send(move |_| hook_storage.break_prefix("v1/retry-queue/"));

    let id = relay.send_message(
        &jid("200@s.whatsapp.net"),
        Message::text("hi"),
        RelayOptions::default(),
    )?;
    assert_eq!(transport.sent().len(), 1);
    assert!(!relay.retry_queue().contains(&id));
    Ok(())
}

#[test]
fn test_jid_text_form_is_stable() -> Result<()> {
    let samples = [
        "5511999@s.whatsapp.net",
        "5511999:12@s.whatsapp.net",
        "120363-1700000000@g.us",
        "status@broadcast",
        "1234@broadcast",
        "777:3@lid",
        "99@newsletter",
    ];
    for raw in samples {
        let jid = Jid::decode(raw)?;
        assert_eq!(jid.encode(), raw);
        assert_eq!(Jid::decode(&jid.encode())?, jid);
        assert!(jid.to_non_device().is_same_user(&jid));
    }
    Ok(())
}

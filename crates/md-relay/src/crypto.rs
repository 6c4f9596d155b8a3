use crate::session_store::{SenderKeyName, SenderKeyRecord, SessionRecord, SessionStore};
use crate::{Error, Jid, ProtocolAddress, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Framing of an encrypted payload on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiphertextType {
    /// Pairwise message that embeds the session handshake bundle.
    PkMsg,
    /// Pairwise message on an established session.
    Msg,
    /// Group message encrypted with the sender key.
    SkMsg,
}

impl CiphertextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CiphertextType::PkMsg => "pkmsg",
            CiphertextType::Msg => "msg",
            CiphertextType::SkMsg => "skmsg",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pkmsg" => Some(CiphertextType::PkMsg),
            "msg" => Some(CiphertextType::Msg),
            "skmsg" => Some(CiphertextType::SkMsg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: CiphertextType,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKey {
    pub key_id: u32,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKey {
    pub key_id: u32,
    pub public_key: Vec<u8>,
}

/// Public key material that lets us open a session without a round trip to
/// the peer device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub identity_key: Vec<u8>,
    pub signed_pre_key: SignedPreKey,
    pub pre_key: Option<PreKey>,
}

/// Key agreement and ratcheting, supplied by the host. Implementations only
/// ever see records the repository loaded for them and hand them back.
pub trait CryptoPrimitives: Send + Sync {
    fn initiate_session(&self, address: &ProtocolAddress, bundle: &PreKeyBundle)
        -> Result<SessionRecord>;

    /// Must return [`CiphertextType::PkMsg`] while the session still carries
    /// unacknowledged handshake material.
    fn encrypt(
        &self,
        address: &ProtocolAddress,
        session: &mut SessionRecord,
        plaintext: &[u8],
    ) -> Result<Envelope>;

    fn decrypt(
        &self,
        address: &ProtocolAddress,
        session: Option<SessionRecord>,
        envelope: &Envelope,
    ) -> Result<(SessionRecord, Vec<u8>)>;

    /// Creates our sender key on first use and returns its distribution
    /// message.
    fn sender_key_distribution(
        &self,
        name: &SenderKeyName,
        record: &mut SenderKeyRecord,
    ) -> Result<Vec<u8>>;

    fn group_encrypt(
        &self,
        name: &SenderKeyName,
        record: &mut SenderKeyRecord,
        plaintext: &[u8],
    ) -> Result<Vec<u8>>;

    fn process_sender_key_distribution(
        &self,
        name: &SenderKeyName,
        record: &mut SenderKeyRecord,
        distribution: &[u8],
    ) -> Result<()>;

    fn group_decrypt(
        &self,
        name: &SenderKeyName,
        record: &mut SenderKeyRecord,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;
}

/// Output of one group encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCiphertext {
    pub ciphertext: Vec<u8>,
    pub distribution: Vec<u8>,
}

/// Pairwise and group encryption over the session store.
pub struct CryptoRepository {
    store: SessionStore,
    primitives: Arc<dyn CryptoPrimitives>,
    // Serializes load-modify-store so two relays never interleave updates of
    // one record.
    records_lock: Mutex<()>,
}

impl CryptoRepository {
    pub fn new(store: SessionStore, primitives: Arc<dyn CryptoPrimitives>) -> Self {
        Self {
            store,
            primitives,
            records_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn has_session(&self, jid: &Jid) -> Result<bool> {
        self.store.has_session(&jid.protocol_address())
    }

    pub fn inject_session(&self, jid: &Jid, bundle: &PreKeyBundle) -> Result<()> {
        let address = jid.protocol_address();
        let record = self.primitives.initiate_session(&address, bundle)?;
        let _guard = self.records_lock.lock().unwrap();
        self.store.store_session(&address, &record)?;
        debug!(%address, registration_id = bundle.registration_id, "injected session");
        Ok(())
    }

    pub fn delete_sessions(&self, jids: &[Jid]) -> Result<()> {
        let _guard = self.records_lock.lock().unwrap();
        for jid in jids {
            self.store.delete_session(&jid.protocol_address())?;
        }
        Ok(())
    }

    pub fn encrypt_message(&self, jid: &Jid, plaintext: &[u8]) -> Result<Envelope> {
        let address = jid.protocol_address();
        let _guard = self.records_lock.lock().unwrap();
        let mut session = self
            .store
            .load_session(&address)?
            .ok_or_else(|| Error::NoSession(address.to_string()))?;

        let envelope = self.primitives.encrypt(&address, &mut session, plaintext)?;
        if envelope.kind == CiphertextType::SkMsg {
            return Err(Error::Crypto(format!(
                "pairwise cipher produced skmsg for {address}"
            )));
        }
        self.store.store_session(&address, &session)?;
        Ok(envelope)
    }

    pub fn decrypt_message(&self, jid: &Jid, envelope: &Envelope) -> Result<Vec<u8>> {
        let address = jid.protocol_address();
        let _guard = self.records_lock.lock().unwrap();
        let existing = self.store.load_session(&address)?;
        match (envelope.kind, &existing) {
            (CiphertextType::SkMsg, _) => {
                return Err(Error::Crypto("skmsg is not a pairwise envelope".to_string()))
            }
            (CiphertextType::Msg, None) => return Err(Error::NoSession(address.to_string())),
            _ => {}
        }

        let (session, plaintext) = self.primitives.decrypt(&address, existing, envelope)?;
        self.store.store_session(&address, &session)?;
        Ok(plaintext)
    }

    /// One sender-key encryption for the whole group plus the distribution
    /// message devices need before they can read it.
    pub fn encrypt_group_message(
        &self,
        group: &Jid,
        sender: &Jid,
        plaintext: &[u8],
    ) -> Result<GroupCiphertext> {
        let name = SenderKeyName::new(group, sender);
        let _guard = self.records_lock.lock().unwrap();
        let mut record = self.store.load_sender_key(&name)?.unwrap_or_default();

        let distribution = self.primitives.sender_key_distribution(&name, &mut record)?;
        let ciphertext = self.primitives.group_encrypt(&name, &mut record, plaintext)?;
        self.store.store_sender_key(&name, &record)?;

        Ok(GroupCiphertext {
            ciphertext,
            distribution,
        })
    }

    pub fn process_sender_key_distribution(
        &self,
        group: &Jid,
        author: &Jid,
        distribution: &[u8],
    ) -> Result<()> {
        let name = SenderKeyName::new(group, author);
        let _guard = self.records_lock.lock().unwrap();
        let mut record = self.store.load_sender_key(&name)?.unwrap_or_default();
        self.primitives
            .process_sender_key_distribution(&name, &mut record, distribution)?;
        self.store.store_sender_key(&name, &record)
    }

    pub fn decrypt_group_message(
        &self,
        group: &Jid,
        author: &Jid,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let name = SenderKeyName::new(group, author);
        let _guard = self.records_lock.lock().unwrap();
        let mut record = self
            .store
            .load_sender_key(&name)?
            .ok_or_else(|| Error::NoSession(name.to_string()))?;
        let plaintext = self.primitives.group_decrypt(&name, &mut record, ciphertext)?;
        self.store.store_sender_key(&name, &record)?;
        Ok(plaintext)
    }
}

use crate::storage::{get_json, put_json};
use crate::{Jid, ProtocolAddress, Result, StorageAdapter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const STORAGE_VERSION: &str = "1";

/// Opaque pairwise session state. Only the crypto primitives interpret it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(with = "crate::storage::serde_base64")]
    data: Vec<u8>,
}

impl SessionRecord {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Opaque sender-key chain state for one sender in one group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    #[serde(with = "crate::storage::serde_base64")]
    data: Vec<u8>,
}

impl SenderKeyRecord {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SenderKeyName {
    pub group: Jid,
    pub sender: ProtocolAddress,
}

impl SenderKeyName {
    pub fn new(group: &Jid, sender: &Jid) -> Self {
        Self {
            group: group.to_non_device(),
            sender: sender.protocol_address(),
        }
    }
}

impl fmt::Display for SenderKeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.group, self.sender)
    }
}

/// Persistent session and sender-key records, keyed by protocol address.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn StorageAdapter>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    pub fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>> {
        get_json(self.storage.as_ref(), &self.session_key(address))
    }

    pub fn store_session(&self, address: &ProtocolAddress, record: &SessionRecord) -> Result<()> {
        put_json(self.storage.as_ref(), &self.session_key(address), record)
    }

    pub fn has_session(&self, address: &ProtocolAddress) -> Result<bool> {
        Ok(self.storage.get(&self.session_key(address))?.is_some())
    }

    pub fn delete_session(&self, address: &ProtocolAddress) -> Result<()> {
        self.storage.del(&self.session_key(address))
    }

    pub fn load_sender_key(&self, name: &SenderKeyName) -> Result<Option<SenderKeyRecord>> {
        get_json(self.storage.as_ref(), &self.sender_key_key(name))
    }

    pub fn store_sender_key(&self, name: &SenderKeyName, record: &SenderKeyRecord) -> Result<()> {
        put_json(self.storage.as_ref(), &self.sender_key_key(name), record)
    }

    pub fn delete_sender_key(&self, name: &SenderKeyName) -> Result<()> {
        self.storage.del(&self.sender_key_key(name))
    }

    fn session_key(&self, address: &ProtocolAddress) -> String {
        format!("v{}/session/{}", STORAGE_VERSION, address)
    }

    fn sender_key_key(&self, name: &SenderKeyName) -> String {
        format!("v{}/sender-key/{}", STORAGE_VERSION, name)
    }
}

use crate::guard::ExclusiveGuard;
use crate::storage::{get_json, put_json};
use crate::{Jid, Result, StorageAdapter};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

const CREDENTIALS_KEY: &str = "v1/credentials";

/// Identity of this linked device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Our device jid in the individual namespace.
    pub me: Jid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me_lid: Option<Jid>,
    /// Attached as `device-identity` whenever a new session is opened.
    #[serde(with = "crate::storage::serde_base64")]
    pub signed_device_identity: Vec<u8>,
}

impl Credentials {
    pub fn new(me: Jid, signed_device_identity: Vec<u8>) -> Self {
        Self {
            me,
            me_lid: None,
            signed_device_identity,
        }
    }

    pub fn with_lid(mut self, me_lid: Jid) -> Self {
        self.me_lid = Some(me_lid);
        self
    }

    /// Whether `jid` belongs to our account in either namespace.
    pub fn is_me(&self, jid: &Jid) -> bool {
        jid.is_same_user(&self.me)
            || self
                .me_lid
                .as_ref()
                .is_some_and(|lid| jid.is_same_user(lid))
    }

    /// Whether `jid` names exactly this device.
    pub fn is_own_device(&self, jid: &Jid) -> bool {
        let same = |mine: &Jid| jid.is_same_user(mine) && jid.device_id() == mine.device_id();
        same(&self.me) || self.me_lid.as_ref().is_some_and(same)
    }

    /// Our identity in the namespace of `destination`.
    pub fn identity_for(&self, destination: &Jid) -> &Jid {
        match (&self.me_lid, destination.is_lid()) {
            (Some(lid), true) => lid,
            _ => &self.me,
        }
    }
}

/// Shared, persisted credentials. Mutations go through an
/// [`ExclusiveGuard`] and are written through to storage.
pub struct CredentialsHandle {
    current: RwLock<Credentials>,
    guard: ExclusiveGuard,
    storage: Arc<dyn StorageAdapter>,
}

impl CredentialsHandle {
    pub fn new(storage: Arc<dyn StorageAdapter>, credentials: Credentials) -> Self {
        Self {
            current: RwLock::new(credentials),
            guard: ExclusiveGuard::new(),
            storage,
        }
    }

    /// Restores previously saved credentials, if any.
    pub fn load(storage: Arc<dyn StorageAdapter>) -> Result<Option<Self>> {
        let saved: Option<Credentials> = get_json(storage.as_ref(), CREDENTIALS_KEY)?;
        Ok(saved.map(|credentials| Self::new(storage, credentials)))
    }

    pub fn snapshot(&self) -> Credentials {
        self.current.read().unwrap().clone()
    }

    pub fn me(&self) -> Jid {
        self.current.read().unwrap().me.clone()
    }

    pub fn save(&self) -> bool {
        self.guard
            .run("save credentials", || {
                let snapshot = self.snapshot();
                put_json(self.storage.as_ref(), CREDENTIALS_KEY, &snapshot)
            })
            .is_some()
    }

    /// Applies `change` to a copy and commits it only if both the change and
    /// the write succeed. Returns whether the update was committed.
    pub fn update(&self, change: impl FnOnce(&mut Credentials) -> Result<()>) -> bool {
        self.guard
            .run("update credentials", || {
                let mut next = self.snapshot();
                change(&mut next)?;
                put_json(self.storage.as_ref(), CREDENTIALS_KEY, &next)?;
                *self.current.write().unwrap() = next;
                Ok(())
            })
            .is_some()
    }
}

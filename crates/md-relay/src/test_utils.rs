//! Deterministic collaborators for tests: a scripted transport that can also
//! play a small server, and loopback crypto primitives.

use crate::crypto::{CiphertextType, CryptoPrimitives, Envelope, PreKey, PreKeyBundle, SignedPreKey};
use crate::devices::USYNC_XMLNS;
use crate::groups::{AddressingMode, GROUPS_XMLNS};
use crate::node::uint_bytes;
use crate::session_store::{SenderKeyName, SenderKeyRecord, SessionRecord};
use crate::sessions::ENCRYPT_XMLNS;
use crate::{BinaryNode, Error, Jid, ProtocolAddress, Result, Transport};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

type SendHook = Arc<dyn Fn(&BinaryNode) + Send + Sync>;

/// Records every query and send. Queries are answered from the scripted
/// queue first, then from the configured device lists and groups.
#[derive(Default)]
pub struct MockTransport {
    scripted: Mutex<VecDeque<Result<BinaryNode>>>,
    send_errors: Mutex<VecDeque<Error>>,
    devices: Mutex<HashMap<Jid, Vec<u16>>>,
    groups: Mutex<HashMap<Jid, (AddressingMode, Vec<Jid>)>>,
    queries: Mutex<Vec<BinaryNode>>,
    sent: Mutex<Vec<BinaryNode>>,
    on_send: Mutex<Option<SendHook>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, node: BinaryNode) {
        self.scripted.lock().unwrap().push_back(Ok(node));
    }

    pub fn push_error(&self, error: Error) {
        self.scripted.lock().unwrap().push_back(Err(error));
    }

    /// Fails the next `send` with `error`.
    pub fn fail_next_send(&self, error: Error) {
        self.send_errors.lock().unwrap().push_back(error);
    }

    /// Device ids the fake server reports for `user`. Every device is keyed.
    pub fn set_devices(&self, user: &Jid, devices: &[u16]) {
        self.devices
            .lock()
            .unwrap()
            .insert(user.to_non_device(), devices.to_vec());
    }

    pub fn set_group(&self, group: &Jid, mode: AddressingMode, participants: &[Jid]) {
        self.groups
            .lock()
            .unwrap()
            .insert(group.clone(), (mode, participants.to_vec()));
    }

    /// Called after each successful send, outside any lock.
    pub fn on_send(&self, hook: impl Fn(&BinaryNode) + Send + Sync + 'static) {
        *self.on_send.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn queries(&self) -> Vec<BinaryNode> {
        self.queries.lock().unwrap().clone()
    }

    pub fn queries_with_xmlns(&self, xmlns: &str) -> Vec<BinaryNode> {
        self.queries()
            .into_iter()
            .filter(|q| q.attr("xmlns") == Some(xmlns))
            .collect()
    }

    pub fn sent(&self) -> Vec<BinaryNode> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_sent(&self) -> Option<BinaryNode> {
        self.sent.lock().unwrap().last().cloned()
    }

    pub fn clear(&self) {
        self.queries.lock().unwrap().clear();
        self.sent.lock().unwrap().clear();
    }

    fn answer(&self, node: &BinaryNode) -> Result<BinaryNode> {
        let requested = || -> Result<Vec<Jid>> {
            node.find_all("user")
                .iter()
                .map(|u| Jid::decode(u.require_attr("jid")?))
                .collect()
        };

        match node.attr("xmlns") {
            Some(USYNC_XMLNS) => {
                let devices = self.devices.lock().unwrap();
                let users = requested()?
                    .iter()
                    .map(|jid| {
                        let ids = devices.get(&jid.to_non_device()).cloned().unwrap_or_else(|| vec![0]);
                        let keyed: Vec<(u16, Option<u32>)> =
                            ids.iter().map(|id| (*id, (*id != 0).then_some(1))).collect();
                        usync_user(jid, &keyed)
                    })
                    .collect();
                Ok(wrap_usync(users))
            }
            Some(ENCRYPT_XMLNS) => {
                let bundles: Vec<_> = requested()?
                    .into_iter()
                    .enumerate()
                    .map(|(i, jid)| (jid, sample_bundle(i as u32 + 1)))
                    .collect();
                Ok(prekey_response(&bundles))
            }
            Some(GROUPS_XMLNS) => {
                let group = Jid::decode(node.require_attr("to")?)?;
                let groups = self.groups.lock().unwrap();
                let (mode, participants) = groups
                    .get(&group)
                    .ok_or_else(|| Error::ServerError {
                        code: "404".to_string(),
                        context: group.to_string(),
                    })?;
                let encoded: Vec<String> = participants.iter().map(Jid::encode).collect();
                let refs: Vec<&str> = encoded.iter().map(String::as_str).collect();
                Ok(group_response(group.user(), *mode, &refs))
            }
            other => Err(Error::Protocol(format!("no answer for xmlns {other:?}"))),
        }
    }
}

impl Transport for MockTransport {
    fn query(&self, node: BinaryNode) -> Result<BinaryNode> {
        self.queries.lock().unwrap().push(node.clone());
        let scripted = self.scripted.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => self.answer(&node),
        }
    }

    fn send(&self, node: BinaryNode) -> Result<()> {
        if let Some(error) = self.send_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(node.clone());
        let hook = self.on_send.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(&node);
        }
        Ok(())
    }
}

pub fn sample_bundle(n: u32) -> PreKeyBundle {
    PreKeyBundle {
        registration_id: 1000 + n,
        identity_key: vec![5; 33],
        signed_pre_key: SignedPreKey {
            key_id: n,
            public_key: vec![n as u8; 33],
            signature: vec![7; 64],
        },
        pre_key: Some(PreKey {
            key_id: 100 + n,
            public_key: vec![(n + 1) as u8; 33],
        }),
    }
}

pub fn prekey_response(bundles: &[(Jid, PreKeyBundle)]) -> BinaryNode {
    let users = bundles
        .iter()
        .map(|(jid, bundle)| {
            let mut children = vec![
                BinaryNode::new("registration").with_bytes(uint_bytes(bundle.registration_id, 4)),
                BinaryNode::new("identity").with_bytes(bundle.identity_key.clone()),
                BinaryNode::new("skey").with_children(vec![
                    BinaryNode::new("id").with_bytes(uint_bytes(bundle.signed_pre_key.key_id, 3)),
                    BinaryNode::new("value").with_bytes(bundle.signed_pre_key.public_key.clone()),
                    BinaryNode::new("signature").with_bytes(bundle.signed_pre_key.signature.clone()),
                ]),
            ];
            if let Some(key) = &bundle.pre_key {
                children.push(BinaryNode::new("key").with_children(vec![
                    BinaryNode::new("id").with_bytes(uint_bytes(key.key_id, 3)),
                    BinaryNode::new("value").with_bytes(key.public_key.clone()),
                ]));
            }
            BinaryNode::new("user")
                .with_attr("jid", jid.encode())
                .with_children(children)
        })
        .collect();
    BinaryNode::new("iq")
        .with_attr("type", "result")
        .with_children(vec![BinaryNode::new("list").with_children(users)])
}

fn usync_user(jid: &Jid, devices: &[(u16, Option<u32>)]) -> BinaryNode {
    let device_nodes = devices
        .iter()
        .map(|(id, key_index)| {
            let node = BinaryNode::new("device").with_attr("id", id.to_string());
            match key_index {
                Some(index) => node.with_attr("key-index", index.to_string()),
                None => node,
            }
        })
        .collect();
    BinaryNode::new("user")
        .with_attr("jid", jid.encode())
        .with_children(vec![BinaryNode::new("devices").with_children(vec![
            BinaryNode::new("device-list").with_children(device_nodes),
        ])])
}

fn wrap_usync(users: Vec<BinaryNode>) -> BinaryNode {
    BinaryNode::new("iq")
        .with_attr("type", "result")
        .with_children(vec![BinaryNode::new("usync")
            .with_children(vec![BinaryNode::new("list").with_children(users)])])
}

/// A usync reply for individual users: `(user, [(device, key-index)])`.
pub fn usync_response(users: &[(&str, &[(u16, Option<u32>)])]) -> BinaryNode {
    wrap_usync(
        users
            .iter()
            .map(|(user, devices)| {
                let jid = Jid::new(*user, crate::Server::Individual)
                    .unwrap_or_else(|_| Jid::server_jid());
                usync_user(&jid, devices)
            })
            .collect(),
    )
}

pub fn group_response(id: &str, mode: AddressingMode, participants: &[&str]) -> BinaryNode {
    let members = participants
        .iter()
        .map(|jid| BinaryNode::new("participant").with_attr("jid", *jid))
        .collect();
    BinaryNode::new("iq")
        .with_attr("type", "result")
        .with_children(vec![BinaryNode::new("group")
            .with_attr("id", id)
            .with_attr("subject", "test group")
            .with_attr("addressing_mode", mode.as_str())
            .with_children(members)])
}

#[derive(Serialize, Deserialize)]
struct LoopbackSession {
    counter: u64,
    pending_prekey: bool,
}

#[derive(Serialize, Deserialize)]
struct LoopbackSenderKey {
    #[serde(with = "crate::storage::serde_base64")]
    key: Vec<u8>,
    iteration: u32,
}

/// Keystream cipher over a secret shared by every instance. Not secure; it
/// only has to round-trip and to report pkmsg/msg like a real ratchet.
pub struct LoopbackCrypto {
    secret: Vec<u8>,
}

impl Default for LoopbackCrypto {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackCrypto {
    pub fn new() -> Self {
        Self {
            secret: b"md-relay loopback".to_vec(),
        }
    }

    /// A session whose handshake was already acknowledged.
    pub fn established_session() -> SessionRecord {
        encode_state(&LoopbackSession {
            counter: 0,
            pending_prekey: false,
        })
    }

    fn xor(&self, key: &[u8], nonce: &[u8], data: &[u8]) -> Vec<u8> {
        let hk = Hkdf::<Sha256>::new(Some(nonce), key);
        let mut out = Vec::with_capacity(data.len());
        for (block, chunk) in data.chunks(32).enumerate() {
            let mut okm = [0u8; 32];
            if hk.expand(&(block as u64).to_be_bytes(), &mut okm).is_err() {
                break;
            }
            out.extend(chunk.iter().zip(okm.iter()).map(|(a, b)| a ^ b));
        }
        out
    }
}

fn encode_state<T: Serialize>(state: &T) -> SessionRecord {
    SessionRecord::new(serde_json::to_vec(state).unwrap_or_default())
}

fn decode_state<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Crypto(format!("corrupt record: {e}")))
}

fn split_nonce(body: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    if body.len() < len {
        return Err(Error::Crypto("ciphertext too short".to_string()));
    }
    Ok(body.split_at(len))
}

impl CryptoPrimitives for LoopbackCrypto {
    fn initiate_session(&self, _address: &ProtocolAddress, bundle: &PreKeyBundle) -> Result<SessionRecord> {
        if bundle.identity_key.is_empty() || bundle.signed_pre_key.signature.is_empty() {
            return Err(Error::Crypto("incomplete prekey bundle".to_string()));
        }
        Ok(encode_state(&LoopbackSession {
            counter: 0,
            pending_prekey: true,
        }))
    }

    fn encrypt(&self, _address: &ProtocolAddress, session: &mut SessionRecord, plaintext: &[u8]) -> Result<Envelope> {
        let mut state: LoopbackSession = decode_state(session.data())?;
        state.counter += 1;
        let nonce = state.counter.to_be_bytes();
        let mut body = nonce.to_vec();
        body.extend(self.xor(&self.secret, &nonce, plaintext));
        let kind = if state.pending_prekey {
            CiphertextType::PkMsg
        } else {
            CiphertextType::Msg
        };
        *session = encode_state(&state);
        Ok(Envelope { kind, body })
    }

    fn decrypt(
        &self,
        _address: &ProtocolAddress,
        session: Option<SessionRecord>,
        envelope: &Envelope,
    ) -> Result<(SessionRecord, Vec<u8>)> {
        let mut state = match session {
            Some(record) => decode_state::<LoopbackSession>(record.data())?,
            None => LoopbackSession {
                counter: 0,
                pending_prekey: false,
            },
        };
        state.pending_prekey = false;
        let (nonce, ciphertext) = split_nonce(&envelope.body, 8)?;
        let plaintext = self.xor(&self.secret, nonce, ciphertext);
        Ok((encode_state(&state), plaintext))
    }

    fn sender_key_distribution(&self, _name: &SenderKeyName, record: &mut SenderKeyRecord) -> Result<Vec<u8>> {
        if record.is_empty() {
            let state = LoopbackSenderKey {
                key: rand::random::<[u8; 32]>().to_vec(),
                iteration: 0,
            };
            *record = SenderKeyRecord::new(serde_json::to_vec(&state)?);
        }
        Ok(record.data().to_vec())
    }

    fn group_encrypt(&self, _name: &SenderKeyName, record: &mut SenderKeyRecord, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut state: LoopbackSenderKey = decode_state(record.data())?;
        state.iteration += 1;
        let nonce = state.iteration.to_be_bytes();
        let mut body = nonce.to_vec();
        body.extend(self.xor(&state.key, &nonce, plaintext));
        *record = SenderKeyRecord::new(serde_json::to_vec(&state)?);
        Ok(body)
    }

    fn process_sender_key_distribution(
        &self,
        _name: &SenderKeyName,
        record: &mut SenderKeyRecord,
        distribution: &[u8],
    ) -> Result<()> {
        let _: LoopbackSenderKey = decode_state(distribution)?;
        *record = SenderKeyRecord::new(distribution.to_vec());
        Ok(())
    }

    fn group_decrypt(&self, _name: &SenderKeyName, record: &mut SenderKeyRecord, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut state: LoopbackSenderKey = decode_state(record.data())?;
        let (nonce, body) = split_nonce(ciphertext, 4)?;
        let plaintext = self.xor(&state.key, nonce, body);
        let iteration = u32::from_be_bytes([nonce[0], nonce[1], nonce[2], nonce[3]]);
        state.iteration = state.iteration.max(iteration);
        *record = SenderKeyRecord::new(serde_json::to_vec(&state)?);
        Ok(plaintext)
    }
}

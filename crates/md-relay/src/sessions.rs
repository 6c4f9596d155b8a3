use crate::crypto::{CryptoRepository, PreKey, PreKeyBundle, SignedPreKey};
use crate::{BinaryNode, Error, Jid, Result, Transport};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub const ENCRYPT_XMLNS: &str = "encrypt";

/// Makes sure a pairwise session exists for every device before encryption.
pub struct SessionAssertion {
    transport: Arc<dyn Transport>,
    crypto: Arc<CryptoRepository>,
}

impl SessionAssertion {
    pub fn new(transport: Arc<dyn Transport>, crypto: Arc<CryptoRepository>) -> Self {
        Self { transport, crypto }
    }

    /// Fetches prekey bundles for devices without a session (or for all of
    /// them when `force`) in one round trip. Returns whether any new session
    /// was created.
    pub fn ensure_sessions(&self, jids: &[Jid], force: bool) -> Result<bool> {
        let mut missing = BTreeSet::new();
        for jid in jids {
            if force || !self.crypto.has_session(jid)? {
                missing.insert(jid.clone());
            }
        }
        if missing.is_empty() {
            return Ok(false);
        }

        debug!(count = missing.len(), force, "fetching prekey bundles");
        let response = self.transport.query(build_prekey_query(&missing))?;
        let bundles = parse_prekey_bundles(&response)?;

        let mut injected = 0usize;
        for (jid, bundle) in &bundles {
            if !missing.contains(jid) {
                debug!(%jid, "ignoring unrequested prekey bundle");
                continue;
            }
            self.crypto.inject_session(jid, bundle)?;
            injected += 1;
        }
        Ok(injected > 0)
    }
}

pub fn build_prekey_query<'a>(jids: impl IntoIterator<Item = &'a Jid>) -> BinaryNode {
    let users = jids
        .into_iter()
        .map(|jid| BinaryNode::new("user").with_attr("jid", jid.encode()))
        .collect();
    BinaryNode::new("iq")
        .with_attr("xmlns", ENCRYPT_XMLNS)
        .with_attr("type", "get")
        .with_attr("to", Jid::server_jid().encode())
        .with_children(vec![BinaryNode::new("key").with_children(users)])
}

/// Reads `list > user[jid]` bundles out of a prekey fetch response. Any user
/// carrying an `<error>` fails the whole batch.
pub fn parse_prekey_bundles(response: &BinaryNode) -> Result<Vec<(Jid, PreKeyBundle)>> {
    response.assert_error_free()?;
    let list = response.require_child("list")?;

    let mut out = Vec::new();
    for user in list.children_with_tag("user") {
        user.assert_error_free()?;
        let jid = Jid::decode(user.require_attr("jid")?)?;

        let registration_id = user.child_uint("registration", 4)?;
        let identity_key = user
            .child_bytes("identity")
            .ok_or_else(|| Error::Protocol(format!("{jid}: missing identity")))?
            .to_vec();

        let skey = user.require_child("skey")?;
        let signed_pre_key = SignedPreKey {
            key_id: skey.child_uint("id", 3)?,
            public_key: required_bytes(skey, "value")?,
            signature: required_bytes(skey, "signature")?,
        };

        let pre_key = match user.child("key") {
            Some(key) => Some(PreKey {
                key_id: key.child_uint("id", 3)?,
                public_key: required_bytes(key, "value")?,
            }),
            None => None,
        };

        out.push((
            jid,
            PreKeyBundle {
                registration_id,
                identity_key,
                signed_pre_key,
                pre_key,
            },
        ));
    }
    Ok(out)
}

fn required_bytes(node: &BinaryNode, tag: &str) -> Result<Vec<u8>> {
    node.child_bytes(tag)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| Error::Protocol(format!("<{}> missing <{tag}>", node.tag)))
}

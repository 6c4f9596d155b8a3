use crate::crypto::{CiphertextType, Envelope};
use crate::{BinaryNode, Jid};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Pairwise ciphertext addressed to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCiphertext {
    pub jid: Jid,
    pub envelope: Envelope,
}

pub fn enc_node(envelope: &Envelope, media_type: Option<&str>, count: Option<u32>) -> BinaryNode {
    let mut node = BinaryNode::new("enc")
        .with_attr("v", "2")
        .with_attr("type", envelope.kind.as_str());
    if let Some(media_type) = media_type {
        node = node.with_attr("mediatype", media_type);
    }
    if let Some(count) = count {
        node = node.with_attr("count", count.to_string());
    }
    node.with_bytes(envelope.body.clone())
}

/// `participants { to[jid] { enc } * }`
pub fn participants_node(
    ciphertexts: &[DeviceCiphertext],
    media_type: Option<&str>,
    count: Option<u32>,
) -> BinaryNode {
    let to_nodes = ciphertexts
        .iter()
        .map(|c| {
            BinaryNode::new("to")
                .with_attr("jid", c.jid.encode())
                .with_children(vec![enc_node(&c.envelope, media_type, count)])
        })
        .collect();
    BinaryNode::new("participants").with_children(to_nodes)
}

/// `2:` + base64 of the first 6 bytes of sha256 over the sorted device jids.
pub fn participant_hash(devices: &[Jid]) -> String {
    let mut encoded: Vec<String> = devices.iter().map(Jid::encode).collect();
    encoded.sort();
    let digest = Sha256::digest(encoded.concat().as_bytes());
    format!(
        "2:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(&digest[..6])
    )
}

/// Assembles one outbound `message` stanza.
#[derive(Debug, Clone)]
pub struct StanzaBuilder {
    id: String,
    to: Jid,
    stanza_type: String,
    attrs: BTreeMap<String, String>,
    content: Vec<BinaryNode>,
    has_pkmsg: bool,
}

impl StanzaBuilder {
    pub fn new(id: impl Into<String>, to: &Jid, stanza_type: &str) -> Self {
        Self {
            id: id.into(),
            to: to.clone(),
            stanza_type: stanza_type.to_string(),
            attrs: BTreeMap::new(),
            content: Vec::new(),
            has_pkmsg: false,
        }
    }

    /// Addresses the stanza to `jid` instead of the jid it was created with.
    pub fn to(mut self, jid: &Jid) -> Self {
        self.to = jid.clone();
        self
    }

    pub fn attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn attrs(mut self, extra: &BTreeMap<String, String>) -> Self {
        for (key, value) in extra {
            self.attrs.insert(key.clone(), value.clone());
        }
        self
    }

    /// Appends `participants` unless there is nobody to address.
    pub fn participants(
        mut self,
        ciphertexts: &[DeviceCiphertext],
        media_type: Option<&str>,
        count: Option<u32>,
    ) -> Self {
        if ciphertexts.is_empty() {
            return self;
        }
        self.note_kinds(ciphertexts);
        self.content
            .push(participants_node(ciphertexts, media_type, count));
        self
    }

    /// Appends a bare `enc`, used when the stanza targets a single device.
    pub fn direct(mut self, ciphertext: &DeviceCiphertext, media_type: Option<&str>, count: Option<u32>) -> Self {
        self.note_kinds(std::slice::from_ref(ciphertext));
        self.content
            .push(enc_node(&ciphertext.envelope, media_type, count));
        self
    }

    pub fn group_ciphertext(mut self, ciphertext: Vec<u8>, media_type: Option<&str>) -> Self {
        let envelope = Envelope {
            kind: CiphertextType::SkMsg,
            body: ciphertext,
        };
        self.content.push(enc_node(&envelope, media_type, None));
        self
    }

    pub fn plaintext(mut self, body: Vec<u8>, media_type: Option<&str>) -> Self {
        let mut node = BinaryNode::new("plaintext");
        if let Some(media_type) = media_type {
            node = node.with_attr("mediatype", media_type);
        }
        self.content.push(node.with_bytes(body));
        self
    }

    /// Finishes the stanza. `id`, `type` and `to` always come from the
    /// builder, whatever extra attributes say. `device_identity` is attached
    /// only when a pairwise ciphertext of type pkmsg was added.
    pub fn build(self, device_identity: &[u8]) -> BinaryNode {
        let mut node = BinaryNode::new("message");
        node.attrs = self.attrs;
        node.attrs.insert("id".to_string(), self.id);
        node.attrs.insert("type".to_string(), self.stanza_type);
        node.attrs.insert("to".to_string(), self.to.encode());

        let mut content = self.content;
        if self.has_pkmsg {
            content.push(BinaryNode::new("device-identity").with_bytes(device_identity.to_vec()));
        }
        if !content.is_empty() {
            node.content = crate::NodeContent::Nodes(content);
        }
        node
    }

    fn note_kinds(&mut self, ciphertexts: &[DeviceCiphertext]) {
        if ciphertexts
            .iter()
            .any(|c| c.envelope.kind == CiphertextType::PkMsg)
        {
            self.has_pkmsg = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Server;

    fn ciphertext(user: &str, device: u16, kind: CiphertextType) -> DeviceCiphertext {
        DeviceCiphertext {
            jid: Jid::with_device(user, Server::Individual, device).unwrap(),
            envelope: Envelope {
                kind,
                body: vec![1, 2, 3],
            },
        }
    }

    #[test]
    fn participant_hash_ignores_order() {
        let a = Jid::with_device("1", Server::Individual, 1).unwrap();
        let b = Jid::user_jid("2").unwrap();
        let hash = participant_hash(&[a.clone(), b.clone()]);
        assert_eq!(hash, participant_hash(&[b, a]));
        assert!(hash.starts_with("2:"));
        assert_eq!(hash.len(), 2 + 8);
    }

    #[test]
    fn device_identity_only_with_pkmsg() {
        let to = Jid::user_jid("2").unwrap();
        let plain = StanzaBuilder::new("ID1", &to, "text")
            .participants(&[ciphertext("2", 0, CiphertextType::Msg)], None, None)
            .build(&[7]);
        assert!(plain.child("device-identity").is_none());

        let fresh = StanzaBuilder::new("ID2", &to, "text")
            .participants(
                &[
                    ciphertext("2", 0, CiphertextType::Msg),
                    ciphertext("2", 3, CiphertextType::PkMsg),
                ],
                None,
                None,
            )
            .build(&[7]);
        assert_eq!(fresh.child_bytes("device-identity"), Some(&[7u8][..]));
        assert_eq!(fresh.find_all("to").len(), 2);
    }

    #[test]
    fn direct_enc_carries_count() {
        let to = Jid::with_device("2", Server::Individual, 3).unwrap();
        let node = StanzaBuilder::new("ID3", &to, "media")
            .attr("device_fanout", "false")
            .direct(&ciphertext("2", 3, CiphertextType::Msg), Some("image"), Some(2))
            .build(&[]);
        let enc = node.require_child("enc").unwrap();
        assert_eq!(enc.attr("count"), Some("2"));
        assert_eq!(enc.attr("mediatype"), Some("image"));
        assert_eq!(node.attr("to"), Some("2:3@s.whatsapp.net"));
        assert_eq!(node.attr("device_fanout"), Some("false"));
    }

    #[test]
    fn extra_attributes_cannot_redirect() {
        let to = Jid::user_jid("2").unwrap();
        let mut extra = BTreeMap::new();
        extra.insert("to".to_string(), "666@s.whatsapp.net".to_string());
        extra.insert("id".to_string(), "OTHER".to_string());
        extra.insert("category".to_string(), "peer".to_string());

        let node = StanzaBuilder::new("ID5", &to, "text").attrs(&extra).build(&[]);
        assert_eq!(node.attr("to"), Some("2@s.whatsapp.net"));
        assert_eq!(node.attr("id"), Some("ID5"));
        assert_eq!(node.attr("category"), Some("peer"));

        let device = Jid::with_device("2", Server::Individual, 4).unwrap();
        let node = StanzaBuilder::new("ID6", &to, "text")
            .attrs(&extra)
            .to(&device)
            .build(&[]);
        assert_eq!(node.attr("to"), Some("2:4@s.whatsapp.net"));
    }

    #[test]
    fn empty_participants_are_omitted() {
        let to = Jid::decode("1-1@g.us").unwrap();
        let node = StanzaBuilder::new("ID4", &to, "text")
            .participants(&[], None, None)
            .group_ciphertext(vec![9], None)
            .build(&[]);
        assert!(node.child("participants").is_none());
        assert_eq!(node.require_child("enc").unwrap().attr("type"), Some("skmsg"));
    }
}

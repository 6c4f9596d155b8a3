use crate::{Error, Jid, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

pub const MESSAGE_ID_PREFIX: &str = "3EB0";
/// Prefix plus 9 hashed bytes in upper-case hex.
pub const MESSAGE_ID_LEN: usize = MESSAGE_ID_PREFIX.len() + 18;

pub const EDIT_ATTR_EDIT: &str = "1";
pub const EDIT_ATTR_SENDER_REVOKE: &str = "7";
pub const EDIT_ATTR_ADMIN_REVOKE: &str = "8";

/// Identifies a previously sent or received message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: Jid,
    pub id: String,
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<Jid>,
}

/// Reference to media already uploaded by the media collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub url: String,
    pub mimetype: String,
    pub file_length: u64,
    /// Base64 media key.
    pub media_key: String,
    /// Hex sha256 of the plaintext file.
    pub file_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Every message shape the relay knows how to frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    Text {
        text: String,
    },
    Image {
        media: MediaInfo,
    },
    Video {
        media: MediaInfo,
        #[serde(default)]
        gif_playback: bool,
    },
    Audio {
        media: MediaInfo,
        #[serde(default)]
        ptt: bool,
    },
    Document {
        media: MediaInfo,
    },
    Sticker {
        media: MediaInfo,
    },
    #[serde(rename_all = "camelCase")]
    Contact {
        display_name: String,
        vcard: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        live: bool,
    },
    Reaction {
        key: MessageKey,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Poll {
        name: String,
        options: Vec<String>,
        selectable_count: u32,
    },
    Edit {
        key: MessageKey,
        message: Box<Message>,
    },
    Revoke {
        key: MessageKey,
    },
    /// Copy delivered to the sender's own devices so they can show the
    /// message as sent instead of received.
    #[serde(rename_all = "camelCase")]
    DeviceSent {
        destination_jid: Jid,
        message: Box<Message>,
    },
    #[serde(rename_all = "camelCase")]
    SenderKeyDistribution {
        group_id: Jid,
        /// Base64 distribution payload from the crypto primitives.
        distribution: String,
    },
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Message::Text { text: text.into() }
    }

    pub fn device_sent(destination_jid: Jid, message: Message) -> Self {
        Message::DeviceSent {
            destination_jid,
            message: Box::new(message),
        }
    }

    /// Value of the `mediatype` attribute on `enc`/`plaintext` nodes.
    pub fn media_type(&self) -> Option<&'static str> {
        match self {
            Message::Image { .. } => Some("image"),
            Message::Video { gif_playback, .. } => Some(if *gif_playback { "gif" } else { "video" }),
            Message::Audio { ptt, .. } => Some(if *ptt { "ptt" } else { "audio" }),
            Message::Document { .. } => Some("document"),
            Message::Sticker { .. } => Some("sticker"),
            Message::Contact { .. } => Some("vcard"),
            Message::Location { live: true, .. } => Some("livelocation"),
            Message::Location { live: false, .. } => None,
            Message::Edit { message, .. } | Message::DeviceSent { message, .. } => {
                message.media_type()
            }
            Message::Text { .. }
            | Message::Reaction { .. }
            | Message::Poll { .. }
            | Message::Revoke { .. }
            | Message::SenderKeyDistribution { .. } => None,
        }
    }

    /// Value of the outer `type` attribute of a message stanza.
    pub fn stanza_type(&self) -> &'static str {
        match self {
            Message::Reaction { .. } => "reaction",
            Message::Poll { .. } => "poll",
            Message::Edit { message, .. } | Message::DeviceSent { message, .. } => {
                message.stanza_type()
            }
            other if other.media_type().is_some() => "media",
            _ => "text",
        }
    }

    /// Value of the `edit` attribute, if this message edits or deletes another.
    pub fn edit_attribute(&self, destination: &Jid) -> Option<&'static str> {
        match self {
            Message::Edit { .. } => Some(EDIT_ATTR_EDIT),
            Message::Revoke { key } if destination.is_group() && !key.from_me => {
                Some(EDIT_ATTR_ADMIN_REVOKE)
            }
            Message::Revoke { .. } => Some(EDIT_ATTR_SENDER_REVOKE),
            Message::Reaction { text, .. } if text.is_empty() => Some(EDIT_ATTR_SENDER_REVOKE),
            _ => None,
        }
    }

    /// Serialized and randomly padded plaintext handed to the cipher.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        let pad: u8 = rand::thread_rng().gen_range(1..=16);
        bytes.extend(std::iter::repeat(pad).take(pad as usize));
        Ok(bytes)
    }

    pub fn decode(padded: &[u8]) -> Result<Self> {
        let pad = *padded
            .last()
            .ok_or_else(|| Error::Serialization("empty message plaintext".to_string()))?
            as usize;
        if pad == 0 || pad > padded.len() {
            return Err(Error::Serialization(format!(
                "bad padding {pad} on {} bytes",
                padded.len()
            )));
        }
        Ok(serde_json::from_slice(&padded[..padded.len() - pad])?)
    }
}

/// Random, fixed-length message id bound to the sending user.
pub fn generate_message_id(own_user: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut hasher = Sha256::new();
    hasher.update(now.to_be_bytes());
    hasher.update(own_user.as_bytes());
    hasher.update(rand::random::<[u8; 16]>());
    let digest = hasher.finalize();
    format!("{}{}", MESSAGE_ID_PREFIX, hex::encode_upper(&digest[..9]))
}

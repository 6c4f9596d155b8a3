use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const INDIVIDUAL_SERVER: &str = "s.whatsapp.net";
pub const LEGACY_INDIVIDUAL_SERVER: &str = "c.us";
pub const GROUP_SERVER: &str = "g.us";
pub const BROADCAST_SERVER: &str = "broadcast";
pub const NEWSLETTER_SERVER: &str = "newsletter";
pub const LID_SERVER: &str = "lid";
pub const STATUS_BROADCAST_USER: &str = "status";

/// Namespace part of a [`Jid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Server {
    Individual,
    Group,
    Broadcast,
    Newsletter,
    Lid,
}

impl Server {
    pub fn as_str(&self) -> &'static str {
        match self {
            Server::Individual => INDIVIDUAL_SERVER,
            Server::Group => GROUP_SERVER,
            Server::Broadcast => BROADCAST_SERVER,
            Server::Newsletter => NEWSLETTER_SERVER,
            Server::Lid => LID_SERVER,
        }
    }

    pub fn parse(server: &str) -> Option<Self> {
        match server {
            INDIVIDUAL_SERVER | LEGACY_INDIVIDUAL_SERVER => Some(Server::Individual),
            GROUP_SERVER => Some(Server::Group),
            BROADCAST_SERVER => Some(Server::Broadcast),
            NEWSLETTER_SERVER => Some(Server::Newsletter),
            LID_SERVER => Some(Server::Lid),
            _ => None,
        }
    }

    /// Only individual and lid addresses can name a specific device.
    pub fn supports_devices(&self) -> bool {
        matches!(self, Server::Individual | Server::Lid)
    }
}

/// A user, group or channel address with an optional device suffix.
///
/// Wire form is `user[:device]@server`. The primary device (`0`) is stored as
/// `None`, so every constructible value round-trips through its string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    user: String,
    server: Server,
    device: Option<u16>,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: Server) -> Result<Self> {
        let user = user.into();
        validate_user(&user)?;
        Ok(Self {
            user,
            server,
            device: None,
        })
    }

    pub fn with_device(user: impl Into<String>, server: Server, device: u16) -> Result<Self> {
        if !server.supports_devices() {
            return Err(Error::InvalidJid(format!(
                "device {device} not allowed on {}",
                server.as_str()
            )));
        }
        let mut jid = Self::new(user, server)?;
        jid.device = (device != 0).then_some(device);
        Ok(jid)
    }

    pub fn user_jid(user: impl Into<String>) -> Result<Self> {
        Self::new(user, Server::Individual)
    }

    /// The bare server address used as the `to` of iq queries.
    pub fn server_jid() -> Self {
        Self {
            user: String::new(),
            server: Server::Individual,
            device: None,
        }
    }

    pub fn status_broadcast() -> Self {
        Self {
            user: STATUS_BROADCAST_USER.to_string(),
            server: Server::Broadcast,
            device: None,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn server(&self) -> Server {
        self.server
    }

    pub fn device(&self) -> Option<u16> {
        self.device
    }

    /// Device id with the primary device spelled out as `0`.
    pub fn device_id(&self) -> u16 {
        self.device.unwrap_or(0)
    }

    /// The same address without a device suffix.
    pub fn to_non_device(&self) -> Self {
        Self {
            user: self.user.clone(),
            server: self.server,
            device: None,
        }
    }

    pub fn is_same_user(&self, other: &Jid) -> bool {
        self.user == other.user && self.server == other.server
    }

    pub fn is_group(&self) -> bool {
        self.server == Server::Group
    }

    pub fn is_broadcast(&self) -> bool {
        self.server == Server::Broadcast
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.is_broadcast() && self.user == STATUS_BROADCAST_USER
    }

    pub fn is_newsletter(&self) -> bool {
        self.server == Server::Newsletter
    }

    pub fn is_lid(&self) -> bool {
        self.server == Server::Lid
    }

    pub fn protocol_address(&self) -> ProtocolAddress {
        let name = match self.server {
            Server::Lid => format!("{}_1", self.user),
            _ => self.user.clone(),
        };
        ProtocolAddress {
            name,
            device: self.device_id(),
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn decode(raw: &str) -> Result<Self> {
        raw.parse()
    }
}

fn validate_user(user: &str) -> Result<()> {
    if user.contains(['@', ':']) {
        return Err(Error::InvalidJid(format!("illegal character in user {user:?}")));
    }
    Ok(())
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user)?;
        if let Some(device) = self.device {
            write!(f, ":{device}")?;
        }
        write!(f, "@{}", self.server.as_str())
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (user_part, server_part) = raw
            .split_once('@')
            .ok_or_else(|| Error::InvalidJid(format!("missing server in {raw:?}")))?;
        let server = Server::parse(server_part)
            .ok_or_else(|| Error::InvalidJid(format!("unknown server in {raw:?}")))?;

        match user_part.split_once(':') {
            Some((user, device)) => {
                let device: u16 = device
                    .parse()
                    .map_err(|_| Error::InvalidJid(format!("bad device in {raw:?}")))?;
                Jid::with_device(user, server, device)
            }
            None => Jid::new(user_part, server),
        }
    }
}

impl Serialize for Jid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Stable per-device key for session records: `user.device`, or
/// `user_1.device` in the lid namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolAddress {
    name: String,
    device: u16,
}

impl ProtocolAddress {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> u16 {
        self.device
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device)
    }
}

/// One linked device of a user, as reported by the device directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub user: String,
    pub device: u16,
    pub server: Server,
}

impl DeviceEntry {
    pub fn new(user: impl Into<String>, device: u16, server: Server) -> Self {
        Self {
            user: user.into(),
            device,
            server,
        }
    }

    pub fn to_jid(&self) -> Result<Jid> {
        Jid::with_device(self.user.clone(), self.server, self.device)
    }
}

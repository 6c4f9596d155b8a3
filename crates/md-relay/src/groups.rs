use crate::jid::GROUP_SERVER;
use crate::{BinaryNode, Jid, Result, Server, Transport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const GROUPS_XMLNS: &str = "w:g2";

/// Namespace group members are addressed in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressingMode {
    #[default]
    Pn,
    Lid,
}

impl AddressingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressingMode::Pn => "pn",
            AddressingMode::Lid => "lid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub jid: Jid,
    /// `admin` or `superadmin`; absent for regular members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetadata {
    pub id: Jid,
    pub subject: String,
    pub addressing_mode: AddressingMode,
    pub participants: Vec<GroupParticipant>,
}

impl GroupMetadata {
    pub fn participant_jids(&self) -> Vec<Jid> {
        self.participants.iter().map(|p| p.jid.clone()).collect()
    }
}

/// Participant lists for group destinations. Cached until invalidated.
pub struct GroupDirectory {
    transport: Arc<dyn Transport>,
    cache: Mutex<HashMap<Jid, GroupMetadata>>,
}

impl GroupDirectory {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn metadata(&self, group: &Jid, use_cache: bool) -> Result<GroupMetadata> {
        if use_cache {
            if let Some(cached) = self.cache.lock().unwrap().get(group) {
                return Ok(cached.clone());
            }
        }

        debug!(%group, "fetching group metadata");
        let response = self.transport.query(build_metadata_query(group))?;
        let metadata = parse_group_metadata(&response)?;
        self.cache
            .lock()
            .unwrap()
            .insert(group.clone(), metadata.clone());
        Ok(metadata)
    }

    pub fn invalidate(&self, group: &Jid) {
        self.cache.lock().unwrap().remove(group);
    }
}

pub fn build_metadata_query(group: &Jid) -> BinaryNode {
    BinaryNode::new("iq")
        .with_attr("type", "get")
        .with_attr("xmlns", GROUPS_XMLNS)
        .with_attr("to", group.encode())
        .with_children(vec![
            BinaryNode::new("query").with_attr("request", "interactive")
        ])
}

pub fn parse_group_metadata(response: &BinaryNode) -> Result<GroupMetadata> {
    response.assert_error_free()?;
    let group = response.require_child("group")?;

    let raw_id = group.require_attr("id")?;
    let id = if raw_id.contains('@') {
        Jid::decode(raw_id)?
    } else {
        Jid::decode(&format!("{raw_id}@{GROUP_SERVER}"))?
    };
    let addressing_mode = match group.attr("addressing_mode") {
        Some("lid") => AddressingMode::Lid,
        _ => AddressingMode::Pn,
    };

    let mut participants = Vec::new();
    for participant in group.children_with_tag("participant") {
        let jid = Jid::decode(participant.require_attr("jid")?)?;
        if !matches!(jid.server(), Server::Individual | Server::Lid) {
            continue;
        }
        participants.push(GroupParticipant {
            jid,
            role: participant.attr("type").map(str::to_string),
        });
    }

    Ok(GroupMetadata {
        id,
        subject: group.attr("subject").unwrap_or_default().to_string(),
        addressing_mode,
        participants,
    })
}

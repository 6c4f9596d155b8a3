use crate::credentials::CredentialsHandle;
use crate::{BinaryNode, DeviceEntry, Error, Jid, Result, Transport};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const USYNC_XMLNS: &str = "usync";

/// Resolves users to their linked devices. Entries stay cached for the life
/// of the process until invalidated.
pub struct DeviceDirectory {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialsHandle>,
    cache: Mutex<HashMap<Jid, Vec<DeviceEntry>>>,
}

impl DeviceDirectory {
    pub fn new(transport: Arc<dyn Transport>, credentials: Arc<CredentialsHandle>) -> Self {
        Self {
            transport,
            credentials,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Devices of every user in `jids`. Cache misses are fetched in one usync
    /// query. Our own device is never returned.
    pub fn resolve_devices(
        &self,
        jids: &[Jid],
        use_cache: bool,
        ignore_zero_device: bool,
    ) -> Result<Vec<DeviceEntry>> {
        let mut users = Vec::new();
        let mut seen = BTreeSet::new();
        for jid in jids {
            let user = jid.to_non_device();
            if seen.insert(user.clone()) {
                users.push(user);
            }
        }

        let mut resolved: HashMap<Jid, Vec<DeviceEntry>> = HashMap::new();
        let mut to_fetch = Vec::new();
        {
            let cache = self.cache.lock().unwrap();
            for user in &users {
                match cache.get(user) {
                    Some(devices) if use_cache => {
                        resolved.insert(user.clone(), devices.clone());
                    }
                    _ => to_fetch.push(user.clone()),
                }
            }
        }

        if !to_fetch.is_empty() {
            debug!(count = to_fetch.len(), "querying devices");
            let sid = uuid::Uuid::new_v4().to_string();
            let response = self.transport.query(build_usync_query(&to_fetch, &sid))?;
            let fetched = parse_usync_devices(&response)?;

            let mut cache = self.cache.lock().unwrap();
            for (user, devices) in fetched {
                cache.insert(user.clone(), devices.clone());
                resolved.insert(user, devices);
            }
        }

        let credentials = self.credentials.snapshot();
        let mut out = Vec::new();
        for user in &users {
            let Some(devices) = resolved.get(user) else {
                continue;
            };
            for entry in devices {
                if ignore_zero_device && entry.device == 0 {
                    continue;
                }
                if credentials.is_own_device(&entry.to_jid()?) {
                    continue;
                }
                out.push(entry.clone());
            }
        }
        Ok(out)
    }

    pub fn cached(&self, user: &Jid) -> Option<Vec<DeviceEntry>> {
        self.cache.lock().unwrap().get(&user.to_non_device()).cloned()
    }

    pub fn invalidate(&self, user: &Jid) {
        self.cache.lock().unwrap().remove(&user.to_non_device());
    }

    pub fn invalidate_all(&self) {
        self.cache.lock().unwrap().clear();
    }
}

pub fn build_usync_query(users: &[Jid], sid: &str) -> BinaryNode {
    let list = users
        .iter()
        .map(|jid| BinaryNode::new("user").with_attr("jid", jid.encode()))
        .collect();
    BinaryNode::new("iq")
        .with_attr("to", Jid::server_jid().encode())
        .with_attr("type", "get")
        .with_attr("xmlns", USYNC_XMLNS)
        .with_children(vec![BinaryNode::new("usync")
            .with_attr("sid", sid)
            .with_attr("mode", "query")
            .with_attr("last", "true")
            .with_attr("index", "0")
            .with_attr("context", "message")
            .with_children(vec![
                BinaryNode::new("query")
                    .with_children(vec![BinaryNode::new("devices").with_attr("version", "2")]),
                BinaryNode::new("list").with_children(list),
            ])])
}

/// Device lists per user from a usync response. Secondary devices without a
/// `key-index` are not usable yet and are dropped.
pub fn parse_usync_devices(response: &BinaryNode) -> Result<Vec<(Jid, Vec<DeviceEntry>)>> {
    response.assert_error_free()?;
    let list = response.require_child("usync")?.require_child("list")?;

    let mut out = Vec::new();
    for user in list.children_with_tag("user") {
        let jid = Jid::decode(user.require_attr("jid")?)?.to_non_device();
        let Some(devices) = user.child("devices") else {
            continue;
        };
        devices.assert_error_free()?;

        let mut entries = Vec::new();
        for device in devices.require_child("device-list")?.children_with_tag("device") {
            let raw_id = device.require_attr("id")?;
            let id: u16 = raw_id
                .parse()
                .map_err(|_| Error::Protocol(format!("bad device id {raw_id:?} for {jid}")))?;
            if id != 0 && device.attr("key-index").is_none() {
                continue;
            }
            entries.push(DeviceEntry::new(jid.user(), id, jid.server()));
        }
        out.push((jid, entries));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use crate::test_utils::{usync_response, MockTransport};
    use crate::{InMemoryStorage, Server};

    fn directory(transport: Arc<MockTransport>) -> DeviceDirectory {
        let me = Jid::with_device("100", Server::Individual, 2).unwrap();
        let credentials = CredentialsHandle::new(
            Arc::new(InMemoryStorage::new()),
            Credentials::new(me, vec![1]),
        );
        DeviceDirectory::new(transport, Arc::new(credentials))
    }

    #[test]
    fn filters_own_device_zero_and_unkeyed() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(usync_response(&[
            ("100", &[(0, None), (2, Some(1)), (3, Some(2))]),
            ("200", &[(0, None), (5, None), (6, Some(3))]),
        ]));
        let directory = directory(transport.clone());
        let jids = [Jid::user_jid("100").unwrap(), Jid::user_jid("200").unwrap()];

        let devices = directory.resolve_devices(&jids, true, true).unwrap();
        let ids: Vec<_> = devices.iter().map(|d| (d.user.as_str(), d.device)).collect();
        assert_eq!(ids, vec![("100", 3), ("200", 6)]);

        let with_primary = directory.resolve_devices(&jids, true, false).unwrap();
        assert_eq!(with_primary.len(), 4);
        assert_eq!(transport.queries().len(), 1);
    }

    #[test]
    fn cache_bypass_refetches() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(usync_response(&[("200", &[(0, None)])]));
        transport.push_response(usync_response(&[("200", &[(0, None), (1, Some(1))])]));
        let directory = directory(transport.clone());
        let jids = [Jid::user_jid("200").unwrap()];

        assert_eq!(directory.resolve_devices(&jids, true, false).unwrap().len(), 1);
        assert_eq!(directory.resolve_devices(&jids, false, false).unwrap().len(), 2);
        assert_eq!(directory.cached(&jids[0]).unwrap().len(), 2);
        assert_eq!(transport.queries().len(), 2);
    }

    #[test]
    fn invalidation_forces_a_new_query() {
        let transport = Arc::new(MockTransport::new());
        transport.push_response(usync_response(&[("200", &[(0, None)])]));
        transport.push_response(usync_response(&[("200", &[(0, None)])]));
        let directory = directory(transport.clone());
        let jids = [Jid::user_jid("200").unwrap()];

        directory.resolve_devices(&jids, true, false).unwrap();
        directory.invalidate(&jids[0]);
        assert!(directory.cached(&jids[0]).is_none());
        directory.resolve_devices(&jids, true, false).unwrap();
        assert_eq!(transport.queries().len(), 2);
    }

    #[test]
    fn query_failure_propagates() {
        let transport = Arc::new(MockTransport::new());
        transport.push_error(Error::Timeout("usync".into()));
        let directory = directory(transport);
        let err = directory
            .resolve_devices(&[Jid::user_jid("200").unwrap()], true, false)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn query_shape() {
        let node = build_usync_query(&[Jid::user_jid("200").unwrap()], "sid-1");
        let usync = node.require_child("usync").unwrap();
        assert_eq!(node.attr("xmlns"), Some("usync"));
        assert_eq!(usync.attr("context"), Some("message"));
        assert_eq!(
            usync.require_child("query").unwrap().child("devices").unwrap().attr("version"),
            Some("2")
        );
    }
}

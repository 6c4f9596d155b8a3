use crate::storage::{get_json, put_json};
use crate::{Jid, Result, StorageAdapter};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

type DeviceFlags = BTreeMap<String, bool>;

/// Which devices of a group already hold our current sender key.
pub struct SenderKeyMemory {
    storage: Arc<dyn StorageAdapter>,
    groups: Mutex<HashMap<Jid, DeviceFlags>>,
}

impl SenderKeyMemory {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// The subset of `devices` not yet sent the distribution message, in
    /// input order.
    pub fn missing(&self, group: &Jid, devices: &[Jid]) -> Result<Vec<Jid>> {
        let mut groups = self.groups.lock().unwrap();
        let flags = self.loaded(&mut groups, group)?;
        Ok(devices
            .iter()
            .filter(|jid| !flags.get(&jid.encode()).copied().unwrap_or(false))
            .cloned()
            .collect())
    }

    pub fn mark(&self, group: &Jid, devices: &[Jid]) -> Result<()> {
        if devices.is_empty() {
            return Ok(());
        }
        let mut groups = self.groups.lock().unwrap();
        let flags = self.loaded(&mut groups, group)?;
        let mut next = flags.clone();
        for jid in devices {
            next.insert(jid.encode(), true);
        }
        put_json(self.storage.as_ref(), &self.key(group), &next)?;
        *flags = next;
        Ok(())
    }

    /// Forgets every device of `group`; the next relay redistributes the key.
    pub fn reset(&self, group: &Jid) -> Result<()> {
        self.groups.lock().unwrap().remove(group);
        self.storage.del(&self.key(group))
    }

    pub fn snapshot(&self, group: &Jid) -> Result<DeviceFlags> {
        let mut groups = self.groups.lock().unwrap();
        Ok(self.loaded(&mut groups, group)?.clone())
    }

    fn loaded<'a>(
        &self,
        groups: &'a mut HashMap<Jid, DeviceFlags>,
        group: &Jid,
    ) -> Result<&'a mut DeviceFlags> {
        if !groups.contains_key(group) {
            let stored: Option<DeviceFlags> = get_json(self.storage.as_ref(), &self.key(group))?;
            groups.insert(group.clone(), stored.unwrap_or_default());
        }
        Ok(groups.entry(group.clone()).or_default())
    }

    fn key(&self, group: &Jid) -> String {
        format!("v1/sender-key-memory/{}", group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryStorage, Server};

    fn device(user: &str, id: u16) -> Jid {
        Jid::with_device(user, Server::Individual, id).unwrap()
    }

    #[test]
    fn marked_devices_are_not_missing() {
        let memory = SenderKeyMemory::new(Arc::new(InMemoryStorage::new()));
        let group = Jid::decode("1-1@g.us").unwrap();
        let devices = [device("1", 0), device("1", 2), device("2", 0)];

        assert_eq!(memory.missing(&group, &devices).unwrap().len(), 3);
        memory.mark(&group, &devices[..2]).unwrap();
        assert_eq!(memory.missing(&group, &devices).unwrap(), vec![device("2", 0)]);
    }

    #[test]
    fn survives_reload_until_reset() {
        let storage = Arc::new(InMemoryStorage::new());
        let group = Jid::decode("1-1@g.us").unwrap();
        let devices = [device("1", 0)];

        SenderKeyMemory::new(storage.clone()).mark(&group, &devices).unwrap();
        let reloaded = SenderKeyMemory::new(storage.clone());
        assert!(reloaded.missing(&group, &devices).unwrap().is_empty());

        reloaded.reset(&group).unwrap();
        assert_eq!(reloaded.missing(&group, &devices).unwrap().len(), 1);
        assert!(SenderKeyMemory::new(storage).snapshot(&group).unwrap().is_empty());
    }
}

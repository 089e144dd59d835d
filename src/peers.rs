//! The known-peer registry.
//!
//! A sled-backed record of every peer this node has heard of: declared
//! preservation groups, contact recency and the highest agreement it has
//! shown in past polls. The registry feeds invitation weighting, the
//! group-compatibility filter and the voter-side repair policy.

use crate::peer_id::Id;
use crate::Result;

use zerocopy::{AsBytes, FromBytes, Unaligned};

use std::time::SystemTime;

const TREE_NAME: &str = "known-peers";

#[derive(Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct Key {
    id: [u8; 32],
}

impl Key {
    fn new(id: &Id) -> Key {
        Key { id: id.bytes() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: Id,
    /// Preservation groups the peer declares; peers whose groups are known
    /// to be disjoint from ours are not invited.
    pub groups: Vec<String>,
    pub last_contact: Option<SystemTime>,
    pub last_invited: Option<SystemTime>,
    /// Highest agreement (percent) this peer has shown us across past
    /// polls; gates whether we serve it repairs.
    pub highest_agreement: Option<u32>,
    /// When a group-incompatible peer becomes eligible for a retry.
    pub group_retry_at: Option<SystemTime>,
}

impl PeerEntry {
    pub fn new(id: Id) -> Self {
        PeerEntry {
            id,
            groups: vec![],
            last_contact: None,
            last_invited: None,
            highest_agreement: None,
            group_retry_at: None,
        }
    }
}

/// Handle to the peer table; cheap to clone (sled trees are shared).
#[derive(Clone)]
pub struct PeerRegistry {
    tree: sled::Tree,
}

impl PeerRegistry {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(PeerRegistry { tree: db.open_tree(TREE_NAME)? })
    }

    pub fn upsert(&self, entry: &PeerEntry) -> Result<()> {
        let key = Key::new(&entry.id);
        let encoded = bincode::serialize(entry)?;
        self.tree.insert(key.as_bytes(), encoded)?;
        Ok(())
    }

    pub fn get(&self, id: &Id) -> Result<Option<PeerEntry>> {
        let key = Key::new(id);
        match self.tree.get(key.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn all(&self) -> Result<Vec<PeerEntry>> {
        let mut entries = vec![];
        for item in self.tree.iter() {
            let (_key, value) = item?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    /// Ensures an entry exists for a nominated peer we have never seen.
    pub fn admit(&self, id: &Id) -> Result<PeerEntry> {
        match self.get(id)? {
            Some(entry) => Ok(entry),
            None => {
                let entry = PeerEntry::new(*id);
                self.upsert(&entry)?;
                Ok(entry)
            }
        }
    }

    pub fn record_contact(&self, id: &Id) -> Result<()> {
        let mut entry = self.admit(id)?;
        entry.last_contact = Some(SystemTime::now());
        self.upsert(&entry)
    }

    pub fn record_invited(&self, id: &Id) -> Result<()> {
        let mut entry = self.admit(id)?;
        entry.last_invited = Some(SystemTime::now());
        self.upsert(&entry)
    }

    /// Records an agreement score, keeping the highest seen.
    pub fn record_agreement(&self, id: &Id, percent: u32) -> Result<()> {
        let mut entry = self.admit(id)?;
        entry.highest_agreement = Some(match entry.highest_agreement {
            Some(prior) => prior.max(percent),
            None => percent,
        });
        entry.last_contact = Some(SystemTime::now());
        self.upsert(&entry)
    }

    pub fn set_groups(&self, id: &Id, groups: Vec<String>) -> Result<()> {
        let mut entry = self.admit(id)?;
        entry.groups = groups;
        self.upsert(&entry)
    }

    /// The recorded agreement for a peer, defaulting to zero.
    pub fn agreement(&self, id: &Id) -> Result<u32> {
        Ok(self.get(id)?.and_then(|e| e.highest_agreement).unwrap_or(0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry() -> PeerRegistry {
        let db = sled::Config::new().temporary(true).open().unwrap();
        PeerRegistry::open(&db).unwrap()
    }

    #[test]
    fn test_upsert_get_roundtrip() {
        let reg = registry();
        let id = Id::generate();
        let mut entry = PeerEntry::new(id);
        entry.groups = vec!["humanities".to_string()];
        reg.upsert(&entry).unwrap();
        let loaded = reg.get(&id).unwrap().unwrap();
        assert_eq!(loaded.groups, vec!["humanities".to_string()]);
    }

    #[test]
    fn test_agreement_keeps_highest() {
        let reg = registry();
        let id = Id::generate();
        reg.record_agreement(&id, 40).unwrap();
        reg.record_agreement(&id, 80).unwrap();
        reg.record_agreement(&id, 60).unwrap();
        assert_eq!(reg.agreement(&id).unwrap(), 80);
    }

    #[test]
    fn test_admit_is_idempotent() {
        let reg = registry();
        let id = Id::generate();
        reg.admit(&id).unwrap();
        reg.record_contact(&id).unwrap();
        let entry = reg.admit(&id).unwrap();
        assert!(entry.last_contact.is_some());
        assert_eq!(reg.all().unwrap().len(), 1);
    }
}

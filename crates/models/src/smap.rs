use crate::{ModelError, NodeFlags, Revs, Snode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Smap is the versioned cluster map: all proxies and targets, and the
/// identity of the current primary. Mutated only by the primary (through
/// the transaction coordinator) and replicated by metasync. Readers hold
/// an immutable snapshot behind an `Arc`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Smap {
    pub version: i64,
    pub uuid: String,
    pub primary_id: String,
    pub pmap: BTreeMap<String, Snode>,
    pub tmap: BTreeMap<String, Snode>,
}

impl Smap {
    pub fn new(uuid: impl Into<String>, primary: Snode) -> Self {
        let mut pmap = BTreeMap::new();
        let primary_id = primary.id.clone();
        pmap.insert(primary.id.clone(), primary);
        Self {
            version: 1,
            uuid: uuid.into(),
            primary_id,
            pmap,
            tmap: BTreeMap::new(),
        }
    }

    pub fn count_targets(&self) -> usize {
        self.tmap.len()
    }
    pub fn count_proxies(&self) -> usize {
        self.pmap.len()
    }

    pub fn count_active_targets(&self) -> usize {
        self.active_targets().count()
    }

    /// Targets eligible for placement: not in maintenance, not
    /// decommissioning.
    pub fn active_targets(&self) -> impl Iterator<Item = &Snode> {
        self.tmap.values().filter(|n| !n.in_maint_or_decomm())
    }

    pub fn active_proxies(&self) -> impl Iterator<Item = &Snode> {
        self.pmap.values().filter(|n| !n.in_maint_or_decomm())
    }

    pub fn get_node(&self, id: &str) -> Option<&Snode> {
        self.tmap.get(id).or_else(|| self.pmap.get(id))
    }

    pub fn primary(&self) -> Option<&Snode> {
        self.pmap.get(&self.primary_id)
    }

    pub fn is_primary(&self, id: &str) -> bool {
        self.primary_id == id
    }

    /// Add or replace a node; the version must be bumped by the caller
    /// exactly once per mutation batch.
    pub fn put_node(&mut self, node: Snode) {
        let map = if node.is_target() {
            &mut self.tmap
        } else {
            &mut self.pmap
        };
        map.insert(node.id.clone(), node);
    }

    pub fn remove_node(&mut self, id: &str) -> Result<Snode, ModelError> {
        self.tmap
            .remove(id)
            .or_else(|| self.pmap.remove(id))
            .ok_or_else(|| ModelError::NodeNotFound(id.to_string()))
    }

    pub fn set_node_flags(&mut self, id: &str, bit: u16, on: bool) -> Result<(), ModelError> {
        let node = self
            .tmap
            .get_mut(id)
            .or_else(|| self.pmap.get_mut(id))
            .ok_or_else(|| ModelError::NodeNotFound(id.to_string()))?;
        if on {
            node.flags.set(bit);
        } else {
            node.flags.clear(bit);
        }
        Ok(())
    }

    /// Structural invariants: exactly one primary, present in pmap,
    /// and the primary is a proxy.
    pub fn validate(&self) -> Result<(), ModelError> {
        let primary = self
            .pmap
            .get(&self.primary_id)
            .ok_or_else(|| ModelError::NodeNotFound(self.primary_id.clone()))?;
        debug_assert!(primary.is_proxy());
        Ok(())
    }
}

impl Revs for Smap {
    const KIND: &'static str = "smap";
    const FNAME: &'static str = ".strand.smap";

    fn version(&self) -> i64 {
        self.version
    }
    fn bump(&mut self) {
        self.version += 1;
    }
    fn uuid(&self) -> Option<&str> {
        Some(&self.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeRole;

    fn node(id: &str, role: NodeRole) -> Snode {
        Snode::new(id, role, "http://127.0.0.1:8080".parse().unwrap())
    }

    fn smap() -> Smap {
        let mut smap = Smap::new("u-1", node("p1", NodeRole::Proxy));
        for tid in ["t1", "t2", "t3", "t4"] {
            smap.put_node(node(tid, NodeRole::Target));
        }
        smap
    }

    #[test]
    fn maintenance_excludes_from_active() {
        let mut smap = smap();
        assert_eq!(smap.count_active_targets(), 4);

        smap.set_node_flags("t2", NodeFlags::MAINTENANCE, true).unwrap();
        assert_eq!(smap.count_targets(), 4);
        assert_eq!(smap.count_active_targets(), 3);
        assert!(smap.active_targets().all(|n| n.id != "t2"));

        smap.set_node_flags("t2", NodeFlags::MAINTENANCE, false).unwrap();
        assert_eq!(smap.count_active_targets(), 4);
    }

    #[test]
    fn validate_requires_known_primary() {
        let mut smap = smap();
        assert!(smap.validate().is_ok());
        smap.primary_id = "p-gone".to_string();
        assert!(smap.validate().is_err());
    }

    #[test]
    fn versions_strictly_increase() {
        let mut smap = smap();
        let v = smap.version;
        smap.bump();
        assert_eq!(smap.version, v + 1);
    }
}

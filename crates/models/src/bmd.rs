use crate::{Bck, BckProps, Revs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bmd is the versioned bucket metadata: every bucket the cluster knows
/// about, with its full property set. Keyed by the bucket's canonical
/// uname so that JSON round-trips keep a stable ordering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bmd {
    pub version: i64,
    pub uuid: String,
    buckets: BTreeMap<String, (Bck, BckProps)>,
}

impl Bmd {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            version: 1,
            uuid: uuid.into(),
            buckets: BTreeMap::new(),
        }
    }

    pub fn get(&self, bck: &Bck) -> Option<&BckProps> {
        self.buckets.get(&bck.uname()).map(|(_, p)| p)
    }

    pub fn exists(&self, bck: &Bck) -> bool {
        self.buckets.contains_key(&bck.uname())
    }

    /// Insert or replace; returns the previous props when replacing.
    /// The per-bucket `bid` generation advances on every write.
    pub fn put(&mut self, bck: Bck, mut props: BckProps) -> Option<BckProps> {
        props.bid += 1;
        self.buckets
            .insert(bck.uname(), (bck, props))
            .map(|(_, p)| p)
    }

    pub fn remove(&mut self, bck: &Bck) -> Option<BckProps> {
        self.buckets.remove(&bck.uname()).map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bck, &BckProps)> {
        self.buckets.values().map(|(b, p)| (b, p))
    }
}

impl Revs for Bmd {
    const KIND: &'static str = "bmd";
    const FNAME: &'static str = ".strand.bmd";

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

    #[test]
    fn put_get_remove() {
        let mut bmd = Bmd::new("u");
        let bck = Bck::ais("nnn");
        assert!(!bmd.exists(&bck));

        bmd.put(bck.clone(), BckProps::default());
        assert!(bmd.exists(&bck));
        assert_eq!(bmd.get(&bck).unwrap().bid, 1);

        // Replacing advances the generation.
        bmd.put(bck.clone(), bmd.get(&bck).unwrap().clone());
        assert_eq!(bmd.get(&bck).unwrap().bid, 2);

        assert!(bmd.remove(&bck).is_some());
        assert!(bmd.get(&bck).is_none());
    }

    #[test]
    fn json_round_trip() {
        let mut bmd = Bmd::new("u");
        bmd.put(Bck::ais("a"), BckProps::default());
        bmd.put("aws://b".parse().unwrap(), BckProps::default());
        bmd.bump();

        let text = serde_json::to_string(&bmd).unwrap();
        let back: Bmd = serde_json::from_str(&text).unwrap();
        assert_eq!(bmd, back);
    }
}

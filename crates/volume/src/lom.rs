use crate::{fqn, ContentType, Mountpath, MpiSnap, VolumeError};
use models::{Bck, ChecksumType, WritePolicy};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Extended attribute holding the packed object metadata.
const LOM_XATTR: &str = "user.strand.lom";

/// LomMd is the persisted part of an object's metadata: everything that
/// must survive restarts, packed (msgpack) into one extended attribute
/// on the canonical replica and on every copy.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LomMd {
    pub size: i64,
    pub cksum_type: ChecksumType,
    pub cksum_value: String,
    #[serde(default)]
    pub version: String,
    /// Nanoseconds since the Unix epoch.
    #[serde(default)]
    pub atime_ns: i64,
    /// ETag, source MD5/CRC32C, origin provider, and the like.
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
    /// Mountpaths holding extra replicas (canonical one excluded).
    #[serde(default)]
    pub copies: BTreeSet<PathBuf>,
}

/// Lom is one object's local metadata record plus its resolved
/// location. Created per-request; heavy state lives in LomMd.
#[derive(Debug, Clone)]
pub struct Lom {
    pub bck: Bck,
    pub objname: String,
    pub mi: Arc<Mountpath>,
    pub fqn: PathBuf,
    pub md: LomMd,
    dirty: bool,
}

impl Lom {
    /// Resolve the canonical (HRW) location of (bck, objname).
    pub fn init(bck: Bck, objname: &str, snap: &MpiSnap) -> Result<Self, VolumeError> {
        let uname = bck.make_uname(objname);
        let mi = snap.hrw_mountpath(&uname)?.clone();
        let fqn = fqn(&mi, &bck, ContentType::Obj, objname);
        Ok(Self {
            bck,
            objname: objname.to_string(),
            mi,
            fqn,
            md: LomMd::default(),
            dirty: false,
        })
    }

    /// A Lom for a replica at a specific (non-HRW) mountpath.
    pub fn init_at(bck: Bck, objname: &str, mi: Arc<Mountpath>) -> Self {
        let fqn = fqn(&mi, &bck, ContentType::Obj, objname);
        Self {
            bck,
            objname: objname.to_string(),
            mi,
            fqn,
            md: LomMd::default(),
            dirty: false,
        }
    }

    pub fn uname(&self) -> String {
        self.bck.make_uname(&self.objname)
    }

    /// Whether this location is the object's HRW home.
    pub fn is_hrw(&self, snap: &MpiSnap) -> bool {
        snap.hrw_mountpath(&self.uname())
            .map(|mi| mi.path == self.mi.path)
            .unwrap_or(false)
    }

    /// Load metadata from the extended attribute. A missing file is
    /// not-found; a present file with missing or undecodable metadata
    /// is corruption.
    pub fn load(&mut self) -> Result<(), VolumeError> {
        if !self.fqn.exists() {
            return Err(VolumeError::ObjNotFound(self.uname()));
        }
        let raw = xattr::get(&self.fqn, LOM_XATTR)
            .map_err(VolumeError::Io)?
            .ok_or_else(|| VolumeError::CorruptedMeta(format!("{}: no metadata", self.uname())))?;
        self.md = rmp_serde::from_slice(&raw)
            .map_err(|err| VolumeError::CorruptedMeta(format!("{}: {err}", self.uname())))?;
        self.dirty = false;
        Ok(())
    }

    /// Persist metadata per the bucket's md write-policy.
    pub fn persist(&mut self, policy: WritePolicy) -> Result<(), VolumeError> {
        match policy {
            WritePolicy::Immediate => self.persist_now(),
            WritePolicy::Delayed => {
                self.dirty = true;
                Ok(())
            }
            WritePolicy::Never => Ok(()),
        }
    }

    pub fn persist_now(&mut self) -> Result<(), VolumeError> {
        let raw = rmp_serde::to_vec(&self.md)
            .map_err(|err| VolumeError::CorruptedMeta(err.to_string()))?;
        xattr::set(&self.fqn, LOM_XATTR, &raw).map_err(VolumeError::Io)?;
        self.dirty = false;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Total replica count including the canonical copy.
    pub fn num_copies(&self) -> usize {
        1 + self.md.copies.len()
    }

    pub fn has_copy_on(&self, mpath: &std::path::Path) -> bool {
        self.mi.path == mpath || self.md.copies.contains(mpath)
    }

    pub fn add_copy(&mut self, mpath: PathBuf) {
        if mpath != self.mi.path {
            self.md.copies.insert(mpath);
        }
    }

    pub fn del_copy(&mut self, mpath: &std::path::Path) -> bool {
        self.md.copies.remove(mpath)
    }
}

/// LomCache keeps recently loaded metadata so hot objects skip the
/// xattr read. Bounded; evicts in insertion order under pressure.
pub struct LomCache {
    max: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    map: BTreeMap<String, LomMd>,
    order: VecDeque<String>,
}

impl LomCache {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            inner: Mutex::new(CacheInner {
                map: BTreeMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, uname: &str) -> Option<LomMd> {
        self.inner.lock().unwrap().map.get(uname).cloned()
    }

    pub fn put(&self, uname: String, md: LomMd) {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.insert(uname.clone(), md).is_none() {
            inner.order.push_back(uname);
        }
        while inner.map.len() > self.max {
            let Some(evict) = inner.order.pop_front() else {
                break;
            };
            inner.map.remove(&evict);
        }
    }

    pub fn invalidate(&self, uname: &str) {
        self.inner.lock().unwrap().map.remove(uname);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mpi;

    fn fixture() -> (tempfile::TempDir, Arc<MpiSnap>) {
        let dir = tempfile::tempdir().unwrap();
        let mpi = Mpi::new(true);
        mpi.attach(dir.path(), "").unwrap();
        let snap = mpi.snapshot();
        (dir, snap)
    }

    fn put_object(lom: &Lom, body: &[u8]) {
        std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
        std::fs::write(&lom.fqn, body).unwrap();
    }

    #[test]
    fn metadata_round_trips() {
        let (_dir, snap) = fixture();
        let mut lom = Lom::init(Bck::ais("b"), "k", &snap).unwrap();
        put_object(&lom, b"hello");

        lom.md.size = 5;
        lom.md.cksum_type = ChecksumType::XxHash;
        lom.md.cksum_value = "abc123".to_string();
        lom.md.version = "v2".to_string();
        lom.md.atime_ns = 1_700_000_000_000_000_000;
        lom.md.custom.insert("ETag".to_string(), "\"e\"".to_string());
        lom.md.custom.insert("source".to_string(), "aws".to_string());
        lom.persist(WritePolicy::Immediate).unwrap();

        let mut other = Lom::init(Bck::ais("b"), "k", &snap).unwrap();
        other.load().unwrap();
        assert_eq!(other.md, lom.md);
    }

    #[test]
    fn missing_object_vs_corrupt_metadata() {
        let (_dir, snap) = fixture();
        let mut lom = Lom::init(Bck::ais("b"), "gone", &snap).unwrap();
        assert!(matches!(lom.load(), Err(VolumeError::ObjNotFound(_))));

        // A file without (or with garbage) metadata is corruption.
        put_object(&lom, b"data");
        assert!(matches!(lom.load(), Err(VolumeError::CorruptedMeta(_))));

        xattr::set(&lom.fqn, LOM_XATTR, b"\xff\xff not msgpack").unwrap();
        assert!(matches!(lom.load(), Err(VolumeError::CorruptedMeta(_))));
    }

    #[test]
    fn delayed_policy_defers_the_write() {
        let (_dir, snap) = fixture();
        let mut lom = Lom::init(Bck::ais("b"), "k", &snap).unwrap();
        put_object(&lom, b"x");
        lom.md.size = 1;
        lom.persist(WritePolicy::Delayed).unwrap();
        assert!(lom.is_dirty());

        let mut fresh = Lom::init(Bck::ais("b"), "k", &snap).unwrap();
        assert!(fresh.load().is_err()); // nothing written yet

        lom.persist_now().unwrap();
        assert!(!lom.is_dirty());
        fresh.load().unwrap();
        assert_eq!(fresh.md.size, 1);
    }

    #[test]
    fn copies_accounting() {
        let (_dir, snap) = fixture();
        let mut lom = Lom::init(Bck::ais("b"), "k", &snap).unwrap();
        assert_eq!(lom.num_copies(), 1);

        // The canonical mountpath is never recorded as an extra copy.
        let home = lom.mi.path.clone();
        lom.add_copy(home.clone());
        assert_eq!(lom.num_copies(), 1);

        lom.add_copy(PathBuf::from("/other/mp"));
        assert_eq!(lom.num_copies(), 2);
        assert!(lom.has_copy_on(std::path::Path::new("/other/mp")));
        assert!(lom.has_copy_on(&home));

        assert!(lom.del_copy(std::path::Path::new("/other/mp")));
        assert_eq!(lom.num_copies(), 1);
    }

    #[test]
    fn cache_evicts_in_order() {
        let cache = LomCache::new(2);
        cache.put("a".into(), LomMd::default());
        cache.put("b".into(), LomMd::default());
        cache.put("c".into(), LomMd::default());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
    }
}

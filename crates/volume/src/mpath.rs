use crate::VolumeError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MountpathFlags {
    /// Detach is pending: invisible to HRW, still serving reads.
    #[serde(default)]
    pub waiting_dd: bool,
    #[serde(default)]
    pub disabled: bool,
}

/// Mountpath is one local storage root: the unit of disk parallelism
/// and of placement-within-target. Immutable once constructed; flag
/// changes swap a fresh instance into the registry snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Mountpath {
    pub path: PathBuf,
    pub fsid: u64,
    /// Precomputed HRW digest of the canonical path.
    pub digest: u64,
    pub label: String,
    pub flags: MountpathFlags,
}

impl Mountpath {
    fn new(path: PathBuf, fsid: u64, label: String) -> Self {
        let digest = hrw::digest(&path.to_string_lossy());
        Self {
            path,
            fsid,
            digest,
            label,
            flags: MountpathFlags::default(),
        }
    }

    pub fn is_hrw_eligible(&self) -> bool {
        !self.flags.waiting_dd && !self.flags.disabled
    }

    /// Free and total bytes of the backing filesystem.
    pub fn capacity(&self) -> std::io::Result<(u64, u64)> {
        statvfs(&self.path)
    }

    /// Disk utilization in percent, derived from used/total capacity.
    pub fn utilization(&self) -> std::io::Result<u8> {
        let (free, total) = self.capacity()?;
        if total == 0 {
            return Ok(0);
        }
        Ok((((total - free) * 100) / total) as u8)
    }
}

impl hrw::Candidate for Mountpath {
    fn hrw_digest(&self) -> u64 {
        self.digest
    }
    fn hrw_id(&self) -> &str {
        self.label.as_str()
    }
}

fn statvfs(path: &Path) -> std::io::Result<(u64, u64)> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let frsize = stat.f_frsize as u64;
    Ok((stat.f_bavail as u64 * frsize, stat.f_blocks as u64 * frsize))
}

fn fsid_of(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(path)?.dev())
}

/// MpiSnap is an immutable snapshot of the registry; readers clone the
/// `Arc` under a brief lock and then operate lock-free.
#[derive(Debug, Clone, Default)]
pub struct MpiSnap {
    pub available: Vec<Arc<Mountpath>>,
    pub disabled: Vec<Arc<Mountpath>>,
}

impl MpiSnap {
    /// Mountpaths eligible for HRW placement (excludes WaitingDD).
    pub fn hrw_eligible(&self) -> impl Iterator<Item = &Arc<Mountpath>> {
        self.available.iter().filter(|mi| mi.is_hrw_eligible())
    }

    pub fn num_avail(&self) -> usize {
        self.available.len()
    }

    /// The HRW owner of `uname` among eligible mountpaths.
    pub fn hrw_mountpath(&self, uname: &str) -> Result<&Arc<Mountpath>, VolumeError> {
        let digest = hrw::digest(uname);
        let mut winner: Option<(&Arc<Mountpath>, u64)> = None;
        for mi in self.hrw_eligible() {
            let score = hrw::mix(mi.digest ^ digest);
            winner = match winner {
                Some((best, bs)) if bs >= score => Some((best, bs)),
                _ => Some((mi, score)),
            };
        }
        winner.map(|(mi, _)| mi).ok_or(VolumeError::NoMountpaths)
    }

    /// Longest-prefix match: the mountpath containing `fqn`.
    pub fn resolve_prefix(&self, fqn: &Path) -> Option<&Arc<Mountpath>> {
        self.available
            .iter()
            .chain(self.disabled.iter())
            .filter(|mi| fqn.starts_with(&mi.path))
            .max_by_key(|mi| mi.path.as_os_str().len())
    }

    pub fn get(&self, path: &Path) -> Option<&Arc<Mountpath>> {
        self.available
            .iter()
            .chain(self.disabled.iter())
            .find(|mi| mi.path == path)
    }
}

/// Mpi is the mountpath registry. All mutations serialize on one lock
/// and atomically publish a new snapshot.
pub struct Mpi {
    inner: RwLock<Inner>,
    /// Permit duplicate fsids (single-disk dev/test rigs).
    test_fsid_override: bool,
}

struct Inner {
    // Master copies, keyed by canonical path.
    all: BTreeMap<PathBuf, Mountpath>,
    snap: Arc<MpiSnap>,
}

impl Mpi {
    pub fn new(test_fsid_override: bool) -> Self {
        Self {
            inner: RwLock::new(Inner {
                all: BTreeMap::new(),
                snap: Arc::new(MpiSnap::default()),
            }),
            test_fsid_override,
        }
    }

    /// Canonicalize: absolute, symlinks resolved, trailing slash
    /// stripped (by PathBuf normalization), root rejected.
    fn canonicalize(path: &Path) -> Result<PathBuf, VolumeError> {
        if !path.is_absolute() {
            return Err(VolumeError::NotAbsolute(path.to_path_buf()));
        }
        let canon = std::fs::canonicalize(path)?;
        if canon == Path::new("/") {
            return Err(VolumeError::RootForbidden);
        }
        Ok(canon)
    }

    pub fn attach(&self, path: &Path, label: &str) -> Result<Arc<Mountpath>, VolumeError> {
        let canon = Self::canonicalize(path)?;
        let fsid = fsid_of(&canon)?;

        let mut inner = self.inner.write().unwrap();
        for (existing, mi) in inner.all.iter() {
            if canon.starts_with(existing) || existing.starts_with(&canon) {
                return Err(VolumeError::PrefixConflict(existing.clone(), canon));
            }
            if mi.fsid == fsid && !self.test_fsid_override {
                return Err(VolumeError::DuplicateFsid(canon, fsid, existing.clone()));
            }
        }
        let label = if label.is_empty() {
            canon.to_string_lossy().into_owned()
        } else {
            label.to_string()
        };
        let mi = Arc::new(Mountpath::new(canon.clone(), fsid, label));
        inner.all.insert(canon, (*mi).clone());
        inner.publish();
        Ok(mi)
    }

    /// Begin detach: the mountpath leaves HRW immediately (WaitingDD)
    /// so the resilver can drain it, then `detach_commit` drops it.
    pub fn detach_begin(&self, path: &Path) -> Result<(), VolumeError> {
        self.update_flags(path, |f| f.waiting_dd = true)
    }

    pub fn detach_commit(&self, path: &Path) -> Result<(), VolumeError> {
        let mut inner = self.inner.write().unwrap();
        if inner.all.remove(path).is_none() {
            return Err(VolumeError::MpathNotFound(path.to_path_buf()));
        }
        inner.publish();
        Ok(())
    }

    pub fn enable(&self, path: &Path) -> Result<(), VolumeError> {
        self.update_flags(path, |f| {
            f.disabled = false;
            f.waiting_dd = false;
        })
    }

    pub fn disable(&self, path: &Path) -> Result<(), VolumeError> {
        self.update_flags(path, |f| f.disabled = true)
    }

    /// Re-check every attached mountpath: paths that no longer resolve
    /// (or changed fsid) are disabled. Returns the disabled set.
    pub fn rescan(&self) -> Vec<PathBuf> {
        let mut lost = Vec::new();
        let mut inner = self.inner.write().unwrap();
        let paths: Vec<PathBuf> = inner.all.keys().cloned().collect();
        for path in paths {
            let healthy = fsid_of(&path)
                .map(|fsid| fsid == inner.all[&path].fsid)
                .unwrap_or(false);
            if !healthy {
                tracing::warn!(mpath = %path.display(), "mountpath lost; disabling");
                inner.all.get_mut(&path).unwrap().flags.disabled = true;
                lost.push(path);
            }
        }
        if !lost.is_empty() {
            inner.publish();
        }
        lost
    }

    fn update_flags(
        &self,
        path: &Path,
        apply: impl FnOnce(&mut MountpathFlags),
    ) -> Result<(), VolumeError> {
        let mut inner = self.inner.write().unwrap();
        let mi = inner
            .all
            .get_mut(path)
            .ok_or_else(|| VolumeError::MpathNotFound(path.to_path_buf()))?;
        apply(&mut mi.flags);
        inner.publish();
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<MpiSnap> {
        self.inner.read().unwrap().snap.clone()
    }
}

impl Inner {
    fn publish(&mut self) {
        let mut snap = MpiSnap::default();
        for mi in self.all.values() {
            let arc = Arc::new(mi.clone());
            if mi.flags.disabled {
                snap.disabled.push(arc);
            } else {
                snap.available.push(arc);
            }
        }
        self.snap = Arc::new(snap);
    }
}

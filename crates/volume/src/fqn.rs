use crate::{Mountpath, MpiSnap, VolumeError};
use models::{Bck, Ns, Provider};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// ContentType partitions each bucket directory by what the files are:
/// objects, EC slices and metafiles, workfiles, and pending deletes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ContentType {
    Obj,
    EcSlice,
    EcMeta,
    Work,
    Deleted,
}

impl ContentType {
    pub fn as_dir(&self) -> &'static str {
        match self {
            ContentType::Obj => "%ob",
            ContentType::EcSlice => "%ec",
            ContentType::EcMeta => "%mt",
            ContentType::Work => "%wf",
            ContentType::Deleted => "%dl",
        }
    }

    pub fn from_dir(dir: &str) -> Option<Self> {
        match dir {
            "%ob" => Some(ContentType::Obj),
            "%ec" => Some(ContentType::EcSlice),
            "%mt" => Some(ContentType::EcMeta),
            "%wf" => Some(ContentType::Work),
            "%dl" => Some(ContentType::Deleted),
            _ => None,
        }
    }
}

/// Directory of a bucket on one mountpath:
/// `<mpath>/@<provider>/<ns-dir>/<bucket>`.
pub fn bucket_dir(mi: &Mountpath, bck: &Bck) -> PathBuf {
    mi.path
        .join(format!("@{}", bck.provider))
        .join(bck.ns.as_dir())
        .join(&bck.name)
}

/// Fully-qualified name of one content item.
pub fn fqn(mi: &Mountpath, bck: &Bck, ct: ContentType, objname: &str) -> PathBuf {
    bucket_dir(mi, bck).join(ct.as_dir()).join(objname)
}

/// ParsedFqn is the inverse mapping: fqn -> (mountpath, bucket,
/// content-type, object name).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFqn {
    pub mi: Arc<Mountpath>,
    pub bck: Bck,
    pub ct: ContentType,
    pub objname: String,
}

impl ParsedFqn {
    /// Resolve `path` against the registry snapshot by longest-prefix
    /// mountpath match, then decode the fixed grammar.
    pub fn parse(snap: &MpiSnap, path: &Path) -> Result<Self, VolumeError> {
        let mi = snap
            .resolve_prefix(path)
            .ok_or_else(|| VolumeError::ForeignFqn(path.to_path_buf()))?
            .clone();
        let rel = path
            .strip_prefix(&mi.path)
            .map_err(|_| VolumeError::ForeignFqn(path.to_path_buf()))?;

        let mut comps = rel.components().map(|c| c.as_os_str().to_string_lossy());
        let provider_dir = comps.next().ok_or_else(|| bad(path))?;
        let ns_dir = comps.next().ok_or_else(|| bad(path))?;
        let bucket = comps.next().ok_or_else(|| bad(path))?;
        let ct_dir = comps.next().ok_or_else(|| bad(path))?;

        let provider: Provider = provider_dir
            .strip_prefix('@')
            .ok_or_else(|| bad(path))?
            .parse()
            .map_err(|_| bad(path))?;
        let ns = parse_ns_dir(&ns_dir).ok_or_else(|| bad(path))?;
        let ct = ContentType::from_dir(&ct_dir).ok_or_else(|| bad(path))?;

        let objname = comps.collect::<Vec<_>>().join("/");
        if objname.is_empty() {
            return Err(bad(path));
        }
        Ok(ParsedFqn {
            mi,
            bck: Bck::new(provider, ns, bucket.into_owned()),
            ct,
            objname,
        })
    }
}

fn parse_ns_dir(dir: &str) -> Option<Ns> {
    if dir == "@global" {
        return Some(Ns::default());
    }
    let tail = dir.strip_prefix('@')?;
    let (uuid, name) = tail.split_once('#')?;
    Some(Ns {
        uuid: uuid.to_string(),
        name: name.to_string(),
    })
}

fn bad(path: &Path) -> VolumeError {
    VolumeError::ForeignFqn(path.to_path_buf())
}

/// A unique workfile path for `objname`: same bucket, %wf content type,
/// name suffixed with a process-unique tag.
pub fn workfile(mi: &Mountpath, bck: &Bck, objname: &str, tag: &str) -> PathBuf {
    fqn(mi, bck, ContentType::Work, &format!("{objname}.{tag}"))
}

/// Visit every object (or other content item) of `bck` on `mi`,
/// depth-first: the callback receives the object name and its path.
pub fn visit_content(mi: &Mountpath, bck: &Bck, ct: ContentType, visit: &mut dyn FnMut(&str, &Path)) {
    let root = bucket_dir(mi, bck).join(ct.as_dir());
    visit_tree(&root, &root, visit);
}

fn visit_tree(root: &Path, dir: &Path, visit: &mut dyn FnMut(&str, &Path)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            visit_tree(root, &path, visit);
        } else if let Ok(rel) = path.strip_prefix(root) {
            let name = rel.to_string_lossy().replace('\\', "/");
            visit(&name, &path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mpi;

    #[test]
    fn fqn_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mpi = Mpi::new(true);
        let mi = mpi.attach(dir.path(), "").unwrap();
        let snap = mpi.snapshot();

        let bck = Bck::ais("nnn");
        for (ct, name) in [
            (ContentType::Obj, "k"),
            (ContentType::Obj, "deep/nested/obj name"),
            (ContentType::EcSlice, "s/1"),
            (ContentType::Work, "w.123"),
        ] {
            let path = fqn(&mi, &bck, ct, name);
            let parsed = ParsedFqn::parse(&snap, &path).unwrap();
            assert_eq!(parsed.bck, bck);
            assert_eq!(parsed.ct, ct);
            assert_eq!(parsed.objname, name);
            assert_eq!(parsed.mi.path, mi.path);
        }
    }

    #[test]
    fn remote_ais_ns_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mpi = Mpi::new(true);
        let mi = mpi.attach(dir.path(), "").unwrap();
        let snap = mpi.snapshot();

        let bck: Bck = "ais://@ce11#team/shared".parse().unwrap();
        let path = fqn(&mi, &bck, ContentType::Obj, "o");
        let parsed = ParsedFqn::parse(&snap, &path).unwrap();
        assert_eq!(parsed.bck, bck);
    }

    #[test]
    fn foreign_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mpi = Mpi::new(true);
        mpi.attach(dir.path(), "").unwrap();
        let snap = mpi.snapshot();

        assert!(ParsedFqn::parse(&snap, Path::new("/no/such/root/x")).is_err());

        // Under the mountpath but not matching the grammar.
        let canon = std::fs::canonicalize(dir.path()).unwrap();
        assert!(ParsedFqn::parse(&snap, &canon.join("stray-file")).is_err());
    }
}

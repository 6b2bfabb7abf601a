use crate::ArchiveError;
use models::{ArchiveArgs, Bck, ChecksumType, Id, Smap, Template, XactKind};
use shard::{Format, MemberMeta, ShardWriter};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use volume::{ContentType, Lom, MpiSnap};
use xaction::{Xact, XactBase};

/// Transfer name of archive member streams.
pub const TRNAME: &str = "arch";

struct OwnerState {
    writer: Option<ShardWriter>,
    /// Workfile to rename into the canonical FQN at finalize; None for
    /// in-place appends (plain tar, zip).
    rename_from: Option<PathBuf>,
    final_fqn: PathBuf,
    appended: usize,
}

/// XactArchive builds one output shard. Each target runs one instance:
/// the shard's HRW owner hosts the writer, the rest only stream their
/// local members to it.
pub struct XactArchive {
    base: XactBase,
    src: Bck,
    args: ArchiveArgs,
    format: Format,
    snap: Arc<MpiSnap>,
    smap: Arc<Smap>,
    self_id: String,
    bundle: Option<Arc<transport::Bundle>>,
    recv: Option<Arc<transport::RecvRegistry>>,
    owner: Option<Mutex<OwnerState>>,
    owner_id: String,
    pool: memsys::Pool,
    send_file_timeout: Duration,
}

impl Xact for XactArchive {
    fn base(&self) -> &XactBase {
        &self.base
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl XactArchive {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Id,
        src: Bck,
        args: ArchiveArgs,
        snap: Arc<MpiSnap>,
        smap: Arc<Smap>,
        self_id: String,
        bundle: Option<Arc<transport::Bundle>>,
        recv: Option<Arc<transport::RecvRegistry>>,
        send_file_timeout: Duration,
    ) -> Result<Arc<Self>, ArchiveError> {
        let format = Format::from_name(&args.arch_name)?;

        // One target owns the output shard; everyone else streams.
        let owner_id = hrw::target(&args.to_bck.make_uname(&args.arch_name), &smap)
            .map(|t| t.id.clone())
            .unwrap_or_else(|_| self_id.clone());

        let owner = if owner_id == self_id {
            Some(Mutex::new(Self::setup_writer(
                &args, format, &snap, id,
            )?))
        } else {
            None
        };

        let xact = Arc::new(Self {
            base: XactBase::new(id, XactKind::Archive, Some(args.to_bck.clone())),
            src,
            args,
            format,
            snap,
            smap,
            self_id,
            bundle,
            recv,
            owner,
            owner_id,
            pool: memsys::Pool::new(),
            send_file_timeout,
        });

        if xact.owner.is_some() {
            if let Some(recv) = &xact.recv {
                recv.register(TRNAME, &id.to_string(), Arc::new(ArchRecv(xact.clone())));
            }
        }
        Ok(xact)
    }

    fn setup_writer(
        args: &ArchiveArgs,
        format: Format,
        snap: &MpiSnap,
        id: Id,
    ) -> Result<OwnerState, ArchiveError> {
        let shard_lom = Lom::init(args.to_bck.clone(), &args.arch_name, snap)?;
        let final_fqn = shard_lom.fqn.clone();
        if let Some(parent) = final_fqn.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let work = volume::workfile(&shard_lom.mi, &args.to_bck, &args.arch_name, &id.to_string());
        if let Some(parent) = work.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pool = memsys::Pool::new();
        let (writer, rename_from) = if args.append_if_exists && final_fqn.exists() {
            match format {
                // In-place appends: tar seeks to its end marker, zip
                // extends through the central directory.
                Format::Tar | Format::Zip => (
                    ShardWriter::open_append(&final_fqn, format, &work, &pool)?,
                    None,
                ),
                // Compressed tars copy the existing shard through.
                Format::TarGz | Format::TarLz4 => (
                    ShardWriter::open_append(&final_fqn, format, &work, &pool)?,
                    Some(work),
                ),
            }
        } else {
            (ShardWriter::create(&work, format)?, Some(work))
        };
        Ok(OwnerState {
            writer: Some(writer),
            rename_from,
            final_fqn,
            appended: 0,
        })
    }

    pub async fn run(self: Arc<Self>) {
        self.base.inc_pending();
        if let Err(err) = self.do_run().await {
            self.base.add_err(&err);
            self.cleanup();
            self.base.dec_pending();
            self.base.abort(&err.to_string());
            return;
        }
        self.base.dec_pending();
        self.base.finish();
    }

    async fn do_run(&self) -> Result<(), ArchiveError> {
        // Phase 1: drain the local source iterator.
        let names = self.matching_names();
        for name in names {
            if self.base.aborted() {
                return Ok(());
            }
            self.send_or_append(&name).await?;
        }

        // Phase 2 (owner only): quiesce inbound, then finalize.
        if self.owner.is_some() {
            if let Some(recv) = &self.recv {
                let xid = self.base.id().to_string();
                recv.quiesce(TRNAME, &xid, self.send_file_timeout).await?;
                recv.unregister(TRNAME, &xid);
            }
            self.finalize()?;
        }
        Ok(())
    }

    /// Source objects matched by the selection, in walk order.
    fn matching_names(&self) -> Vec<String> {
        if !self.args.selection.names.is_empty() {
            return self
                .args
                .selection
                .names
                .iter()
                .filter(|name| self.owns(name))
                .cloned()
                .collect();
        }
        let template = if self.args.selection.template.is_empty() {
            None
        } else {
            Template::parse(&self.args.selection.template).ok()
        };
        let mut names = Vec::new();
        for mi in self.snap.available.iter() {
            let uname_snap = &self.snap;
            volume::visit_content(mi, &self.src, ContentType::Obj, &mut |name, _path| {
                let matched = template.as_ref().map(|t| t.matches(name)).unwrap_or(true);
                if matched {
                    // Only the canonical replica contributes.
                    let uname = self.src.make_uname(name);
                    let home = uname_snap
                        .hrw_mountpath(&uname)
                        .map(|h| h.path == mi.path)
                        .unwrap_or(false);
                    if home {
                        names.push(name.to_string());
                    }
                }
            });
        }
        names.sort();
        names
    }

    fn owns(&self, objname: &str) -> bool {
        let uname = self.src.make_uname(objname);
        self.snap
            .hrw_mountpath(&uname)
            .map(|home| volume::fqn(home, &self.src, ContentType::Obj, objname).exists())
            .unwrap_or(false)
    }

    async fn send_or_append(&self, objname: &str) -> Result<(), ArchiveError> {
        let mut lom = Lom::init(self.src.clone(), objname, &self.snap)?;
        lom.load()?;
        let member_name = if self.args.flatten {
            objname.rsplit('/').next().unwrap_or(objname).to_string()
        } else {
            objname.to_string()
        };

        if self.owner.is_some() {
            let meta = MemberMeta {
                name: member_name,
                size: lom.md.size as u64,
                mtime: (lom.md.atime_ns / 1_000_000_000).max(0) as u64,
                uid: None,
                gid: None,
            };
            let mut file = std::fs::File::open(&lom.fqn)?;
            self.append_member(&meta, &mut file)?;
        } else {
            let (Some(bundle), Some(node)) =
                (self.bundle.as_ref(), self.smap.get_node(&self.owner_id))
            else {
                return Err(ArchiveError::OwnerUnreachable(self.owner_id.clone()));
            };
            let body = std::fs::read(&lom.fqn)?;
            let hdr = transport::ObjHdr {
                bck: self.src.clone(),
                objname: member_name,
                size: lom.md.size,
                atime_ns: lom.md.atime_ns,
                cksum_type: lom.md.cksum_type.as_str().to_string(),
                cksum_value: lom.md.cksum_value.clone(),
                opaque: Vec::new(),
            };
            bundle.send(node, hdr, bytes::Bytes::from(body)).await?;
        }
        self.base.add_obj(lom.md.size);
        Ok(())
    }

    /// Append one member to the shard. Called by the local iterator
    /// and, on the owner, by the transport receive handler.
    fn append_member(&self, meta: &MemberMeta, body: &mut dyn std::io::Read) -> Result<(), ArchiveError> {
        let owner = self
            .owner
            .as_ref()
            .ok_or_else(|| ArchiveError::OwnerUnreachable(self.owner_id.clone()))?;
        let mut state = owner.lock().unwrap();
        let writer = state.writer.as_mut().ok_or_else(|| {
            ArchiveError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "shard already finalized",
            ))
        })?;
        writer.append_member(meta, body, &self.pool)?;
        state.appended += 1;
        Ok(())
    }

    fn finalize(&self) -> Result<(), ArchiveError> {
        let Some(owner) = self.owner.as_ref() else {
            return Ok(());
        };
        let mut state = owner.lock().unwrap();
        let writer = match state.writer.take() {
            Some(w) => w,
            None => return Ok(()),
        };

        if state.appended == 0 && self.args.append_if_exists {
            // Nothing new: leave the existing shard byte-identical.
            writer.finalize()?;
            if let Some(work) = state.rename_from.take() {
                let _ = std::fs::remove_file(work);
            }
            tracing::info!(shard = %self.args.arch_name, "no new appends");
            return Ok(());
        }

        writer.finalize()?;
        if let Some(work) = state.rename_from.take() {
            std::fs::rename(&work, &state.final_fqn)?;
        }

        // Stamp the shard's object metadata.
        let size = std::fs::metadata(&state.final_fqn)?.len() as i64;
        let cksum = {
            let payload = std::fs::read(&state.final_fqn)?;
            format!("{:016x}", xxhash_rust::xxh64::xxh64(&payload, hrw::SEED))
        };
        let mut lom = Lom::init(self.args.to_bck.clone(), &self.args.arch_name, &self.snap)?;
        lom.md.size = size;
        lom.md.cksum_type = ChecksumType::XxHash;
        lom.md.cksum_value = cksum;
        lom.persist_now()?;
        Ok(())
    }

    fn cleanup(&self) {
        if let Some(owner) = &self.owner {
            let mut state = owner.lock().unwrap();
            state.writer = None;
            if let Some(work) = state.rename_from.take() {
                let _ = std::fs::remove_file(work);
            }
        }
        if let Some(recv) = &self.recv {
            recv.unregister(TRNAME, &self.base.id().to_string());
        }
    }
}

/// Receive handler on the owner: appends streamed members.
struct ArchRecv(Arc<XactArchive>);

#[async_trait::async_trait]
impl transport::RecvHandler for ArchRecv {
    async fn recv(
        &self,
        _from_node: &str,
        hdr: transport::ObjHdr,
        body: transport::BodyStream,
    ) -> Result<(), transport::TransportError> {
        let meta = MemberMeta {
            name: hdr.objname.clone(),
            size: hdr.size as u64,
            mtime: (hdr.atime_ns / 1_000_000_000).max(0) as u64,
            uid: None,
            gid: None,
        };
        self.0
            .append_member(&meta, &mut std::io::Cursor::new(body.as_ref()))
            .map_err(|err| {
                transport::TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    err.to_string(),
                ))
            })
    }
}

/// ArchFactory builds archive xactions from committed transaction
/// arguments.
pub struct ArchFactory {
    pub self_id: String,
    pub mpi: Arc<volume::Mpi>,
    pub smap: Arc<dyn Fn() -> Arc<Smap> + Send + Sync>,
    pub client: Option<reqwest::Client>,
    pub recv: Option<Arc<transport::RecvRegistry>>,
    pub netw_timeout: Duration,
    pub send_file_timeout: Duration,
}

impl xaction::Factory for ArchFactory {
    fn kind(&self) -> XactKind {
        XactKind::Archive
    }

    fn start(&self, args: &xaction::RenewArgs, id: Id) -> Result<xaction::ArcXact, xaction::XactError> {
        let src = args
            .bck
            .clone()
            .ok_or_else(|| xaction::XactError::Failed("archive requires a source bucket".into()))?;
        let parsed: ArchiveArgs = args
            .custom
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .ok_or_else(|| xaction::XactError::Failed("archive requires args".into()))?;
        let bundle = self.client.clone().map(|client| {
            Arc::new(transport::Bundle::new(
                client,
                TRNAME,
                id,
                self.self_id.clone(),
                8,
                self.netw_timeout,
            ))
        });
        let xact = XactArchive::new(
            id,
            src,
            parsed,
            self.mpi.snapshot(),
            (self.smap)(),
            self.self_id.clone(),
            bundle,
            self.recv.clone(),
            self.send_file_timeout,
        )
        .map_err(|err| xaction::XactError::Failed(err.to_string()))?;
        tokio::spawn(xact.clone().run());
        Ok(xact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::ListRange;

    struct Fixture {
        _dirs: Vec<tempfile::TempDir>,
        snap: Arc<MpiSnap>,
        src: Bck,
        dst: Bck,
    }

    fn fixture(objs: &[(&str, &[u8])]) -> Fixture {
        let dirs: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
        let mpi = volume::Mpi::new(true);
        for d in &dirs {
            mpi.attach(d.path(), "").unwrap();
        }
        let snap = mpi.snapshot();
        let src = Bck::ais("src");
        for (name, body) in objs {
            let mut lom = Lom::init(src.clone(), name, &snap).unwrap();
            std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
            std::fs::write(&lom.fqn, body).unwrap();
            lom.md.size = body.len() as i64;
            lom.persist_now().unwrap();
        }
        Fixture {
            _dirs: dirs,
            snap,
            src,
            dst: Bck::ais("dst"),
        }
    }

    fn archive(f: &Fixture, arch_name: &str, names: &[&str], append: bool) -> Arc<XactArchive> {
        XactArchive::new(
            models::IdGenerator::new(11).next(),
            f.src.clone(),
            ArchiveArgs {
                to_bck: f.dst.clone(),
                arch_name: arch_name.to_string(),
                selection: ListRange {
                    names: names.iter().map(|s| s.to_string()).collect(),
                    template: String::new(),
                },
                append_if_exists: append,
                flatten: false,
            },
            f.snap.clone(),
            Arc::new(Smap::default()),
            "t1".to_string(),
            None,
            None,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn members_in_iterator_order() {
        let f = fixture(&[("a", b"body-a"), ("b", b"body-b"), ("c", b"body-c")]);
        let x = archive(&f, "arch.tar", &["a", "b", "c"], false);
        x.clone().run().await;
        assert!(x.base().finished());
        assert!(!x.base().aborted());

        let shard_lom = Lom::init(f.dst.clone(), "arch.tar", &f.snap).unwrap();
        let members = shard::list_members(&shard_lom.fqn, Format::Tar).unwrap();
        let names: Vec<_> = members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(members[0].size, 6);

        // The shard has object metadata of its own.
        let mut lom = Lom::init(f.dst.clone(), "arch.tar", &f.snap).unwrap();
        lom.load().unwrap();
        assert_eq!(lom.md.cksum_type, ChecksumType::XxHash);
        assert!(lom.md.size > 0);
    }

    #[tokio::test]
    async fn append_adds_only_new_members() {
        let f = fixture(&[("a", b"1"), ("b", b"2")]);
        archive(&f, "arch.tar", &["a"], false).run().await;
        archive(&f, "arch.tar", &["b"], true).run().await;

        let shard_lom = Lom::init(f.dst.clone(), "arch.tar", &f.snap).unwrap();
        let members = shard::list_members(&shard_lom.fqn, Format::Tar).unwrap();
        let names: Vec<_> = members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[tokio::test]
    async fn zero_appends_leave_the_shard_identical() {
        let f = fixture(&[("a", b"1")]);
        archive(&f, "arch.tar", &["a"], false).run().await;
        let shard_lom = Lom::init(f.dst.clone(), "arch.tar", &f.snap).unwrap();
        let before = std::fs::read(&shard_lom.fqn).unwrap();

        // "missing" resolves to no local members.
        let x = archive(&f, "arch.tar", &["missing"], true);
        x.clone().run().await;
        assert!(x.base().finished());
        let after = std::fs::read(&shard_lom.fqn).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn workfile_is_cleaned_up_on_error() {
        let f = fixture(&[("a", b"1")]);
        // Unknown format fails at construction.
        let err = XactArchive::new(
            models::IdGenerator::new(12).next(),
            f.src.clone(),
            ArchiveArgs {
                to_bck: f.dst.clone(),
                arch_name: "arch.rar".to_string(),
                selection: ListRange::default(),
                append_if_exists: false,
                flatten: false,
            },
            f.snap.clone(),
            Arc::new(Smap::default()),
            "t1".to_string(),
            None,
            None,
            Duration::from_secs(5),
        );
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn tgz_shards_build_too() {
        let f = fixture(&[("x", b"compress me"), ("y", b"me too")]);
        let x = archive(&f, "arch.tgz", &["x", "y"], false);
        x.clone().run().await;
        assert!(!x.base().aborted());

        let shard_lom = Lom::init(f.dst.clone(), "arch.tgz", &f.snap).unwrap();
        let members = shard::list_members(&shard_lom.fqn, Format::TarGz).unwrap();
        assert_eq!(members.len(), 2);
    }
}

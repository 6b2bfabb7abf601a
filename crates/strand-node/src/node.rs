use anyhow::Context;
use models::{Bck, ChecksumType, NodeRole, Snode, XactKind};
use std::sync::Arc;

/// Node is the per-process context: identity, replicated state owners,
/// the volume, the xaction registry, and the control-plane helpers.
/// Built once at startup and shared by every handler.
pub struct Node {
    pub self_id: String,
    pub role: NodeRole,
    pub started: std::time::Instant,
    pub owners: Arc<cluster::Owners>,
    pub mpi: Arc<volume::Mpi>,
    pub registry: Arc<xaction::Registry>,
    pub recv: Arc<transport::RecvRegistry>,
    pub metasync: Arc<cluster::Metasync>,
    pub executor: Option<txn::TargetExecutor>,
    pub coordinator: Option<txn::Coordinator>,
    pub locker: Arc<volume::NameLocker>,
    pub lom_cache: volume::LomCache,
    pub client: reqwest::Client,
}

impl Node {
    pub fn snode(&self) -> Option<Snode> {
        self.owners.smap.get().get_node(&self.self_id).cloned()
    }

    pub fn disk_stats(&self) -> Vec<serde_json::Value> {
        self.mpi
            .snapshot()
            .available
            .iter()
            .map(|mi| {
                let (free, total) = mi.capacity().unwrap_or((0, 0));
                serde_json::json!({
                    "mountpath": mi.path,
                    "label": mi.label,
                    "fsid": mi.fsid,
                    "free": free,
                    "total": total,
                })
            })
            .collect()
    }

    /// Downcast a registry entry back to the list-objects xaction.
    pub fn lso_of<'a>(&self, xact: &'a xaction::ArcXact) -> Option<&'a lso::LsoXact> {
        xact.as_any().downcast_ref::<lso::LsoXact>()
    }

    /// Minimal data path: write the object at its HRW home, stamp its
    /// metadata, then hand mirroring to the on-demand put-copies
    /// xaction (best-effort).
    pub fn put_object(&self, bck: &Bck, objname: &str, body: &[u8]) -> anyhow::Result<()> {
        let props = self
            .owners
            .bmd
            .get()
            .get(bck)
            .cloned()
            .with_context(|| format!("bucket {bck} does not exist"))?;
        let snap = self.mpi.snapshot();
        let mut lom = volume::Lom::init(bck.clone(), objname, &snap)?;

        let uname = lom.uname();
        self.locker.wlock(&uname);
        // Overwrites bump the version; a failed load is a fresh object.
        let _ = lom.load();
        let res = (|| -> anyhow::Result<()> {
            if let Some(parent) = lom.fqn.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let work = volume::workfile(&lom.mi, bck, objname, "put");
            if let Some(parent) = work.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&work, body)?;
            std::fs::rename(&work, &lom.fqn)?;

            lom.md.size = body.len() as i64;
            lom.md.cksum_type = ChecksumType::XxHash;
            lom.md.cksum_value =
                format!("{:016x}", xxhash_rust::xxh64::xxh64(body, hrw::SEED));
            lom.md.atime_ns = now_ns();
            if props.versioning.enabled {
                lom.md.version = (lom
                    .md
                    .version
                    .parse::<u64>()
                    .unwrap_or(0)
                    + 1)
                .to_string();
            }
            lom.md.copies.clear();
            lom.persist(props.write_policy.md)?;
            Ok(())
        })();
        self.locker.wunlock(&uname);
        self.lom_cache.invalidate(&uname);
        res?;

        if props.mirror.enabled && props.mirror.copies > 1 {
            self.submit_put_copies(bck, objname);
        }
        Ok(())
    }

    fn submit_put_copies(&self, bck: &Bck, objname: &str) {
        let outcome = self.registry.renew(xaction::RenewArgs {
            kind: XactKind::PutCopies,
            bck: Some(bck.clone()),
            id: None,
            custom: None,
        });
        match outcome {
            Ok(outcome) => {
                let xact = outcome.into_xact();
                if let Some(put) = xact.as_any().downcast_ref::<mirror::XactPut>() {
                    put.submit(objname);
                }
            }
            Err(err) => {
                tracing::warn!(%bck, objname, %err, "put-copies renew failed");
            }
        }
    }

    pub fn get_object(&self, bck: &Bck, objname: &str) -> anyhow::Result<Vec<u8>> {
        let snap = self.mpi.snapshot();
        let mut lom = volume::Lom::init(bck.clone(), objname, &snap)?;
        let uname = lom.uname();
        self.locker.rlock(&uname);
        let res = (|| -> anyhow::Result<Vec<u8>> {
            lom.load()?;
            Ok(std::fs::read(&lom.fqn)?)
        })();
        self.locker.runlock(&uname);
        res
    }

    pub fn head_object(&self, bck: &Bck, objname: &str) -> anyhow::Result<volume::LomMd> {
        let uname = bck.make_uname(objname);
        if let Some(md) = self.lom_cache.get(&uname) {
            return Ok(md);
        }
        let snap = self.mpi.snapshot();
        let mut lom = volume::Lom::init(bck.clone(), objname, &snap)?;
        lom.load()?;
        self.lom_cache.put(uname, lom.md.clone());
        Ok(lom.md)
    }

    /// A fresh RMD version arrived: start the rebalance (and resilver,
    /// when requested) this epoch calls for.
    pub fn on_rmd_bump(&self) {
        if self.role != NodeRole::Target {
            return;
        }
        let rmd = self.owners.rmd.get();
        let id = models::Id::new(hrw::digest(&format!("reb-{}", rmd.version)).to_be_bytes());
        if let Err(err) = self.registry.renew(xaction::RenewArgs {
            kind: XactKind::Rebalance,
            bck: None,
            id: Some(id),
            custom: None,
        }) {
            tracing::warn!(%err, "failed to start rebalance");
        }
        if !rmd.resilver_id.is_empty() {
            if let Err(err) = self.registry.renew(xaction::RenewArgs {
                kind: XactKind::Resilver,
                bck: None,
                id: None,
                custom: None,
            }) {
                tracing::warn!(%err, "failed to start resilver");
            }
        }
    }

    /// Interrupted-work markers found at boot force the corresponding
    /// xactions to resume.
    pub fn resume_interrupted(&self) {
        if self.role != NodeRole::Target {
            return;
        }
        let snap = self.mpi.snapshot();
        if volume::marker_exists(&snap, volume::Marker::Resilver) {
            tracing::warn!("resilver marker found; resuming interrupted resilver");
            let _ = self.registry.renew(xaction::RenewArgs {
                kind: XactKind::Resilver,
                bck: None,
                id: None,
                custom: None,
            });
        }
        if volume::marker_exists(&snap, volume::Marker::Rebalance) {
            tracing::warn!("rebalance marker found; resuming interrupted rebalance");
            self.on_rmd_bump();
        }
    }

    /// Graceful shutdown: abort xactions, flush metadata, persist maps.
    pub fn shutdown(&self) {
        let n = self.registry.abort_all(None, None, "node shutdown");
        if n > 0 {
            tracing::info!(aborted = n, "aborted running xactions for shutdown");
        }
        let snap = self.mpi.snapshot();
        let _ = volume::save_revs(&snap, &*self.owners.smap.get());
        let _ = volume::save_revs(&snap, &*self.owners.bmd.get());
        let _ = volume::save_revs(&snap, &*self.owners.rmd.get());
    }
}

/// Wire the per-kind factories of a target node.
#[allow(clippy::too_many_arguments)]
pub fn target_registry(
    self_id: &str,
    mpi: Arc<volume::Mpi>,
    owners: Arc<cluster::Owners>,
    recv: Arc<transport::RecvRegistry>,
    client: reqwest::Client,
) -> xaction::Registry {
    let conf = owners.config.get();
    let netw_timeout = conf.timeout.network;
    let send_file_timeout = conf.timeout.send_file;
    let lso_idle = conf.lso.idle_timeout;
    let mirror_idle = conf.mirror.idle_timeout;
    let dsort_conf = conf.dsort.clone();

    let smap_owner = owners.smap.clone();
    let smap_fn: Arc<dyn Fn() -> Arc<models::Smap> + Send + Sync> =
        Arc::new(move || smap_owner.get());
    let bmd_owner = owners.bmd.clone();
    let props_fn: Arc<dyn Fn(&Bck) -> Option<models::BckProps> + Send + Sync> =
        Arc::new(move |bck| bmd_owner.get().get(bck).cloned());
    let bmd_owner2 = owners.bmd.clone();
    let mirror_props_fn: Arc<dyn Fn(&Bck) -> Option<models::MirrorProps> + Send + Sync> =
        Arc::new(move |bck| bmd_owner2.get().get(bck).map(|p| p.mirror.clone()));

    xaction::Registry::new()
        .register(Box::new(lso::LsoFactory {
            self_id: self_id.to_string(),
            mpi: mpi.clone(),
            smap: smap_fn.clone(),
            remote: None,
            client: Some(client.clone()),
            netw_timeout,
            idle_timeout: lso_idle,
        }))
        .register(Box::new(mirror::PutCopiesFactory {
            mpi: mpi.clone(),
            props: mirror_props_fn,
            idle_timeout: mirror_idle,
        }))
        .register(Box::new(mirror::NCopiesFactory { mpi: mpi.clone() }))
        .register(Box::new(mirror::CopyBucketFactory {
            self_id: self_id.to_string(),
            mpi: mpi.clone(),
            smap: smap_fn.clone(),
            client: Some(client.clone()),
            recv: Some(recv.clone()),
            netw_timeout,
        }))
        .register(Box::new(archive::ArchFactory {
            self_id: self_id.to_string(),
            mpi: mpi.clone(),
            smap: smap_fn.clone(),
            client: Some(client.clone()),
            recv: Some(recv.clone()),
            netw_timeout,
            send_file_timeout,
        }))
        .register(Box::new(dsort::DsortFactory {
            self_id: self_id.to_string(),
            mpi: mpi.clone(),
            smap: smap_fn.clone(),
            client: Some(client.clone()),
            recv: Some(recv.clone()),
            netw_timeout,
            mem_reaction: dsort_conf.mem_reaction,
            mem_frac: dsort_conf.mem_frac,
        }))
        .register(Box::new(resilver::ResilverFactory {
            mpi: mpi.clone(),
            props: props_fn.clone(),
        }))
        .register(Box::new(resilver::RebalanceFactory {
            self_id: self_id.to_string(),
            mpi: mpi.clone(),
            smap: smap_fn,
            client: Some(client),
            recv: Some(recv),
            netw_timeout,
        }))
        .register(Box::new(resilver::EcFactory {
            mpi,
            props: props_fn,
            slicer: Arc::new(resilver::NoopSlicer),
        }))
}

fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

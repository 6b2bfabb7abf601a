use crate::{
    extract_local, merge_plan, plan_output_shards, DsortError, DsortSpec, MemEstimator,
    ProcMemInfo, Record, RecordManager,
};
use models::{Id, MemReaction, Smap, XactKind};
use shard::{Format, MemberMeta, ShardWriter};
use std::io::Cursor;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use volume::{Lom, MpiSnap};
use xaction::{Xact, XactBase};

/// Transfer name of dsort record-table and shard streams.
pub const TRNAME: &str = "dsort";

/// BodyFetcher resolves a record back to its payload at create time.
/// The local implementation re-reads the member from its source shard;
/// a cluster deployment layers a remote fetch over it.
pub trait BodyFetcher: Send + Sync + 'static {
    fn fetch(&self, record: &Record) -> Result<Vec<u8>, DsortError>;
}

struct LocalFetcher {
    spec: DsortSpec,
    snap: Arc<MpiSnap>,
}

impl BodyFetcher for LocalFetcher {
    fn fetch(&self, record: &Record) -> Result<Vec<u8>, DsortError> {
        let lom = Lom::init(self.spec.input_bck.clone(), &record.shard, &self.snap)?;
        let format = Format::from_name(&record.shard)?;
        let mut body = None;
        shard::read_members(&lom.fqn, format, |meta, reader| {
            if meta.name == record.name {
                let mut buf = Vec::with_capacity(meta.size as usize);
                std::io::Read::read_to_end(reader, &mut buf)?;
                body = Some(buf);
            }
            Ok(())
        })?;
        body.ok_or_else(|| {
            DsortError::Spec(format!("member {} missing from {}", record.name, record.shard))
        })
    }
}

/// The two-stage cleanup gate: `final` may not begin before `initial`
/// completed, regardless of who calls which first.
struct CleanupGate {
    stage: Mutex<u8>, // 0 = none, 1 = initial done, 2 = final done
    cv: Condvar,
}

impl CleanupGate {
    fn new() -> Self {
        Self {
            stage: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn run_initial(&self, work: impl FnOnce()) {
        let mut stage = self.stage.lock().unwrap();
        if *stage >= 1 {
            return;
        }
        work();
        *stage = 1;
        self.cv.notify_all();
    }

    fn run_final(&self, work: impl FnOnce()) {
        let mut stage = self.stage.lock().unwrap();
        while *stage < 1 {
            stage = self.cv.wait(stage).unwrap();
        }
        if *stage >= 2 {
            return;
        }
        work();
        *stage = 2;
    }
}

/// DsortManager drives one distributed-sort job on one target:
/// extract -> (merge ring) -> sort -> create. Any error aborts the
/// whole job.
pub struct DsortManager {
    base: XactBase,
    spec: DsortSpec,
    snap: Arc<MpiSnap>,
    smap: Arc<Smap>,
    self_id: String,
    bundle: Option<Arc<transport::Bundle>>,
    recv: Option<Arc<transport::RecvRegistry>>,
    fetcher: Arc<dyn BodyFetcher>,
    mem_reaction: MemReaction,
    mem_frac: f64,
    pool: memsys::Pool,
    /// Inbound record tables from ring senders.
    tables_rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<RecordManager>>,
    tables_tx: tokio::sync::mpsc::UnboundedSender<RecordManager>,
    cleanup: CleanupGate,
}

impl Xact for DsortManager {
    fn base(&self) -> &XactBase {
        &self.base
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl DsortManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Id,
        spec: DsortSpec,
        snap: Arc<MpiSnap>,
        smap: Arc<Smap>,
        self_id: String,
        bundle: Option<Arc<transport::Bundle>>,
        recv: Option<Arc<transport::RecvRegistry>>,
        mem_reaction: MemReaction,
        mem_frac: f64,
    ) -> Arc<Self> {
        let (tables_tx, tables_rx) = tokio::sync::mpsc::unbounded_channel();
        let fetcher = Arc::new(LocalFetcher {
            spec: spec.clone(),
            snap: snap.clone(),
        });
        let manager = Arc::new(Self {
            base: XactBase::new(id, XactKind::Dsort, Some(spec.output_bck.clone())),
            spec,
            snap,
            smap,
            self_id,
            bundle,
            recv,
            fetcher,
            mem_reaction,
            mem_frac,
            pool: memsys::Pool::new(),
            tables_rx: tokio::sync::Mutex::new(tables_rx),
            tables_tx,
            cleanup: CleanupGate::new(),
        });
        if let Some(recv) = &manager.recv {
            recv.register(
                TRNAME,
                &id.to_string(),
                Arc::new(DsortRecv(manager.clone())),
            );
        }
        manager
    }

    pub async fn run(self: Arc<Self>) {
        self.base.inc_pending();
        let res = self.do_run().await;
        self.base.dec_pending();
        match res {
            Ok(()) => {
                self.run_cleanup(false);
                self.base.finish();
            }
            Err(err) => {
                self.base.add_err(&err);
                self.run_cleanup(true);
                self.base.abort(&err.to_string());
            }
        }
    }

    async fn do_run(&self) -> Result<(), DsortError> {
        self.spec.validate()?;
        let salt = hrw::digest(&self.base.id().to_string());

        // Phase 1: extract.
        let mut mgr = RecordManager::new();
        let estimator = MemEstimator::new(self.mem_reaction, self.mem_frac, &ProcMemInfo);
        let warn = {
            let aborted = self.base.abort_token();
            extract_local(
                &self.spec,
                &self.snap,
                &self.self_id,
                Some(&estimator),
                &mut mgr,
                &|| aborted.is_cancelled(),
            )?
        };
        if let Some(warn) = warn {
            self.base.add_err(warn);
        }
        tracing::info!(id = %self.base.id(), records = mgr.len(), "dsort extract done");

        // Phase 2: merge along the target ring, then order.
        let target_ids: Vec<String> = self.smap.active_targets().map(|t| t.id.clone()).collect();
        let (rounds, holder) = merge_plan(&target_ids, salt);
        let holder = holder.unwrap_or_else(|| self.self_id.clone());

        for round in &rounds {
            if self.base.aborted() {
                return Err(DsortError::Aborted("merge".into()));
            }
            if let Some((_, receiver)) = round
                .pairs
                .iter()
                .find(|(sender, _)| *sender == self.self_id)
            {
                // Even side: ship the table and drop our copy.
                self.send_table(receiver, &mgr).await?;
                mgr = RecordManager::new();
                break;
            }
            let inbound = round
                .pairs
                .iter()
                .filter(|(_, receiver)| *receiver == self.self_id)
                .count();
            for _ in 0..inbound {
                // Odd side: merge the neighbor's table.
                let table = self.await_table().await?;
                mgr.merge(table);
            }
        }

        if holder != self.self_id {
            return Ok(()); // shipped; create runs on the holder
        }
        mgr.sort(&self.spec.algorithm, salt);

        // Phase 3: create output shards.
        let shards = plan_output_shards(&self.spec, mgr.into_records())?;
        for out in shards {
            if self.base.aborted() {
                return Err(DsortError::Aborted("create".into()));
            }
            self.build_shard(&out).await?;
        }
        Ok(())
    }

    async fn send_table(&self, receiver: &str, mgr: &RecordManager) -> Result<(), DsortError> {
        let (Some(bundle), Some(node)) = (self.bundle.as_ref(), self.smap.get_node(receiver))
        else {
            return Err(DsortError::Spec(format!(
                "no stream to merge receiver {receiver}"
            )));
        };
        let raw = rmp_serde::to_vec(mgr)
            .map_err(|err| DsortError::Spec(format!("unencodable record table: {err}")))?;
        let hdr = transport::ObjHdr {
            objname: "records".to_string(),
            size: raw.len() as i64,
            opaque: b"table".to_vec(),
            ..Default::default()
        };
        bundle.send(node, hdr, bytes::Bytes::from(raw)).await?;
        Ok(())
    }

    async fn await_table(&self) -> Result<RecordManager, DsortError> {
        let abort = self.base.abort_token();
        let mut rx = self.tables_rx.lock().await;
        tokio::select! {
            _ = abort.cancelled() => Err(DsortError::Aborted("merge recv".into())),
            table = rx.recv() => table.ok_or_else(|| DsortError::Aborted("merge stream closed".into())),
        }
    }

    async fn build_shard(&self, out: &crate::create::OutShard) -> Result<(), DsortError> {
        let out_uname = self.spec.output_bck.make_uname(&out.name);
        let owner = hrw::target(&out_uname, &self.smap)
            .map(|t| t.id.clone())
            .unwrap_or_else(|_| self.self_id.clone());

        let lom = Lom::init(self.spec.output_bck.clone(), &out.name, &self.snap)?;
        if let Some(parent) = lom.fqn.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let work = volume::workfile(
            &lom.mi,
            &self.spec.output_bck,
            &out.name,
            &self.base.id().to_string(),
        );
        if let Some(parent) = work.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let format = Format::from_name(&out.name)?;
        let mut writer = ShardWriter::create(&work, format)?;
        let mut bytes_total = 0i64;
        for record in &out.records {
            let body = self.fetcher.fetch(record)?;
            let meta = MemberMeta {
                name: record.name.clone(),
                size: body.len() as u64,
                mtime: 0,
                uid: None,
                gid: None,
            };
            writer.append_member(&meta, &mut Cursor::new(&body), &self.pool)?;
            bytes_total += body.len() as i64;
        }
        writer.finalize()?;

        if owner == self.self_id || self.bundle.is_none() {
            std::fs::rename(&work, &lom.fqn)?;
            let mut lom = lom;
            lom.md.size = std::fs::metadata(&lom.fqn)?.len() as i64;
            lom.persist_now()?;
        } else {
            // Stream the finished shard to its owning target.
            let (Some(bundle), Some(node)) = (self.bundle.as_ref(), self.smap.get_node(&owner))
            else {
                let _ = std::fs::remove_file(&work);
                return Err(DsortError::Spec(format!("shard owner {owner} unreachable")));
            };
            let payload = std::fs::read(&work)?;
            let hdr = transport::ObjHdr {
                bck: self.spec.output_bck.clone(),
                objname: out.name.clone(),
                size: payload.len() as i64,
                ..Default::default()
            };
            bundle.send(node, hdr, bytes::Bytes::from(payload)).await?;
            std::fs::remove_file(&work)?;
        }
        self.base.add_objs(out.records.len() as i64, bytes_total);
        Ok(())
    }

    /// Two strictly ordered stages: initial (stop workers, drop
    /// records) always precedes final (close streams, free the ack
    /// state).
    fn run_cleanup(&self, aborted: bool) {
        self.cleanup.run_initial(|| {
            if aborted {
                tracing::info!(id = %self.base.id(), "dsort initial cleanup after abort");
            }
            // Workers exit via the abort token; record tables are
            // owned by do_run and already dropped with it.
        });
        self.cleanup.run_final(|| {
            if let Some(recv) = &self.recv {
                recv.unregister(TRNAME, &self.base.id().to_string());
            }
        });
    }
}

/// Receive handler: inbound record tables during the merge phase.
struct DsortRecv(Arc<DsortManager>);

#[async_trait::async_trait]
impl transport::RecvHandler for DsortRecv {
    async fn recv(
        &self,
        _from: &str,
        hdr: transport::ObjHdr,
        body: transport::BodyStream,
    ) -> Result<(), transport::TransportError> {
        if hdr.opaque == b"table" {
            let table: RecordManager = rmp_serde::from_slice(&body)
                .map_err(|err| transport::TransportError::BadHeader(err.to_string()))?;
            return self
                .0
                .tables_tx
                .send(table)
                .map_err(|_| transport::TransportError::UnknownTrname(TRNAME.to_string()));
        }
        // Anything else is a finished output shard for this target.
        mirror::write_object(&self.0.snap, &hdr, &body).map_err(|err| {
            transport::TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            ))
        })
    }
}

/// DsortFactory builds dsort managers from job specs submitted via the
/// control plane.
pub struct DsortFactory {
    pub self_id: String,
    pub mpi: Arc<volume::Mpi>,
    pub smap: Arc<dyn Fn() -> Arc<Smap> + Send + Sync>,
    pub client: Option<reqwest::Client>,
    pub recv: Option<Arc<transport::RecvRegistry>>,
    pub netw_timeout: Duration,
    pub mem_reaction: MemReaction,
    pub mem_frac: f64,
}

impl xaction::Factory for DsortFactory {
    fn kind(&self) -> XactKind {
        XactKind::Dsort
    }

    fn start(&self, args: &xaction::RenewArgs, id: Id) -> Result<xaction::ArcXact, xaction::XactError> {
        let spec: DsortSpec = args
            .custom
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .ok_or_else(|| xaction::XactError::Failed("dsort requires a job spec".into()))?;
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
        let manager = DsortManager::new(
            id,
            spec,
            self.mpi.snapshot(),
            (self.smap)(),
            self.self_id.clone(),
            bundle,
            self.recv.clone(),
            self.mem_reaction,
            self.mem_frac,
        );
        tokio::spawn(manager.clone().run());
        Ok(manager)
    }
}

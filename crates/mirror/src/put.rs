use crate::make_copies;
use models::{Bck, Id, MirrorProps, XactKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use volume::MpiSnap;
use xaction::{Xact, XactBase};

/// One queued copy request: replicate this just-PUT object up to the
/// bucket's configured copy count.
#[derive(Debug)]
struct CopyJob {
    objname: String,
}

/// XactPut is the on-demand put-copies xaction, one per (bucket,
/// target). Each PUT of a mirrored object submits a job; per-mountpath
/// workers drain the bounded queue. A full queue drops the job with an
/// aggregated error — redundancy is best-effort, the PUT itself never
/// fails on it.
pub struct XactPut {
    base: XactBase,
    bck: Bck,
    snap: Arc<MpiSnap>,
    copies: usize,
    tx: mpsc::Sender<CopyJob>,
    rx: tokio::sync::Mutex<mpsc::Receiver<CopyJob>>,
    idle_timeout: Duration,
}

impl Xact for XactPut {
    fn base(&self) -> &XactBase {
        &self.base
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl XactPut {
    pub fn new(
        id: Id,
        bck: Bck,
        props: &MirrorProps,
        snap: Arc<MpiSnap>,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(props.burst.max(1));
        Arc::new(Self {
            base: XactBase::new(id, XactKind::PutCopies, Some(bck.clone())),
            bck,
            snap,
            copies: props.copies as usize,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            idle_timeout,
        })
    }

    /// Submit one just-PUT object for replication. Never blocks: on a
    /// full queue the job is dropped and counted.
    pub fn submit(&self, objname: &str) {
        if self.base.aborted() {
            return;
        }
        self.base.inc_pending();
        match self.tx.try_send(CopyJob {
            objname: objname.to_string(),
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.base.dec_pending();
                self.base.inc_chan_full();
                self.base
                    .add_err(format!("copy of {} dropped: queue full", job.objname));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.base.dec_pending();
            }
        }
    }

    /// The run loop: one worker per available mountpath shares the
    /// queue; the loop itself owns the receiver and dispatches.
    pub async fn run(self: Arc<Self>) {
        let workers = self.snap.num_avail().max(1);
        let sem = Arc::new(tokio::sync::Semaphore::new(workers));
        let abort = self.base.abort_token();
        let mut rx = self.rx.lock().await;

        loop {
            tokio::select! {
                _ = abort.cancelled() => break,
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    let permit = match sem.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    let this = self.clone();
                    tokio::task::spawn_blocking(move || {
                        this.copy_one(&job.objname);
                        drop(permit);
                    });
                }
                _ = tokio::time::sleep(self.idle_timeout / 4) => {
                    if self.base.is_idle_for(self.idle_timeout) {
                        break;
                    }
                }
            }
        }

        // Drain: dropped jobs are reported, not silently lost.
        let mut dropped = 0usize;
        while let Ok(job) = rx.try_recv() {
            self.base.dec_pending();
            dropped += 1;
            let _ = job;
        }
        if dropped > 0 {
            self.base.add_err(format!("{dropped} queued copies dropped at shutdown"));
        }
        // Wait out in-flight workers.
        let _ = sem.acquire_many(workers as u32).await;
        self.base.finish();
    }

    fn copy_one(&self, objname: &str) {
        match make_copies(&self.bck, objname, self.copies, &self.snap) {
            Ok(created) => {
                if created > 0 {
                    self.base.add_objs(created as i64, 0);
                }
            }
            Err(err) => self.base.add_err(format!("{objname}: {err}")),
        }
        self.base.dec_pending();
    }
}

/// PutCopiesFactory builds the per-bucket on-demand mirror xaction.
/// Mirror props are read from the BMD at renew time.
pub struct PutCopiesFactory {
    pub mpi: Arc<volume::Mpi>,
    pub props: Arc<dyn Fn(&Bck) -> Option<MirrorProps> + Send + Sync>,
    pub idle_timeout: Duration,
}

impl xaction::Factory for PutCopiesFactory {
    fn kind(&self) -> XactKind {
        XactKind::PutCopies
    }

    fn start(&self, args: &xaction::RenewArgs, id: Id) -> Result<xaction::ArcXact, xaction::XactError> {
        let bck = args
            .bck
            .clone()
            .ok_or_else(|| xaction::XactError::Failed("put-copies requires a bucket".into()))?;
        let props = (self.props)(&bck)
            .ok_or_else(|| xaction::XactError::Failed(format!("bucket {bck} is not mirrored")))?;
        let xact = XactPut::new(id, bck, &props, self.mpi.snapshot(), self.idle_timeout);
        tokio::spawn(xact.clone().run());
        Ok(xact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volume::Lom;

    fn fixture(n: usize) -> (Vec<tempfile::TempDir>, Arc<volume::Mpi>, Bck) {
        let dirs: Vec<_> = (0..n).map(|_| tempfile::tempdir().unwrap()).collect();
        let mpi = Arc::new(volume::Mpi::new(true));
        for d in &dirs {
            mpi.attach(d.path(), "").unwrap();
        }
        (dirs, mpi, Bck::ais("b"))
    }

    fn put_object(bck: &Bck, snap: &MpiSnap, name: &str) {
        let mut lom = Lom::init(bck.clone(), name, snap).unwrap();
        std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
        std::fs::write(&lom.fqn, vec![0u8; 4096]).unwrap();
        lom.md.size = 4096;
        lom.persist_now().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn puts_get_mirrored() {
        let (_dirs, mpi, bck) = fixture(4);
        let snap = mpi.snapshot();
        let props = MirrorProps {
            enabled: true,
            copies: 2,
            burst: 64,
        };
        let xact = XactPut::new(
            models::IdGenerator::new(4).next(),
            bck.clone(),
            &props,
            snap.clone(),
            Duration::from_millis(200),
        );
        let runner = tokio::spawn(xact.clone().run());

        for i in 0..20 {
            let name = format!("obj-{i}");
            put_object(&bck, &snap, &name);
            xact.submit(&name);
        }

        // The xaction self-terminates once idle.
        runner.await.unwrap();
        assert!(xact.base().finished());

        for i in 0..20 {
            let mut lom = Lom::init(bck.clone(), &format!("obj-{i}"), &snap).unwrap();
            lom.load().unwrap();
            assert_eq!(lom.num_copies(), 2, "obj-{i}");
        }
        assert_eq!(xact.snap().stats.errs, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_queue_drops_with_error() {
        let (_dirs, mpi, bck) = fixture(2);
        let snap = mpi.snapshot();
        let props = MirrorProps {
            enabled: true,
            copies: 2,
            burst: 1,
        };
        let xact = XactPut::new(
            models::IdGenerator::new(5).next(),
            bck.clone(),
            &props,
            snap.clone(),
            Duration::from_millis(100),
        );
        // No runner: the queue (capacity 1) fills immediately.
        xact.submit("a");
        xact.submit("b");
        xact.submit("c");
        let snap_stats = xact.snap();
        assert!(snap_stats.stats.chan_full >= 1);
        assert!(snap_stats.stats.errs >= 1);
    }
}

use crate::{LocalPager, LsoError, LsoMsg, LsoPage};
use models::{Bck, Id, Smap, XactKind};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use volume::MpiSnap;
use xaction::{Xact, XactBase};

/// Transfer name of the designated target's page broadcast.
pub const TRNAME: &str = "lsop";

/// RemoteLister is the backend-provider seam: implemented by the cloud
/// SDK wrappers (out of scope here), consumed by the designated target
/// when a remote-backed bucket is listed without `cached_only`.
#[async_trait::async_trait]
pub trait RemoteLister: Send + Sync + 'static {
    async fn list_page(&self, bck: &Bck, msg: &LsoMsg) -> Result<LsoPage, LsoError>;
}

enum Mode {
    /// AIS buckets and cached-only requests: local walk.
    Local(LocalPager),
    /// Remote-backed bucket, this target owns the backend walk and
    /// broadcasts every page to its peers.
    Designated {
        lister: Arc<dyn RemoteLister>,
        bundle: Option<Arc<transport::Bundle>>,
        peers: Vec<models::Snode>,
    },
    /// Remote-backed bucket, another target is designated; pages
    /// arrive over the streaming transport.
    Subscriber {
        tx: tokio::sync::mpsc::Sender<LsoPage>,
        rx: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<LsoPage>>,
    },
}

struct Cached {
    /// Token the cached page was requested with.
    token: String,
    page: LsoPage,
}

/// LsoXact serves successive pages of one bucket's listing. On-demand:
/// idles between calls, self-terminates on idle timeout, and delivers
/// the terminal Gone error to callers once aborted.
pub struct LsoXact {
    base: XactBase,
    bck: Bck,
    mode: Mode,
    cached: Mutex<Option<Cached>>,
    idle_timeout: Duration,
}

impl Xact for LsoXact {
    fn base(&self) -> &XactBase {
        &self.base
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl LsoXact {
    pub async fn next_page(&self, msg: LsoMsg) -> Result<LsoPage, LsoError> {
        if self.base.aborted() {
            return Err(LsoError::Gone);
        }
        self.base.inc_pending();
        let res = self.do_page(msg).await;
        self.base.dec_pending();
        if let Err(err) = &res {
            self.base.add_err(err);
        }
        res
    }

    async fn do_page(&self, msg: LsoMsg) -> Result<LsoPage, LsoError> {
        // Same token as the last call: re-serve from cache. A smaller
        // page size takes a prefix; a grown one (when the cached page
        // was not final) resumes the walk instead.
        if let Some(cached) = self.cached.lock().unwrap().as_ref() {
            if cached.token == msg.continuation_token {
                let want = msg.clamped_page_size();
                let have = cached.page.entries.len();
                if want < have {
                    let entries: Vec<_> = cached.page.entries[..want].to_vec();
                    let continuation_token =
                        entries.last().map(|e| e.name.clone()).unwrap_or_default();
                    return Ok(LsoPage {
                        entries,
                        continuation_token,
                    });
                }
                if want == have || cached.page.continuation_token.is_empty() {
                    return Ok(cached.page.clone());
                }
            }
        }

        let page = match &self.mode {
            Mode::Local(pager) => {
                let pager = LocalPager {
                    bck: pager.bck.clone(),
                    snap: pager.snap.clone(),
                    self_id: pager.self_id.clone(),
                };
                let msg2 = msg.clone();
                let abort = self.base.abort_token();
                let walk = tokio::task::spawn_blocking(move || pager.page(&msg2));
                tokio::select! {
                    _ = abort.cancelled() => return Err(LsoError::Gone),
                    res = walk => res.map_err(|err| LsoError::Remote(err.to_string()))??,
                }
            }
            Mode::Designated {
                lister,
                bundle,
                peers,
            } => {
                let abort = self.base.abort_token();
                let page = tokio::select! {
                    _ = abort.cancelled() => return Err(LsoError::Gone),
                    res = lister.list_page(&self.bck, &msg) => res?,
                };
                if let Some(bundle) = bundle {
                    for peer in peers {
                        if let Err(err) = bundle.send_page(peer, &page).await {
                            tracing::warn!(peer = %peer.id, %err, "failed to broadcast lso page");
                            self.base.add_err(&err);
                        }
                    }
                }
                self.base.add_objs(page.entries.len() as i64, 0);
                page
            }
            Mode::Subscriber { rx, .. } => {
                // The receiver lock serializes concurrent callers;
                // pages are consumed in arrival order.
                let abort = self.base.abort_token();
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = abort.cancelled() => return Err(LsoError::Gone),
                    page = rx.recv() => page.ok_or(LsoError::Gone)?,
                }
            }
        };

        if !matches!(self.mode, Mode::Designated { .. }) {
            self.base.add_objs(page.entries.len() as i64, 0);
        }
        *self.cached.lock().unwrap() = Some(Cached {
            token: msg.continuation_token.clone(),
            page: page.clone(),
        });
        Ok(page)
    }

    /// On subscriber targets: the sink the transport receiver feeds
    /// broadcast pages into. None in the other modes.
    pub fn page_sink(&self) -> Option<tokio::sync::mpsc::Sender<LsoPage>> {
        match &self.mode {
            Mode::Subscriber { tx, .. } => Some(tx.clone()),
            _ => None,
        }
    }

    /// The xaction run loop: wait out the idle timer or the abort.
    pub async fn run(self: Arc<Self>) {
        let abort = self.base.abort_token();
        loop {
            tokio::select! {
                _ = abort.cancelled() => break,
                _ = tokio::time::sleep(self.idle_timeout / 4) => {
                    if self.base.is_idle_for(self.idle_timeout) {
                        self.base.finish();
                        break;
                    }
                }
            }
        }
    }
}

/// LsoFactory builds list-objects xactions: a local pager for ais (and
/// cached-only) listings, the designated/subscriber split for
/// remote-backed buckets.
pub struct LsoFactory {
    pub self_id: String,
    pub mpi: Arc<volume::Mpi>,
    pub smap: Arc<dyn Fn() -> Arc<Smap> + Send + Sync>,
    pub remote: Option<Arc<dyn RemoteLister>>,
    /// Client for the designated target's page broadcast; None keeps
    /// pages local (single-target clusters, tests).
    pub client: Option<reqwest::Client>,
    pub netw_timeout: Duration,
    pub idle_timeout: Duration,
}

impl LsoFactory {
    fn build(&self, bck: &Bck, id: Id) -> Arc<LsoXact> {
        let snap: Arc<MpiSnap> = self.mpi.snapshot();
        let smap = (self.smap)();

        let mode = if bck.is_remote() && self.remote.is_some() {
            match hrw::target(&bck.uname(), &smap) {
                Ok(designated) if designated.id == self.self_id => Mode::Designated {
                    lister: self.remote.as_ref().unwrap().clone(),
                    bundle: self.client.clone().map(|client| {
                        Arc::new(transport::Bundle::new(
                            client,
                            TRNAME,
                            id,
                            self.self_id.clone(),
                            8,
                            self.netw_timeout,
                        ))
                    }),
                    peers: smap
                        .active_targets()
                        .filter(|t| t.id != self.self_id)
                        .cloned()
                        .collect(),
                },
                Ok(_) => {
                    let (tx, rx) = tokio::sync::mpsc::channel(8);
                    Mode::Subscriber {
                        tx,
                        rx: tokio::sync::Mutex::new(rx),
                    }
                }
                Err(_) => Mode::Local(LocalPager {
                    bck: bck.clone(),
                    snap: snap.clone(),
                    self_id: self.self_id.clone(),
                }),
            }
        } else {
            Mode::Local(LocalPager {
                bck: bck.clone(),
                snap,
                self_id: self.self_id.clone(),
            })
        };

        Arc::new(LsoXact {
            base: XactBase::new(id, XactKind::ListObjects, Some(bck.clone())),
            bck: bck.clone(),
            mode,
            cached: Mutex::new(None),
            idle_timeout: self.idle_timeout,
        })
    }
}

impl xaction::Factory for LsoFactory {
    fn kind(&self) -> XactKind {
        XactKind::ListObjects
    }

    fn start(&self, args: &xaction::RenewArgs, id: Id) -> Result<xaction::ArcXact, xaction::XactError> {
        let bck = args
            .bck
            .clone()
            .ok_or_else(|| xaction::XactError::Failed("list-objects requires a bucket".into()))?;
        let xact = self.build(&bck, id);
        tokio::spawn(xact.clone().run());
        Ok(xact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(names: &[&str]) -> (Vec<tempfile::TempDir>, Arc<volume::Mpi>, Bck) {
        let dirs: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
        let mpi = Arc::new(volume::Mpi::new(true));
        for d in &dirs {
            mpi.attach(d.path(), "").unwrap();
        }
        let bck = Bck::ais("b");
        let snap = mpi.snapshot();
        for name in names {
            let lom = volume::Lom::init(bck.clone(), name, &snap).unwrap();
            std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
            std::fs::write(&lom.fqn, b"x").unwrap();
        }
        (dirs, mpi, bck)
    }

    fn xact(mpi: Arc<volume::Mpi>, bck: &Bck) -> Arc<LsoXact> {
        let factory = LsoFactory {
            self_id: "t1".to_string(),
            mpi,
            smap: Arc::new(|| Arc::new(Smap::default())),
            remote: None,
            client: None,
            netw_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
        };
        factory.build(bck, models::IdGenerator::new(3).next())
    }

    #[tokio::test]
    async fn token_reuse_serves_the_cached_page() {
        let (_dirs, mpi, bck) = fixture(&["a", "b", "c", "d"]);
        let x = xact(mpi, &bck);

        let msg = LsoMsg {
            page_size: 2,
            ..Default::default()
        };
        let p1 = x.next_page(msg.clone()).await.unwrap();
        assert_eq!(p1.entries.len(), 2);

        // Same (empty) token: identical page, not an advance.
        let p1b = x.next_page(msg.clone()).await.unwrap();
        assert_eq!(p1, p1b);

        // Advancing with the returned token yields the rest.
        let p2 = x
            .next_page(LsoMsg {
                page_size: 2,
                continuation_token: p1.continuation_token.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        let names: Vec<_> = p2.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["c", "d"]);
    }

    #[tokio::test]
    async fn shrinking_page_size_reuses_the_cache() {
        let (_dirs, mpi, bck) = fixture(&["a", "b", "c", "d"]);
        let x = xact(mpi, &bck);

        let p1 = x
            .next_page(LsoMsg {
                page_size: 4,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(p1.entries.len(), 4);

        let shrunk = x
            .next_page(LsoMsg {
                page_size: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(shrunk.entries.len(), 2);
        assert_eq!(shrunk.continuation_token, "b");
    }

    #[tokio::test]
    async fn abort_delivers_gone() {
        let (_dirs, mpi, bck) = fixture(&["a"]);
        let x = xact(mpi, &bck);
        x.abort("test");
        let err = x.next_page(LsoMsg::default()).await;
        assert!(matches!(err, Err(LsoError::Gone)));
    }

    #[tokio::test]
    async fn pending_returns_to_zero() {
        let (_dirs, mpi, bck) = fixture(&["a", "b"]);
        let x = xact(mpi, &bck);
        let _ = x.next_page(LsoMsg::default()).await.unwrap();
        assert_eq!(x.base().pending(), 0);
    }
}

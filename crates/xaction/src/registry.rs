use crate::{ArcXact, XactError};
use models::{Bck, Id, IdGenerator, XactKind, XactSnap};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Retained snapshots of finished/aborted xactions.
const FINISHED_CAP: usize = 256;

/// RenewArgs parameterizes a factory invocation.
#[derive(Debug, Clone)]
pub struct RenewArgs {
    pub kind: XactKind,
    pub bck: Option<Bck>,
    /// Externally assigned id (dsort, cluster-wide jobs); None lets the
    /// registry generate one.
    pub id: Option<Id>,
    /// Opaque kind-specific arguments, JSON-encoded by the caller.
    pub custom: Option<String>,
}

/// RenewOutcome distinguishes a fresh start from joining a live
/// on-demand xaction.
pub enum RenewOutcome {
    Started(ArcXact),
    /// An equivalent xaction is already running (on-demand kinds).
    Joined(ArcXact),
}

impl RenewOutcome {
    pub fn xact(&self) -> &ArcXact {
        match self {
            RenewOutcome::Started(x) | RenewOutcome::Joined(x) => x,
        }
    }
    pub fn into_xact(self) -> ArcXact {
        match self {
            RenewOutcome::Started(x) | RenewOutcome::Joined(x) => x,
        }
    }
}

/// Factory builds one kind of xaction. One factory per kind is
/// registered at node startup; the registry owns the enumerated set.
pub trait Factory: Send + Sync + 'static {
    fn kind(&self) -> XactKind;
    /// Construct (but do not run) a new xaction. The registry spawns
    /// the run loop separately so construction stays infallible-fast.
    fn start(&self, args: &RenewArgs, id: Id) -> Result<ArcXact, XactError>;
}

/// Registry is the per-node table of running xactions plus a bounded
/// history of finished ones.
pub struct Registry {
    factories: HashMap<XactKind, Box<dyn Factory>>,
    inner: Mutex<Inner>,
}

struct Inner {
    running: HashMap<Id, ArcXact>,
    finished: VecDeque<XactSnap>,
    ids: IdGenerator,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            inner: Mutex::new(Inner {
                running: HashMap::new(),
                finished: VecDeque::new(),
                ids: IdGenerator::new(2),
            }),
        }
    }

    pub fn register(mut self, factory: Box<dyn Factory>) -> Self {
        let kind = factory.kind();
        let prev = self.factories.insert(kind, factory);
        assert!(prev.is_none(), "duplicate factory for {kind}");
        self
    }

    /// Start a new xaction, or join the live equivalent for on-demand
    /// kinds (same kind + bucket).
    pub fn renew(&self, args: RenewArgs) -> Result<RenewOutcome, XactError> {
        let factory = self
            .factories
            .get(&args.kind)
            .ok_or(XactError::UnknownKind(args.kind))?;

        let mut inner = self.inner.lock().unwrap();
        self.reap_locked(&mut inner);

        if let Some(id) = args.id {
            // Cluster-assigned ids join their live instance: a second
            // commit of the same transaction must not double-start.
            if let Some(x) = inner.running.get(&id) {
                if !x.base().finished() {
                    return Ok(RenewOutcome::Joined(x.clone()));
                }
            }
        } else if args.kind.is_on_demand() {
            let live = inner.running.values().find(|x| {
                x.kind() == args.kind && x.bck() == args.bck.as_ref() && !x.base().finished()
            });
            if let Some(x) = live {
                return Ok(RenewOutcome::Joined(x.clone()));
            }
        }

        let id = args.id.unwrap_or_else(|| inner.ids.next());
        let xact = factory.start(&args, id)?;
        inner.running.insert(id, xact.clone());
        tracing::info!(%id, kind = %args.kind, bck = ?args.bck, "xaction started");
        Ok(RenewOutcome::Started(xact))
    }

    pub fn get(&self, id: Id) -> Option<ArcXact> {
        self.inner.lock().unwrap().running.get(&id).cloned()
    }

    /// Snapshot of a specific xaction, running or finished.
    pub fn snap(&self, id: Id) -> Result<XactSnap, XactError> {
        let inner = self.inner.lock().unwrap();
        if let Some(x) = inner.running.get(&id) {
            return Ok(x.snap());
        }
        inner
            .finished
            .iter()
            .rev()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(XactError::NotFound(id))
    }

    /// All currently running (non-terminal) xactions.
    pub fn running_snaps(&self) -> Vec<XactSnap> {
        let mut inner = self.inner.lock().unwrap();
        self.reap_locked(&mut inner);
        inner.running.values().map(|x| x.snap()).collect()
    }

    pub fn find_running(&self, kind: XactKind, bck: Option<&Bck>) -> Option<ArcXact> {
        let inner = self.inner.lock().unwrap();
        inner
            .running
            .values()
            .find(|x| x.kind() == kind && (bck.is_none() || x.bck() == bck) && !x.base().finished())
            .cloned()
    }

    pub fn abort_id(&self, id: Id, cause: &str) -> Result<(), XactError> {
        let xact = self.get(id).ok_or(XactError::NotFound(id))?;
        xact.abort(cause);
        Ok(())
    }

    /// Abort all running xactions matching the filters; returns count.
    pub fn abort_all(&self, kind: Option<XactKind>, bck: Option<&Bck>, cause: &str) -> usize {
        let targets: Vec<ArcXact> = {
            let inner = self.inner.lock().unwrap();
            inner
                .running
                .values()
                .filter(|x| kind.map(|k| x.kind() == k).unwrap_or(true))
                .filter(|x| bck.map(|b| x.bck() == Some(b)).unwrap_or(true))
                .cloned()
                .collect()
        };
        let mut n = 0;
        for x in targets {
            if x.abort(cause) {
                n += 1;
            }
        }
        n
    }

    /// Move terminal entries into the bounded finished history.
    fn reap_locked(&self, inner: &mut Inner) {
        let done: Vec<Id> = inner
            .running
            .iter()
            .filter(|(_, x)| x.base().finished())
            .map(|(id, _)| *id)
            .collect();
        for id in done {
            if let Some(x) = inner.running.remove(&id) {
                inner.finished.push_back(x.snap());
                while inner.finished.len() > FINISHED_CAP {
                    inner.finished.pop_front();
                }
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Xact, XactBase};
    use std::sync::Arc;

    struct TestXact(XactBase);
    impl Xact for TestXact {
        fn base(&self) -> &XactBase {
            &self.0
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct TestFactory(XactKind);
    impl Factory for TestFactory {
        fn kind(&self) -> XactKind {
            self.0
        }
        fn start(&self, args: &RenewArgs, id: Id) -> Result<ArcXact, XactError> {
            Ok(Arc::new(TestXact(XactBase::new(id, self.0, args.bck.clone()))))
        }
    }

    fn registry() -> Registry {
        Registry::new()
            .register(Box::new(TestFactory(XactKind::ListObjects)))
            .register(Box::new(TestFactory(XactKind::Resilver)))
    }

    fn args(kind: XactKind, bck: Option<Bck>) -> RenewArgs {
        RenewArgs {
            kind,
            bck,
            id: None,
            custom: None,
        }
    }

    #[test]
    fn on_demand_renew_joins_the_live_instance() {
        let reg = registry();
        let bck = Bck::ais("b");
        let first = reg
            .renew(args(XactKind::ListObjects, Some(bck.clone())))
            .unwrap();
        assert!(matches!(first, RenewOutcome::Started(_)));
        let id = first.xact().id();

        let second = reg
            .renew(args(XactKind::ListObjects, Some(bck.clone())))
            .unwrap();
        assert!(matches!(second, RenewOutcome::Joined(_)));
        assert_eq!(second.xact().id(), id);

        // A different bucket gets its own xaction.
        let other = reg.renew(args(XactKind::ListObjects, Some(Bck::ais("c")))).unwrap();
        assert!(matches!(other, RenewOutcome::Started(_)));
    }

    #[test]
    fn non_demand_kinds_always_start_fresh() {
        let reg = registry();
        let a = reg.renew(args(XactKind::Resilver, None)).unwrap();
        let b = reg.renew(args(XactKind::Resilver, None)).unwrap();
        assert!(matches!(a, RenewOutcome::Started(_)));
        assert!(matches!(b, RenewOutcome::Started(_)));
        assert_ne!(a.xact().id(), b.xact().id());
    }

    #[test]
    fn explicit_ids_join_by_id() {
        let reg = registry();
        let id = Id::new([0, 0, 0, 0, 0, 0, 0, 9]);
        let mk = || RenewArgs {
            kind: XactKind::Resilver,
            bck: None,
            id: Some(id),
            custom: None,
        };
        let a = reg.renew(mk()).unwrap();
        assert!(matches!(a, RenewOutcome::Started(_)));
        assert_eq!(a.xact().id(), id);

        // Re-committing the same cluster-assigned id joins, never
        // double-starts.
        let b = reg.renew(mk()).unwrap();
        assert!(matches!(b, RenewOutcome::Joined(_)));
        assert_eq!(b.xact().id(), id);
    }

    #[test]
    fn finished_xactions_move_to_history() {
        let reg = registry();
        let x = reg.renew(args(XactKind::Resilver, None)).unwrap().into_xact();
        let id = x.id();
        x.base().finish();

        // Reaped on the next registry scan, still queryable by id.
        assert!(reg.running_snaps().iter().all(|s| s.id != id));
        let snap = reg.snap(id).unwrap();
        assert!(!snap.is_running());
    }

    #[test]
    fn abort_all_filters_by_kind_and_bucket() {
        let reg = registry();
        let bck = Bck::ais("b");
        let lso = reg
            .renew(args(XactKind::ListObjects, Some(bck.clone())))
            .unwrap()
            .into_xact();
        let res = reg.renew(args(XactKind::Resilver, None)).unwrap().into_xact();

        assert_eq!(reg.abort_all(Some(XactKind::ListObjects), None, "test"), 1);
        assert!(lso.base().aborted());
        assert!(!res.base().aborted());

        assert_eq!(reg.abort_all(None, None, "test"), 1);
        assert!(res.base().aborted());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let reg = registry();
        assert!(matches!(
            reg.renew(args(XactKind::Dsort, None)),
            Err(XactError::UnknownKind(XactKind::Dsort))
        ));
    }
}

use crate::NotifSender;
use models::{Bck, Id, XactKind, XactSnap, XactState, XactStats};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bound on the per-xaction error collector; beyond it, AddErr only
/// counts.
pub const ERR_CAP: usize = 4;

const ST_IDLE: u8 = 0;
const ST_RUNNING: u8 = 1;
const ST_FINISHED: u8 = 2;
const ST_ABORTED: u8 = 3;

fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// XactBase carries the state every xaction kind shares. Embedded by
/// value in each concrete xaction; all fields are updated via atomics
/// or short critical sections, so any worker may call in.
///
/// Snapshots are per-field consistent, not transactional across fields.
pub struct XactBase {
    id: Id,
    kind: XactKind,
    bck: Option<Bck>,

    state: AtomicU8,
    start_time: i64,
    end_time: AtomicI64,
    /// Last transition out of running, for the idle timer.
    last_busy_ns: AtomicI64,

    pending: AtomicI64,
    objs: AtomicI64,
    bytes: AtomicI64,
    errs: AtomicI64,
    chan_full: AtomicI64,

    abort: CancellationToken,
    abort_cause: Mutex<Option<String>>,
    errors: Mutex<Vec<String>>,
    notif: NotifSender,
}

impl XactBase {
    pub fn new(id: Id, kind: XactKind, bck: Option<Bck>) -> Self {
        let now = now_ns();
        Self {
            id,
            kind,
            bck,
            state: AtomicU8::new(ST_IDLE),
            start_time: now,
            end_time: AtomicI64::new(0),
            last_busy_ns: AtomicI64::new(now),
            pending: AtomicI64::new(0),
            objs: AtomicI64::new(0),
            bytes: AtomicI64::new(0),
            errs: AtomicI64::new(0),
            chan_full: AtomicI64::new(0),
            abort: CancellationToken::new(),
            abort_cause: Mutex::new(None),
            errors: Mutex::new(Vec::new()),
            notif: NotifSender::new(),
        }
    }

    /// Subscribe to the (single) terminal notification. Listeners
    /// registered after finish/abort receive nothing.
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<crate::NotifMsg> {
        self.notif.subscribe()
    }

    pub fn id(&self) -> Id {
        self.id
    }
    pub fn kind(&self) -> XactKind {
        self.kind
    }
    pub fn bck(&self) -> Option<&Bck> {
        self.bck.as_ref()
    }

    // --- pending ref-count -------------------------------------------------

    /// Account one outstanding work item; flips idle -> running.
    pub fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let _ = self.state.compare_exchange(
            ST_IDLE,
            ST_RUNNING,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        self.last_busy_ns.store(now_ns(), Ordering::Release);
    }

    pub fn dec_pending(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "dec_pending below zero");
        self.last_busy_ns.store(now_ns(), Ordering::Release);
        if prev == 1 {
            let _ = self.state.compare_exchange(
                ST_RUNNING,
                ST_IDLE,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Idle iff nothing is pending and nothing happened for `timeout`.
    pub fn is_idle_for(&self, timeout: Duration) -> bool {
        if self.pending() != 0 {
            return false;
        }
        let last = self.last_busy_ns.load(Ordering::Acquire);
        now_ns() - last >= timeout.as_nanos() as i64
    }

    // --- counters ----------------------------------------------------------

    pub fn add_obj(&self, bytes: i64) {
        self.objs.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
    pub fn add_objs(&self, objs: i64, bytes: i64) {
        self.objs.fetch_add(objs, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
    pub fn inc_chan_full(&self) {
        self.chan_full.fetch_add(1, Ordering::Relaxed);
    }

    // --- errors ------------------------------------------------------------

    /// Record an error: deduplicated, capped at ERR_CAP distinct
    /// messages; the error counter always advances.
    pub fn add_err(&self, err: impl std::fmt::Display) {
        self.errs.fetch_add(1, Ordering::Relaxed);
        let msg = err.to_string();
        let mut errors = self.errors.lock().unwrap();
        if errors.len() < ERR_CAP && !errors.iter().any(|e| *e == msg) {
            errors.push(msg);
        }
    }

    /// Joined view of the collected errors, if any.
    pub fn err(&self) -> Option<String> {
        let errors = self.errors.lock().unwrap();
        if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        }
    }

    // --- abort & finish ----------------------------------------------------

    /// Level-triggered, idempotent abort. Returns false when the
    /// xaction already reached a terminal state.
    pub fn abort(&self, cause: &str) -> bool {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur == ST_FINISHED || cur == ST_ABORTED {
                return false;
            }
            if self
                .state
                .compare_exchange(cur, ST_ABORTED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        *self.abort_cause.lock().unwrap() = Some(cause.to_string());
        self.end_time.store(now_ns(), Ordering::Release);
        self.abort.cancel();
        tracing::info!(id = %self.id, kind = %self.kind, cause, "xaction aborted");
        self.notif.notify(self.snap(), Some(cause.to_string()));
        true
    }

    pub fn aborted(&self) -> bool {
        self.state.load(Ordering::Acquire) == ST_ABORTED
    }

    pub fn abort_cause(&self) -> Option<String> {
        self.abort_cause.lock().unwrap().clone()
    }

    /// The token every blocking select must include.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Transition to finished. No-op after abort; stats freeze either
    /// way.
    pub fn finish(&self) {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur == ST_FINISHED || cur == ST_ABORTED {
                return;
            }
            if self
                .state
                .compare_exchange(cur, ST_FINISHED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        self.end_time.store(now_ns(), Ordering::Release);
        tracing::debug!(id = %self.id, kind = %self.kind, "xaction finished");
        self.notif.notify(self.snap(), self.err());
    }

    pub fn finished(&self) -> bool {
        let st = self.state.load(Ordering::Acquire);
        st == ST_FINISHED || st == ST_ABORTED
    }

    pub fn state(&self) -> XactState {
        match self.state.load(Ordering::Acquire) {
            ST_IDLE => XactState::Idle,
            ST_RUNNING => XactState::Running,
            ST_FINISHED => XactState::Finished,
            _ => XactState::Aborted,
        }
    }

    // --- snapshots ---------------------------------------------------------

    pub fn snap(&self) -> XactSnap {
        XactSnap {
            id: self.id,
            kind: self.kind,
            bck: self.bck.clone(),
            state: self.state(),
            stats: XactStats {
                objs: self.objs.load(Ordering::Relaxed),
                bytes: self.bytes.load(Ordering::Relaxed),
                errs: self.errs.load(Ordering::Relaxed),
                chan_full: self.chan_full.load(Ordering::Relaxed),
            },
            start_time: self.start_time,
            end_time: self.end_time.load(Ordering::Acquire),
            errors: self.errors.lock().unwrap().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::IdGenerator;

    fn base() -> XactBase {
        XactBase::new(IdGenerator::new(0).next(), XactKind::Resilver, None)
    }

    #[test]
    fn pending_drives_idle_running() {
        let x = base();
        assert_eq!(x.state(), XactState::Idle);
        x.inc_pending();
        assert_eq!(x.state(), XactState::Running);
        x.inc_pending();
        x.dec_pending();
        assert_eq!(x.state(), XactState::Running);
        x.dec_pending();
        assert_eq!(x.state(), XactState::Idle);
        assert_eq!(x.pending(), 0);
    }

    #[test]
    fn idle_requires_quiet_period() {
        let x = base();
        assert!(!x.is_idle_for(Duration::from_millis(50)));
        assert!(x.is_idle_for(Duration::ZERO));
        x.inc_pending();
        assert!(!x.is_idle_for(Duration::ZERO));
    }

    #[test]
    fn abort_is_terminal_and_idempotent() {
        let x = base();
        assert!(x.abort("test cause"));
        assert!(x.aborted());
        assert!(!x.abort("second"));
        assert_eq!(x.abort_cause().unwrap(), "test cause");
        // finish after abort does not change the state.
        x.finish();
        assert_eq!(x.state(), XactState::Aborted);
        assert!(x.abort_token().is_cancelled());
    }

    #[test]
    fn finish_freezes_the_snapshot() {
        let x = base();
        x.add_obj(100);
        x.finish();
        let snap1 = x.snap();
        assert_eq!(snap1.state, XactState::Finished);
        assert!(snap1.end_time > 0);
        assert!(!x.abort("late"));
        let snap2 = x.snap();
        assert_eq!(snap1.state, snap2.state);
        assert_eq!(snap1.stats, snap2.stats);
    }

    #[tokio::test]
    async fn terminal_transition_fires_one_notification() {
        let x = base();
        let mut rx = x.subscribe();
        x.finish();
        x.abort("late"); // second transition must not re-fire
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.snap.state, XactState::Finished);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn errors_dedup_and_cap() {
        let x = base();
        for _ in 0..3 {
            x.add_err("same error");
        }
        for i in 0..10 {
            x.add_err(format!("err-{i}"));
        }
        let snap = x.snap();
        assert_eq!(snap.errors.len(), ERR_CAP);
        assert_eq!(snap.stats.errs, 13);
        assert!(x.err().unwrap().contains("same error"));
    }
}

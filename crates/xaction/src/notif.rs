use models::XactSnap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// NotifMsg announces a terminal transition of one xaction to whoever
/// subscribed (typically the gateway that spawned it).
#[derive(Debug, Clone)]
pub struct NotifMsg {
    pub snap: XactSnap,
    /// Abort cause, None on clean finish.
    pub err: Option<String>,
}

/// NotifSender fires finish/abort notifications exactly once per
/// xaction. Listeners are registered before the run loop starts;
/// late subscribers receive nothing.
pub struct NotifSender {
    listeners: Mutex<Vec<mpsc::UnboundedSender<NotifMsg>>>,
    fired: std::sync::atomic::AtomicBool,
}

impl NotifSender {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            fired: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NotifMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    /// Deliver the terminal notification. Idempotent; only the first
    /// call fires.
    pub fn notify(&self, snap: XactSnap, err: Option<String>) {
        if self
            .fired
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            return;
        }
        let msg = NotifMsg { snap, err };
        for tx in self.listeners.lock().unwrap().drain(..) {
            // A gone listener is not an error.
            let _ = tx.send(msg.clone());
        }
    }
}

impl Default for NotifSender {
    fn default() -> Self {
        Self::new()
    }
}

use crate::{ObjHdr, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Inbound stream body, delivered fully buffered. Transport framing is
/// one HTTP request per item; flow control lives on the send side.
pub type BodyStream = bytes::Bytes;

/// RecvHandler is the receiving end of one transfer name. Implemented
/// by the archive owner, the dsort record receiver, the LSO page
/// subscriber.
#[async_trait::async_trait]
pub trait RecvHandler: Send + Sync + 'static {
    async fn recv(
        &self,
        from_node: &str,
        hdr: ObjHdr,
        body: BodyStream,
    ) -> Result<(), TransportError>;
}

struct Entry {
    handler: Arc<dyn RecvHandler>,
    active: Arc<AtomicUsize>,
}

/// RecvRegistry maps (trname, xaction-id) to a live handler. The node
/// router resolves every inbound `/v1/transport/...` request here.
#[derive(Default)]
pub struct RecvRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    drained: tokio::sync::Notify,
}

impl RecvRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(trname: &str, xid: &str) -> String {
        format!("{trname}/{xid}")
    }

    pub fn register(&self, trname: &str, xid: &str, handler: Arc<dyn RecvHandler>) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            Self::key(trname, xid),
            Entry {
                handler,
                active: Arc::new(AtomicUsize::new(0)),
            },
        );
    }

    pub fn unregister(&self, trname: &str, xid: &str) {
        self.entries.lock().unwrap().remove(&Self::key(trname, xid));
    }

    /// Dispatch one inbound stream. The active count covers the full
    /// handler invocation, so `quiesce` cannot return while any body
    /// is still being consumed.
    pub async fn dispatch(
        &self,
        trname: &str,
        xid: &str,
        from_node: &str,
        hdr: ObjHdr,
        body: BodyStream,
    ) -> Result<(), TransportError> {
        let (handler, active) = {
            let entries = self.entries.lock().unwrap();
            let entry = entries
                .get(&Self::key(trname, xid))
                .ok_or_else(|| TransportError::UnknownTrname(Self::key(trname, xid)))?;
            (entry.handler.clone(), entry.active.clone())
        };
        active.fetch_add(1, Ordering::AcqRel);
        let res = handler.recv(from_node, hdr, body).await;
        active.fetch_sub(1, Ordering::AcqRel);
        self.drained.notify_waiters();
        res
    }

    pub fn active(&self, trname: &str, xid: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .get(&Self::key(trname, xid))
            .map(|e| e.active.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Wait until the inbound ref-count reaches zero, bounded by
    /// `timeout` (the send-file timeout of the finalizing xaction).
    pub async fn quiesce(
        &self,
        trname: &str,
        xid: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let until = tokio::time::Instant::now() + timeout;
        loop {
            let n = self.active(trname, xid);
            if n == 0 {
                return Ok(());
            }
            tokio::select! {
                _ = self.drained.notified() => {}
                _ = tokio::time::sleep_until(until) => {
                    return Err(TransportError::QuiesceTimeout(self.active(trname, xid)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler {
        seen: Mutex<Vec<String>>,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait::async_trait]
    impl RecvHandler for CountingHandler {
        async fn recv(
            &self,
            from_node: &str,
            hdr: ObjHdr,
            _body: BodyStream,
        ) -> Result<(), TransportError> {
            let _g = self.gate.acquire().await.unwrap();
            self.seen
                .lock()
                .unwrap()
                .push(format!("{from_node}:{}", hdr.objname));
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_the_registered_handler() {
        let reg = RecvRegistry::new();
        let handler = Arc::new(CountingHandler {
            seen: Mutex::new(Vec::new()),
            gate: tokio::sync::Semaphore::new(1),
        });
        reg.register("arch", "x1", handler.clone());

        let hdr = ObjHdr {
            objname: "obj-a".to_string(),
            ..Default::default()
        };
        reg.dispatch("arch", "x1", "t2", hdr, bytes::Bytes::new())
            .await
            .unwrap();
        assert_eq!(handler.seen.lock().unwrap().as_slice(), ["t2:obj-a"]);

        // Unknown names are rejected.
        let err = reg
            .dispatch("arch", "x9", "t2", ObjHdr::default(), bytes::Bytes::new())
            .await;
        assert!(matches!(err, Err(TransportError::UnknownTrname(_))));
    }

    #[tokio::test]
    async fn quiesce_waits_for_inflight_handlers() {
        let reg = Arc::new(RecvRegistry::new());
        let handler = Arc::new(CountingHandler {
            seen: Mutex::new(Vec::new()),
            gate: tokio::sync::Semaphore::new(0), // hold the handler open
        });
        reg.register("arch", "x1", handler.clone());

        let reg2 = reg.clone();
        let dispatch = tokio::spawn(async move {
            reg2.dispatch("arch", "x1", "t3", ObjHdr::default(), bytes::Bytes::new())
                .await
        });

        // Handler is blocked; quiesce must time out.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reg.active("arch", "x1"), 1);
        let res = reg.quiesce("arch", "x1", Duration::from_millis(30)).await;
        assert!(matches!(res, Err(TransportError::QuiesceTimeout(1))));

        // Release the handler; quiesce now succeeds.
        handler.gate.add_permits(1);
        dispatch.await.unwrap().unwrap();
        reg.quiesce("arch", "x1", Duration::from_millis(100))
            .await
            .unwrap();
    }
}

use crate::TransportError;
use models::{Bck, Id, Snode};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// ObjHdr describes one streamed item: enough for the receiver to build
/// a workfile and, on finalize, a LOM.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ObjHdr {
    pub bck: Bck,
    pub objname: String,
    pub size: i64,
    #[serde(default)]
    pub atime_ns: i64,
    #[serde(default)]
    pub cksum_type: String,
    #[serde(default)]
    pub cksum_value: String,
    /// Kind-specific sideband (dsort record metadata and the like).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opaque: Vec<u8>,
}

/// Bundle is the sending half of one xaction's streams: bounded
/// in-flight sends to every peer, shared HTTP client, send accounting.
/// Opened at xaction start, closed (dropped) at finalize; callers must
/// drain their receive side before closing.
pub struct Bundle {
    client: reqwest::Client,
    /// Transfer name: selects the receiver-side handler.
    trname: String,
    xid: Id,
    self_id: String,
    inflight: Arc<Semaphore>,
    netw_timeout: Duration,
    sent_objs: AtomicI64,
    sent_bytes: AtomicI64,
}

impl Bundle {
    pub fn new(
        client: reqwest::Client,
        trname: impl Into<String>,
        xid: Id,
        self_id: impl Into<String>,
        max_inflight: usize,
        netw_timeout: Duration,
    ) -> Self {
        Self {
            client,
            trname: trname.into(),
            xid,
            self_id: self_id.into(),
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
            netw_timeout,
            sent_objs: AtomicI64::new(0),
            sent_bytes: AtomicI64::new(0),
        }
    }

    pub fn url(&self, node: &Snode) -> String {
        format!(
            "{}/{}/{}",
            node.data_url(api::paths::TRANSPORT),
            self.trname,
            self.xid
        )
    }

    /// Stream one object to `node`. Blocks behind flow control (the
    /// per-bundle in-flight bound), then runs the HTTP PUT to
    /// completion. Body is a fully owned buffer: shard members and
    /// dsort records are bounded, and retries need a rewindable body.
    pub async fn send(
        &self,
        node: &Snode,
        hdr: ObjHdr,
        body: bytes::Bytes,
    ) -> Result<(), TransportError> {
        let _permit = self
            .inflight
            .acquire()
            .await
            .expect("bundle semaphore closed");
        let size = body.len() as i64;

        let opaque64 = if hdr.opaque.is_empty() {
            String::new()
        } else {
            base64::encode(&hdr.opaque)
        };
        let mut req = self
            .client
            .put(self.url(node))
            .timeout(self.netw_timeout)
            .header(api::headers::NODE_ID, &self.self_id)
            .header(api::headers::XACTION_ID, self.xid.to_string())
            .header(crate::hdrs::OBJ_BCK, hdr.bck.to_string())
            .header(crate::hdrs::OBJ_NAME, &hdr.objname)
            .header(crate::hdrs::OBJ_SIZE, hdr.size.to_string())
            .header(api::headers::OBJ_ATIME, hdr.atime_ns.to_string());
        if !hdr.cksum_type.is_empty() {
            req = req
                .header(api::headers::OBJ_CKSUM_TYPE, &hdr.cksum_type)
                .header(api::headers::OBJ_CKSUM_VAL, &hdr.cksum_value);
        }
        if !opaque64.is_empty() {
            req = req.header(crate::hdrs::OPAQUE, opaque64);
        }

        let resp = req.body(body).send().await.map_err(|err| TransportError::Send {
            node: node.id.clone(),
            err: err.to_string(),
        })?;
        if !resp.status().is_success() {
            return Err(TransportError::Send {
                node: node.id.clone(),
                err: format!("http status {}", resp.status()),
            });
        }
        self.sent_objs.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    /// Non-blocking send admission; lets callers count `chan_full`
    /// instead of queueing unboundedly.
    pub fn try_reserve(&self) -> Result<tokio::sync::OwnedSemaphorePermit, TransportError> {
        self.inflight
            .clone()
            .try_acquire_owned()
            .map_err(|_| TransportError::ChanFull)
    }

    pub fn sent(&self) -> (i64, i64) {
        (
            self.sent_objs.load(Ordering::Relaxed),
            self.sent_bytes.load(Ordering::Relaxed),
        )
    }

    /// Encode-and-send a typed msgpack page (LSO page streaming).
    pub async fn send_page<T: serde::Serialize>(
        &self,
        node: &Snode,
        page: &T,
    ) -> Result<(), TransportError> {
        let body = rmp_serde::to_vec_named(page)
            .map_err(|err| TransportError::BadHeader(err.to_string()))?;
        let hdr = ObjHdr {
            objname: "page".to_string(),
            size: body.len() as i64,
            ..Default::default()
        };
        self.send(node, hdr, bytes::Bytes::from(body)).await
    }
}

/// Decode a msgpack page previously sent with `send_page`.
pub fn decode_page<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, TransportError> {
    rmp_serde::from_slice(body).map_err(|err| TransportError::BadHeader(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_encoding_round_trips() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Page {
            entries: Vec<String>,
            token: String,
        }
        let page = Page {
            entries: vec!["a".into(), "b".into()],
            token: "b".into(),
        };
        let raw = rmp_serde::to_vec_named(&page).unwrap();
        let back: Page = super::decode_page(&raw).unwrap();
        assert_eq!(page, back);
    }

    #[tokio::test]
    async fn try_reserve_enforces_the_bound() {
        let bundle = Bundle::new(
            reqwest::Client::new(),
            "t",
            Id::new([0; 8]),
            "t1",
            2,
            Duration::from_secs(1),
        );
        let p1 = bundle.try_reserve().unwrap();
        let _p2 = bundle.try_reserve().unwrap();
        assert!(matches!(bundle.try_reserve(), Err(TransportError::ChanFull)));
        drop(p1);
        assert!(bundle.try_reserve().is_ok());
    }
}

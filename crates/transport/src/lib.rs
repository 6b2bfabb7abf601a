//! Intra-cluster object and page streaming. A sending xaction opens a
//! Bundle against its peers; receivers register a handler under a
//! transfer name ("trname") and the node router dispatches inbound
//! streams to it. Inbound streams are ref-counted so a finalizing
//! receiver can quiesce before closing its writer.

mod bundle;
mod recv;

pub use bundle::{decode_page, Bundle, ObjHdr};
pub use recv::{BodyStream, RecvHandler, RecvRegistry};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no receiver registered for {0:?}")]
    UnknownTrname(String),
    #[error("stream to {node} failed: {err}")]
    Send { node: String, err: String },
    #[error("send queue full")]
    ChanFull,
    #[error("quiesce timed out with {0} inbound streams still active")]
    QuiesceTimeout(usize),
    #[error("bad stream header: {0}")]
    BadHeader(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Headers specific to the streaming transport (the object metadata
/// headers come from `api::headers`).
pub mod hdrs {
    pub const OBJ_BCK: &str = "Hdr-Obj-Bck";
    pub const OBJ_NAME: &str = "Hdr-Obj-Name";
    pub const OBJ_SIZE: &str = "Hdr-Obj-Size";
    pub const OPAQUE: &str = "Hdr-Stream-Opaque";
}

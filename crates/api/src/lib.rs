//! Wire-stable constants and types of the native control API: URL paths,
//! headers, query parameters, the `what=` selector, and the structured
//! error envelope. Shared by clients and servers so the two cannot drift.

mod err;

pub use err::{is_retriable, is_retriable_status, ErrBody, TypeCode};

/// Versioned URL paths. Path segments after the fixed prefix are
/// interpreted by the owning handler.
pub mod paths {
    pub const VERSION: &str = "/v1";

    pub const CLUSTER: &str = "/v1/cluster";
    pub const DAEMON: &str = "/v1/daemon";
    pub const REVERSE_DAEMON: &str = "/v1/reverse/daemon";
    pub const BUCKETS: &str = "/v1/buckets";
    pub const OBJECTS: &str = "/v1/objects";
    pub const TXN: &str = "/v1/txn";
    pub const METASYNC: &str = "/v1/metasync";
    pub const TRANSPORT: &str = "/v1/transport";
    pub const XACTIONS: &str = "/v1/xactions";

    /// Phases of the two-phase transaction protocol (targets only).
    pub const TXN_BEGIN: &str = "begin";
    pub const TXN_COMMIT: &str = "commit";
    pub const TXN_ABORT: &str = "abort";
}

/// Custom headers. Canonical names are used verbatim on the wire.
pub mod headers {
    pub const NODE_ID: &str = "Hdr-Node-Id";
    pub const NODE_URL: &str = "Hdr-Node-Url";
    pub const CLUSTER_UPTIME: &str = "Hdr-Cluster-Uptime";
    pub const NODE_UPTIME: &str = "Hdr-Node-Uptime";
    pub const XACTION_ID: &str = "Hdr-Xaction-Id";
    pub const PROMOTE_NAMES_HASH: &str = "Hdr-Promote-Names-Hash";
    pub const PROMOTE_NAMES_NUM: &str = "Hdr-Promote-Names-Num";
    pub const OBJ_CKSUM_TYPE: &str = "Hdr-Obj-Cksum-Type";
    pub const OBJ_CKSUM_VAL: &str = "Hdr-Obj-Cksum-Val";
    pub const OBJ_ATIME: &str = "Hdr-Obj-Atime";
    pub const OBJ_VERSION: &str = "Hdr-Obj-Version";
    pub const OBJ_CUSTOM_MD: &str = "Hdr-Obj-Custom-Md";
}

/// Query parameters.
pub mod qparams {
    pub const WHAT: &str = "what";
    pub const FORCE: &str = "force";
    pub const KEEP_MD: &str = "keep_md";
    pub const TRANSIENT: &str = "transient";
    /// Txn begin freshness: primary's wall clock, Unix nanoseconds.
    pub const UNIXTIME: &str = "unixtime";
    pub const WAIT_METASYNC: &str = "wait_metasync";
    pub const NETW_TIMEOUT: &str = "netw_timeout";
    pub const HOST_TIMEOUT: &str = "host_timeout";
    /// Continuation token of a list-objects page.
    pub const CONTINUATION: &str = "continuation_token";
}

/// Environment variables consumed by the node binary.
pub mod env {
    pub const ENDPOINT: &str = "STRAND_ENDPOINT";
    pub const IS_PRIMARY: &str = "STRAND_IS_PRIMARY";
    pub const PRIMARY_ID: &str = "STRAND_PRIMARY_ID";
    pub const USE_HTTPS: &str = "STRAND_USE_HTTPS";
    pub const CRT: &str = "STRAND_CRT";
    pub const CRT_KEY: &str = "STRAND_CRT_KEY";
    pub const CLIENT_CA: &str = "STRAND_CLIENT_CA";
    pub const SKIP_VERIFY_CRT: &str = "STRAND_SKIP_VERIFY_CRT";
    pub const MY_POD: &str = "MY_POD";
    pub const MY_NODE: &str = "MY_NODE";
    pub const K8S_NS: &str = "K8S_NS";
}

/// The `what=` selector of daemon and cluster GET queries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum What {
    Smap,
    Bmd,
    Rmd,
    ClusterConfig,
    NodeConfig,
    Snode,
    NodeStats,
    DiskStats,
    MetricNames,
    Log,
    AllRunningXacts,
}

impl What {
    pub fn as_str(&self) -> &'static str {
        match self {
            What::Smap => "smap",
            What::Bmd => "bmd",
            What::Rmd => "rmd",
            What::ClusterConfig => "cluster-config",
            What::NodeConfig => "node-config",
            What::Snode => "snode",
            What::NodeStats => "node-stats",
            What::DiskStats => "disk-stats",
            What::MetricNames => "metric-names",
            What::Log => "log",
            What::AllRunningXacts => "all-running-xacts",
        }
    }
}

impl std::str::FromStr for What {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smap" => Ok(What::Smap),
            "bmd" => Ok(What::Bmd),
            "rmd" => Ok(What::Rmd),
            "cluster-config" => Ok(What::ClusterConfig),
            "node-config" => Ok(What::NodeConfig),
            "snode" => Ok(What::Snode),
            "node-stats" => Ok(What::NodeStats),
            "disk-stats" => Ok(What::DiskStats),
            "metric-names" => Ok(What::MetricNames),
            "log" => Ok(What::Log),
            "all-running-xacts" => Ok(What::AllRunningXacts),
            other => Err(format!("unknown what={other:?}")),
        }
    }
}

/// Url of a bucket-level endpoint on `node`.
pub fn bucket_url(node: &models::Snode, bck: &models::Bck) -> String {
    node.control_url(&format!("{}/{}", paths::BUCKETS, bck.name))
}

/// Url of a txn phase endpoint on `node`.
pub fn txn_url(node: &models::Snode, bck_name: &str, phase: &str) -> String {
    node.control_url(&format!("{}/{}/{}", paths::TXN, bck_name, phase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn what_round_trips() {
        for w in [What::Smap, What::AllRunningXacts, What::ClusterConfig] {
            let parsed: What = w.as_str().parse().unwrap();
            assert_eq!(w, parsed);
        }
        assert!("nope".parse::<What>().is_err());
    }
}

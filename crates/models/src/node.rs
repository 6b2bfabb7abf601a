use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Proxy,
    Target,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NodeRole::Proxy => "proxy",
            NodeRole::Target => "target",
        })
    }
}

/// NodeFlags is a bitmask of lifecycle states a node can be in while
/// still appearing in the cluster map.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeFlags(pub u16);

impl NodeFlags {
    pub const MAINTENANCE: u16 = 1 << 0;
    pub const DECOMMISSION: u16 = 1 << 1;

    pub fn set(&mut self, bit: u16) {
        self.0 |= bit;
    }
    pub fn clear(&mut self, bit: u16) {
        self.0 &= !bit;
    }
    pub fn is_set(&self, bit: u16) -> bool {
        self.0 & bit != 0
    }
    /// In maintenance or decommissioning: excluded from placement and
    /// from "active" queries.
    pub fn is_anyset(&self) -> bool {
        self.0 & (Self::MAINTENANCE | Self::DECOMMISSION) != 0
    }
}

/// NetInfo is one of a node's three serving endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInfo {
    pub url: url::Url,
}

impl NetInfo {
    pub fn new(url: url::Url) -> Self {
        Self { url }
    }
}

/// Snode is one cluster member. Identity (`id`) survives restarts;
/// everything else may change between cluster map versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snode {
    pub id: String,
    pub role: NodeRole,
    /// Client-facing endpoint.
    pub pub_net: NetInfo,
    /// Intra-cluster control traffic (metasync, txn, keepalive).
    pub control_net: NetInfo,
    /// Intra-cluster data traffic (rebalance, streams).
    pub data_net: NetInfo,
    #[serde(default)]
    pub flags: NodeFlags,
}

impl Snode {
    pub fn new(id: impl Into<String>, role: NodeRole, url: url::Url) -> Self {
        let net = NetInfo::new(url);
        Self {
            id: id.into(),
            role,
            pub_net: net.clone(),
            control_net: net.clone(),
            data_net: net,
            flags: NodeFlags::default(),
        }
    }

    pub fn is_target(&self) -> bool {
        self.role == NodeRole::Target
    }
    pub fn is_proxy(&self) -> bool {
        self.role == NodeRole::Proxy
    }
    pub fn in_maint_or_decomm(&self) -> bool {
        self.flags.is_anyset()
    }

    pub fn control_url(&self, path: &str) -> String {
        format!("{}{}", self.control_net.url.as_str().trim_end_matches('/'), path)
    }
    pub fn data_url(&self, path: &str) -> String {
        format!("{}{}", self.data_net.url.as_str().trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_roundtrip() {
        let mut f = NodeFlags::default();
        assert!(!f.is_anyset());
        f.set(NodeFlags::MAINTENANCE);
        assert!(f.is_set(NodeFlags::MAINTENANCE));
        assert!(f.is_anyset());
        f.clear(NodeFlags::MAINTENANCE);
        assert!(!f.is_anyset());
    }

    #[test]
    fn control_url_joins_cleanly() {
        let n = Snode::new("t1", NodeRole::Target, "http://127.0.0.1:8081/".parse().unwrap());
        assert_eq!(n.control_url("/v1/metasync"), "http://127.0.0.1:8081/v1/metasync");
    }
}

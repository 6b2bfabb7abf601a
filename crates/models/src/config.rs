use crate::Revs;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_host_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_netw_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_idle() -> Duration {
    Duration::from_secs(20)
}
fn default_send_file() -> Duration {
    Duration::from_secs(300)
}
fn default_max_probing() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConf {
    /// Overall control-action deadline.
    #[serde(with = "humantime_serde", default = "default_host_timeout")]
    pub host: Duration,
    /// Per-call intra-cluster network deadline.
    #[serde(with = "humantime_serde", default = "default_netw_timeout")]
    pub network: Duration,
    /// Ceiling on retry backoff for retriable transport errors.
    #[serde(with = "humantime_serde", default = "default_max_probing")]
    pub max_probing: Duration,
    /// Bound on the archive/dsort quiesce wait for inbound streams.
    #[serde(with = "humantime_serde", default = "default_send_file")]
    pub send_file: Duration,
}

impl Default for TimeoutConf {
    fn default() -> Self {
        Self {
            host: default_host_timeout(),
            network: default_netw_timeout(),
            max_probing: default_max_probing(),
            send_file: default_send_file(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LsoConf {
    /// Idle timeout of the list-objects xaction between pages.
    #[serde(with = "humantime_serde", default = "default_idle")]
    pub idle_timeout: Duration,
    /// Capacity of the jogger -> merge channel, per mountpath.
    #[serde(default = "LsoConf::default_burst")]
    pub burst: usize,
}

impl LsoConf {
    fn default_burst() -> usize {
        128
    }
}

impl Default for LsoConf {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle(),
            burst: Self::default_burst(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorConf {
    /// Idle timeout of the on-demand put-copies xaction.
    #[serde(with = "humantime_serde", default = "default_idle")]
    pub idle_timeout: Duration,
}

impl Default for MirrorConf {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DsortConf {
    /// Reaction when the projected working set exceeds free RAM.
    #[serde(default)]
    pub mem_reaction: MemReaction,
    /// Fraction of free RAM the estimator may plan to use.
    #[serde(default = "DsortConf::default_mem_frac")]
    pub mem_frac: f64,
}

impl DsortConf {
    fn default_mem_frac() -> f64 {
        0.8
    }
}

impl Default for DsortConf {
    fn default() -> Self {
        Self {
            mem_reaction: MemReaction::default(),
            mem_frac: Self::default_mem_frac(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemReaction {
    Ignore,
    Warn,
    Abort,
}

impl Default for MemReaction {
    fn default() -> Self {
        MemReaction::Warn
    }
}

/// ClusterConfig is the minimal replicated cluster configuration: the
/// tunables the coordination core itself consumes. Persisted per
/// mountpath as `.strand.conf`; `transient=true` updates skip persist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub timeout: TimeoutConf,
    #[serde(default)]
    pub lso: LsoConf,
    #[serde(default)]
    pub mirror: MirrorConf,
    #[serde(default)]
    pub dsort: DsortConf,
}

impl Revs for ClusterConfig {
    const KIND: &'static str = "conf";
    const FNAME: &'static str = ".strand.conf";

    fn version(&self) -> i64 {
        self.version
    }
    fn bump(&mut self) {
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_from_empty_object() {
        let conf: ClusterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(conf.timeout.network, Duration::from_secs(10));
        assert_eq!(conf.dsort.mem_reaction, MemReaction::Warn);
    }

    #[test]
    fn durations_use_humantime() {
        let conf: ClusterConfig =
            serde_json::from_str(r#"{"timeout": {"network": "250ms"}}"#).unwrap();
        assert_eq!(conf.timeout.network, Duration::from_millis(250));
    }
}

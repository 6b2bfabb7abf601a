use crate::Owners;
use exponential_backoff::Backoff;
use models::{Bmd, ClusterConfig, Revs, Rmd, Smap};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// MsyncPayload is the wire body of one metasync push: the latest
/// version of every queued kind, plus the action that caused it (for
/// logs and receiver-side triggers).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MsyncPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smap: Option<Smap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmd: Option<Bmd>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rmd: Option<Rmd>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<ClusterConfig>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
}

impl MsyncPayload {
    pub fn is_empty(&self) -> bool {
        self.smap.is_none() && self.bmd.is_none() && self.rmd.is_none() && self.conf.is_none()
    }
}

/// Per-node, per-kind highest acked version.
type AckTable = HashMap<String, HashMap<&'static str, i64>>;

/// MsyncStatus is the externally visible convergence state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MsyncStatus {
    /// Kinds still queued with their pending versions.
    pub pending: HashMap<&'static str, i64>,
    pub acked: HashMap<String, HashMap<&'static str, i64>>,
}

struct State {
    /// Latest queued version of each kind; superseded queue entries are
    /// simply overwritten (only the newest version matters).
    queued: MsyncPayload,
    versions: HashMap<&'static str, i64>,
    acked: AckTable,
}

/// Metasync runs on the primary: control actions queue fresh Revs, the
/// background pump pushes them to every active node with at-least-once
/// retry, and `wait_synced` lets callers gate on convergence.
pub struct Metasync {
    self_id: String,
    client: reqwest::Client,
    state: Mutex<State>,
    wakeup: tokio::sync::Notify,
    acked_changed: tokio::sync::Notify,
}

impl Metasync {
    pub fn new(self_id: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            self_id: self_id.into(),
            client,
            state: Mutex::new(State {
                queued: MsyncPayload::default(),
                versions: HashMap::new(),
                acked: AckTable::new(),
            }),
            wakeup: tokio::sync::Notify::new(),
            acked_changed: tokio::sync::Notify::new(),
        }
    }

    pub fn queue_smap(&self, smap: Smap, action: &str) {
        let mut st = self.state.lock().unwrap();
        st.versions.insert(Smap::KIND, smap.version());
        st.queued.smap = Some(smap);
        st.queued.action = action.to_string();
        drop(st);
        self.wakeup.notify_one();
    }

    pub fn queue_bmd(&self, bmd: Bmd, action: &str) {
        let mut st = self.state.lock().unwrap();
        st.versions.insert(Bmd::KIND, bmd.version());
        st.queued.bmd = Some(bmd);
        st.queued.action = action.to_string();
        drop(st);
        self.wakeup.notify_one();
    }

    pub fn queue_rmd(&self, rmd: Rmd, action: &str) {
        let mut st = self.state.lock().unwrap();
        st.versions.insert(Rmd::KIND, rmd.version());
        st.queued.rmd = Some(rmd);
        st.queued.action = action.to_string();
        drop(st);
        self.wakeup.notify_one();
    }

    pub fn queue_conf(&self, conf: ClusterConfig, action: &str) {
        let mut st = self.state.lock().unwrap();
        st.versions.insert(ClusterConfig::KIND, conf.version());
        st.queued.conf = Some(conf);
        st.queued.action = action.to_string();
        drop(st);
        self.wakeup.notify_one();
    }

    pub fn status(&self) -> MsyncStatus {
        let st = self.state.lock().unwrap();
        MsyncStatus {
            pending: st.versions.clone(),
            acked: st.acked.clone(),
        }
    }

    /// The background pump. Runs until cancelled; every wakeup pushes
    /// the currently queued payload to all active nodes except self.
    pub async fn run(
        self: Arc<Self>,
        owners: Arc<Owners>,
        netw_timeout: Duration,
        max_probing: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.wakeup.notified() => {}
            }

            let payload = {
                let st = self.state.lock().unwrap();
                st.queued.clone()
            };
            if payload.is_empty() {
                continue;
            }
            let smap = owners.smap.get();
            let body = match serde_json::to_vec(&payload) {
                Ok(b) => b,
                Err(err) => {
                    tracing::error!(%err, "failed to encode metasync payload");
                    continue;
                }
            };

            let mut tasks = tokio::task::JoinSet::new();
            for node in smap.pmap.values().chain(smap.tmap.values()) {
                if node.id == self.self_id || node.in_maint_or_decomm() {
                    continue;
                }
                let this = self.clone();
                let node = node.clone();
                let body = body.clone();
                let payload = payload.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    this.push_one(node, body, payload, netw_timeout, max_probing, cancel)
                        .await
                });
            }
            while let Some(res) = tasks.join_next().await {
                if let Err(err) = res {
                    tracing::warn!(%err, "metasync push task panicked");
                }
            }
        }
    }

    async fn push_one(
        &self,
        node: models::Snode,
        body: Vec<u8>,
        payload: MsyncPayload,
        netw_timeout: Duration,
        max_probing: Duration,
        cancel: CancellationToken,
    ) {
        let url = node.control_url(api::paths::METASYNC);
        let backoff = Backoff::new(8, Duration::from_millis(100), Some(max_probing));
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let res = self
                .client
                .post(&url)
                .timeout(netw_timeout)
                .header("content-type", "application/json")
                .body(body.clone())
                .send()
                .await;
            match res {
                Ok(resp) if resp.status().is_success() => {
                    self.record_ack(&node.id, &payload);
                    return;
                }
                Ok(resp) => {
                    tracing::warn!(node = %node.id, status = %resp.status(), "metasync rejected");
                    if !api::is_retriable_status(resp.status().as_u16()) {
                        return;
                    }
                }
                Err(err) if api::is_retriable(&err) => {
                    tracing::debug!(node = %node.id, attempt, %err, "metasync push failed; will retry");
                }
                Err(err) => {
                    tracing::warn!(node = %node.id, %err, "metasync push failed (not retriable)");
                    return;
                }
            }
            attempt += 1;
            match backoff.next(attempt) {
                Some(wait) => tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                },
                None => break,
            }
        }
        tracing::warn!(node = %node.id, "metasync retries exhausted");
    }

    fn record_ack(&self, node_id: &str, payload: &MsyncPayload) {
        let mut st = self.state.lock().unwrap();
        let acked = st.acked.entry(node_id.to_string()).or_default();
        if let Some(smap) = &payload.smap {
            acked.insert(Smap::KIND, smap.version());
        }
        if let Some(bmd) = &payload.bmd {
            acked.insert(Bmd::KIND, bmd.version());
        }
        if let Some(rmd) = &payload.rmd {
            acked.insert(Rmd::KIND, rmd.version());
        }
        if let Some(conf) = &payload.conf {
            acked.insert(ClusterConfig::KIND, conf.version());
        }
        drop(st);
        self.acked_changed.notify_waiters();
    }

    /// Block until every node in `node_ids` acked `kind >= version`,
    /// or the deadline expires. Best-effort by design: returns the ids
    /// still missing on timeout.
    pub async fn wait_synced(
        &self,
        kind: &'static str,
        version: i64,
        node_ids: &[String],
        deadline: Duration,
    ) -> Vec<String> {
        let until = tokio::time::Instant::now() + deadline;
        loop {
            let missing: Vec<String> = {
                let st = self.state.lock().unwrap();
                node_ids
                    .iter()
                    .filter(|id| {
                        st.acked
                            .get(*id)
                            .and_then(|m| m.get(kind))
                            .map(|v| *v < version)
                            .unwrap_or(true)
                    })
                    .cloned()
                    .collect()
            };
            if missing.is_empty() {
                return missing;
            }
            tokio::select! {
                _ = self.acked_changed.notified() => {}
                _ = tokio::time::sleep_until(until) => return missing,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metasync() -> Metasync {
        Metasync::new("p1", reqwest::Client::new())
    }

    #[test]
    fn queue_keeps_only_the_latest_version() {
        let ms = metasync();
        let mut smap = Smap::default();
        smap.version = 3;
        ms.queue_smap(smap.clone(), "act-a");
        smap.version = 7;
        ms.queue_smap(smap, "act-b");

        let status = ms.status();
        assert_eq!(status.pending[Smap::KIND], 7);
    }

    #[tokio::test]
    async fn wait_synced_reports_missing_nodes() {
        let ms = metasync();
        let mut payload = MsyncPayload::default();
        let mut bmd = Bmd::new("u");
        bmd.version = 4;
        payload.bmd = Some(bmd);

        ms.record_ack("t1", &payload);
        let missing = ms
            .wait_synced(
                Bmd::KIND,
                4,
                &["t1".to_string(), "t2".to_string()],
                Duration::from_millis(20),
            )
            .await;
        assert_eq!(missing, vec!["t2".to_string()]);

        ms.record_ack("t2", &payload);
        let missing = ms
            .wait_synced(
                Bmd::KIND,
                4,
                &["t1".to_string(), "t2".to_string()],
                Duration::from_millis(20),
            )
            .await;
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn older_acks_do_not_satisfy_newer_waits() {
        let ms = metasync();
        let mut payload = MsyncPayload::default();
        let mut smap = Smap::default();
        smap.version = 2;
        payload.smap = Some(smap);
        ms.record_ack("t1", &payload);

        let missing = ms
            .wait_synced(Smap::KIND, 3, &["t1".to_string()], Duration::from_millis(20))
            .await;
        assert_eq!(missing.len(), 1);
    }
}

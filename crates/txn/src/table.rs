use crate::TxnError;
use models::ActMsg;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Tolerated difference between the primary's `unixtime` stamp and the
/// target's clock at begin; larger gaps mean the begin is stale (a
/// delayed retry of a superseded attempt) and must be rejected.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(90);

/// Txn is one in-flight transaction on a target: begun, awaiting
/// commit or abort. Never reused across attempts.
#[derive(Debug, Clone)]
pub struct Txn {
    pub uuid: String,
    pub bck_name: String,
    pub action: ActMsg,
    pub begun_at: Instant,
    pub deadline: Instant,
}

/// TxnTable is the target-side registry of begun transactions.
pub struct TxnTable {
    inner: Mutex<HashMap<String, Txn>>,
}

impl TxnTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Validate the primary's timestamp against the local clock.
    pub fn check_freshness(unixtime_ns: i64) -> Result<(), TxnError> {
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        let skew = Duration::from_nanos(now_ns.abs_diff(unixtime_ns));
        if skew > MAX_CLOCK_SKEW {
            return Err(TxnError::Stale(skew));
        }
        Ok(())
    }

    /// Record a begun transaction. Duplicate uuids are protocol errors:
    /// the coordinator never reuses an attempt.
    pub fn begin(
        &self,
        uuid: &str,
        bck_name: &str,
        action: ActMsg,
        host_timeout: Duration,
    ) -> Result<(), TxnError> {
        let mut inner = self.inner.lock().unwrap();
        Self::gc_locked(&mut inner);
        if inner.contains_key(uuid) {
            return Err(TxnError::Duplicate(uuid.to_string()));
        }
        let now = Instant::now();
        inner.insert(
            uuid.to_string(),
            Txn {
                uuid: uuid.to_string(),
                bck_name: bck_name.to_string(),
                action,
                begun_at: now,
                deadline: now + host_timeout,
            },
        );
        Ok(())
    }

    /// Take the transaction for commit; it leaves the table either way.
    pub fn commit(&self, uuid: &str) -> Result<Txn, TxnError> {
        self.inner
            .lock()
            .unwrap()
            .remove(uuid)
            .ok_or_else(|| TxnError::NotFound(uuid.to_string()))
    }

    /// Abort is idempotent: unknown uuids (already expired or never
    /// begun here) are fine.
    pub fn abort(&self, uuid: &str) -> bool {
        self.inner.lock().unwrap().remove(uuid).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn gc_locked(inner: &mut HashMap<String, Txn>) {
        let now = Instant::now();
        inner.retain(|uuid, txn| {
            let live = txn.deadline > now;
            if !live {
                tracing::warn!(uuid, action = txn.action.name(), "expiring abandoned transaction");
            }
            live
        });
    }
}

impl Default for TxnTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::DestroyBucketArgs;

    fn act() -> ActMsg {
        ActMsg::DestroyBucket(DestroyBucketArgs::default())
    }

    #[test]
    fn begin_commit_removes_the_entry() {
        let table = TxnTable::new();
        table
            .begin("u-1", "b", act(), Duration::from_secs(10))
            .unwrap();
        assert_eq!(table.len(), 1);

        let txn = table.commit("u-1").unwrap();
        assert_eq!(txn.bck_name, "b");
        assert!(table.is_empty());
        assert!(matches!(table.commit("u-1"), Err(TxnError::NotFound(_))));
    }

    #[test]
    fn duplicate_uuid_is_rejected() {
        let table = TxnTable::new();
        table.begin("u", "b", act(), Duration::from_secs(10)).unwrap();
        assert!(matches!(
            table.begin("u", "b", act(), Duration::from_secs(10)),
            Err(TxnError::Duplicate(_))
        ));
    }

    #[test]
    fn abort_is_idempotent() {
        let table = TxnTable::new();
        table.begin("u", "b", act(), Duration::from_secs(10)).unwrap();
        assert!(table.abort("u"));
        assert!(!table.abort("u"));
        assert!(!table.abort("never-begun"));
    }

    #[test]
    fn expired_entries_are_collected() {
        let table = TxnTable::new();
        table.begin("u", "b", act(), Duration::ZERO).unwrap();
        // The next begin sweeps the expired entry.
        table.begin("v", "b", act(), Duration::from_secs(10)).unwrap();
        assert!(matches!(table.commit("u"), Err(TxnError::NotFound(_))));
    }

    #[test]
    fn freshness_rejects_ancient_stamps() {
        assert!(TxnTable::check_freshness(0).is_err());
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as i64;
        assert!(TxnTable::check_freshness(now_ns).is_ok());
    }
}

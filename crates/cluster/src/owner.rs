use crate::ClusterError;
use models::Revs;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Incoming version <= local: ignored by the receiver rule.
    Ignored,
}

/// Owner holds one replicated metadata kind behind an atomic
/// pointer-swap: readers clone an `Arc` to an immutable value, writers
/// clone-mutate-bump-persist-swap under a serializing lock.
pub struct Owner<T: Revs> {
    cur: RwLock<Arc<T>>,
    /// Serializes modify() so concurrent writers cannot interleave
    /// their clone/persist/swap sequences.
    write: Mutex<()>,
    mpi: Option<Arc<volume::Mpi>>,
}

impl<T: Revs> Owner<T> {
    pub fn new(initial: T, mpi: Option<Arc<volume::Mpi>>) -> Self {
        Self {
            cur: RwLock::new(Arc::new(initial)),
            write: Mutex::new(()),
            mpi,
        }
    }

    pub fn get(&self) -> Arc<T> {
        self.cur.read().unwrap().clone()
    }

    pub fn version(&self) -> i64 {
        self.get().version()
    }

    /// Clone the current value, apply `mutate`, bump the version,
    /// persist, and publish. The mutation sees the latest value; the
    /// bump is owned here so a mutation can never skip or repeat it.
    pub fn modify<R>(
        &self,
        mutate: impl FnOnce(&mut T) -> Result<R, ClusterError>,
    ) -> Result<(Arc<T>, R), ClusterError> {
        let _guard = self.write.lock().unwrap();
        let mut next = (**self.cur.read().unwrap()).clone();
        let res = mutate(&mut next)?;
        next.bump();
        self.persist(&next)?;
        let next = Arc::new(next);
        *self.cur.write().unwrap() = next.clone();
        Ok((next, res))
    }

    /// Swap the in-memory value without bumping, persisting, or
    /// replicating. Used for transient config updates that must not
    /// survive a restart.
    pub fn apply_transient(&self, val: T) {
        let _guard = self.write.lock().unwrap();
        *self.cur.write().unwrap() = Arc::new(val);
    }

    /// Receiver path: apply only strictly newer versions; same-or-older
    /// are ignored without error (metasync retries are expected).
    pub fn apply_newer(&self, incoming: T) -> ApplyOutcome {
        let _guard = self.write.lock().unwrap();
        let local = self.cur.read().unwrap().clone();
        if incoming.version() <= local.version() {
            tracing::debug!(
                kind = T::KIND,
                incoming = incoming.version(),
                local = local.version(),
                "ignoring stale metasync revs"
            );
            return ApplyOutcome::Ignored;
        }
        if let (Some(iu), Some(lu)) = (incoming.uuid(), local.uuid()) {
            if !lu.is_empty() && iu != lu {
                tracing::error!(
                    kind = T::KIND,
                    incoming_uuid = iu,
                    local_uuid = lu,
                    "uuid mismatch; refusing to apply"
                );
                return ApplyOutcome::Ignored;
            }
        }
        if let Err(err) = self.persist(&incoming) {
            tracing::warn!(kind = T::KIND, %err, "failed to persist applied revs");
        }
        *self.cur.write().unwrap() = Arc::new(incoming);
        ApplyOutcome::Applied
    }

    fn persist(&self, val: &T) -> Result<(), ClusterError> {
        if let Some(mpi) = &self.mpi {
            volume::save_revs(&mpi.snapshot(), val)?;
        }
        Ok(())
    }

    /// Load the persisted copy (newest across mountpaths) and adopt it
    /// when newer than the in-memory value. Boot-time only.
    pub fn load_persisted(&self) -> ApplyOutcome {
        let Some(mpi) = &self.mpi else {
            return ApplyOutcome::Ignored;
        };
        match volume::load_revs::<T>(&mpi.snapshot()) {
            Some(loaded) => self.apply_newer(loaded),
            None => ApplyOutcome::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::Smap;

    #[test]
    fn modify_bumps_and_publishes() {
        let owner = Owner::new(Smap::default(), None);
        let v0 = owner.version();
        let (next, ()) = owner
            .modify(|smap| {
                smap.uuid = "u-new".to_string();
                Ok(())
            })
            .unwrap();
        assert_eq!(next.version, v0 + 1);
        assert_eq!(owner.get().uuid, "u-new");
    }

    #[test]
    fn apply_newer_enforces_the_ignore_older_rule() {
        let mut local = Smap::default();
        local.version = 5;
        let owner = Owner::new(local, None);

        let mut stale = Smap::default();
        stale.version = 5;
        assert_eq!(owner.apply_newer(stale), ApplyOutcome::Ignored);

        let mut older = Smap::default();
        older.version = 3;
        assert_eq!(owner.apply_newer(older), ApplyOutcome::Ignored);
        assert_eq!(owner.version(), 5);

        let mut newer = Smap::default();
        newer.version = 9;
        assert_eq!(owner.apply_newer(newer), ApplyOutcome::Applied);
        assert_eq!(owner.version(), 9);
    }

    #[test]
    fn uuid_mismatch_is_refused() {
        let mut local = Smap::default();
        local.uuid = "cluster-a".to_string();
        local.version = 2;
        let owner = Owner::new(local, None);

        let mut foreign = Smap::default();
        foreign.uuid = "cluster-b".to_string();
        foreign.version = 10;
        assert_eq!(owner.apply_newer(foreign), ApplyOutcome::Ignored);
        assert_eq!(owner.get().uuid, "cluster-a");
    }

    #[test]
    fn persists_through_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let mpi = Arc::new(volume::Mpi::new(true));
        mpi.attach(dir.path(), "").unwrap();

        let owner = Owner::new(Smap::default(), Some(mpi.clone()));
        owner
            .modify(|smap| {
                smap.uuid = "persisted".to_string();
                Ok(())
            })
            .unwrap();

        // A second owner booting from the same volume sees the write.
        let owner2 = Owner::new(Smap::default(), Some(mpi));
        assert_eq!(owner2.load_persisted(), ApplyOutcome::Applied);
        assert_eq!(owner2.get().uuid, "persisted");
    }
}

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// ConcurrencyAdjuster caps the extract/create worker fan-out at
/// 2 x active-target-count: enough to keep disks busy cluster-wide
/// without letting one job monopolize a node.
#[derive(Clone)]
pub struct ConcurrencyAdjuster {
    sem: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyAdjuster {
    pub fn new(active_targets: usize) -> Self {
        let limit = (2 * active_targets).max(1);
        Self {
            sem: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.sem
            .clone()
            .acquire_owned()
            .await
            .expect("adjuster semaphore closed")
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.sem.clone().try_acquire_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limit_is_twice_the_targets() {
        let adj = ConcurrencyAdjuster::new(3);
        assert_eq!(adj.limit(), 6);
        let permits: Vec<_> = (0..6).map(|_| adj.try_acquire().unwrap()).collect();
        assert!(adj.try_acquire().is_none());
        drop(permits);
        assert!(adj.try_acquire().is_some());
    }

    #[test]
    fn zero_targets_still_allows_one() {
        assert_eq!(ConcurrencyAdjuster::new(0).limit(), 1);
    }
}

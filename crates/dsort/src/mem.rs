use crate::DsortError;
use models::MemReaction;

/// MemInfo abstracts "how much free RAM is there": /proc/meminfo in
/// production, a fixed number in tests.
pub trait MemInfo: Send + Sync {
    /// Free (available) bytes.
    fn available(&self) -> u64;
}

/// Reads MemAvailable from /proc/meminfo.
pub struct ProcMemInfo;

impl MemInfo for ProcMemInfo {
    fn available(&self) -> u64 {
        let Ok(text) = std::fs::read_to_string("/proc/meminfo") else {
            return u64::MAX; // no way to tell; never flag
        };
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("MemAvailable:") {
                let kb: u64 = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse()
                    .unwrap_or(u64::MAX / 1024);
                return kb.saturating_mul(1024);
            }
        }
        u64::MAX
    }
}

/// MemEstimator projects the all-records-on-one-node working set after
/// the first extracted shard and fires the configured reaction when
/// the projection exceeds the RAM budget.
pub struct MemEstimator {
    reaction: MemReaction,
    budget: u64,
}

impl MemEstimator {
    pub fn new(reaction: MemReaction, mem_frac: f64, mem: &dyn MemInfo) -> Self {
        let avail = mem.available();
        let budget = (avail as f64 * mem_frac.clamp(0.0, 1.0)) as u64;
        Self { reaction, budget }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Project from one extracted shard: `shard_records_size` bytes of
    /// record payload out of `total_shards` input shards, all of which
    /// eventually land on the final merge holder.
    pub fn check(
        &self,
        shard_records_size: u64,
        total_shards: usize,
    ) -> Result<Option<String>, DsortError> {
        let projected = shard_records_size.saturating_mul(total_shards as u64);
        if projected <= self.budget {
            return Ok(None);
        }
        let warning = format!(
            "projected working set {projected}B exceeds the {budget}B memory budget",
            budget = self.budget
        );
        match self.reaction {
            MemReaction::Ignore => Ok(None),
            MemReaction::Warn => Ok(Some(warning)),
            MemReaction::Abort => Err(DsortError::Memory {
                projected,
                limit: self.budget,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u64);
    impl MemInfo for Fixed {
        fn available(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn within_budget_is_silent() {
        let est = MemEstimator::new(MemReaction::Abort, 1.0, &Fixed(1000));
        assert!(est.check(10, 10).unwrap().is_none());
    }

    #[test]
    fn reactions_fire_over_budget() {
        let ignore = MemEstimator::new(MemReaction::Ignore, 0.5, &Fixed(1000));
        assert!(ignore.check(100, 100).unwrap().is_none());

        let warn = MemEstimator::new(MemReaction::Warn, 0.5, &Fixed(1000));
        assert!(warn.check(100, 100).unwrap().is_some());

        let abort = MemEstimator::new(MemReaction::Abort, 0.5, &Fixed(1000));
        assert!(matches!(
            abort.check(100, 100),
            Err(DsortError::Memory { .. })
        ));
    }

    #[test]
    fn budget_honors_the_fraction() {
        let est = MemEstimator::new(MemReaction::Warn, 0.25, &Fixed(1000));
        assert_eq!(est.budget(), 250);
    }
}

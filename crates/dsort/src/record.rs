use crate::{Algorithm, AlgorithmKind, ContentKeyType};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// RecordKey is the value records are ordered by. The variants mirror
/// the declared content key types; Name and Md5 come from the member
/// itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordKey {
    Name(String),
    Md5(String),
    Int(i64),
    Float(f64),
    Str(String),
}

impl RecordKey {
    pub fn from_content(raw: &str, ty: ContentKeyType) -> Option<Self> {
        let trimmed = raw.trim();
        match ty {
            ContentKeyType::Int => trimmed.parse::<i64>().ok().map(RecordKey::Int),
            ContentKeyType::Float => trimmed.parse::<f64>().ok().map(RecordKey::Float),
            ContentKeyType::String => Some(RecordKey::Str(trimmed.to_string())),
        }
    }

    /// String form used for ekm lookups and wire transfer.
    pub fn as_lookup(&self) -> String {
        match self {
            RecordKey::Name(s) | RecordKey::Md5(s) | RecordKey::Str(s) => s.clone(),
            RecordKey::Int(v) => v.to_string(),
            RecordKey::Float(v) => v.to_string(),
        }
    }

    fn order(&self, other: &Self) -> std::cmp::Ordering {
        use RecordKey::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal),
            _ => self.as_lookup().cmp(&other.as_lookup()),
        }
    }
}

/// Record is one extracted member: its ordering key plus everything
/// needed to re-read the body at create time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    /// Member name inside its source shard.
    pub name: String,
    pub size: i64,
    /// Source shard object name.
    pub shard: String,
    /// Target holding the source shard.
    pub target_id: String,
}

/// RecordManager accumulates records during extract and orders them
/// for create. Merging (the ring phase) concatenates managers.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RecordManager {
    records: Vec<Record>,
}

impl RecordManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn merge(&mut self, other: RecordManager) {
        self.records.extend(other.records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
    pub fn total_size(&self) -> i64 {
        self.records.iter().map(|r| r.size).sum()
    }
    pub fn records(&self) -> &[Record] {
        &self.records
    }
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Order per the algorithm. `fallback_seed` seeds the shuffle when
    /// the job request left the seed empty (derived from the job id,
    /// so the whole cluster shuffles identically).
    pub fn sort(&mut self, algorithm: &Algorithm, fallback_seed: u64) {
        match algorithm.kind {
            AlgorithmKind::None => {}
            AlgorithmKind::Alphanumeric | AlgorithmKind::Md5 | AlgorithmKind::Content => {
                self.records.sort_by(|a, b| a.key.order(&b.key));
                if algorithm.decreasing {
                    self.records.reverse();
                }
            }
            AlgorithmKind::Shuffle => {
                let seed = if algorithm.seed.is_empty() {
                    fallback_seed
                } else {
                    algorithm
                        .seed
                        .parse::<u64>()
                        .unwrap_or_else(|_| xxhash_rust::xxh64::xxh64(algorithm.seed.as_bytes(), 0))
                };
                let mut rng = SmallRng::seed_from_u64(seed);
                self.records.shuffle(&mut rng);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: RecordKey, name: &str) -> Record {
        Record {
            key,
            name: name.to_string(),
            size: 1,
            shard: "s.tar".to_string(),
            target_id: "t1".to_string(),
        }
    }

    fn names(mgr: &RecordManager) -> Vec<&str> {
        mgr.records().iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn alphanumeric_orders_by_key() {
        let mut mgr = RecordManager::new();
        for n in ["b", "c", "a"] {
            mgr.insert(record(RecordKey::Name(n.to_string()), n));
        }
        let mut algo = Algorithm::default();
        mgr.sort(&algo, 0);
        assert_eq!(names(&mgr), ["a", "b", "c"]);

        algo.decreasing = true;
        mgr.sort(&algo, 0);
        assert_eq!(names(&mgr), ["c", "b", "a"]);
    }

    #[test]
    fn int_keys_sort_numerically() {
        let mut mgr = RecordManager::new();
        for v in [10i64, 2, 33] {
            mgr.insert(record(RecordKey::Int(v), &v.to_string()));
        }
        mgr.sort(
            &Algorithm {
                kind: AlgorithmKind::Content,
                ..Default::default()
            },
            0,
        );
        assert_eq!(names(&mgr), ["2", "10", "33"]);
    }

    #[test]
    fn none_preserves_insertion_order() {
        let mut mgr = RecordManager::new();
        for n in ["z", "a", "m"] {
            mgr.insert(record(RecordKey::Name(n.to_string()), n));
        }
        mgr.sort(
            &Algorithm {
                kind: AlgorithmKind::None,
                ..Default::default()
            },
            0,
        );
        assert_eq!(names(&mgr), ["z", "a", "m"]);
    }

    #[test]
    fn shuffle_is_seed_deterministic() {
        let build = || {
            let mut mgr = RecordManager::new();
            for i in 0..50 {
                let n = format!("r-{i:02}");
                mgr.insert(record(RecordKey::Name(n.clone()), &n));
            }
            mgr
        };
        let algo = Algorithm {
            kind: AlgorithmKind::Shuffle,
            seed: "42".to_string(),
            ..Default::default()
        };

        let mut a = build();
        let mut b = build();
        a.sort(&algo, 0);
        b.sort(&algo, 0);
        assert_eq!(a.records(), b.records());

        // A different seed produces a different permutation.
        let mut c = build();
        c.sort(
            &Algorithm {
                seed: "43".to_string(),
                ..algo
            },
            0,
        );
        assert_ne!(a.records(), c.records());
    }

    #[test]
    fn content_keys_parse_by_declared_type() {
        assert_eq!(
            RecordKey::from_content(" 17\n", ContentKeyType::Int),
            Some(RecordKey::Int(17))
        );
        assert_eq!(RecordKey::from_content("x", ContentKeyType::Int), None);
        assert!(matches!(
            RecordKey::from_content("3.5", ContentKeyType::Float),
            Some(RecordKey::Float(_))
        ));
    }
}

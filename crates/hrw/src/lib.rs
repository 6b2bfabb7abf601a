//! Highest-random-weight ("rendezvous") placement. Given a name and a
//! candidate set, every node in the cluster independently computes the
//! same owner; adding or removing one candidate re-homes only ~1/N of
//! all names.

use xxhash_rust::xxh64::xxh64;

/// Seed of every name digest; fixed forever, since digests are compared
/// across nodes and process restarts.
pub const SEED: u64 = 1103515245;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HrwError {
    #[error("no available mountpaths")]
    NoMountpaths,
    #[error("no active targets in the cluster map")]
    NoTargets,
}

/// 64-bit digest of a name.
pub fn digest(name: &str) -> u64 {
    xxh64(name.as_bytes(), SEED)
}

/// The avalanche function applied to `candidate.digest ^ name.digest`.
/// This is the 64-bit finalizer used to seed xoshiro256** state: every
/// input bit flips each output bit with probability ~1/2, which is what
/// makes per-candidate scores independent.
#[inline]
pub fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

/// Candidate is anything placeable-onto: a target node or a mountpath.
/// The digest must be precomputed once, at registration time.
pub trait Candidate {
    fn hrw_digest(&self) -> u64;
    /// Lexicographic tie-breaker; ties are astronomically rare but the
    /// winner must still be deterministic across nodes.
    fn hrw_id(&self) -> &str;
}

impl Candidate for models::Snode {
    fn hrw_digest(&self) -> u64 {
        digest(&self.id)
    }
    fn hrw_id(&self) -> &str {
        &self.id
    }
}

/// The owner of `name_digest` among `candidates`, or None when empty.
pub fn select<'a, C, I>(name_digest: u64, candidates: I) -> Option<&'a C>
where
    C: Candidate + 'a,
    I: IntoIterator<Item = &'a C>,
{
    let mut winner: Option<(&C, u64)> = None;
    for cand in candidates {
        let score = mix(cand.hrw_digest() ^ name_digest);
        winner = match winner {
            None => Some((cand, score)),
            Some((best, best_score)) => {
                if score > best_score || (score == best_score && cand.hrw_id() > best.hrw_id()) {
                    Some((cand, score))
                } else {
                    Some((best, best_score))
                }
            }
        };
    }
    winner.map(|(c, _)| c)
}

/// The first `k` owners of `name_digest`, by descending score. Used to
/// pick a designated target plus fallbacks.
pub fn select_top<'a, C, I>(name_digest: u64, candidates: I, k: usize) -> Vec<&'a C>
where
    C: Candidate + 'a,
    I: IntoIterator<Item = &'a C>,
{
    let mut scored: Vec<(&C, u64)> = candidates
        .into_iter()
        .map(|c| (c, mix(c.hrw_digest() ^ name_digest)))
        .collect();
    scored.sort_by(|(a, sa), (b, sb)| sb.cmp(sa).then_with(|| b.hrw_id().cmp(a.hrw_id())));
    scored.truncate(k);
    scored.into_iter().map(|(c, _)| c).collect()
}

/// The target owning object `uname` in `smap`. Maintenance and
/// decommissioning targets are excluded.
pub fn target<'a>(uname: &str, smap: &'a models::Smap) -> Result<&'a models::Snode, HrwError> {
    select(digest(uname), smap.active_targets()).ok_or(HrwError::NoTargets)
}

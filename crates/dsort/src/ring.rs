use xxhash_rust::xxh64::xxh64;

/// One merge round: (sender, receiver) pairs. Senders ship their
/// record table to their receiver and drop their copy; receivers merge
/// and survive into the next round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRound {
    pub pairs: Vec<(String, String)>,
}

/// Order targets into the pseudo-random ring: sort by
/// `xxhash64(target-id, salt)`. Every node computes the same ring from
/// the same salt (the job id), with no coordination.
pub fn target_ring(target_ids: &[String], salt: u64) -> Vec<String> {
    let mut ring: Vec<(u64, &String)> = target_ids
        .iter()
        .map(|tid| (xxh64(tid.as_bytes(), salt), tid))
        .collect();
    ring.sort();
    ring.into_iter().map(|(_, tid)| tid.clone()).collect()
}

/// The complete pairwise merge plan: in each round, the ring's
/// even-index targets send to their odd-index neighbor; rounds repeat
/// over the survivors until one target holds all records. Returns the
/// rounds and the final holder.
pub fn merge_plan(target_ids: &[String], salt: u64) -> (Vec<MergeRound>, Option<String>) {
    let mut alive = target_ring(target_ids, salt);
    let mut rounds = Vec::new();
    while alive.len() > 1 {
        let mut pairs = Vec::new();
        let mut survivors = Vec::new();
        let mut chunks = alive.chunks_exact(2);
        for pair in &mut chunks {
            // Even index sends to its odd neighbor.
            pairs.push((pair[0].clone(), pair[1].clone()));
            survivors.push(pair[1].clone());
        }
        // An odd trailing target just survives the round.
        survivors.extend(chunks.remainder().iter().cloned());
        rounds.push(MergeRound { pairs });
        alive = survivors;
    }
    (rounds, alive.into_iter().next())
}

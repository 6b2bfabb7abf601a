use crate::LsoEntry;

/// Coalesce same-named entries arriving from multiple targets (or
/// multiple replicas) into one. Inputs need not be sorted; the output
/// is sorted and duplicate-free.
///
/// Coalescing rule, applied pairwise:
///   - prefer the present entry over the absent one;
///   - keep the longest version (ties: lexicographically greater);
///   - keep the first non-empty location;
///   - status is the minimum of the two;
///   - copies is the maximum (replicas report what they can see).
pub fn merge_entries(mut entries: Vec<LsoEntry>) -> Vec<LsoEntry> {
    entries.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

    let mut out: Vec<LsoEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match out.last_mut() {
            Some(last) if last.name == entry.name && last.is_dir == entry.is_dir => {
                coalesce(last, entry);
            }
            _ => out.push(entry),
        }
    }
    out
}

/// Directories sort before files at the same name (meaningful only
/// under no-recursion, where both can occur).
fn sort_key(e: &LsoEntry) -> (&str, bool) {
    (&e.name, !e.is_dir)
}

fn coalesce(kept: &mut LsoEntry, other: LsoEntry) {
    if other.present && !kept.present {
        let location = std::mem::take(&mut kept.location);
        *kept = other;
        if kept.location.is_empty() {
            kept.location = location;
        }
        return;
    }
    if !other.present && kept.present {
        kept.status = kept.status.min(other.status);
        kept.copies = kept.copies.max(other.copies);
        return;
    }
    // Both present (or both absent): field-wise rules.
    if longer_version(&other.version, &kept.version) {
        kept.version = other.version;
        kept.size = other.size;
        kept.checksum = other.checksum;
        kept.atime_ns = other.atime_ns;
    }
    if kept.location.is_empty() {
        kept.location = other.location;
    }
    kept.status = kept.status.min(other.status);
    kept.copies = kept.copies.max(other.copies);
}

fn longer_version(candidate: &str, current: &str) -> bool {
    match candidate.len().cmp(&current.len()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Equal => candidate > current,
        std::cmp::Ordering::Less => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status;

    fn entry(name: &str, present: bool, version: &str, location: &str) -> LsoEntry {
        LsoEntry {
            name: name.to_string(),
            present,
            version: version.to_string(),
            location: location.to_string(),
            status: status::OK,
            ..Default::default()
        }
    }

    #[test]
    fn present_wins_over_absent() {
        let merged = merge_entries(vec![
            entry("k", false, "v99", ""),
            entry("k", true, "v1", "t1/mp1"),
        ]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].present);
        assert_eq!(merged[0].version, "v1");
        assert_eq!(merged[0].location, "t1/mp1");
    }

    #[test]
    fn longest_version_wins_among_present() {
        let merged = merge_entries(vec![
            entry("k", true, "v9", "t1/mp1"),
            entry("k", true, "v10", "t2/mp1"),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].version, "v10");
        // First non-empty location sticks.
        assert_eq!(merged[0].location, "t1/mp1");
    }

    #[test]
    fn status_takes_the_minimum() {
        let mut a = entry("k", true, "v1", "t1/mp1");
        a.status = status::MISPLACED;
        let b = entry("k", true, "v1", "t2/mp2");
        let merged = merge_entries(vec![a, b]);
        assert_eq!(merged[0].status, status::OK);
    }

    #[test]
    fn output_is_sorted_and_duplicate_free() {
        let merged = merge_entries(vec![
            entry("b", true, "", "t1"),
            entry("a", true, "", "t2"),
            entry("b", true, "", "t3"),
            entry("c", true, "", "t1"),
        ]);
        let names: Vec<_> = merged.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn directories_sort_before_files_at_equal_name() {
        let mut dir = entry("pfx", true, "", "");
        dir.is_dir = true;
        let file = entry("pfx", true, "", "");
        let merged = merge_entries(vec![file, dir]);
        assert_eq!(merged.len(), 2);
        assert!(merged[0].is_dir);
        assert!(!merged[1].is_dir);
    }
}

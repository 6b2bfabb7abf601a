use crate::{merge_entries, status, LsoEntry, LsoError, LsoMsg, LsoPage};
use models::Bck;
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use volume::{ContentType, MpiSnap};

/// LocalPager produces pages of the bucket's in-cluster objects: one
/// jogger thread per mountpath does an ordered, pruned filesystem walk
/// and a k-way merge assembles the page in lexicographic order.
///
/// The continuation token is simply the last served name; each page
/// walks forward from it, so a shrinking or growing page size needs no
/// walker state carried across calls.
pub struct LocalPager {
    pub bck: Bck,
    pub snap: Arc<MpiSnap>,
    /// `target-id` part of the entries' location field.
    pub self_id: String,
}

impl LocalPager {
    pub fn page(&self, msg: &LsoMsg) -> Result<LsoPage, LsoError> {
        let limit = msg.clamped_page_size();
        let mut rxs = Vec::new();
        let mut joggers = Vec::new();

        for mi in self.snap.available.iter() {
            let (tx, rx) = mpsc::sync_channel::<LsoEntry>(128);
            let jogger = Jogger {
                base: volume::bucket_dir(mi, &self.bck).join(ContentType::Obj.as_dir()),
                location: format!("{}/{}", self.self_id, mi.label),
                bck: self.bck.clone(),
                snap: self.snap.clone(),
                mi_path: mi.path.clone(),
                msg: msg.clone(),
                tx,
            };
            rxs.push(rx);
            joggers.push(std::thread::spawn(move || jogger.run()));
        }

        let page = self.merge(rxs, limit);

        // Dropped receivers unblock any jogger still sending.
        for jogger in joggers {
            let _ = jogger.join();
        }
        Ok(page)
    }

    fn merge(&self, rxs: Vec<mpsc::Receiver<LsoEntry>>, limit: usize) -> LsoPage {
        // Min-heap keyed by (name, files-after-dirs, jogger index).
        struct Head(LsoEntry, usize);
        impl PartialEq for Head {
            fn eq(&self, other: &Self) -> bool {
                self.cmp(other) == std::cmp::Ordering::Equal
            }
        }
        impl Eq for Head {}
        impl PartialOrd for Head {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Head {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                // Reversed: BinaryHeap is a max-heap.
                (&other.0.name, !other.0.is_dir, other.1)
                    .cmp(&(&self.0.name, !self.0.is_dir, self.1))
            }
        }

        let mut heap = BinaryHeap::new();
        for (idx, rx) in rxs.iter().enumerate() {
            if let Ok(entry) = rx.recv() {
                heap.push(Head(entry, idx));
            }
        }

        let mut raw: Vec<LsoEntry> = Vec::with_capacity(limit.min(4096));
        // Collect up to `limit` distinct names; duplicates (replicas on
        // other mountpaths) coalesce below, so overshoot slightly.
        let mut distinct = 0usize;
        while let Some(Head(entry, idx)) = heap.pop() {
            let is_new = raw.last().map(|last| last.name != entry.name).unwrap_or(true);
            if is_new {
                if distinct == limit {
                    break;
                }
                distinct += 1;
            }
            raw.push(entry);
            if let Ok(next) = rxs[idx].recv() {
                heap.push(Head(next, idx));
            }
        }
        drop(rxs);

        let entries = merge_entries(raw);
        let continuation_token = if distinct == limit {
            entries.last().map(|e| e.name.clone()).unwrap_or_default()
        } else {
            String::new()
        };
        LsoPage {
            entries,
            continuation_token,
        }
    }
}

struct Jogger {
    base: std::path::PathBuf,
    location: String,
    bck: Bck,
    snap: Arc<MpiSnap>,
    mi_path: std::path::PathBuf,
    msg: LsoMsg,
    tx: mpsc::SyncSender<LsoEntry>,
}

impl Jogger {
    fn run(self) {
        if self.base.is_dir() {
            let _ = self.walk(&self.base.clone(), String::new());
        }
    }

    /// Ordered DFS. Returns Err(()) when the page is full (receiver
    /// dropped) so the recursion unwinds immediately.
    fn walk(&self, dir: &Path, rel: String) -> Result<(), ()> {
        let Ok(read) = std::fs::read_dir(dir) else {
            return Ok(());
        };
        let mut children: Vec<(String, bool, std::path::PathBuf)> = read
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let is_dir = e.file_type().ok()?.is_dir();
                Some((e.file_name().to_string_lossy().into_owned(), is_dir, e.path()))
            })
            .collect();
        // Sort with a trailing '/' on directories so that the combined
        // stream of names is lexicographic ("a.b" < "a/b").
        children.sort_by(|a, b| dir_sort_key(a).cmp(&dir_sort_key(b)));

        for (name, is_dir, path) in children {
            let child_rel = if rel.is_empty() {
                name
            } else {
                format!("{rel}/{name}")
            };
            if is_dir {
                self.visit_dir(&path, child_rel)?;
            } else {
                self.visit_file(&path, child_rel)?;
            }
        }
        Ok(())
    }

    fn visit_dir(&self, path: &Path, child_rel: String) -> Result<(), ()> {
        let prefix = &self.msg.prefix;
        let subtree = format!("{child_rel}/");

        // Prune: nothing under this directory can match.
        if !prefix.is_empty() && !subtree.starts_with(prefix.as_str()) && !prefix.starts_with(&subtree)
        {
            return Ok(());
        }
        // Prune: the whole subtree sorts at or before the token.
        let token = &self.msg.continuation_token;
        if !token.is_empty() && *token > subtree && !token.starts_with(&subtree) {
            return Ok(());
        }

        if self.msg.no_recursion && child_rel.starts_with(prefix.as_str()) {
            // Directly-listed virtual directory; do not descend.
            if subtree > *token {
                let entry = LsoEntry {
                    name: subtree,
                    is_dir: true,
                    present: true,
                    ..Default::default()
                };
                self.tx.send(entry).map_err(|_| ())?;
            }
            return Ok(());
        }
        self.walk(path, child_rel)
    }

    fn visit_file(&self, path: &Path, child_rel: String) -> Result<(), ()> {
        if !child_rel.starts_with(self.msg.prefix.as_str()) {
            return Ok(());
        }
        if !self.msg.continuation_token.is_empty() && child_rel <= self.msg.continuation_token {
            return Ok(());
        }
        let Ok(meta) = std::fs::metadata(path) else {
            return Ok(());
        };

        let mut entry = LsoEntry {
            name: child_rel.clone(),
            size: meta.len() as i64,
            location: self.location.clone(),
            present: true,
            status: status::OK,
            ..Default::default()
        };

        // Replica on a non-HRW mountpath is a misplaced/extra copy.
        let uname = self.bck.make_uname(&child_rel);
        if let Ok(home) = self.snap.hrw_mountpath(&uname) {
            if home.path != self.mi_path {
                entry.status = status::MISPLACED;
            }
        }

        // Metadata enrichment is best-effort: a missing or corrupt
        // xattr degrades the entry, not the listing.
        if let Some(mi) = self.snap.get(&self.mi_path) {
            let mut lom = volume::Lom::init_at(self.bck.clone(), &child_rel, mi.clone());
            if lom.load().is_ok() {
                entry.size = lom.md.size;
                entry.checksum = lom.md.cksum_value.clone();
                entry.version = lom.md.version.clone();
                entry.atime_ns = lom.md.atime_ns;
                entry.copies = lom.num_copies() as u16;
            }
        }
        self.tx.send(entry).map_err(|_| ())?;

        // Under arch-list, a shard's members follow the shard itself
        // (still in lexicographic order: "name" < "name/member").
        if self.msg.arch_list {
            if let Ok(format) = shard::Format::from_name(&child_rel) {
                if let Ok(members) = shard::list_members(path, format) {
                    for member in members {
                        let name = format!("{child_rel}/{}", member.name);
                        if !self.msg.continuation_token.is_empty()
                            && name <= self.msg.continuation_token
                        {
                            continue;
                        }
                        let entry = LsoEntry {
                            name,
                            size: member.size as i64,
                            present: true,
                            status: status::OK,
                            ..Default::default()
                        };
                        self.tx.send(entry).map_err(|_| ())?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn dir_sort_key(child: &(String, bool, std::path::PathBuf)) -> String {
    if child.1 {
        format!("{}/", child.0)
    } else {
        child.0.clone()
    }
}

use crate::{
    AlgorithmKind, DsortError, DsortSpec, MemEstimator, Record, RecordKey, RecordManager,
};
use models::Template;
use shard::Format;
use std::io::Read;
use volume::{ContentType, MpiSnap};

/// Extract records from every input shard whose canonical replica
/// lives on this target. Shards are visited in name order; records
/// keep their shard's member order, so `algorithm: none` reproduces
/// the input order per shard.
///
/// Returns any memory-estimator warning.
pub fn extract_local(
    spec: &DsortSpec,
    snap: &MpiSnap,
    self_id: &str,
    estimator: Option<&MemEstimator>,
    mgr: &mut RecordManager,
    aborted: &dyn Fn() -> bool,
) -> Result<Option<String>, DsortError> {
    let template = Template::parse(&spec.input_template)?;
    let mut shards = Vec::new();
    for mi in snap.available.iter() {
        volume::visit_content(mi, &spec.input_bck, ContentType::Obj, &mut |name, path| {
            if !template.matches(name) {
                return;
            }
            let uname = spec.input_bck.make_uname(name);
            let home = snap
                .hrw_mountpath(&uname)
                .map(|h| h.path == mi.path)
                .unwrap_or(false);
            if home {
                shards.push((name.to_string(), path.to_path_buf()));
            }
        });
    }
    shards.sort();

    let total_shards = template.count();
    let mut warning = None;
    for (index, (shard_name, path)) in shards.iter().enumerate() {
        if aborted() {
            return Err(DsortError::Aborted("extract".into()));
        }
        let before = mgr.total_size();
        extract_shard(spec, self_id, shard_name, path, mgr)?;

        // Project the all-records-on-one-node working set after the
        // first shard.
        if index == 0 {
            if let Some(estimator) = estimator {
                let first = (mgr.total_size() - before).max(0) as u64;
                if let Some(warn) = estimator.check(first, total_shards)? {
                    tracing::warn!(%warn, "dsort memory estimate");
                    warning = Some(warn);
                }
            }
        }
    }
    Ok(warning)
}

fn extract_shard(
    spec: &DsortSpec,
    self_id: &str,
    shard_name: &str,
    path: &std::path::Path,
    mgr: &mut RecordManager,
) -> Result<(), DsortError> {
    let format = Format::from_name(shard_name)?;
    let algo = &spec.algorithm;

    match algo.kind {
        AlgorithmKind::Content => {
            // The key lives in the member carrying the configured
            // extension; its siblings (same stem) are the payload.
            let mut keyed: Vec<(String, RecordKey)> = Vec::new();
            let mut data: Vec<(String, String, i64)> = Vec::new(); // (stem, name, size)
            shard::read_members(path, format, |meta, body| {
                if meta.name.ends_with(&algo.extension) {
                    let mut raw = String::new();
                    body.take(4096).read_to_string(&mut raw).ok();
                    let stem = meta.name[..meta.name.len() - algo.extension.len()].to_string();
                    if let Some(key) = RecordKey::from_content(&raw, algo.content_key_type) {
                        keyed.push((stem, key));
                    }
                } else {
                    let stem = stem_of(&meta.name);
                    data.push((stem, meta.name.clone(), meta.size as i64));
                }
                Ok(())
            })?;
            for (stem, name, size) in data {
                let key = keyed
                    .iter()
                    .find(|(s, _)| *s == stem)
                    .map(|(_, k)| k.clone())
                    .ok_or_else(|| {
                        DsortError::Spec(format!("no {0} key member for {name}", algo.extension))
                    })?;
                mgr.insert(Record {
                    key,
                    name,
                    size,
                    shard: shard_name.to_string(),
                    target_id: self_id.to_string(),
                });
            }
        }
        _ => {
            shard::read_members(path, format, |meta, _body| {
                let key = match algo.kind {
                    AlgorithmKind::Md5 => {
                        RecordKey::Md5(format!("{:x}", md5::compute(meta.name.as_bytes())))
                    }
                    _ => RecordKey::Name(meta.name.clone()),
                };
                mgr.insert(Record {
                    key,
                    name: meta.name.clone(),
                    size: meta.size as i64,
                    shard: shard_name.to_string(),
                    target_id: self_id.to_string(),
                });
                Ok(())
            })?;
        }
    }
    Ok(())
}

fn stem_of(name: &str) -> String {
    match name.rfind('.') {
        Some(dot) => name[..dot].to_string(),
        None => name.to_string(),
    }
}

use crate::{DsortError, DsortSpec, Ekm, Record};
use models::Template;

/// One planned output shard: its name and the records it will hold, in
/// final order.
#[derive(Debug, Clone, PartialEq)]
pub struct OutShard {
    pub name: String,
    pub records: Vec<Record>,
}

/// Partition the (already ordered) records into output shards, either
/// by the external key map or by filling the output template names up
/// to `output_shard_size` each.
pub fn plan_output_shards(
    spec: &DsortSpec,
    records: Vec<Record>,
) -> Result<Vec<OutShard>, DsortError> {
    if !spec.ekm.is_empty() {
        return plan_by_ekm(&Ekm::parse(&spec.ekm)?, records);
    }
    plan_by_template(spec, records)
}

fn plan_by_ekm(ekm: &Ekm, records: Vec<Record>) -> Result<Vec<OutShard>, DsortError> {
    // Shards appear in first-reference order; records keep their
    // overall ordering within each shard.
    let mut shards: Vec<OutShard> = Vec::new();
    for record in records {
        let lookup = record.key.as_lookup();
        let shard_name = ekm
            .get(&lookup)
            .ok_or_else(|| DsortError::Spec(format!("record key {lookup:?} missing from ekm")))?
            .to_string();
        match shards.iter_mut().find(|s| s.name == shard_name) {
            Some(shard) => shard.records.push(record),
            None => shards.push(OutShard {
                name: shard_name,
                records: vec![record],
            }),
        }
    }
    Ok(shards)
}

fn plan_by_template(spec: &DsortSpec, records: Vec<Record>) -> Result<Vec<OutShard>, DsortError> {
    let template = Template::parse(&spec.output_template)?;
    let mut names = template.iter();
    let total: i64 = records.iter().map(|r| r.size).sum();
    // With no explicit cap, spread evenly over the template names.
    let cap = if spec.output_shard_size > 0 {
        spec.output_shard_size
    } else {
        let n = template.count().max(1) as i64;
        (total + n - 1) / n.max(1)
    };

    let mut shards: Vec<OutShard> = Vec::new();
    let mut current: Option<OutShard> = None;
    let mut current_size = 0i64;

    for record in records {
        let need_new = match &current {
            None => true,
            // At least one record per shard, then respect the cap.
            Some(shard) => !shard.records.is_empty() && current_size + record.size > cap,
        };
        if need_new {
            if let Some(done) = current.take() {
                shards.push(done);
            }
            let name = names.next().ok_or_else(|| {
                DsortError::Spec(format!(
                    "output template {:?} is too small for the record set",
                    spec.output_template
                ))
            })?;
            current = Some(OutShard {
                name,
                records: Vec::new(),
            });
            current_size = 0;
        }
        current_size += record.size;
        current.as_mut().map(|s| s.records.push(record));
    }
    if let Some(done) = current.take() {
        shards.push(done);
    }
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordKey;
    use models::Bck;

    fn record(name: &str, size: i64) -> Record {
        Record {
            key: RecordKey::Name(name.to_string()),
            name: name.to_string(),
            size,
            shard: "in.tar".to_string(),
            target_id: "t1".to_string(),
        }
    }

    fn spec(output_template: &str, shard_size: i64) -> DsortSpec {
        DsortSpec {
            input_bck: Bck::ais("in"),
            output_bck: Bck::ais("out"),
            input_template: "in-{0..0}.tar".to_string(),
            output_template: output_template.to_string(),
            output_shard_size: shard_size,
            ..Default::default()
        }
    }

    #[test]
    fn template_fills_by_size() {
        let records: Vec<_> = (0..6).map(|i| record(&format!("r{i}"), 10)).collect();
        let shards = plan_output_shards(&spec("o-{0..9}.tar", 20), records).unwrap();
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].name, "o-0.tar");
        assert_eq!(shards[0].records.len(), 2);
        assert_eq!(shards[2].name, "o-2.tar");
    }

    #[test]
    fn record_order_is_preserved_within_shards() {
        let records = vec![record("z", 5), record("a", 5), record("m", 5)];
        let shards = plan_output_shards(&spec("o-{0..0}.tar", 0), records.clone()).unwrap();
        assert_eq!(shards.len(), 1);
        let names: Vec<_> = shards[0].records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["z", "a", "m"]);
    }

    #[test]
    fn exhausted_template_is_an_error() {
        let records: Vec<_> = (0..5).map(|i| record(&format!("r{i}"), 100)).collect();
        let err = plan_output_shards(&spec("o-{0..1}.tar", 100), records);
        assert!(matches!(err, Err(DsortError::Spec(_))));
    }

    #[test]
    fn ekm_routes_records_by_key() {
        let mut s = spec("", 0);
        s.output_template.clear();
        s.ekm = "ra s-a.tar\nrb s-b.tar\nrc s-a.tar".to_string();
        let records = vec![record("ra", 1), record("rb", 1), record("rc", 1)];
        let shards = plan_output_shards(&s, records).unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].name, "s-a.tar");
        assert_eq!(shards[0].records.len(), 2);
        assert_eq!(shards[1].name, "s-b.tar");
    }

    #[test]
    fn unmapped_key_is_an_error() {
        let mut s = spec("", 0);
        s.output_template.clear();
        s.ekm = "known s.tar".to_string();
        let err = plan_output_shards(&s, vec![record("unknown", 1)]);
        assert!(matches!(err, Err(DsortError::Spec(_))));
    }
}

use crate::DsortError;
use models::Bck;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmKind {
    /// Order records by member name.
    Alphanumeric,
    /// Order records by the MD5 of the member name.
    Md5,
    /// Deterministic seeded shuffle.
    Shuffle,
    /// Order by a key parsed from a member with the given extension.
    Content,
    /// Keep extraction order.
    None,
}

impl Default for AlgorithmKind {
    fn default() -> Self {
        AlgorithmKind::Alphanumeric
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKeyType {
    Int,
    Float,
    String,
}

impl Default for ContentKeyType {
    fn default() -> Self {
        ContentKeyType::String
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Algorithm {
    #[serde(default)]
    pub kind: AlgorithmKind,
    #[serde(default)]
    pub decreasing: bool,
    /// Shuffle seed; an empty string seeds from the job id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub seed: String,
    /// Content algorithm: extension of the key-carrying member.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extension: String,
    #[serde(default)]
    pub content_key_type: ContentKeyType,
}

/// Ekm is the external record-key -> output-shard mapping. Accepts a
/// JSON object or `recordKey<sep>shardName` lines (whitespace or tab).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ekm(pub BTreeMap<String, String>);

impl Ekm {
    pub fn parse(raw: &str) -> Result<Self, DsortError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        if trimmed.starts_with('{') {
            let map: BTreeMap<String, String> = serde_json::from_str(trimmed)
                .map_err(|err| DsortError::Spec(format!("bad ekm json: {err}")))?;
            return Ok(Self(map));
        }
        let mut map = BTreeMap::new();
        for (lineno, line) in trimmed.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(key), Some(shard)) = (parts.next(), parts.next()) else {
                return Err(DsortError::Spec(format!("bad ekm line {}", lineno + 1)));
            };
            map.insert(key.to_string(), shard.to_string());
        }
        Ok(Self(map))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }
}

/// DsortSpec is the job request, validated before the job starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DsortSpec {
    pub input_bck: Bck,
    pub output_bck: Bck,
    /// Brace template (or plain prefix) selecting the input shards.
    pub input_template: String,
    /// Brace template naming the output shards (ignored with an ekm).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_template: String,
    /// Cap on one output shard's payload; 0 means unbounded.
    #[serde(default)]
    pub output_shard_size: i64,
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Raw external key map, when supplied.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ekm: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl DsortSpec {
    pub fn validate(&self) -> Result<(), DsortError> {
        if self.input_template.is_empty() {
            return Err(DsortError::Spec("input template is required".into()));
        }
        models::Template::parse(&self.input_template)?;
        if self.ekm.is_empty() {
            if self.output_template.is_empty() {
                return Err(DsortError::Spec(
                    "either an output template or an ekm is required".into(),
                ));
            }
            models::Template::parse(&self.output_template)?;
        } else {
            Ekm::parse(&self.ekm)?;
        }
        if self.algorithm.kind == AlgorithmKind::Content && self.algorithm.extension.is_empty() {
            return Err(DsortError::Spec(
                "content algorithm requires an extension".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> DsortSpec {
        DsortSpec {
            input_bck: Bck::ais("in"),
            output_bck: Bck::ais("out"),
            input_template: "shard-{0..9}.tar".to_string(),
            output_template: "out-{0..9}.tar".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn valid_spec_passes() {
        spec().validate().unwrap();
    }

    #[test]
    fn missing_output_is_rejected_without_ekm() {
        let mut s = spec();
        s.output_template.clear();
        assert!(s.validate().is_err());
        s.ekm = r#"{"k": "out-1.tar"}"#.to_string();
        s.validate().unwrap();
    }

    #[test]
    fn ekm_parses_both_syntaxes() {
        let json = Ekm::parse(r#"{"rec-1": "s-1.tar", "rec-2": "s-2.tar"}"#).unwrap();
        assert_eq!(json.get("rec-1"), Some("s-1.tar"));

        let lines = Ekm::parse("rec-1\ts-1.tar\nrec-2 s-2.tar\n").unwrap();
        assert_eq!(json, lines);

        assert!(Ekm::parse("only-a-key").is_err());
    }

    #[test]
    fn content_needs_extension() {
        let mut s = spec();
        s.algorithm.kind = AlgorithmKind::Content;
        assert!(s.validate().is_err());
        s.algorithm.extension = ".key".to_string();
        s.validate().unwrap();
    }
}

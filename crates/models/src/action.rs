use crate::{Bck, BckProps};
use serde::{Deserialize, Serialize};

/// ListRange selects objects by explicit list or by brace-template /
/// prefix range. Exactly one of `names` / `template` should be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListRange {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template: String,
}

impl ListRange {
    pub fn is_list(&self) -> bool {
        !self.names.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestroyBucketArgs {
    /// Keep on-disk metadata and content; only drop the BMD entry.
    #[serde(default)]
    pub keep_md: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameBucketArgs {
    pub to: Bck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyBucketRange {
    pub to: Bck,
    #[serde(default)]
    pub selection: ListRange,
    /// Object-name prefix prepended in the destination.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prepend: String,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPropsArgs {
    pub props: BckProps,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakeNCopiesArgs {
    pub copies: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EcEncodeArgs {
    pub data_slices: u8,
    pub parity_slices: u8,
    #[serde(default)]
    pub force: bool,
}

/// ActMsg is the closed set of control-plane actions. The JSON envelope
/// carries the discriminator in `action` and the typed payload in
/// `value`, so every receiver decodes exactly one payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "kebab-case")]
pub enum ActMsg {
    CreateBucket(BckProps),
    DestroyBucket(DestroyBucketArgs),
    RenameBucket(RenameBucketArgs),
    CopyBucket(CopyBucketRange),
    SetBucketProps(SetPropsArgs),
    MakeNCopies(MakeNCopiesArgs),
    EcEncode(EcEncodeArgs),
    ArchiveObjects(ArchiveArgs),
    StartMaintenance { node_id: String },
    StopMaintenance { node_id: String },
    DecommissionNode { node_id: String, rm_user_data: bool },
    Shutdown,
}

impl ActMsg {
    /// Stable wire name of the discriminator, for logs and txn tables.
    pub fn name(&self) -> &'static str {
        match self {
            ActMsg::CreateBucket(_) => "create-bucket",
            ActMsg::DestroyBucket(_) => "destroy-bucket",
            ActMsg::RenameBucket(_) => "rename-bucket",
            ActMsg::CopyBucket(_) => "copy-bucket",
            ActMsg::SetBucketProps(_) => "set-bucket-props",
            ActMsg::MakeNCopies(_) => "make-n-copies",
            ActMsg::EcEncode(_) => "ec-encode",
            ActMsg::ArchiveObjects(_) => "archive-objects",
            ActMsg::StartMaintenance { .. } => "start-maintenance",
            ActMsg::StopMaintenance { .. } => "stop-maintenance",
            ActMsg::DecommissionNode { .. } => "decommission-node",
            ActMsg::Shutdown => "shutdown",
        }
    }

    /// Whether concurrent commits of this action kind may interleave on
    /// the same destination bucket.
    pub fn allows_concurrency(&self) -> bool {
        matches!(self, ActMsg::CopyBucket(_) | ActMsg::ArchiveObjects(_))
    }
}

/// Arguments of the multi-object archive action (§ archive xaction).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveArgs {
    pub to_bck: Bck,
    /// Output shard name, extension selects the format.
    pub arch_name: String,
    #[serde(default)]
    pub selection: ListRange,
    #[serde(default)]
    pub append_if_exists: bool,
    /// Include only the last path element of each member name.
    #[serde(default)]
    pub flatten: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_discriminator() {
        let msg = ActMsg::MakeNCopies(MakeNCopiesArgs { copies: 3 });
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains(r#""action":"make-n-copies""#), "{text}");
        let back: ActMsg = serde_json::from_str(&text).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = serde_json::from_str::<ActMsg>(r#"{"action":"no-such-act","value":{}}"#);
        assert!(err.is_err());
    }
}

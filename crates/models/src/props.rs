use crate::{Bck, ModelError};
use serde::{Deserialize, Serialize};

/// Largest supported number of object replicas within a single target.
pub const MAX_COPIES: u8 = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    XxHash,
    Md5,
    Crc32c,
    Sha256,
    None,
}

impl Default for ChecksumType {
    fn default() -> Self {
        ChecksumType::XxHash
    }
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::XxHash => "xxhash",
            ChecksumType::Md5 => "md5",
            ChecksumType::Crc32c => "crc32c",
            ChecksumType::Sha256 => "sha256",
            ChecksumType::None => "none",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersioningConf {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumConf {
    #[serde(rename = "type")]
    pub ty: ChecksumType,
    #[serde(default)]
    pub validate_cold_get: bool,
    #[serde(default)]
    pub validate_warm_get: bool,
}

/// Local mirroring: N replicas of every object on distinct mountpaths
/// of its home target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorProps {
    pub enabled: bool,
    pub copies: u8,
    /// Bound on the put-copies work queue; beyond it, copy jobs are
    /// dropped (best-effort redundancy) and counted as errors.
    pub burst: usize,
}

impl Default for MirrorProps {
    fn default() -> Self {
        Self {
            enabled: false,
            copies: 2,
            burst: 512,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcConf {
    pub enabled: bool,
    pub data_slices: u8,
    pub parity_slices: u8,
    /// Objects at or below this size are replicated rather than sliced.
    pub objsize_limit: i64,
}

impl EcConf {
    /// Number of targets required to host all slices of one object.
    pub fn required_targets(&self) -> usize {
        self.data_slices as usize + self.parity_slices as usize + 1
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    Immediate,
    Delayed,
    Never,
}

impl Default for WritePolicy {
    fn default() -> Self {
        WritePolicy::Immediate
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePolicyConf {
    pub data: WritePolicy,
    pub md: WritePolicy,
}

/// AccessAttrs is the bucket permission mask.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessAttrs(pub u64);

impl AccessAttrs {
    pub const GET: u64 = 1 << 0;
    pub const HEAD: u64 = 1 << 1;
    pub const PUT: u64 = 1 << 2;
    pub const DELETE: u64 = 1 << 3;
    pub const LIST: u64 = 1 << 4;
    pub const PATCH: u64 = 1 << 5;

    pub fn all() -> Self {
        Self(Self::GET | Self::HEAD | Self::PUT | Self::DELETE | Self::LIST | Self::PATCH)
    }
    pub fn allows(&self, bit: u64) -> bool {
        self.0 & bit != 0
    }
}

impl Default for AccessAttrs {
    fn default() -> Self {
        Self::all()
    }
}

/// BckProps is the complete property set of one bucket, replicated
/// cluster-wide inside the BMD.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BckProps {
    #[serde(default)]
    pub versioning: VersioningConf,
    #[serde(default)]
    pub checksum: ChecksumConf,
    #[serde(default)]
    pub mirror: MirrorProps,
    #[serde(default)]
    pub ec: EcConf,
    #[serde(default)]
    pub access: AccessAttrs,
    #[serde(default)]
    pub write_policy: WritePolicyConf,
    /// When set, reads and writes pass through to this (remote) bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_bck: Option<Bck>,
    /// Monotonic per-bucket generation, bumped by every props update.
    #[serde(default)]
    pub bid: u64,
}

impl BckProps {
    /// Validate a full property set against the current cluster shape.
    pub fn validate(&self, active_targets: usize, avail_mountpaths: usize) -> Result<(), ModelError> {
        if self.mirror.enabled
            && (self.mirror.copies < 1 || self.mirror.copies > MAX_COPIES)
        {
            return Err(ModelError::InvalidNCopies {
                copies: self.mirror.copies,
                max: MAX_COPIES,
            });
        }
        if self.mirror.enabled && (self.mirror.copies as usize) > avail_mountpaths.max(1) {
            return Err(ModelError::InvalidNCopies {
                copies: self.mirror.copies,
                max: avail_mountpaths.max(1) as u8,
            });
        }
        if self.ec.enabled && self.ec.required_targets() > active_targets {
            return Err(ModelError::NotEnoughTargets {
                need: self.ec.required_targets(),
                have: active_targets,
            });
        }
        Ok(())
    }

    /// Validate an update of `self` to `next`. Slice counts of an
    /// already-enabled EC config are frozen unless `force`.
    pub fn validate_update(
        &self,
        next: &BckProps,
        active_targets: usize,
        avail_mountpaths: usize,
        force: bool,
    ) -> Result<(), ModelError> {
        next.validate(active_targets, avail_mountpaths)?;
        if self.ec.enabled
            && next.ec.enabled
            && !force
            && (self.ec.data_slices != next.ec.data_slices
                || self.ec.parity_slices != next.ec.parity_slices)
        {
            return Err(ModelError::EcSliceChange);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_copies_bounds() {
        let mut props = BckProps::default();
        props.mirror.enabled = true;
        props.mirror.copies = 0;
        assert!(props.validate(4, 4).is_err());

        props.mirror.copies = 2;
        assert!(props.validate(4, 4).is_ok());
        // More copies than mountpaths.
        assert!(props.validate(4, 1).is_err());
    }

    #[test]
    fn ec_needs_targets() {
        let mut props = BckProps::default();
        props.ec.enabled = true;
        props.ec.data_slices = 4;
        props.ec.parity_slices = 2;
        assert!(props.validate(6, 4).is_err());
        assert!(props.validate(7, 4).is_ok());
    }

    #[test]
    fn ec_slices_frozen_without_force() {
        let mut cur = BckProps::default();
        cur.ec.enabled = true;
        cur.ec.data_slices = 2;
        cur.ec.parity_slices = 2;

        let mut next = cur.clone();
        next.ec.data_slices = 3;
        assert!(cur.validate_update(&next, 8, 4, false).is_err());
        assert!(cur.validate_update(&next, 8, 4, true).is_ok());

        // Disabling is always allowed.
        next.ec.enabled = false;
        assert!(cur.validate_update(&next, 8, 4, false).is_ok());
    }
}

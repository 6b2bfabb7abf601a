use serde::{Deserialize, Serialize};

/// Provider is the backend behind a bucket.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ais,
    Aws,
    Gcp,
    Azure,
    Ht,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Ais => "ais",
            Provider::Aws => "aws",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
            Provider::Ht => "ht",
        }
    }

    /// Remote providers require a backend walk for full listings;
    /// ais buckets (local namespace) are fully resident.
    pub fn is_remote(&self) -> bool {
        !matches!(self, Provider::Ais)
    }
}

impl std::str::FromStr for Provider {
    type Err = crate::ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ais" => Ok(Provider::Ais),
            "aws" | "s3" => Ok(Provider::Aws),
            "gcp" | "gs" => Ok(Provider::Gcp),
            "azure" | "az" => Ok(Provider::Azure),
            "ht" => Ok(Provider::Ht),
            other => Err(crate::ModelError::InvalidProvider(other.to_string())),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ns qualifies an ais bucket that lives in an attached remote cluster:
/// `uuid` is the remote cluster's uuid, `name` an optional sub-namespace.
/// The global (all-empty) namespace is the common case.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ns {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl Ns {
    pub fn is_global(&self) -> bool {
        self.uuid.is_empty() && self.name.is_empty()
    }

    /// Renders as `@uuid#name`, eliding empty parts.
    pub fn as_dir(&self) -> String {
        if self.is_global() {
            return "@global".to_string();
        }
        format!("@{}#{}", self.uuid, self.name)
    }
}

impl std::fmt::Display for Ns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_global() {
            return Ok(());
        }
        write!(f, "@{}#{}", self.uuid, self.name)
    }
}

/// Bck names a bucket: provider + namespace + name. An ais bucket's
/// (provider, ns, name) triple is globally unique within the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bck {
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Ns::is_global")]
    pub ns: Ns,
    pub name: String,
}

impl Default for Provider {
    fn default() -> Self {
        Provider::Ais
    }
}

impl Bck {
    pub fn ais(name: impl Into<String>) -> Self {
        Self {
            provider: Provider::Ais,
            ns: Ns::default(),
            name: name.into(),
        }
    }

    pub fn new(provider: Provider, ns: Ns, name: impl Into<String>) -> Self {
        Self {
            provider,
            ns,
            name: name.into(),
        }
    }

    /// Bucket names are S3-compatible: lowercase alphanumerics plus
    /// `.`, `-`, `_`, length 1..=63, no leading dot.
    pub fn validate_name(name: &str) -> Result<(), crate::ModelError> {
        let ok = !name.is_empty()
            && name.len() <= 63
            && !name.starts_with('.')
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'_'));
        if ok {
            Ok(())
        } else {
            Err(crate::ModelError::InvalidBucketName(name.to_string()))
        }
    }

    /// Canonical unique name: the HRW hashing input and BMD map key.
    pub fn uname(&self) -> String {
        format!("{}/{}/{}", self.provider, self.ns, self.name)
    }

    /// Unique name of an object within this bucket (placement input).
    pub fn make_uname(&self, objname: &str) -> String {
        format!("{}/{}/{}/{}", self.provider, self.ns, self.name, objname)
    }

    pub fn is_ais(&self) -> bool {
        self.provider == Provider::Ais && self.ns.uuid.is_empty()
    }

    /// An ais bucket with a populated remote-cluster uuid.
    pub fn is_remote_ais(&self) -> bool {
        self.provider == Provider::Ais && !self.ns.uuid.is_empty()
    }

    pub fn is_remote(&self) -> bool {
        self.provider.is_remote() || self.is_remote_ais()
    }
}

impl std::fmt::Display for Bck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ns.is_global() {
            write!(f, "{}://{}", self.provider, self.name)
        } else {
            write!(f, "{}://{}/{}", self.provider, self.ns, self.name)
        }
    }
}

impl std::str::FromStr for Bck {
    type Err = crate::ModelError;

    /// Parses `provider://[@uuid#ns/]name`; a bare name means `ais://name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, rest) = match s.split_once("://") {
            Some((p, rest)) => (p.parse::<Provider>()?, rest),
            None => (Provider::Ais, s),
        };
        let (ns, name) = match rest.strip_prefix('@') {
            Some(tail) => {
                let (nspart, name) = tail
                    .split_once('/')
                    .ok_or_else(|| crate::ModelError::InvalidBucketName(s.to_string()))?;
                let (uuid, nsname) = nspart.split_once('#').unwrap_or((nspart, ""));
                (
                    Ns {
                        uuid: uuid.to_string(),
                        name: nsname.to_string(),
                    },
                    name,
                )
            }
            None => (Ns::default(), rest),
        };
        Self::validate_name(name)?;
        Ok(Bck {
            provider,
            ns,
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let b: Bck = "ais://nnn".parse().unwrap();
        assert!(b.is_ais());
        assert_eq!(b.to_string(), "ais://nnn");

        let b: Bck = "aws://imagenet".parse().unwrap();
        assert_eq!(b.provider, Provider::Aws);
        assert!(b.is_remote());

        let b: Bck = "ais://@1a2b#team/shared".parse().unwrap();
        assert!(b.is_remote_ais());
        assert_eq!(b.ns.uuid, "1a2b");
        assert_eq!(b.ns.name, "team");
        assert_eq!(b.name, "shared");
    }

    #[test]
    fn rejects_bad_names() {
        assert!(Bck::validate_name("").is_err());
        assert!(Bck::validate_name(".hidden").is_err());
        assert!(Bck::validate_name("UPPER").is_err());
        assert!(Bck::validate_name("with space").is_err());
        assert!(Bck::validate_name("ok-name_1.2").is_ok());
    }

    #[test]
    fn unames_are_distinct_per_provider() {
        let a = Bck::ais("b");
        let b = Bck::new(Provider::Aws, Ns::default(), "b");
        assert_ne!(a.uname(), b.uname());
        assert_ne!(a.make_uname("k"), b.make_uname("k"));
    }
}

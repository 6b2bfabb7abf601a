//! Multi-member shard codecs: tar, tar.gz, zip, and tar.lz4, with a
//! uniform write/append/read surface. Archive and dsort both build
//! their output shards through these writers.

mod read;
mod write;

pub use read::{list_members, read_members};
pub use write::{MemberMeta, ShardWriter};

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("unsupported shard extension: {0}")]
    UnknownFormat(String),
    #[error("corrupt {format} shard: {detail}")]
    Corrupt {
        format: &'static str,
        detail: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

/// Format is the closed set of supported shard encodings, selected by
/// the output name's extension.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    Tar,
    TarGz,
    Zip,
    TarLz4,
}

impl Format {
    pub fn from_name(name: &str) -> Result<Self, ShardError> {
        if name.ends_with(".tar") {
            Ok(Format::Tar)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(Format::TarGz)
        } else if name.ends_with(".zip") {
            Ok(Format::Zip)
        } else if name.ends_with(".tar.lz4") {
            Ok(Format::TarLz4)
        } else {
            Err(ShardError::UnknownFormat(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Tar => "tar",
            Format::TarGz => "tar.gz",
            Format::Zip => "zip",
            Format::TarLz4 => "tar.lz4",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_detection() {
        assert_eq!(Format::from_name("a.tar").unwrap(), Format::Tar);
        assert_eq!(Format::from_name("a.tgz").unwrap(), Format::TarGz);
        assert_eq!(Format::from_name("a.tar.gz").unwrap(), Format::TarGz);
        assert_eq!(Format::from_name("a.zip").unwrap(), Format::Zip);
        assert_eq!(Format::from_name("a.tar.lz4").unwrap(), Format::TarLz4);
        assert!(Format::from_name("a.rar").is_err());
    }
}

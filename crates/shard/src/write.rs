use crate::{Format, ShardError};
use flate2::write::GzEncoder;
use lz4_flex::frame::FrameEncoder;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// MemberMeta is the per-member header: what survives of the source
/// object inside the shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberMeta {
    pub name: String,
    pub size: u64,
    /// Seconds since the Unix epoch (tar mtime granularity).
    pub mtime: u64,
    pub uid: Option<u64>,
    pub gid: Option<u64>,
}

enum Inner {
    Tar(tar::Builder<File>),
    TarGz(tar::Builder<GzEncoder<File>>),
    Zip(zip::ZipWriter<File>),
    TarLz4(tar::Builder<FrameEncoder<File>>),
}

/// ShardWriter drives one output shard. Create (or open-for-append),
/// add members in visit order, then finalize — which flushes every
/// encoder layer before the caller renames the workfile into place.
pub struct ShardWriter {
    inner: Inner,
    members: usize,
}

impl ShardWriter {
    pub fn create(path: &Path, format: Format) -> Result<Self, ShardError> {
        let file = File::create(path)?;
        let inner = match format {
            Format::Tar => Inner::Tar(tar::Builder::new(file)),
            Format::TarGz => Inner::TarGz(tar::Builder::new(GzEncoder::new(
                file,
                flate2::Compression::default(),
            ))),
            Format::Zip => Inner::Zip(zip::ZipWriter::new(file)),
            Format::TarLz4 => Inner::TarLz4(tar::Builder::new(FrameEncoder::new(file))),
        };
        Ok(Self { inner, members: 0 })
    }

    /// Open an existing shard for appending.
    ///
    /// Plain tar seeks to the end-of-archive marker and writes new
    /// members in place. The compressed formats cannot be extended
    /// in place: existing members are copied through a fresh writer at
    /// `workpath` (zip appends natively via its central directory).
    pub fn open_append(
        path: &Path,
        format: Format,
        workpath: &Path,
        pool: &memsys::Pool,
    ) -> Result<Self, ShardError> {
        match format {
            Format::Tar => {
                let mut file = File::options().read(true).write(true).open(path)?;
                let end = tar_data_end(&mut file)?;
                file.set_len(end)?;
                file.seek(SeekFrom::Start(end))?;
                Ok(Self {
                    inner: Inner::Tar(tar::Builder::new(file)),
                    members: 0,
                })
            }
            Format::Zip => {
                let file = File::options().read(true).write(true).open(path)?;
                Ok(Self {
                    inner: Inner::Zip(zip::ZipWriter::new_append(file)?),
                    members: 0,
                })
            }
            Format::TarGz | Format::TarLz4 => {
                let mut writer = Self::create(workpath, format)?;
                crate::read_members(path, format, |meta, body| {
                    writer.append_member(&meta, body, pool)
                })?;
                writer.members = 0; // count only the new appends
                Ok(writer)
            }
        }
    }

    /// Number of members appended through this writer.
    pub fn appended(&self) -> usize {
        self.members
    }

    pub fn append_member(
        &mut self,
        meta: &MemberMeta,
        mut body: &mut dyn Read,
        pool: &memsys::Pool,
    ) -> Result<(), ShardError> {
        match &mut self.inner {
            Inner::Tar(b) => append_tar(b, meta, body)?,
            Inner::TarGz(b) => append_tar(b, meta, body)?,
            Inner::TarLz4(b) => append_tar(b, meta, body)?,
            Inner::Zip(z) => {
                let options = zip::write::FileOptions::default()
                    .compression_method(zip::CompressionMethod::Deflated);
                z.start_file(meta.name.as_str(), options)?;
                memsys::copy_buf(pool, &mut body, z, meta.size as usize)?;
            }
        }
        self.members += 1;
        Ok(())
    }

    /// Flush every layer and close. Errors here are real: a missing
    /// finalize leaves a truncated gzip/lz4 stream or a zip without a
    /// central directory.
    pub fn finalize(self) -> Result<(), ShardError> {
        match self.inner {
            Inner::Tar(b) => {
                let mut file = b.into_inner()?;
                file.flush()?;
            }
            Inner::TarGz(b) => {
                let enc = b.into_inner()?;
                let mut file = enc.finish()?;
                file.flush()?;
            }
            Inner::TarLz4(b) => {
                let enc = b.into_inner()?;
                let mut file = enc
                    .finish()
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
                file.flush()?;
            }
            Inner::Zip(mut z) => {
                let mut file = z.finish()?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

fn append_tar<W: Write>(
    builder: &mut tar::Builder<W>,
    meta: &MemberMeta,
    body: &mut dyn Read,
) -> Result<(), ShardError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(meta.size);
    header.set_mtime(meta.mtime);
    header.set_mode(0o644);
    if let Some(uid) = meta.uid {
        header.set_uid(uid);
    }
    if let Some(gid) = meta.gid {
        header.set_gid(gid);
    }
    builder.append_data(&mut header, meta.name.as_str(), body)?;
    Ok(())
}

/// Offset of the tar end-of-archive marker (two zero blocks): walk the
/// headers, skipping each member's (512-padded) body.
fn tar_data_end(file: &mut File) -> Result<u64, ShardError> {
    const BLOCK: u64 = 512;
    let mut pos = 0u64;
    let mut block = [0u8; 512];
    loop {
        file.seek(SeekFrom::Start(pos))?;
        let n = read_full(file, &mut block)?;
        if n < 512 || block.iter().all(|b| *b == 0) {
            return Ok(pos);
        }
        let size = octal_size(&block[124..136]).ok_or_else(|| ShardError::Corrupt {
            format: "tar",
            detail: format!("bad size field at offset {pos}"),
        })?;
        let padded = (size + BLOCK - 1) / BLOCK * BLOCK;
        pos += BLOCK + padded;
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn octal_size(field: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(field).ok()?;
    let trimmed = text.trim_matches(|c: char| c == '\0' || c == ' ');
    u64::from_str_radix(trimmed, 8).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_shard(dir: &Path, name: &str, members: &[(&str, &[u8])]) -> std::path::PathBuf {
        let format = Format::from_name(name).unwrap();
        let path = dir.join(name);
        let pool = memsys::Pool::new();
        let mut writer = ShardWriter::create(&path, format).unwrap();
        for (mname, body) in members {
            let meta = MemberMeta {
                name: mname.to_string(),
                size: body.len() as u64,
                mtime: 1_700_000_000,
                uid: None,
                gid: None,
            };
            writer.append_member(&meta, &mut Cursor::new(body), &pool).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn all_formats_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["s.tar", "s.tgz", "s.zip", "s.tar.lz4"] {
            let members: &[(&str, &[u8])] = &[("a", b"alpha"), ("b/c", b"nested body")];
            let path = write_shard(dir.path(), name, members);
            let format = Format::from_name(name).unwrap();

            let mut got = Vec::new();
            crate::read_members(&path, format, |meta, body| {
                let mut content = Vec::new();
                body.read_to_end(&mut content)?;
                got.push((meta.name, content));
                Ok(())
            })
            .unwrap();
            assert_eq!(
                got,
                vec![
                    ("a".to_string(), b"alpha".to_vec()),
                    ("b/c".to_string(), b"nested body".to_vec())
                ],
                "{name}"
            );
        }
    }

    #[test]
    fn members_preserve_visit_order() {
        let dir = tempfile::tempdir().unwrap();
        let members: &[(&str, &[u8])] = &[("z", b"1"), ("a", b"2"), ("m", b"3")];
        let path = write_shard(dir.path(), "ordered.tar", members);
        let listed = crate::list_members(&path, Format::Tar).unwrap();
        let names: Vec<_> = listed.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["z", "a", "m"]);
    }

    #[test]
    fn tar_append_extends_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shard(dir.path(), "grow.tar", &[("one", b"first")]);
        let pool = memsys::Pool::new();

        let mut writer =
            ShardWriter::open_append(&path, Format::Tar, &dir.path().join("unused"), &pool).unwrap();
        writer
            .append_member(
                &MemberMeta {
                    name: "two".into(),
                    size: 6,
                    mtime: 0,
                    uid: None,
                    gid: None,
                },
                &mut Cursor::new(b"second"),
                &pool,
            )
            .unwrap();
        assert_eq!(writer.appended(), 1);
        writer.finalize().unwrap();

        let listed = crate::list_members(&path, Format::Tar).unwrap();
        let names: Vec<_> = listed.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["one", "two"]);
    }

    #[test]
    fn append_with_zero_members_leaves_tar_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shard(dir.path(), "same.tar", &[("only", b"payload")]);
        let before = std::fs::read(&path).unwrap();
        let pool = memsys::Pool::new();

        let writer =
            ShardWriter::open_append(&path, Format::Tar, &dir.path().join("unused"), &pool).unwrap();
        assert_eq!(writer.appended(), 0);
        writer.finalize().unwrap();

        let after = std::fs::read(&path).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn tgz_append_copies_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shard(dir.path(), "grow.tgz", &[("one", b"first")]);
        let work = dir.path().join("grow.tgz.work");
        let pool = memsys::Pool::new();

        let mut writer = ShardWriter::open_append(&path, Format::TarGz, &work, &pool).unwrap();
        writer
            .append_member(
                &MemberMeta {
                    name: "two".into(),
                    size: 6,
                    mtime: 0,
                    uid: None,
                    gid: None,
                },
                &mut Cursor::new(b"second"),
                &pool,
            )
            .unwrap();
        writer.finalize().unwrap();
        std::fs::rename(&work, &path).unwrap();

        let listed = crate::list_members(&path, Format::TarGz).unwrap();
        let names: Vec<_> = listed.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["one", "two"]);
    }

    #[test]
    fn zip_append_uses_the_central_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shard(dir.path(), "grow.zip", &[("one", b"first")]);
        let pool = memsys::Pool::new();

        let mut writer =
            ShardWriter::open_append(&path, Format::Zip, &dir.path().join("unused"), &pool).unwrap();
        writer
            .append_member(
                &MemberMeta {
                    name: "two".into(),
                    size: 6,
                    mtime: 0,
                    uid: None,
                    gid: None,
                },
                &mut Cursor::new(b"second"),
                &pool,
            )
            .unwrap();
        writer.finalize().unwrap();

        let listed = crate::list_members(&path, Format::Zip).unwrap();
        assert_eq!(listed.len(), 2);
    }
}

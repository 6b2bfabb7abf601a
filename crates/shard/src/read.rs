use crate::{Format, MemberMeta, ShardError};
use flate2::read::GzDecoder;
use lz4_flex::frame::FrameDecoder;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Visit every member of a shard in stored order. The callback gets
/// the member's metadata and a reader over its body.
pub fn read_members(
    path: &Path,
    format: Format,
    mut visit: impl FnMut(MemberMeta, &mut dyn Read) -> Result<(), ShardError>,
) -> Result<(), ShardError> {
    match format {
        Format::Tar => {
            let file = File::open(path)?;
            visit_tar(tar::Archive::new(file), &mut visit)
        }
        Format::TarGz => {
            let file = File::open(path)?;
            visit_tar(tar::Archive::new(GzDecoder::new(file)), &mut visit)
        }
        Format::TarLz4 => {
            let file = File::open(path)?;
            visit_tar(tar::Archive::new(FrameDecoder::new(file)), &mut visit)
        }
        Format::Zip => {
            let file = File::open(path)?;
            let mut archive = zip::ZipArchive::new(file)?;
            for index in 0..archive.len() {
                let mut member = archive.by_index(index)?;
                if member.is_dir() {
                    continue;
                }
                let meta = MemberMeta {
                    name: member.name().to_string(),
                    size: member.size(),
                    mtime: 0,
                    uid: None,
                    gid: None,
                };
                visit(meta, &mut member)?;
            }
            Ok(())
        }
    }
}

fn visit_tar<R: Read>(
    mut archive: tar::Archive<R>,
    visit: &mut impl FnMut(MemberMeta, &mut dyn Read) -> Result<(), ShardError>,
) -> Result<(), ShardError> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let meta = MemberMeta {
            name: entry.path()?.to_string_lossy().into_owned(),
            size: entry.header().size()?,
            mtime: entry.header().mtime().unwrap_or(0),
            uid: entry.header().uid().ok(),
            gid: entry.header().gid().ok(),
        };
        visit(meta, &mut entry)?;
    }
    Ok(())
}

/// Member metadata only, bodies skipped.
pub fn list_members(path: &Path, format: Format) -> Result<Vec<MemberMeta>, ShardError> {
    let mut out = Vec::new();
    read_members(path, format, |meta, _body| {
        out.push(meta);
        Ok(())
    })?;
    Ok(out)
}

use models::ChecksumType;
use std::sync::Arc;
use volume::{Lom, MpiSnap, VolumeError};

/// Write one inbound object (streamed by a peer target) to its local
/// HRW location, metadata included. Shared by rebalance, copy-bucket,
/// and dsort shard delivery.
pub fn write_object(
    snap: &MpiSnap,
    hdr: &transport::ObjHdr,
    body: &[u8],
) -> Result<(), VolumeError> {
    let mut lom = Lom::init(hdr.bck.clone(), &hdr.objname, snap)?;
    if let Some(parent) = lom.fqn.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let work = volume::workfile(&lom.mi, &hdr.bck, &hdr.objname, "recv");
    if let Some(parent) = work.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&work, body)?;
    std::fs::rename(&work, &lom.fqn)?;

    lom.md.size = if hdr.size > 0 { hdr.size } else { body.len() as i64 };
    lom.md.atime_ns = hdr.atime_ns;
    if !hdr.cksum_type.is_empty() {
        lom.md.cksum_type = match hdr.cksum_type.as_str() {
            "md5" => ChecksumType::Md5,
            "crc32c" => ChecksumType::Crc32c,
            "sha256" => ChecksumType::Sha256,
            "none" => ChecksumType::None,
            _ => ChecksumType::XxHash,
        };
        lom.md.cksum_value = hdr.cksum_value.clone();
    }
    lom.persist_now()?;
    Ok(())
}

/// ObjWriter is the standing receive handler of object streams: every
/// inbound item becomes a local object.
pub struct ObjWriter {
    pub snap: Arc<MpiSnap>,
}

#[async_trait::async_trait]
impl transport::RecvHandler for ObjWriter {
    async fn recv(
        &self,
        _from_node: &str,
        hdr: transport::ObjHdr,
        body: transport::BodyStream,
    ) -> Result<(), transport::TransportError> {
        let snap = self.snap.clone();
        let res = tokio::task::spawn_blocking(move || write_object(&snap, &hdr, &body))
            .await
            .map_err(|err| {
                transport::TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    err.to_string(),
                ))
            })?;
        res.map_err(|err| {
            transport::TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::Bck;

    #[tokio::test]
    async fn inbound_objects_land_at_their_hrw_home() {
        let dirs: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
        let mpi = volume::Mpi::new(true);
        for d in &dirs {
            mpi.attach(d.path(), "").unwrap();
        }
        let snap = mpi.snapshot();

        let hdr = transport::ObjHdr {
            bck: Bck::ais("b"),
            objname: "streamed".to_string(),
            size: 5,
            atime_ns: 123,
            cksum_type: "xxhash".to_string(),
            cksum_value: "abc".to_string(),
            opaque: Vec::new(),
        };
        write_object(&snap, &hdr, b"hello").unwrap();

        let mut lom = Lom::init(Bck::ais("b"), "streamed", &snap).unwrap();
        lom.load().unwrap();
        assert_eq!(lom.md.size, 5);
        assert_eq!(lom.md.cksum_value, "abc");
        assert_eq!(std::fs::read(&lom.fqn).unwrap(), b"hello");
    }
}

//! Persisted form of a [`LocalNode`].
//!
//! ```text
//! i64   size, or -type for folders
//! u64   fsid (0: none)
//! u32   parent record id (0: sync root)
//! [6]   bound node handle (all ones: unbound)
//! str16 name
//! [16]  checksum      \ files only
//! u8+.. compact mtime /
//! ```

use bytes::BufMut;

use super::local_node::LocalNode;
use crate::codec::{put_compact_i64, put_str16, CodecError, RecordReader};
use crate::fingerprint::{FileFingerprint, CRC_SIZE};
use crate::types::{size_or_type, split_size_or_type, Fsid, NodeHandle, NodeType};

/// Decoded local node record, before it is attached to a tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRecord {
    pub node_type: NodeType,
    pub size: i64,
    pub fsid: Option<Fsid>,
    pub parent_db_id: u32,
    pub node: Option<NodeHandle>,
    pub name: String,
    pub fingerprint: Option<FileFingerprint>,
}

impl LocalNode {
    pub fn serialize(
        &self,
        parent_db_id: u32,
        node: Option<NodeHandle>,
    ) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(48 + self.name.len());
        buf.put_i64_le(size_or_type(self.node_type, self.size));
        buf.put_u64_le(self.fsid.map(|f| f.0).unwrap_or(0));
        buf.put_u32_le(parent_db_id);
        buf.put_slice(&node.unwrap_or(NodeHandle::UNDEF).to_bytes());
        put_str16(&mut buf, self.name.as_bytes())?;
        if self.is_file() {
            buf.put_slice(&self.fingerprint.crc);
            put_compact_i64(&mut buf, self.fingerprint.mtime);
        }
        Ok(buf)
    }
}

impl LocalRecord {
    pub fn deserialize(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = RecordReader::new(data);
        let (node_type, size) = split_size_or_type(reader.i64()?)
            .filter(|(t, _)| matches!(t, NodeType::File | NodeType::Folder))
            .ok_or_else(|| CodecError::Invalid("local node type".to_string()))?;
        let fsid = match reader.u64()? {
            0 => None,
            value => Some(Fsid(value)),
        };
        let parent_db_id = reader.u32()?;
        let node = NodeHandle::from_record(reader.array::<6>()?);
        let name = String::from_utf8(reader.str16()?.to_vec())
            .map_err(|_| CodecError::Invalid("local name".to_string()))?;
        let fingerprint = if node_type.is_file() {
            let crc = reader.array::<CRC_SIZE>()?;
            let mtime = reader.compact_i64()?;
            Some(FileFingerprint::new(size, mtime, crc))
        } else {
            None
        };
        reader.finish()?;
        Ok(Self {
            node_type,
            size,
            fsid,
            parent_db_id,
            node,
            name,
            fingerprint,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{LocalId, SyncId};

    #[test]
    fn test_file_record() {
        let mut node = LocalNode::new(
            LocalId::new(SyncId(1), 4),
            Some(LocalId::new(SyncId(1), 1)),
            NodeType::File,
            "report.txt".to_string(),
        );
        node.size = 1234;
        node.fsid = Some(Fsid(77));
        node.fingerprint = FileFingerprint::new(1234, 1_650_000_000, [5u8; CRC_SIZE]);

        let bytes = node
            .serialize(3, Some(NodeHandle::from_u64(0xabc)))
            .unwrap();
        let record = LocalRecord::deserialize(&bytes).unwrap();
        assert_eq!(record.node_type, NodeType::File);
        assert_eq!(record.size, 1234);
        assert_eq!(record.fsid, Some(Fsid(77)));
        assert_eq!(record.parent_db_id, 3);
        assert_eq!(record.node, Some(NodeHandle::from_u64(0xabc)));
        assert_eq!(record.name, "report.txt");
        assert_eq!(record.fingerprint, Some(node.fingerprint));
    }

    #[test]
    fn test_folder_record_has_no_fingerprint() {
        let node = LocalNode::new(
            LocalId::new(SyncId(1), 1),
            None,
            NodeType::Folder,
            "root".to_string(),
        );
        let bytes = node.serialize(0, None).unwrap();
        // size tag, fsid, parent, handle, name
        assert_eq!(bytes.len(), 8 + 8 + 4 + 6 + 2 + 4);
        let record = LocalRecord::deserialize(&bytes).unwrap();
        assert_eq!(record.node, None);
        assert_eq!(record.fsid, None);
        assert_eq!(record.fingerprint, None);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let node = LocalNode::new(
            LocalId::new(SyncId(1), 1),
            None,
            NodeType::Folder,
            "x".to_string(),
        );
        let mut bytes = node.serialize(0, None).unwrap();
        bytes.extend_from_slice(&[1, 2]);
        assert_eq!(
            LocalRecord::deserialize(&bytes),
            Err(CodecError::TrailingBytes(2))
        );
    }
}

//! Persisted form of a [`Node`].
//!
//! ```text
//! i64   size, or -type for anything but files
//! [6]   handle
//! [6]   parent handle (all ones: none)
//! [8]   owner
//! i64   mtime
//! i64   ctime
//! [..]  key bytes (32 file, 16 folder, none for roots)
//! str16 file attribute descriptor (files only)
//! [8]   reserved, zero
//! i16   share count (-1: incoming share)
//! [16]  share key, then share records, when the count is not zero
//! attrs (u8 name len, name, u16 value len, value)*, 0
//! ```

use bytes::BufMut;

use super::node::{KeyState, Node, NodeAttributes};
use super::GraphError;
use crate::codec::{put_str16, CodecError, RecordReader};
use crate::crypto::{node_key_size, AttrMap, SymmKey, SYMM_KEY_SIZE};
use crate::transport::ShareRecord;
use crate::types::{size_or_type, split_size_or_type, NodeHandle, UserHandle};

const RESERVED_SIZE: usize = 8;

fn put_share_record(buf: &mut Vec<u8>, record: &ShareRecord) {
    buf.put_slice(&record.user.to_bytes());
    buf.put_i8(record.access);
    buf.put_i64_le(record.timestamp);
}

fn read_share_record(reader: &mut RecordReader<'_>) -> Result<ShareRecord, CodecError> {
    Ok(ShareRecord {
        user: UserHandle::from(reader.array::<8>()?),
        access: reader.u8()? as i8,
        timestamp: reader.i64()?,
    })
}

impl Node {
    /// Encode for the state cache.
    ///
    /// Refused while the key is pending or the attributes are still
    /// encrypted: a cached record must be usable without a round trip.
    pub fn serialize(&self) -> Result<Vec<u8>, GraphError> {
        let key_size = node_key_size(self.node_type);
        let key: &[u8] = match &self.key {
            KeyState::Ready(key) if key.len() == key_size => key,
            KeyState::None if key_size == 0 => &[],
            _ => return Err(GraphError::KeyUnavailable(self.handle)),
        };
        let attrs = match &self.attributes {
            NodeAttributes::Decrypted(attrs) => attrs,
            _ => return Err(GraphError::KeyUnavailable(self.handle)),
        };

        let mut buf = Vec::with_capacity(128);
        buf.put_i64_le(size_or_type(self.node_type, self.size));
        buf.put_slice(&self.handle.to_bytes());
        buf.put_slice(&self.parent.unwrap_or(NodeHandle::UNDEF).to_bytes());
        buf.put_slice(&self.owner.to_bytes());
        buf.put_i64_le(self.mtime);
        buf.put_i64_le(self.ctime);
        buf.put_slice(key);
        if self.node_type.is_file() {
            put_str16(&mut buf, self.file_attributes.as_bytes())?;
        }
        buf.put_bytes(0, RESERVED_SIZE);

        match (&self.share_key, &self.inshare) {
            (Some(share_key), Some(inshare)) => {
                buf.put_i16_le(-1);
                buf.put_slice(share_key.bytes());
                put_share_record(&mut buf, inshare);
            }
            (Some(share_key), None) if !self.outshares.is_empty() => {
                let count = i16::try_from(self.outshares.len())
                    .map_err(|_| CodecError::Invalid("too many shares".to_string()))?;
                buf.put_i16_le(count);
                buf.put_slice(share_key.bytes());
                for record in &self.outshares {
                    put_share_record(&mut buf, record);
                }
            }
            _ => buf.put_i16_le(0),
        }

        for (name, value) in attrs {
            let name_len = u8::try_from(name.len())
                .ok()
                .filter(|len| *len > 0)
                .ok_or_else(|| CodecError::Invalid(format!("attribute name {:?}", name)))?;
            buf.put_u8(name_len);
            buf.put_slice(name.as_bytes());
            put_str16(&mut buf, value.as_bytes())?;
        }
        buf.put_u8(0);
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Node, GraphError> {
        let mut reader = RecordReader::new(data);
        let (node_type, size) = split_size_or_type(reader.i64()?)
            .ok_or_else(|| CodecError::Invalid("unknown node type".to_string()))?;
        let handle = NodeHandle::from(reader.array::<6>()?);
        let parent = NodeHandle::from_record(reader.array::<6>()?);
        let mut node = Node::new(handle, parent, node_type);
        node.size = size;
        node.owner = UserHandle::from(reader.array::<8>()?);
        node.mtime = reader.i64()?;
        node.ctime = reader.i64()?;

        let key_size = node_key_size(node_type);
        node.key = if key_size == 0 {
            KeyState::None
        } else {
            KeyState::Ready(reader.bytes(key_size)?.to_vec())
        };
        if node_type.is_file() {
            node.file_attributes = String::from_utf8(reader.str16()?.to_vec())
                .map_err(|_| CodecError::Invalid("file attribute descriptor".to_string()))?;
        }
        reader.bytes(RESERVED_SIZE)?;

        let share_count = reader.i16()?;
        if share_count != 0 {
            let share_key = SymmKey::try_from(reader.bytes(SYMM_KEY_SIZE)?)?;
            node.share_key = Some(share_key);
            if share_count < 0 {
                node.inshare = Some(read_share_record(&mut reader)?);
            } else {
                for _ in 0..share_count {
                    node.outshares.push(read_share_record(&mut reader)?);
                }
            }
        }

        let mut attrs = AttrMap::new();
        loop {
            let name_len = reader.u8()? as usize;
            if name_len == 0 {
                break;
            }
            let name = String::from_utf8(reader.bytes(name_len)?.to_vec())
                .map_err(|_| CodecError::Invalid("attribute name".to_string()))?;
            let value = String::from_utf8(reader.str16()?.to_vec())
                .map_err(|_| CodecError::Invalid("attribute value".to_string()))?;
            attrs.insert(name, value);
        }
        node.attributes = NodeAttributes::Decrypted(attrs);
        reader.finish()?;
        Ok(node)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node_graph::node::ATTR_NAME;
    use crate::types::NodeType;

    fn shared_folder() -> Node {
        let mut node = Node::new(
            NodeHandle::from_u64(10),
            Some(NodeHandle::from_u64(1)),
            NodeType::Folder,
        );
        node.owner = UserHandle::from_u64(99);
        node.mtime = 1_700_000_000;
        node.ctime = 1_700_000_100;
        node.key = KeyState::Ready(vec![4u8; 16]);
        let mut attrs = AttrMap::new();
        attrs.insert(ATTR_NAME.to_string(), "Projects".to_string());
        node.attributes = NodeAttributes::Decrypted(attrs);
        node.share_key = Some(SymmKey::from([2u8; 16]));
        node.outshares = vec![ShareRecord {
            user: UserHandle::from_u64(5),
            access: 1,
            timestamp: 42,
        }];
        node
    }

    #[test]
    fn test_record_preserves_shares() {
        let node = shared_folder();
        let decoded = Node::deserialize(&node.serialize().unwrap()).unwrap();
        assert_eq!(decoded.handle, node.handle);
        assert_eq!(decoded.parent, node.parent);
        assert_eq!(decoded.owner, node.owner);
        assert_eq!((decoded.mtime, decoded.ctime), (node.mtime, node.ctime));
        assert_eq!(decoded.key, node.key);
        assert_eq!(decoded.outshares, node.outshares);
        assert_eq!(decoded.share_key, node.share_key);
        assert_eq!(decoded.name(), Some("Projects"));
    }

    #[test]
    fn test_pending_key_is_not_serialized() {
        let mut node = shared_folder();
        node.key = KeyState::Pending(Vec::new());
        assert!(matches!(
            node.serialize(),
            Err(GraphError::KeyUnavailable(_))
        ));
    }

    #[test]
    fn test_trailing_and_short_records_rejected() {
        let mut bytes = shared_folder().serialize().unwrap();
        bytes.push(0);
        assert!(matches!(
            Node::deserialize(&bytes),
            Err(GraphError::Codec(CodecError::TrailingBytes(1)))
        ));
        bytes.truncate(20);
        assert!(matches!(
            Node::deserialize(&bytes),
            Err(GraphError::Codec(CodecError::Truncated { .. }))
        ));
    }
}

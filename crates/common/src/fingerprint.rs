use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::codec::{compact_i64_bytes, compact_i64_from};
use crate::fs::{FileHandle, FsError};

/// Number of checksum bytes kept in a fingerprint
pub const CRC_SIZE: usize = 16;
/// Read granularity when hashing file content
const READ_BLOCK: usize = 64 * 1024;

/// Content identity of a file: size, modification time and checksum.
///
/// Two fingerprints compare equal when all three components match, which is
/// what lets the engine treat files as identical without moving bytes.
/// `valid` records whether the checksum was actually computed (as opposed to
/// derived from key material) and takes no part in comparisons.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub size: i64,
    pub mtime: i64,
    pub crc: [u8; CRC_SIZE],
    pub valid: bool,
}

impl PartialEq for FileFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.mtime == other.mtime && self.crc == other.crc
    }
}

impl Eq for FileFingerprint {}

impl Hash for FileFingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.size.hash(state);
        self.mtime.hash(state);
        self.crc.hash(state);
    }
}

impl PartialOrd for FileFingerprint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileFingerprint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.size
            .cmp(&other.size)
            .then(self.mtime.cmp(&other.mtime))
            .then(self.crc.cmp(&other.crc))
    }
}

impl FileFingerprint {
    pub fn new(size: i64, mtime: i64, crc: [u8; CRC_SIZE]) -> Self {
        Self {
            size,
            mtime,
            crc,
            valid: true,
        }
    }

    /// Checksum of in-memory content
    pub fn checksum(data: &[u8]) -> [u8; CRC_SIZE] {
        let hash = blake3::hash(data);
        let mut crc = [0u8; CRC_SIZE];
        crc.copy_from_slice(&hash.as_bytes()[..CRC_SIZE]);
        crc
    }

    pub fn from_content(data: &[u8], mtime: i64) -> Self {
        Self::new(data.len() as i64, mtime, Self::checksum(data))
    }

    /// Hash an open file
    pub fn generate(file: &mut dyn FileHandle) -> Result<Self, FsError> {
        let size = file.size();
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; READ_BLOCK];
        let mut pos: u64 = 0;
        while (pos as i64) < size {
            let n = file.read_at(pos, &mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            pos += n as u64;
        }
        let mut crc = [0u8; CRC_SIZE];
        crc.copy_from_slice(&hasher.finalize().as_bytes()[..CRC_SIZE]);
        Ok(Self::new(pos as i64, file.mtime(), crc))
    }

    /// Recompute from `file`, returning whether anything changed
    pub fn refresh(&mut self, file: &mut dyn FileHandle) -> Result<bool, FsError> {
        let fresh = Self::generate(file)?;
        let changed = !self.valid || fresh != *self;
        *self = fresh;
        Ok(changed)
    }

    /// Encode as the `c` node attribute (size travels separately)
    pub fn to_attribute(&self) -> String {
        let mut out = hex::encode(self.crc);
        out.push_str(&hex::encode(compact_i64_bytes(self.mtime)));
        out
    }

    pub fn from_attribute(value: &str, size: i64) -> Option<Self> {
        if value.len() <= CRC_SIZE * 2 {
            return None;
        }
        let mut crc = [0u8; CRC_SIZE];
        hex::decode_to_slice(&value[..CRC_SIZE * 2], &mut crc).ok()?;
        let mtime_bytes = hex::decode(&value[CRC_SIZE * 2..]).ok()?;
        let mtime = compact_i64_from(&mtime_bytes).ok()?;
        Some(Self::new(size, mtime, crc))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_attribute_encoding() {
        let fp = FileFingerprint::from_content(b"quarterly numbers", 1_700_000_123);
        let attr = fp.to_attribute();
        let parsed = FileFingerprint::from_attribute(&attr, fp.size).unwrap();
        assert_eq!(parsed, fp);
        assert!(parsed.valid);
    }

    #[test]
    fn test_garbage_attribute_is_rejected() {
        assert!(FileFingerprint::from_attribute("zz", 3).is_none());
        assert!(FileFingerprint::from_attribute(&"g".repeat(40), 3).is_none());
    }

    #[test]
    fn test_ordering_ignores_validity() {
        let a = FileFingerprint::from_content(b"a", 5);
        let mut b = a;
        b.valid = false;
        assert_eq!(a, b);

        let bigger = FileFingerprint::from_content(b"ab", 1);
        assert!(a < bigger);
    }
}

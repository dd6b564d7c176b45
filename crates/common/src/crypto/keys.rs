use serde::{Deserialize, Serialize};

use super::cipher::{random_bytes, CryptoError, SymmKey, SYMM_KEY_SIZE};
use super::share::Identity;
use crate::types::{NodeType, UserHandle};

/// Size of a file node key in bytes
pub const FILE_KEY_SIZE: usize = 32;
/// Size of a folder node key in bytes
pub const FOLDER_KEY_SIZE: usize = 16;

/// Expected key length for a node type; root types carry no key
pub fn node_key_size(node_type: NodeType) -> usize {
    match node_type {
        NodeType::File => FILE_KEY_SIZE,
        NodeType::Folder => FOLDER_KEY_SIZE,
        _ => 0,
    }
}

/// Key used for a node's attribute blob.
///
/// File keys fold their two halves together, which recovers the AES key.
pub fn attribute_key(node_key: &[u8]) -> Result<SymmKey, CryptoError> {
    match node_key.len() {
        FILE_KEY_SIZE => {
            let mut folded = [0u8; SYMM_KEY_SIZE];
            for (i, b) in folded.iter_mut().enumerate() {
                *b = node_key[i] ^ node_key[i + SYMM_KEY_SIZE];
            }
            Ok(folded.into())
        }
        FOLDER_KEY_SIZE => SymmKey::try_from(node_key),
        n => Err(CryptoError::KeyLength(n)),
    }
}

/// Content key material of a file.
///
/// Packed into 32 bytes as `(aes ^ tail) || tail` where `tail` is the CTR
/// nonce followed by the meta-MAC, both big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileKey {
    pub aes: [u8; SYMM_KEY_SIZE],
    pub nonce: u64,
    pub meta_mac: u64,
}

impl FileKey {
    /// Fresh key and nonce for an upload; the meta-MAC is filled in on completion
    pub fn generate() -> Result<Self, CryptoError> {
        let mut aes = [0u8; SYMM_KEY_SIZE];
        random_bytes(&mut aes)?;
        let mut nonce = [0u8; 8];
        random_bytes(&mut nonce)?;
        Ok(Self {
            aes,
            nonce: u64::from_be_bytes(nonce),
            meta_mac: 0,
        })
    }

    pub fn cipher(&self) -> SymmKey {
        SymmKey::from(self.aes)
    }

    pub fn to_bytes(&self) -> [u8; FILE_KEY_SIZE] {
        let mut out = [0u8; FILE_KEY_SIZE];
        out[16..24].copy_from_slice(&self.nonce.to_be_bytes());
        out[24..].copy_from_slice(&self.meta_mac.to_be_bytes());
        for i in 0..SYMM_KEY_SIZE {
            out[i] = self.aes[i] ^ out[i + SYMM_KEY_SIZE];
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != FILE_KEY_SIZE {
            return Err(CryptoError::KeyLength(bytes.len()));
        }
        let mut aes = [0u8; SYMM_KEY_SIZE];
        for (i, b) in aes.iter_mut().enumerate() {
            *b = bytes[i] ^ bytes[i + SYMM_KEY_SIZE];
        }
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&bytes[16..24]);
        let mut meta_mac = [0u8; 8];
        meta_mac.copy_from_slice(&bytes[24..]);
        Ok(Self {
            aes,
            nonce: u64::from_be_bytes(nonce),
            meta_mac: u64::from_be_bytes(meta_mac),
        })
    }
}

/// Keys of the logged-in account.
#[derive(Debug, Clone)]
pub struct KeyRing {
    pub me: UserHandle,
    pub master: SymmKey,
    pub identity: Option<Identity>,
}

impl KeyRing {
    pub fn new(me: UserHandle, master: SymmKey) -> Self {
        Self {
            me,
            master,
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Generate a fresh account: random master key and identity
    pub fn generate(me: UserHandle) -> Result<Self, CryptoError> {
        Ok(Self::new(me, SymmKey::generate()?).with_identity(Identity::generate()?))
    }

    /// Wrap a node key under `holder` for transmission
    pub fn wrap_key(holder: &SymmKey, key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = key.to_vec();
        holder.ecb_encrypt(&mut out)?;
        Ok(out)
    }

    pub fn unwrap_key(holder: &SymmKey, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = wrapped.to_vec();
        holder.ecb_decrypt(&mut out)?;
        Ok(out)
    }

    /// Encode the master key and identity for the key file
    pub fn to_pem(&self) -> String {
        let mut blocks = vec![pem::Pem::new("CUMULUS MASTER KEY", {
            let mut contents = self.me.to_bytes().to_vec();
            contents.extend_from_slice(self.master.bytes());
            contents
        })];
        if let Some(identity) = &self.identity {
            blocks.push(pem::Pem::new("PRIVATE KEY", identity.to_bytes().to_vec()));
        }
        pem::encode_many(&blocks)
    }

    pub fn from_pem(pem_str: &str) -> Result<Self, CryptoError> {
        let blocks =
            pem::parse_many(pem_str).map_err(|e| anyhow::anyhow!("failed to parse PEM: {}", e))?;
        let mut ring: Option<KeyRing> = None;
        let mut identity = None;
        for block in blocks {
            match block.tag() {
                "CUMULUS MASTER KEY" => {
                    let contents = block.contents();
                    if contents.len() != 8 + SYMM_KEY_SIZE {
                        return Err(CryptoError::KeyLength(contents.len()));
                    }
                    let mut me = [0u8; 8];
                    me.copy_from_slice(&contents[..8]);
                    let master = SymmKey::try_from(&contents[8..])?;
                    ring = Some(KeyRing::new(UserHandle::from(me), master));
                }
                "PRIVATE KEY" => identity = Some(Identity::try_from(block.contents())?),
                tag => {
                    return Err(anyhow::anyhow!("unexpected PEM tag {}", tag).into());
                }
            }
        }
        let ring = ring.ok_or_else(|| anyhow::anyhow!("key file has no master key"))?;
        Ok(match identity {
            Some(identity) => ring.with_identity(identity),
            None => ring,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_file_key_packing() {
        let key = FileKey {
            aes: [3u8; 16],
            nonce: 0x0102_0304_0506_0708,
            meta_mac: 0xdead_beef,
        };
        let packed = key.to_bytes();
        assert_eq!(FileKey::from_bytes(&packed).unwrap(), key);
        // the attribute key of a file is its aes key
        assert_eq!(attribute_key(&packed).unwrap().bytes(), &key.aes);
    }

    #[test]
    fn test_wrap_requires_block_multiple() {
        let master = SymmKey::from([1u8; 16]);
        assert!(KeyRing::wrap_key(&master, &[0u8; 10]).is_err());
        let wrapped = KeyRing::wrap_key(&master, &[9u8; 32]).unwrap();
        assert_eq!(KeyRing::unwrap_key(&master, &wrapped).unwrap(), vec![9u8; 32]);
    }

    #[test]
    fn test_pem_serialization() {
        let ring = KeyRing::generate(UserHandle::from_u64(77)).unwrap();
        let recovered = KeyRing::from_pem(&ring.to_pem()).unwrap();
        assert_eq!(recovered.me, ring.me);
        assert_eq!(recovered.master, ring.master);
        assert_eq!(
            recovered.identity.unwrap().public().to_bytes(),
            ring.identity.unwrap().public().to_bytes()
        );
    }
}

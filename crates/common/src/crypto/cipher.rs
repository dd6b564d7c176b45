//! AES-128 block operations used for node keys, attributes and content.
//!
//! All modes here run on a single raw block cipher: ECB for wrapping keys,
//! zero-IV CBC for attribute blobs and records, CTR for file content with a
//! CBC-MAC computed over each chunk's plaintext.

use std::fmt;

use aes_gcm::aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes_gcm::aes::Aes128;

/// Cipher block size in bytes
pub const BLOCK_SIZE: usize = 16;
/// Size of a symmetric key in bytes
pub const SYMM_KEY_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("crypto error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("length {0} is not a multiple of the cipher block size")]
    NotBlockAligned(usize),
    #[error("invalid key length {0}")]
    KeyLength(usize),
    #[error("attribute magic mismatch")]
    BadMagic,
    #[error("invalid padding")]
    Padding,
    #[error("attribute encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A 128-bit symmetric key with its expanded cipher state.
#[derive(Clone)]
pub struct SymmKey {
    bytes: [u8; SYMM_KEY_SIZE],
    cipher: Aes128,
}

impl fmt::Debug for SymmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmKey(..)")
    }
}

impl PartialEq for SymmKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for SymmKey {}

impl From<[u8; SYMM_KEY_SIZE]> for SymmKey {
    fn from(bytes: [u8; SYMM_KEY_SIZE]) -> Self {
        Self {
            bytes,
            cipher: Aes128::new(&GenericArray::from(bytes)),
        }
    }
}

impl TryFrom<&[u8]> for SymmKey {
    type Error = CryptoError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; SYMM_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::KeyLength(bytes.len()))?;
        Ok(bytes.into())
    }
}

fn ensure_aligned(data: &[u8]) -> Result<(), CryptoError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::NotBlockAligned(data.len()));
    }
    Ok(())
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    dst.iter_mut().zip(src).for_each(|(d, s)| *d ^= s);
}

/// Fill `buf` from the operating system's random source
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|e| anyhow::anyhow!("random source failure: {}", e))?;
    Ok(())
}

impl SymmKey {
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; SYMM_KEY_SIZE];
        random_bytes(&mut bytes)?;
        Ok(bytes.into())
    }

    pub fn bytes(&self) -> &[u8; SYMM_KEY_SIZE] {
        &self.bytes
    }

    pub fn encrypt_block(&self, block: &mut [u8]) {
        self.cipher
            .encrypt_block(GenericArray::from_mut_slice(&mut block[..BLOCK_SIZE]));
    }

    pub fn decrypt_block(&self, block: &mut [u8]) {
        self.cipher
            .decrypt_block(GenericArray::from_mut_slice(&mut block[..BLOCK_SIZE]));
    }

    pub fn ecb_encrypt(&self, data: &mut [u8]) -> Result<(), CryptoError> {
        ensure_aligned(data)?;
        data.chunks_exact_mut(BLOCK_SIZE)
            .for_each(|block| self.encrypt_block(block));
        Ok(())
    }

    pub fn ecb_decrypt(&self, data: &mut [u8]) -> Result<(), CryptoError> {
        ensure_aligned(data)?;
        data.chunks_exact_mut(BLOCK_SIZE)
            .for_each(|block| self.decrypt_block(block));
        Ok(())
    }

    /// CBC with an all-zero IV
    pub fn cbc_encrypt(&self, data: &mut [u8]) -> Result<(), CryptoError> {
        ensure_aligned(data)?;
        let mut prev = [0u8; BLOCK_SIZE];
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            xor_into(block, &prev);
            self.encrypt_block(block);
            prev.copy_from_slice(block);
        }
        Ok(())
    }

    pub fn cbc_decrypt(&self, data: &mut [u8]) -> Result<(), CryptoError> {
        ensure_aligned(data)?;
        let mut prev = [0u8; BLOCK_SIZE];
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            let mut saved = [0u8; BLOCK_SIZE];
            saved.copy_from_slice(block);
            self.decrypt_block(block);
            xor_into(block, &prev);
            prev = saved;
        }
        Ok(())
    }

    /// CBC over data extended with `E` and `P` padding up to the block size
    pub fn encrypt_padded(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::with_capacity(data.len() + BLOCK_SIZE);
        out.extend_from_slice(data);
        out.push(b'E');
        while out.len() % BLOCK_SIZE != 0 {
            out.push(b'P');
        }
        self.cbc_encrypt(&mut out)?;
        Ok(out)
    }

    pub fn decrypt_padded(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = data.to_vec();
        self.cbc_decrypt(&mut out)?;
        while out.last() == Some(&b'P') {
            out.pop();
        }
        if out.pop() != Some(b'E') {
            return Err(CryptoError::Padding);
        }
        Ok(out)
    }

    fn counter_block(nonce: u64, index: u64) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[..8].copy_from_slice(&nonce.to_be_bytes());
        block[8..].copy_from_slice(&index.to_be_bytes());
        block
    }

    /// CTR keystream applied in place; `pos` is the absolute offset of `data`
    /// and must be block aligned.
    pub fn ctr_crypt(&self, data: &mut [u8], nonce: u64, pos: u64) -> Result<(), CryptoError> {
        if pos % BLOCK_SIZE as u64 != 0 {
            return Err(CryptoError::NotBlockAligned(pos as usize));
        }
        let first = pos / BLOCK_SIZE as u64;
        for (i, block) in data.chunks_mut(BLOCK_SIZE).enumerate() {
            let mut keystream = Self::counter_block(nonce, first + i as u64);
            self.encrypt_block(&mut keystream);
            xor_into(block, &keystream);
        }
        Ok(())
    }

    /// CBC-MAC over a chunk's plaintext, seeded with the nonce
    pub fn chunk_mac(&self, plaintext: &[u8], nonce: u64) -> [u8; BLOCK_SIZE] {
        let mut mac = [0u8; BLOCK_SIZE];
        mac[..8].copy_from_slice(&nonce.to_be_bytes());
        mac[8..].copy_from_slice(&nonce.to_be_bytes());
        for block in plaintext.chunks(BLOCK_SIZE) {
            xor_into(&mut mac, block);
            self.encrypt_block(&mut mac);
        }
        mac
    }

    /// Fold per-chunk MACs, in offset order, into the 64-bit meta-MAC
    pub fn condense_macs<'a>(&self, macs: impl IntoIterator<Item = &'a [u8; BLOCK_SIZE]>) -> u64 {
        let mut mac = [0u8; BLOCK_SIZE];
        for chunk in macs {
            xor_into(&mut mac, chunk);
            self.encrypt_block(&mut mac);
        }
        let mut out = [0u8; 8];
        for i in 0..4 {
            out[i] = mac[i] ^ mac[i + 4];
            out[i + 4] = mac[i + 8] ^ mac[i + 12];
        }
        u64::from_be_bytes(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key() -> SymmKey {
        SymmKey::from([7u8; SYMM_KEY_SIZE])
    }

    #[test]
    fn test_cbc_inverts() {
        let mut data = *b"0123456789abcdef0123456789abcdef";
        key().cbc_encrypt(&mut data).unwrap();
        assert_ne!(&data, b"0123456789abcdef0123456789abcdef");
        key().cbc_decrypt(&mut data).unwrap();
        assert_eq!(&data, b"0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn test_unaligned_input_rejected() {
        let mut data = [0u8; 15];
        assert!(matches!(
            key().ecb_encrypt(&mut data),
            Err(CryptoError::NotBlockAligned(15))
        ));
    }

    #[test]
    fn test_padded_cbc() {
        let sealed = key().encrypt_padded(b"record bytes").unwrap();
        assert_eq!(sealed.len() % BLOCK_SIZE, 0);
        assert_eq!(key().decrypt_padded(&sealed).unwrap(), b"record bytes");

        let other = SymmKey::from([8u8; SYMM_KEY_SIZE]);
        assert!(other.decrypt_padded(&sealed).is_err());
    }

    #[test]
    fn test_ctr_is_position_dependent() {
        let plain = vec![42u8; 40];
        let mut whole = plain.clone();
        key().ctr_crypt(&mut whole, 9, 0).unwrap();

        // decrypting the tail alone at its own offset yields the same bytes
        let mut tail = whole[16..].to_vec();
        key().ctr_crypt(&mut tail, 9, 16).unwrap();
        assert_eq!(tail, plain[16..]);
    }

    #[test]
    fn test_meta_mac_depends_on_chunk_order() {
        let a = key().chunk_mac(b"first chunk", 1);
        let b = key().chunk_mac(b"second chunk", 1);
        assert_ne!(key().condense_macs([&a, &b]), key().condense_macs([&b, &a]));
    }
}

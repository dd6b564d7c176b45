use std::collections::BTreeMap;

use super::cipher::{CryptoError, SymmKey, BLOCK_SIZE};

/// Prefix every decrypted attribute blob starts with
pub const ATTR_MAGIC: &[u8] = b"CUMU";

/// Decrypted node attributes (`n` name, `c` fingerprint, ...)
pub type AttrMap = BTreeMap<String, String>;

/// Seal attributes under a node's attribute key.
pub fn encrypt_attributes(attrs: &AttrMap, key: &SymmKey) -> Result<Vec<u8>, CryptoError> {
    let mut out = ATTR_MAGIC.to_vec();
    out.extend_from_slice(&serde_json::to_vec(attrs)?);
    out.resize(out.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0);
    key.cbc_encrypt(&mut out)?;
    Ok(out)
}

/// Open an attribute blob.
///
/// A key that decrypts to anything not starting with the magic prefix is
/// the wrong key; that case is reported as [`CryptoError::BadMagic`].
pub fn decrypt_attributes(blob: &[u8], key: &SymmKey) -> Result<AttrMap, CryptoError> {
    let mut plain = blob.to_vec();
    key.cbc_decrypt(&mut plain)?;
    if !plain.starts_with(ATTR_MAGIC) || plain.get(ATTR_MAGIC.len()) != Some(&b'{') {
        return Err(CryptoError::BadMagic);
    }
    let end = plain
        .iter()
        .rposition(|b| *b != 0)
        .map(|pos| pos + 1)
        .unwrap_or(0);
    Ok(serde_json::from_slice(&plain[ATTR_MAGIC.len()..end])?)
}

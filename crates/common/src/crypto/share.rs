//! Share keys sealed for an account identity using ECDH + AES Key Wrap
//!
//! A share key (the symmetric key of a shared folder) can reach an account
//! in two ways: wrapped under the account's master key, or sealed for the
//! account's x25519 identity by someone who does not know that master key.
//! This module handles the second form.
//!
//! To seal a share key for a recipient:
//! 1. **Generate ephemeral keypair**: a throwaway x25519 secret
//! 2. **Perform ECDH**: with the recipient's public identity
//! 3. **Wrap key**: AES-KW the share key with the shared secret
//! 4. **Package**: ephemeral public key || wrapped key
//!
//! The recipient repeats the ECDH with its identity secret and unwraps.

use std::fmt;

use aes_kw::KekAes256 as Kek;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use x25519_dalek::{PublicKey, StaticSecret};

use super::cipher::{random_bytes, CryptoError, SymmKey, SYMM_KEY_SIZE};

/// Size of an x25519 key in bytes
pub const IDENTITY_KEY_SIZE: usize = 32;
/// Size of AES Key Wrap integrity block in bytes
pub const KW_NONCE_SIZE: usize = 8;
/// Total size of a sealed share key
///
/// Layout: ephemeral_pubkey (32) || wrapped_key (24)
pub const SHARE_ENVELOPE_SIZE: usize = IDENTITY_KEY_SIZE + SYMM_KEY_SIZE + KW_NONCE_SIZE;

/// The account's x25519 identity secret.
#[derive(Clone)]
pub struct Identity(StaticSecret);

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", hex::encode(self.public().to_bytes()))
    }
}

impl From<[u8; IDENTITY_KEY_SIZE]> for Identity {
    fn from(bytes: [u8; IDENTITY_KEY_SIZE]) -> Self {
        Identity(StaticSecret::from(bytes))
    }
}

impl TryFrom<&[u8]> for Identity {
    type Error = CryptoError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; IDENTITY_KEY_SIZE] = bytes.try_into().map_err(|_| {
            anyhow::anyhow!(
                "invalid identity size, expected {}, got {}",
                IDENTITY_KEY_SIZE,
                bytes.len()
            )
        })?;
        Ok(bytes.into())
    }
}

impl Identity {
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; IDENTITY_KEY_SIZE];
        random_bytes(&mut bytes)?;
        Ok(bytes.into())
    }

    pub fn public(&self) -> PublicKey {
        PublicKey::from(&self.0)
    }

    pub fn to_bytes(&self) -> [u8; IDENTITY_KEY_SIZE] {
        self.0.to_bytes()
    }
}

/// A share key sealed for one recipient identity.
///
/// # Wire Format
///
/// ```text
/// [ ephemeral_pubkey: 32 bytes ][ wrapped_key: 24 bytes ]
/// ```
#[serde_as]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareEnvelope(#[serde_as(as = "Bytes")] [u8; SHARE_ENVELOPE_SIZE]);

impl ShareEnvelope {
    /// Seal `share_key` so only `recipient` can open it
    pub fn seal(share_key: &SymmKey, recipient: &PublicKey) -> Result<Self, CryptoError> {
        let ephemeral = Identity::generate()?;
        let shared_secret = ephemeral.0.diffie_hellman(recipient);

        let kek = Kek::from(shared_secret.to_bytes());
        let wrapped = kek
            .wrap_vec(share_key.bytes())
            .map_err(|_| anyhow::anyhow!("AES-KW wrap error"))?;

        let ephemeral_bytes = ephemeral.public().to_bytes();
        if ephemeral_bytes.len() + wrapped.len() != SHARE_ENVELOPE_SIZE {
            return Err(anyhow::anyhow!("expected envelope size is incorrect").into());
        }

        let mut envelope = [0u8; SHARE_ENVELOPE_SIZE];
        envelope[..IDENTITY_KEY_SIZE].copy_from_slice(&ephemeral_bytes);
        envelope[IDENTITY_KEY_SIZE..].copy_from_slice(&wrapped);
        Ok(ShareEnvelope(envelope))
    }

    /// Recover the share key with the recipient's identity
    pub fn open(&self, identity: &Identity) -> Result<SymmKey, CryptoError> {
        let mut ephemeral = [0u8; IDENTITY_KEY_SIZE];
        ephemeral.copy_from_slice(&self.0[..IDENTITY_KEY_SIZE]);
        let shared_secret = identity.0.diffie_hellman(&PublicKey::from(ephemeral));

        let kek = Kek::from(shared_secret.to_bytes());
        let unwrapped = kek
            .unwrap_vec(&self.0[IDENTITY_KEY_SIZE..])
            .map_err(|_| anyhow::anyhow!("AES-KW unwrap error"))?;
        SymmKey::try_from(unwrapped.as_slice())
    }

    pub fn to_bytes(&self) -> [u8; SHARE_ENVELOPE_SIZE] {
        self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_seal_and_open() {
        let recipient = Identity::generate().unwrap();
        let share_key = SymmKey::generate().unwrap();

        let envelope = ShareEnvelope::seal(&share_key, &recipient.public()).unwrap();
        assert_eq!(envelope.open(&recipient).unwrap(), share_key);
    }

    #[test]
    fn test_wrong_identity_cannot_open() {
        let recipient = Identity::generate().unwrap();
        let stranger = Identity::generate().unwrap();
        let envelope =
            ShareEnvelope::seal(&SymmKey::generate().unwrap(), &recipient.public()).unwrap();
        assert!(envelope.open(&stranger).is_err());
    }

    #[test]
    fn test_envelope_survives_bincode() {
        let recipient = Identity::generate().unwrap();
        let envelope =
            ShareEnvelope::seal(&SymmKey::generate().unwrap(), &recipient.public()).unwrap();
        let bytes = bincode::serialize(&envelope).unwrap();
        let decoded: ShareEnvelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }
}

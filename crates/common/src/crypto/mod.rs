//! Cryptographic operations of the engine
//!
//! This module provides the key handling that gates node visibility and the
//! content protection used by transfers:
//!
//! - **Node keys**: every node carries its own key, delivered wrapped under
//!   the account master key or under the key of a share it lives in
//! - **Attributes**: names and fingerprints travel as a CBC-encrypted blob
//!   whose magic prefix tells a correct key from a wrong one
//! - **Content**: file data is CTR-encrypted with a per-file key; every chunk
//!   carries its own CBC-MAC and the chunk MACs condense into a meta-MAC that
//!   is stored in the file key and verified on download
//! - **Share delivery**: share keys can be sealed for the account's x25519
//!   identity with ECDH + AES key wrap
//!
//! # Key Resolution
//!
//! A node's key becomes usable by trying, in order:
//! 1. a key the node already holds in the clear (created locally or cached)
//! 2. an entry wrapped for the logged-in account (master key)
//! 3. an entry wrapped under a share key held by one of its ancestors
//!
//! Nodes for which none of these work stay undecrypted and are retried
//! whenever a new share key is installed.

mod attributes;
mod cipher;
mod keys;
mod share;

pub use attributes::{decrypt_attributes, encrypt_attributes, AttrMap, ATTR_MAGIC};
pub use cipher::{random_bytes, CryptoError, SymmKey, BLOCK_SIZE, SYMM_KEY_SIZE};
pub use keys::{attribute_key, node_key_size, FileKey, KeyRing, FILE_KEY_SIZE, FOLDER_KEY_SIZE};
pub use share::{Identity, ShareEnvelope, SHARE_ENVELOPE_SIZE};
pub use x25519_dalek::PublicKey as IdentityPublic;

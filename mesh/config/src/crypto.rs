// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

//! Curve25519 identity types used throughout the mesh.
//!
//! The public key doubles as the machine id (hex form) and as the seed for
//! the machine's overlay address. The whole code base should only refer to
//! these wrappers and never to the underlying scheme implementation.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// Length in bytes of a Curve25519 key.
pub const KEY_LENGTH: usize = 32;

/// First two octets of the fixed private range overlay addresses are derived
/// into. The remaining 16 bits are a pure function of the public key.
const OVERLAY_NET: [u8; 2] = [10, 210];

/// Public half of a machine's identity key.
///
/// Hex encoding of this key is the machine id in the registry; base64
/// encoding is what the tunnel backend understands.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachinePublicKey([u8; KEY_LENGTH]);

impl MachinePublicKey {
    pub fn new(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_base64(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        STANDARD.encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyDecodeError> {
        let bytes = hex::decode(s).map_err(|e| KeyDecodeError::Malformed(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyDecodeError> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let bytes = STANDARD
            .decode(s)
            .map_err(|e| KeyDecodeError::Malformed(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, KeyDecodeError> {
        let bytes: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| KeyDecodeError::WrongLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    /// Derives the machine's stable overlay address. The host half of the
    /// address is taken from a SHA-256 digest of the public key, avoiding
    /// the all-zeros and all-ones host bytes.
    pub fn overlay_ip(&self) -> Ipv4Addr {
        let digest = Sha256::digest(self.0);
        let hi = digest[0];
        let lo = match digest[1] {
            0 => 1,
            255 => 254,
            b => b,
        };
        Ipv4Addr::new(OVERLAY_NET[0], OVERLAY_NET[1], hi, lo)
    }
}

impl fmt::Display for MachinePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for MachinePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachinePublicKey({}..)", &self.to_hex()[..8])
    }
}

impl Serialize for MachinePublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MachinePublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MachinePublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A machine's long-lived identity key pair. The private key is generated
/// once and never rotated; the public half is the machine id.
pub struct MachineKeyPair(StaticSecret);

impl MachineKeyPair {
    pub fn generate<R: rand::RngCore + rand::CryptoRng>(rng: &mut R) -> Self {
        Self(StaticSecret::random_from_rng(rng))
    }

    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn public(&self) -> MachinePublicKey {
        MachinePublicKey(PublicKey::from(&self.0).to_bytes())
    }

    pub fn private_key_bytes(&self) -> [u8; KEY_LENGTH] {
        self.0.to_bytes()
    }

    pub fn private_key_base64(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        STANDARD.encode(self.0.to_bytes())
    }
}

impl Clone for MachineKeyPair {
    fn clone(&self) -> Self {
        Self::from_bytes(self.0.to_bytes())
    }
}

impl fmt::Debug for MachineKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineKeyPair({:?})", self.public())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyDecodeError {
    #[error("key has wrong length: {0} bytes")]
    WrongLength(usize),
    #[error("malformed key encoding: {0}")]
    Malformed(String),
}

//! # Device Identity
//!
//! Identity types used throughout dhtlink:
//!
//! - [`DeviceKeypair`]: Ed25519 signing keypair owned by the local device
//! - [`DeviceId`]: 32-byte BLAKE3 fingerprint of a device public key
//! - [`DeviceCertificate`]: X.509 certificate bound to a device fingerprint
//!
//! ## Identity Model
//!
//! A device is identified by the fingerprint of its public key, not by the
//! key itself. The fingerprint is stable for the lifetime of the keypair,
//! totally ordered (used for tie-breaking simultaneous connections) and
//! usable directly as DHT routing material.
//!
//! Rendezvous values for a device are published under the DHT key
//! `peer:<infohash>`, where the infohash is the 20-byte truncation of the
//! device fingerprint.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Domain separation prefix for device fingerprints.
/// Prevents cross-protocol hash reuse.
const FINGERPRINT_DOMAIN: &[u8] = b"dhtlink-device-v1:";

/// Prefix of the DHT key under which a device receives connection requests.
pub const DHT_KEY_PREFIX: &[u8] = b"peer:";

/// Prefix of the DHT key under which device certificates are published.
pub const CERT_KEY_PREFIX: &[u8] = b"crt:";

/// Length of the truncated fingerprint used in DHT keys.
pub const INFOHASH_LEN: usize = 20;

#[derive(Clone)]
pub struct DeviceKeypair {
    signing_key: SigningKey,
}

impl DeviceKeypair {
    /// Generate a fresh Ed25519 keypair from the system CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore a keypair from its 32-byte secret seed.
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The fingerprint identifying this device.
    pub fn device_id(&self) -> DeviceId {
        DeviceId::from_public_key(&self.public_key_bytes())
    }
}

impl std::fmt::Debug for DeviceKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeypair")
            .field("device_id", &self.device_id())
            .finish_non_exhaustive()
    }
}

/// 32-byte BLAKE3 fingerprint of a device public key.
///
/// Opaque, comparable and hashable. The total order is used to break ties
/// when two devices open connections to each other simultaneously.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId([u8; 32]);

impl DeviceId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the fingerprint of a raw Ed25519 public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(public_key);
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// 20-byte truncated fingerprint used as DHT key material.
    pub fn infohash(&self) -> [u8; INFOHASH_LEN] {
        let mut out = [0u8; INFOHASH_LEN];
        out.copy_from_slice(&self.0[..INFOHASH_LEN]);
        out
    }

    /// DHT key under which this device listens for connection requests.
    pub fn dht_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(DHT_KEY_PREFIX.len() + INFOHASH_LEN);
        key.extend_from_slice(DHT_KEY_PREFIX);
        key.extend_from_slice(&self.infohash());
        key
    }

    /// DHT key under which this device's certificate is published.
    pub fn cert_dht_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(CERT_KEY_PREFIX.len() + INFOHASH_LEN);
        key.extend_from_slice(CERT_KEY_PREFIX);
        key.extend_from_slice(&self.infohash());
        key
    }
}

impl std::fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for DeviceId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// An X.509 certificate bound to a device fingerprint.
///
/// The fingerprint is derived from the public key embedded in the
/// certificate, never taken from certificate metadata. `owner` carries the
/// URI of the account the device belongs to, when the issuing layer
/// provides one; it is matched by
/// [`ConnectionManager::close_connections_with`].
///
/// [`ConnectionManager::close_connections_with`]: crate::ConnectionManager::close_connections_with
#[derive(Clone)]
pub struct DeviceCertificate {
    der: Vec<u8>,
    device_id: DeviceId,
    owner: Option<String>,
}

impl DeviceCertificate {
    /// Build a certificate record from parts already validated by the
    /// caller. Use [`DeviceCertificate::from_der`] for untrusted input.
    pub(crate) fn from_parts(der: Vec<u8>, device_id: DeviceId, owner: Option<String>) -> Self {
        Self {
            der,
            device_id,
            owner,
        }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

impl std::fmt::Debug for DeviceCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCertificate")
            .field("device_id", &self.device_id)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn fingerprint_is_deterministic() {
        let keypair = DeviceKeypair::generate();
        let a = DeviceId::from_public_key(&keypair.public_key_bytes());
        let b = keypair.device_id();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_per_key() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let keypair = DeviceKeypair::generate();
            assert!(seen.insert(keypair.device_id()), "fingerprint collision");
        }
    }

    #[test]
    fn hex_round_trip() {
        let id = DeviceKeypair::generate().device_id();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(DeviceId::from_hex(&hex), Some(id));
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert_eq!(DeviceId::from_hex("zz"), None);
        assert_eq!(DeviceId::from_hex("abcd"), None);
        assert_eq!(DeviceId::from_hex(&"0".repeat(63)), None);
    }

    #[test]
    fn dht_key_layout() {
        let id = DeviceKeypair::generate().device_id();
        let key = id.dht_key();
        assert_eq!(key.len(), DHT_KEY_PREFIX.len() + INFOHASH_LEN);
        assert!(key.starts_with(DHT_KEY_PREFIX));
        assert_eq!(&key[DHT_KEY_PREFIX.len()..], &id.as_bytes()[..INFOHASH_LEN]);
    }

    #[test]
    fn secret_round_trip_preserves_identity() {
        let keypair = DeviceKeypair::generate();
        let restored = DeviceKeypair::from_secret_bytes(keypair.secret_key_bytes());
        assert_eq!(keypair.device_id(), restored.device_id());
    }

    #[test]
    fn ordering_is_total_and_stable() {
        let a = DeviceId::from_bytes([1u8; 32]);
        let b = DeviceId::from_bytes([2u8; 32]);
        assert!(a < b);
        assert_eq!(a.min(b), a);
    }
}

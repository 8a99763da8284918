//! Node identity and crypto: keypairs, peer hash, shared secrets, payload sealing.

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Size of a derived shared secret in bytes.
pub const SECRET_SIZE: usize = 32;

/// Peer public identity (32 bytes, X25519). Serializable for packet envelopes.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    /// Identity equality; the sole key used by the client registry.
    pub fn matches(&self, other: &PublicKey) -> bool {
        self == other
    }

    /// Truncated wire hash of this identity. One byte, so collisions between
    /// distinct identities are expected; resolution by hash may yield zero,
    /// one, or many peers.
    pub fn peer_hash(&self) -> PeerHash {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        let digest = hasher.finalize();
        PeerHash(digest[0])
    }

    /// Does this identity hash to the supplied short hash?
    pub fn hash_matches(&self, hash: PeerHash) -> bool {
        self.peer_hash() == hash
    }
}

/// Short hash carried on the wire in place of a full identity.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerHash(pub u8);

/// Symmetric secret derived once per peer via X25519 key agreement.
#[derive(Clone, Eq, PartialEq)]
pub struct SharedSecret([u8; SECRET_SIZE]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; SECRET_SIZE]) -> Self {
        SharedSecret(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// X25519 keypair. Keep secret key private; expose only the public identity.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random long-term identity.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public_x = X25519PublicKey::from(&secret);
        let public = PublicKey(public_x.to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Shared secret with a remote identity. Deterministic for a fixed pair of
    /// long-term identities; the registry calls this once per new peer and
    /// caches the result.
    pub fn shared_secret(&self, other_public: &PublicKey) -> SharedSecret {
        let other = X25519PublicKey::from(*other_public.as_bytes());
        SharedSecret(self.secret.diffie_hellman(&other).to_bytes())
    }
}

/// Derive the 32-byte packet key for ChaCha20-Poly1305 from a shared secret.
/// Pairwise: each pair of nodes has its own packet key.
pub fn derive_packet_key(secret: &SharedSecret) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"meshling-anon-v1");
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Seal a response payload: ChaCha20-Poly1305. Nonce: 96-bit counter per
/// sender; never reuse under the same key.
pub fn seal_payload(key: &[u8; 32], nonce: u64, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let cipher =
        chacha20poly1305::ChaCha20Poly1305::new_from_slice(key).map_err(|_| SealError::Key)?;
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&nonce.to_le_bytes());
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| SealError::Seal)
}

/// Open a sealed payload.
pub fn open_payload(key: &[u8; 32], nonce: u64, ciphertext: &[u8]) -> Result<Vec<u8>, SealError> {
    let cipher =
        chacha20poly1305::ChaCha20Poly1305::new_from_slice(key).map_err(|_| SealError::Key)?;
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&nonce.to_le_bytes());
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| SealError::Open)
}

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("invalid key")]
    Key,
    #[error("sealing failed")]
    Seal,
    #[error("opening failed")]
    Open,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let secret_a = a.shared_secret(b.public_key());
        let secret_b = b.shared_secret(a.public_key());
        assert_eq!(secret_a, secret_b);
    }

    #[test]
    fn peer_hash_matches_own_identity() {
        let kp = Keypair::generate();
        let hash = kp.public_key().peer_hash();
        assert!(kp.public_key().hash_matches(hash));
    }

    #[test]
    fn peer_hash_deterministic() {
        let kp = Keypair::generate();
        assert_eq!(kp.public_key().peer_hash(), kp.public_key().peer_hash());
    }

    #[test]
    fn seal_open_roundtrip() {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let plain = b"pong";
        let sealed = seal_payload(&key, 7, plain).unwrap();
        let opened = open_payload(&key, 7, &sealed).unwrap();
        assert_eq!(opened.as_slice(), plain);
    }

    #[test]
    fn open_rejects_wrong_nonce() {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let sealed = seal_payload(&key, 1, b"pong").unwrap();
        assert!(open_payload(&key, 2, &sealed).is_err());
    }

    #[test]
    fn packet_key_differs_per_pair() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let c = Keypair::generate();
        let ab = derive_packet_key(&a.shared_secret(b.public_key()));
        let ac = derive_packet_key(&a.shared_secret(c.public_key()));
        assert_ne!(ab, ac);
    }
}

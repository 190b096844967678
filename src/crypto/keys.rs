//! Key management using secp256k1 ECDSA.
//!
//! Every participant is identified by a compressed SEC1 public key. Events
//! and blocks are signed over a 32-byte BLAKE3 digest with deterministic
//! (RFC 6979) ECDSA, so equal inputs always produce equal signatures. The
//! private key lives PEM-encoded in the node's data directory and is
//! generated on first run.

use std::path::{Path, PathBuf};

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::pkcs8::LineEnding;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::Hash;

/// Compressed SEC1 public key length.
const SEC1_COMPRESSED_BYTES: usize = 33;

/// Errors from key handling.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed key material: {0}")]
    Malformed(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

// ── Public keys ──

/// A compressed secp256k1 public key (33 bytes).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub(crate) Vec<u8>);

impl PublicKey {
    /// Construct from raw SEC1-compressed bytes, validating the point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != SEC1_COMPRESSED_BYTES {
            return Err(KeyError::Malformed(format!(
                "expected {} key bytes, got {}",
                SEC1_COMPRESSED_BYTES,
                bytes.len()
            )));
        }
        VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|e| KeyError::Malformed(e.to_string()))?;
        Ok(PublicKey(bytes.to_vec()))
    }

    /// Parse from a hex string (as found in the peers file).
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| KeyError::Malformed(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Raw SEC1-compressed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hex encoding of the SEC1 bytes.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Domain-separated BLAKE3 fingerprint of the key.
    pub fn fingerprint(&self) -> Hash {
        crate::hash_domain("braid.peer.id", &self.0)
    }

    /// Stable 64-bit participant id: first eight fingerprint bytes, LE.
    pub fn participant_id(&self) -> u64 {
        let fp = self.fingerprint();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&fp[..8]);
        u64::from_le_bytes(raw)
    }

    /// Verify a signature over a 32-byte digest.
    pub fn verify(&self, digest: &Hash, signature: &Signature) -> bool {
        let Ok(vk) = VerifyingKey::from_sec1_bytes(&self.0) else {
            return false;
        };
        let Ok(sig) = signature.to_ecdsa() else {
            return false;
        };
        vk.verify_prehash(digest, &sig).is_ok()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..4.min(self.0.len())]))
    }
}

// ── Signatures ──

/// An ECDSA signature as raw `(r, s)` scalars, matching the wire format.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl Signature {
    pub(crate) fn from_ecdsa(sig: &EcdsaSignature) -> Self {
        let (rb, sb) = sig.split_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&rb);
        s.copy_from_slice(&sb);
        Signature { r, s }
    }

    pub(crate) fn to_ecdsa(self) -> Result<EcdsaSignature, KeyError> {
        EcdsaSignature::from_scalars(self.r, self.s)
            .map_err(|e| KeyError::Malformed(e.to_string()))
    }

    /// Concatenated `r || s` bytes, used for signature whitening.
    pub fn to_bytes(self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.r);
        out[32..].copy_from_slice(&self.s);
        out
    }

    /// Deterministic coin bit derived from the signature.
    pub fn coin_bit(&self) -> bool {
        self.s[31] & 1 == 1
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}…)", hex::encode(&self.r[..4]))
    }
}

// ── Keypairs ──

/// A secp256k1 signing keypair.
#[derive(Clone)]
pub struct Keypair {
    pub public: PublicKey,
    secret: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secret = SigningKey::random(&mut OsRng);
        let public = PublicKey(
            secret
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes()
                .to_vec(),
        );
        Keypair { public, secret }
    }

    /// Sign a 32-byte digest (RFC 6979 deterministic ECDSA).
    pub fn sign(&self, digest: &Hash) -> Result<Signature, KeyError> {
        let sig: EcdsaSignature = self
            .secret
            .sign_prehash(digest)
            .map_err(|e| KeyError::Signing(e.to_string()))?;
        Ok(Signature::from_ecdsa(&sig))
    }

    fn from_secret(secret: SigningKey) -> Self {
        let public = PublicKey(
            secret
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes()
                .to_vec(),
        );
        Keypair { public, secret }
    }

    /// Path of the PEM key file inside a data directory.
    pub fn key_path(data_dir: &Path) -> PathBuf {
        data_dir.join(crate::constants::KEY_FILE)
    }

    /// Load the PEM-encoded private key from `data_dir`, generating and
    /// persisting a new one if the file does not exist.
    pub fn load_or_generate(data_dir: &Path) -> Result<Self, KeyError> {
        let path = Self::key_path(data_dir);
        if path.exists() {
            let pem = std::fs::read_to_string(&path)?;
            let secret = k256::SecretKey::from_sec1_pem(&pem)
                .map_err(|e| KeyError::Malformed(e.to_string()))?;
            let kp = Keypair::from_secret(SigningKey::from(&secret));
            tracing::info!(key = %hex::encode(&kp.public.fingerprint()[..8]), "loaded private key");
            return Ok(kp);
        }

        std::fs::create_dir_all(data_dir)?;
        let secret = k256::SecretKey::random(&mut OsRng);
        let pem = secret
            .to_sec1_pem(LineEnding::LF)
            .map_err(|e| KeyError::Malformed(e.to_string()))?;
        std::fs::write(&path, pem.as_bytes())?;
        let kp = Keypair::from_secret(SigningKey::from(&secret));
        tracing::info!(key = %hex::encode(&kp.public.fingerprint()[..8]), "generated new private key");
        Ok(kp)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({:?})", self.public)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = Keypair::generate();
        let digest = crate::hash_domain("braid.test", b"payload");
        let sig = kp.sign(&digest).unwrap();
        assert!(kp.public.verify(&digest, &sig));

        let other = crate::hash_domain("braid.test", b"different");
        assert!(!kp.public.verify(&other, &sig));
    }

    #[test]
    fn signatures_are_deterministic() {
        let kp = Keypair::generate();
        let digest = crate::hash_domain("braid.test", b"payload");
        let a = kp.sign(&digest).unwrap();
        let b = kp.sign(&digest).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let kp = Keypair::generate();
        let hex = kp.public.to_hex();
        let back = PublicKey::from_hex(&hex).unwrap();
        assert_eq!(kp.public, back);
        assert_eq!(kp.public.as_bytes().len(), SEC1_COMPRESSED_BYTES);
    }

    #[test]
    fn pem_load_or_generate_roundtrip() {
        let dir = std::env::temp_dir().join(format!("braid-keys-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let first = Keypair::load_or_generate(&dir).unwrap();
        let second = Keypair::load_or_generate(&dir).unwrap();
        assert_eq!(first.public, second.public);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_garbage_key_bytes() {
        assert!(PublicKey::from_bytes(&[0u8; 33]).is_err());
        assert!(PublicKey::from_hex("zz").is_err());
    }
}

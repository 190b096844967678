//! Cryptographic identity: secp256k1 ECDSA keypairs and signatures.

pub mod keys;

pub use keys::{Keypair, KeyError, PublicKey, Signature};

//! Cryptographic primitives consulted by `wallet-core`: hashing and
//! symmetric encryption for master-key custody. Primitives such as
//! secp256k1 signing and BIP32 derivation are consulted directly from the
//! `bitcoin` crate rather than wrapped here.

pub mod cipher;
pub mod hash;

pub use hash::{hash160, hash256};

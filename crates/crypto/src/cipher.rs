use aes::Aes256;
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha512;
use zeroize::Zeroize;

type Aes256Ctr = Ctr128BE<Aes256>;

/// PBKDF2-HMAC-SHA512 round count mandated by the master-key persistence
/// format (spec §4.3: `algo=0, iterations=50000, r=0, p=0`).
pub const PBKDF2_ITERATIONS: u32 = 50_000;

/// Derives a 32-byte AES-256 key from a passphrase and a random IV-sized
/// salt. The persisted `iv` doubles as the PBKDF2 salt, matching the
/// source's single-salt scheme.
pub fn derive_key(passphrase: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha512>(passphrase, salt, iterations, &mut key);
    key
}

/// Fills `out` with cryptographically secure random bytes.
pub fn random(out: &mut [u8]) {
    rand::thread_rng().fill_bytes(out);
}

/// Applies AES-256-CTR in place. Because CTR is a stream cipher, the same
/// operation both encrypts and decrypts.
pub struct Aes256CtrKey([u8; 32]);

impl Aes256CtrKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self(key)
    }

    pub fn apply(&self, iv: &[u8; 16], data: &mut [u8]) {
        let mut cipher = Aes256Ctr::new(&self.0.into(), iv.into());
        cipher.apply_keystream(data);
    }
}

impl Drop for Aes256CtrKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

//! The three-state master key custody machine of spec §4.3: `clear`,
//! `encrypted`, `unlocked`. A locked master key cannot sign; `unlock`
//! decrypts into a short-lived cache that a background timer wipes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::bip32::Xpriv;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::serialize::{
    read_u32_le, read_u8, read_varbytes, write_u32_le, write_u8, write_varbytes,
};
use wallet_crypto::cipher::{derive_key, random, Aes256CtrKey, PBKDF2_ITERATIONS};

/// `unlock`'s default auto-destroy window when the caller doesn't override
/// it. `-1` (passed as `None`) disables the timer entirely.
pub const DEFAULT_UNLOCK_TIMEOUT_MS: u64 = 60_000;

/// Raw BIP32 extended private key serialization, held behind a type that
/// zeroes its backing buffer on drop instead of relying on `Xpriv` (which
/// doesn't expose its internal secret for explicit wiping).
struct SensitiveKey(Zeroizing<[u8; 78]>);

impl SensitiveKey {
    fn from_xpriv(key: &Xpriv) -> Self {
        Self(Zeroizing::new(key.encode()))
    }

    fn to_xpriv(&self) -> Xpriv {
        Xpriv::decode(&*self.0).expect("buffer was constructed from a valid Xpriv")
    }
}

enum Inner {
    Clear(SensitiveKey),
    Encrypted {
        iv: [u8; 16],
        ciphertext: Vec<u8>,
    },
    Unlocked {
        key: SensitiveKey,
        iv: [u8; 16],
        ciphertext: Vec<u8>,
        generation: u64,
    },
}

/// Custody state for one wallet's master extended private key. Cheap to
/// clone (it's `Arc`-backed); clones share the same lock and timer.
#[derive(Clone)]
pub struct MasterKey {
    inner: Arc<Mutex<Inner>>,
    generation: Arc<AtomicU64>,
}

impl MasterKey {
    pub fn from_key(key: &Xpriv) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::Clear(SensitiveKey::from_xpriv(key)))),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// `encrypt(passphrase)`: clear -> encrypted. Derives a fresh random
    /// IV and a PBKDF2-HMAC-SHA512 key, then AES-256-CTR encrypts the raw
    /// extended private key.
    pub async fn encrypt(&self, passphrase: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let key = match &*guard {
            Inner::Clear(key) => key.to_xpriv(),
            Inner::Encrypted { .. } | Inner::Unlocked { .. } => {
                return Err(Error::AlreadyInitialized)
            }
        };

        let mut iv = [0u8; 16];
        random(&mut iv);
        let derived = derive_key(passphrase, &iv, PBKDF2_ITERATIONS);
        let cipher = Aes256CtrKey::new(derived);

        let mut ciphertext = key.encode().to_vec();
        cipher.apply(&iv, &mut ciphertext);

        *guard = Inner::Encrypted { iv, ciphertext };
        Ok(())
    }

    /// `decrypt(passphrase)`: encrypted -> clear. Irreversibly discards
    /// the ciphertext; a later `lock()` has nothing to fall back to, so
    /// callers that want to stay lockable should use `unlock` instead.
    pub async fn decrypt(&self, passphrase: &[u8]) -> Result<Xpriv> {
        let mut guard = self.inner.lock().await;
        let (iv, ciphertext) = match &*guard {
            Inner::Encrypted { iv, ciphertext } => (*iv, ciphertext.clone()),
            Inner::Unlocked { iv, ciphertext, .. } => (*iv, ciphertext.clone()),
            Inner::Clear(_) => return Err(Error::NotInitialized),
        };

        let key = decrypt_payload(passphrase, &iv, &ciphertext)?;
        *guard = Inner::Clear(SensitiveKey::from_xpriv(&key));
        Ok(key)
    }

    /// `unlock(passphrase, timeout)`: if a decrypted key is already
    /// cached (state is `clear` or `unlocked`), returns it without
    /// resetting any running timer. Otherwise decrypts, caches the
    /// result as `unlocked`, and schedules a best-effort wipe after
    /// `timeout` (`None` disables the timer).
    pub async fn unlock(&self, passphrase: &[u8], timeout: Option<Duration>) -> Result<Xpriv> {
        let mut guard = self.inner.lock().await;
        match &*guard {
            Inner::Clear(key) => return Ok(key.to_xpriv()),
            Inner::Unlocked { key, .. } => return Ok(key.to_xpriv()),
            Inner::Encrypted { iv, ciphertext } => {
                let key = decrypt_payload(passphrase, iv, ciphertext)?;
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *guard = Inner::Unlocked {
                    key: SensitiveKey::from_xpriv(&key),
                    iv: *iv,
                    ciphertext: ciphertext.clone(),
                    generation,
                };
                drop(guard);

                if let Some(timeout) = timeout {
                    let this = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        this.destroy_if_generation(generation).await;
                    });
                }

                Ok(key)
            }
        }
    }

    /// `lock()`: unlocked/encrypted -> encrypted, wiping any cached
    /// plaintext key. No-op on an already-encrypted key. Errs on a
    /// never-encrypted (`clear`) key, since there's no ciphertext to
    /// fall back to.
    pub async fn lock(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        match &*guard {
            Inner::Clear(_) => Err(Error::NotInitialized),
            Inner::Encrypted { .. } => Ok(()),
            Inner::Unlocked { iv, ciphertext, .. } => {
                *guard = Inner::Encrypted {
                    iv: *iv,
                    ciphertext: ciphertext.clone(),
                };
                Ok(())
            }
        }
    }

    /// `destroy()`: zero any decrypted material immediately, regardless
    /// of timer state. Falls back to `encrypted` if ciphertext is
    /// available, otherwise the key is gone for good.
    pub async fn destroy(&self) {
        let mut guard = self.inner.lock().await;
        if let Inner::Unlocked { iv, ciphertext, .. } = &*guard {
            *guard = Inner::Encrypted {
                iv: *iv,
                ciphertext: ciphertext.clone(),
            };
        }
    }

    async fn destroy_if_generation(&self, expected: u64) {
        let mut guard = self.inner.lock().await;
        if let Inner::Unlocked { generation, iv, ciphertext, .. } = &*guard {
            if *generation == expected {
                *guard = Inner::Encrypted {
                    iv: *iv,
                    ciphertext: ciphertext.clone(),
                };
            }
        }
    }

    pub async fn is_encrypted(&self) -> bool {
        matches!(&*self.inner.lock().await, Inner::Encrypted { .. } | Inner::Unlocked { .. })
    }

    /// Returns the cached key without checking a passphrase: `Some` when
    /// the key is held in the clear or currently unlocked, `None` when
    /// `Encrypted`. Callers that only need to confirm "master is
    /// available right now" (account creation, signing) use this instead
    /// of `unlock`, which would otherwise require a passphrase on every
    /// call even while a prior unlock is still live.
    pub async fn peek(&self) -> Option<Xpriv> {
        match &*self.inner.lock().await {
            Inner::Clear(key) => Some(key.to_xpriv()),
            Inner::Unlocked { key, .. } => Some(key.to_xpriv()),
            Inner::Encrypted { .. } => None,
        }
    }

    /// Persists per spec §4.3's byte layout:
    /// `flag:u8`; `flag=0` then `varbytes(raw xpriv)`; `flag=1` then
    /// `varbytes(iv) varbytes(ciphertext) u8(algo=0) u32(iterations)
    /// u32(r=0) u32(p=0)`.
    pub async fn to_bytes(&self) -> Vec<u8> {
        let guard = self.inner.lock().await;
        let mut buf = Vec::new();
        match &*guard {
            Inner::Clear(key) => {
                write_u8(&mut buf, 0);
                write_varbytes(&mut buf, &key.to_xpriv().encode());
            }
            Inner::Encrypted { iv, ciphertext } | Inner::Unlocked { iv, ciphertext, .. } => {
                write_u8(&mut buf, 1);
                write_varbytes(&mut buf, iv);
                write_varbytes(&mut buf, ciphertext);
                write_u8(&mut buf, 0); // algo = 0 (aes-256-ctr / pbkdf2-hmac-sha512)
                write_u32_le(&mut buf, PBKDF2_ITERATIONS);
                write_u32_le(&mut buf, 0); // r
                write_u32_le(&mut buf, 0); // p
            }
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let flag = read_u8(data, &mut pos)?;
        let inner = match flag {
            0 => {
                let raw = read_varbytes(data, &mut pos)?;
                let key = Xpriv::decode(&raw)?;
                Inner::Clear(SensitiveKey::from_xpriv(&key))
            }
            1 => {
                let iv_vec = read_varbytes(data, &mut pos)?;
                let iv: [u8; 16] = iv_vec
                    .try_into()
                    .map_err(|_| Error::Database("master key iv must be 16 bytes".into()))?;
                let ciphertext = read_varbytes(data, &mut pos)?;
                let _algo = read_u8(data, &mut pos)?;
                let _iterations = read_u32_le(data, &mut pos)?;
                let _r = read_u32_le(data, &mut pos)?;
                let _p = read_u32_le(data, &mut pos)?;
                Inner::Encrypted { iv, ciphertext }
            }
            other => {
                return Err(Error::Database(
                    format!("unknown master key flag byte {other}").into(),
                ))
            }
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }
}

fn decrypt_payload(passphrase: &[u8], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Xpriv> {
    let derived = derive_key(passphrase, iv, PBKDF2_ITERATIONS);
    let cipher = Aes256CtrKey::new(derived);
    let mut plaintext = ciphertext.to_vec();
    cipher.apply(iv, &mut plaintext);
    Xpriv::decode(&plaintext).map_err(|_| Error::BadPassphrase)
}

#[cfg(test)]
mod tests {
    use bitcoin::Network as BtcNetwork;

    use super::*;

    fn test_key() -> Xpriv {
        Xpriv::new_master(BtcNetwork::Testnet, b"master-key-test-seed-bytes-here!").unwrap()
    }

    #[tokio::test]
    async fn encrypt_then_decrypt_recovers_the_same_key() {
        let mk = MasterKey::from_key(&test_key());
        mk.encrypt(b"hunter2").await.unwrap();
        assert!(mk.is_encrypted().await);

        let recovered = mk.decrypt(b"hunter2").await.unwrap();
        assert_eq!(recovered, test_key());
        assert!(!mk.is_encrypted().await);
    }

    #[tokio::test]
    async fn decrypt_with_wrong_passphrase_fails() {
        let mk = MasterKey::from_key(&test_key());
        mk.encrypt(b"hunter2").await.unwrap();
        assert!(matches!(
            mk.decrypt(b"wrong").await,
            Err(Error::BadPassphrase)
        ));
    }

    #[tokio::test]
    async fn unlock_then_lock_preserves_round_trip() {
        let mk = MasterKey::from_key(&test_key());
        mk.encrypt(b"hunter2").await.unwrap();

        let key = mk.unlock(b"hunter2", None).await.unwrap();
        assert_eq!(key, test_key());
        assert!(mk.is_encrypted().await);

        mk.lock().await.unwrap();
        let key_again = mk.unlock(b"hunter2", None).await.unwrap();
        assert_eq!(key_again, test_key());
    }

    #[tokio::test]
    async fn reunlock_while_unlocked_returns_cached_key_without_passphrase_check() {
        let mk = MasterKey::from_key(&test_key());
        mk.encrypt(b"hunter2").await.unwrap();
        mk.unlock(b"hunter2", None).await.unwrap();

        // Wrong passphrase doesn't matter once already unlocked.
        let key = mk.unlock(b"totally-wrong", None).await.unwrap();
        assert_eq!(key, test_key());
    }

    #[tokio::test]
    async fn auto_destroy_timer_relocks_after_timeout() {
        let mk = MasterKey::from_key(&test_key());
        mk.encrypt(b"hunter2").await.unwrap();
        mk.unlock(b"hunter2", Some(Duration::from_millis(20)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(mk.is_encrypted().await);
        // and the cached plaintext key is gone, so decrypt needs the
        // passphrase again:
        assert!(matches!(
            mk.decrypt(b"wrong").await,
            Err(Error::BadPassphrase)
        ));
    }

    #[tokio::test]
    async fn persistence_round_trips_clear_and_encrypted_forms() {
        let clear = MasterKey::from_key(&test_key());
        let clear_bytes = clear.to_bytes().await;
        let reloaded = MasterKey::from_bytes(&clear_bytes).unwrap();
        assert!(!reloaded.is_encrypted().await);

        let encrypted = MasterKey::from_key(&test_key());
        encrypted.encrypt(b"hunter2").await.unwrap();
        let encrypted_bytes = encrypted.to_bytes().await;
        let reloaded = MasterKey::from_bytes(&encrypted_bytes).unwrap();
        assert!(reloaded.is_encrypted().await);
        assert_eq!(reloaded.decrypt(b"hunter2").await.unwrap(), test_key());
    }
}

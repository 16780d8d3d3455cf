//! Wallet id and API token derivation, byte-exact per spec §4.1.

use bitcoin::{
    bip32::{ChildNumber, Xpriv, Xpub},
    secp256k1::Secp256k1,
};
use wallet_common::Network;
use wallet_crypto::{hash160, hash256};

use crate::error::Result;

/// The 3-byte prefix this wallet format uses ahead of the HASH160 payload,
/// chosen so the resulting base58check string begins with `WLT`.
pub const WALLET_ID_PREFIX: [u8; 3] = [0x03, 0xbe, 0x04];

/// `getID()`: derives the wallet's public identifier from the master key's
/// non-hardened child 44 and the network magic.
///
/// 1. `pub := publicKey(master.derive(44))`
/// 2. `hash := RIPEMD160(SHA256(pub || u32LE(network.magic)))`
/// 3. `payload := 0x03 || 0xbe || 0x04 || hash`
/// 4. append `checksum := SHA256(SHA256(payload))[0..4]`, base58-encode.
pub fn get_id(master: &Xpriv, network: Network) -> Result<String> {
    let secp = Secp256k1::new();
    let child = master.derive_priv(&secp, &[ChildNumber::from_normal_idx(44)?])?;
    let pubkey = Xpub::from_priv(&secp, &child).public_key;

    let mut preimage = pubkey.serialize().to_vec();
    preimage.extend_from_slice(&network.magic().to_le_bytes());
    let hash = hash160(&preimage);

    let mut payload = WALLET_ID_PREFIX.to_vec();
    payload.extend_from_slice(&hash);

    let checksum = hash256(&payload);
    payload.extend_from_slice(&checksum[..4]);

    Ok(bs58::encode(payload).into_string())
}

/// `getToken(master, nonce)` = `SHA256(SHA256(privkey(master.derive(44',
/// hardened)) || u32LE(nonce)))`.
pub fn get_token(master: &Xpriv, nonce: u32) -> Result<[u8; 32]> {
    let secp = Secp256k1::new();
    let child = master.derive_priv(&secp, &[ChildNumber::from_hardened_idx(44)?])?;

    let mut preimage = child.private_key.secret_bytes().to_vec();
    preimage.extend_from_slice(&nonce.to_le_bytes());

    Ok(hash256(&preimage))
}

#[cfg(test)]
mod tests {
    use bitcoin::Network as BtcNetwork;

    use super::*;

    fn test_master(seed: &[u8]) -> Xpriv {
        Xpriv::new_master(BtcNetwork::Bitcoin, seed).unwrap()
    }

    #[test]
    fn id_is_deterministic_for_fixed_master() {
        let master = test_master(b"abandon abandon abandon about seed bytes!!");
        let a = get_id(&master, Network::Bitcoin).unwrap();
        let b = get_id(&master, Network::Bitcoin).unwrap();
        assert_eq!(a, b);
        // base58check payloads starting with 0x03 0xbe 0x04 always decode
        // to a string starting with "WLT" on mainnet-style prefixes.
        assert!(a.starts_with("WLT"), "unexpected prefix: {a}");
    }

    #[test]
    fn id_depends_on_network_magic() {
        let master = test_master(b"abandon abandon abandon about seed bytes!!");
        let mainnet_id = get_id(&master, Network::Bitcoin).unwrap();
        let testnet_id = get_id(&master, Network::Testnet).unwrap();
        assert_ne!(mainnet_id, testnet_id);
    }

    #[test]
    fn token_changes_with_nonce() {
        let master = test_master(b"abandon abandon abandon about seed bytes!!");
        let t0 = get_token(&master, 0).unwrap();
        let t1 = get_token(&master, 1).unwrap();
        assert_ne!(t0, t1);
    }

    #[test]
    fn token_is_pure_function_of_inputs() {
        let master = test_master(b"abandon abandon abandon about seed bytes!!");
        let a = get_token(&master, 7).unwrap();
        let b = get_token(&master, 7).unwrap();
        assert_eq!(a, b);
    }
}

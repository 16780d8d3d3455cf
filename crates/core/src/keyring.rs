use bitcoin::{
    bip32::{ChildNumber, Xpub},
    opcodes::all::OP_CHECKMULTISIG,
    script::Builder,
    secp256k1::{Secp256k1, Verification},
    Address, PublicKey, ScriptBuf,
};
use wallet_common::{Network, ScriptType};

use crate::error::{Error, Result};

/// A keyring is a derived artifact, never persisted directly: the material
/// needed to recognize and redeem outputs at one derivation path. See
/// spec §3 "Keyring".
#[derive(Clone, Debug)]
pub struct Keyring {
    /// The account's own derived public key at this path (`keys[0]`
    /// derived, per spec's invariant that `accountKey` is always element
    /// 0 of the cosigner set).
    pub public_key: PublicKey,
    /// Every cosigner's derived public key, in `keys[]` order, including
    /// `public_key` as element 0. Empty for non-multisig accounts.
    pub cosigner_public_keys: Vec<PublicKey>,
    /// Redeem/witness script for P2SH or P2WSH multisig. `None` for
    /// single-key accounts.
    pub script: Option<ScriptBuf>,
    /// The spendable script pubkey.
    pub script_pubkey: ScriptBuf,
    /// 20 bytes (HASH160) for P2PKH/P2WPKH/P2SH, 32 bytes (SHA256) for
    /// P2WSH. This is the value reverse-indexed by the wallet.
    pub hash: Vec<u8>,
}

impl Keyring {
    pub fn address(&self, network: Network) -> Result<Address> {
        Address::from_script(&self.script_pubkey, bitcoin::Network::from(network))
            .map_err(|_| Error::InvalidAddress)
    }
}

fn derive_child_pub<C: Verification>(
    secp: &Secp256k1<C>,
    key: &Xpub,
    change: bool,
    index: u32,
) -> Result<PublicKey> {
    let path = [
        ChildNumber::from_normal_idx(change as u32)?,
        ChildNumber::from_normal_idx(index)?,
    ];
    let child = key.derive_pub(secp, &path)?;
    Ok(PublicKey::new(child.public_key))
}

/// Derives the keyring for one `(change, index)` path of an account.
///
/// `account_key` is the account's own extended public key. `cosigner_keys`
/// is the account's full `keys[]` set (including `account_key` itself as
/// element 0) when `script_type == Multisig`; ignored otherwise.
pub fn derive(
    account_key: &Xpub,
    cosigner_keys: &[Xpub],
    change: bool,
    index: u32,
    script_type: ScriptType,
    witness: bool,
    m: u8,
) -> Result<Keyring> {
    let secp = Secp256k1::verification_only();
    let public_key = derive_child_pub(&secp, account_key, change, index)?;

    match script_type {
        ScriptType::PubkeyHash => {
            let (script_pubkey, hash) = if witness {
                let wpkh = public_key.wpubkey_hash().map_err(|_| Error::InvalidAddress)?;
                (ScriptBuf::new_p2wpkh(&wpkh), wpkh.to_byte_array().to_vec())
            } else {
                let pkh = public_key.pubkey_hash();
                (ScriptBuf::new_p2pkh(&pkh), pkh.to_byte_array().to_vec())
            };

            Ok(Keyring {
                public_key,
                cosigner_public_keys: Vec::new(),
                script: None,
                script_pubkey,
                hash,
            })
        }
        ScriptType::Multisig => {
            let cosigner_public_keys = cosigner_keys
                .iter()
                .map(|key| derive_child_pub(&secp, key, change, index))
                .collect::<Result<Vec<_>>>()?;

            let n = cosigner_public_keys.len();
            let mut builder = Builder::new().push_int(m as i64);
            for key in &cosigner_public_keys {
                builder = builder.push_key(key);
            }
            let redeem_script = builder
                .push_int(n as i64)
                .push_opcode(OP_CHECKMULTISIG)
                .into_script();

            let (script_pubkey, hash) = if witness {
                let wsh = redeem_script.wscript_hash();
                (ScriptBuf::new_p2wsh(&wsh), wsh.to_byte_array().to_vec())
            } else {
                let sh = redeem_script.script_hash();
                (ScriptBuf::new_p2sh(&sh), sh.to_byte_array().to_vec())
            };

            Ok(Keyring {
                public_key,
                cosigner_public_keys,
                script: Some(redeem_script),
                script_pubkey,
                hash,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        bip32::{DerivationPath, Xpriv},
        Network as BtcNetwork,
    };

    use super::*;

    fn test_account_key(seed: &[u8]) -> Xpub {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(BtcNetwork::Testnet, seed).unwrap();
        let path: DerivationPath = "m/44'/1'/0'".parse().unwrap();
        let account_xprv = master.derive_priv(&secp, &path).unwrap();
        Xpub::from_priv(&secp, &account_xprv)
    }

    #[test]
    fn pubkeyhash_is_deterministic_and_20_bytes() {
        let key = test_account_key(b"deterministic-test-seed-0123456");
        let ring = derive(&key, &[], false, 0, ScriptType::PubkeyHash, true, 1).unwrap();
        assert_eq!(ring.hash.len(), 20);

        let ring_again = derive(&key, &[], false, 0, ScriptType::PubkeyHash, true, 1).unwrap();
        assert_eq!(ring.hash, ring_again.hash);
    }

    #[test]
    fn different_indexes_produce_different_hashes() {
        let key = test_account_key(b"deterministic-test-seed-0123456");
        let a = derive(&key, &[], false, 0, ScriptType::PubkeyHash, true, 1).unwrap();
        let b = derive(&key, &[], false, 1, ScriptType::PubkeyHash, true, 1).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn multisig_witness_hash_is_32_bytes() {
        let key1 = test_account_key(b"deterministic-test-seed-cosign1");
        let key2 = test_account_key(b"deterministic-test-seed-cosign2");
        let ring = derive(&key1, &[key1, key2], false, 0, ScriptType::Multisig, true, 2).unwrap();
        assert_eq!(ring.hash.len(), 32);
        assert!(ring.script.is_some());
    }

    #[test]
    fn multisig_legacy_hash_is_20_bytes() {
        let key1 = test_account_key(b"deterministic-test-seed-cosign1");
        let key2 = test_account_key(b"deterministic-test-seed-cosign2");
        let ring = derive(&key1, &[key1, key2], false, 0, ScriptType::Multisig, false, 2).unwrap();
        assert_eq!(ring.hash.len(), 20);
    }
}

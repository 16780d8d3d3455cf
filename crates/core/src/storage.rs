//! The `WalletDB` collaborator of spec §6: register/batch/save/lookup,
//! plus an in-memory test double with the same batch-atomicity
//! discipline the real implementation must honor.

use std::collections::{HashMap, HashSet};

use bitcoin::{OutPoint, Transaction};
use tokio::sync::Mutex;
use wallet_common::async_trait_impl;

use crate::account::Account;
use crate::error::{Error, Result};
use crate::path::Path;
use crate::serialize::{
    read_u32_le, read_u8, read_varbytes, read_varstring, write_u32_le, write_u8, write_varbytes,
    write_varstring,
};

/// Everything about a wallet except its live accounts and MasterKey
/// object, in the exact byte layout spec §6 names for the wallet record.
#[derive(Clone, Debug)]
pub struct WalletRecord {
    pub wid: u32,
    pub network_magic: u32,
    pub id: String,
    pub initialized: bool,
    pub account_depth: u32,
    pub token: [u8; 32],
    pub token_depth: u32,
    pub master_bytes: Vec<u8>,
}

impl WalletRecord {
    /// `[network_magic:u32LE][wid:u32LE][varstring id][initialized:u8]
    /// [accountDepth:u32LE][token:32 bytes][tokenDepth:u32LE]
    /// [varbytes master_record]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_u32_le(&mut buf, self.network_magic);
        write_u32_le(&mut buf, self.wid);
        write_varstring(&mut buf, &self.id);
        write_u8(&mut buf, self.initialized as u8);
        write_u32_le(&mut buf, self.account_depth);
        buf.extend_from_slice(&self.token);
        write_u32_le(&mut buf, self.token_depth);
        write_varbytes(&mut buf, &self.master_bytes);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let network_magic = read_u32_le(data, &mut pos)?;
        let wid = read_u32_le(data, &mut pos)?;
        let id = read_varstring(data, &mut pos)?;
        let initialized = read_u8(data, &mut pos)? != 0;
        let account_depth = read_u32_le(data, &mut pos)?;
        let token_bytes = data
            .get(pos..pos + 32)
            .ok_or_else(|| Error::Database("truncated wallet record (token)".into()))?;
        let token: [u8; 32] = token_bytes.try_into().unwrap();
        pos += 32;
        let token_depth = read_u32_le(data, &mut pos)?;
        let master_bytes = read_varbytes(data, &mut pos)?;

        Ok(Self {
            wid,
            network_magic,
            id,
            initialized,
            account_depth,
            token,
            token_depth,
            master_bytes,
        })
    }
}

async_trait_impl! {
pub trait WalletDb: Send + Sync {
    async fn register(&self, record: WalletRecord) -> Result<()>;
    async fn unregister(&self, wid: u32) -> Result<()>;

    async fn start(&self, wid: u32) -> Result<()>;
    async fn commit(&self, wid: u32) -> Result<()>;
    /// Named `abort` rather than `drop` (a reserved word); corresponds to
    /// spec §4.1's `db.drop(wid)`.
    async fn abort(&self, wid: u32) -> Result<()>;

    async fn save_wallet(&self, record: WalletRecord) -> Result<()>;
    async fn save_account(&self, wid: u32, account: Account) -> Result<()>;
    /// Indexes `(address_hash, path)` pairs into the reverse address
    /// index. Corresponds to spec §6's `saveAddress(wid, keyrings[])`;
    /// the core only ever needs a keyring's hash and path for indexing,
    /// so callers pass those two fields rather than a whole `Keyring`.
    async fn save_addresses(&self, wid: u32, entries: Vec<(Vec<u8>, Path)>) -> Result<()>;

    async fn get_wallet(&self, wid: u32) -> Result<WalletRecord>;
    async fn get_account(&self, wid: u32, account_index: u32) -> Result<Account>;
    async fn has_account(&self, wid: u32, account_index: u32) -> Result<bool>;
    async fn get_accounts(&self, wid: u32) -> Result<Vec<Account>>;

    async fn get_address_path(&self, wid: u32, hash: &[u8]) -> Result<Option<Path>>;
    async fn get_wallet_paths(&self, wid: u32) -> Result<Vec<Path>>;
    async fn get_address_paths(&self, hash: &[u8]) -> Result<Vec<Path>>;
    async fn has_address(&self, wid: u32, hash: &[u8]) -> Result<bool>;

    /// spec §4.4/§6 `addTX(tx)`: records a sent transaction's spent
    /// outpoints so they stay excluded from future coin selection across
    /// an `open` — the runtime `lockedCoins` table alone only covers
    /// coins reserved within the current process.
    async fn add_tx(&self, wid: u32, tx: Transaction) -> Result<()>;
    async fn get_spent_outpoints(&self, wid: u32) -> Result<HashSet<OutPoint>>;
}
}

#[derive(Clone, Default)]
struct Snapshot {
    wallets: HashMap<u32, WalletRecord>,
    accounts: HashMap<(u32, u32), Account>,
    paths_by_hash: HashMap<Vec<u8>, Vec<Path>>,
    spent_outpoints: HashMap<u32, HashSet<OutPoint>>,
}

/// A test double with the same start/commit/abort batch semantics the
/// real database must provide: mutations during an open batch are
/// invisible to readers until `commit`, and `abort` discards them
/// wholesale. Grounded on the teacher's `MemoryDatabase` used throughout
/// its account/transaction-builder unit tests.
#[derive(Default)]
pub struct InMemoryWalletDb {
    committed: Mutex<Snapshot>,
    staging: Mutex<HashMap<u32, Snapshot>>,
}

impl InMemoryWalletDb {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_staged<R>(&self, wid: u32, f: impl FnOnce(&mut Snapshot) -> R) -> Result<R> {
        let mut staging = self.staging.lock().await;
        let snapshot = staging
            .get_mut(&wid)
            .ok_or_else(|| Error::Database("no open batch for this wallet".into()))?;
        Ok(f(snapshot))
    }
}

async_trait_impl! {
impl WalletDb for InMemoryWalletDb {
    async fn register(&self, record: WalletRecord) -> Result<()> {
        let mut committed = self.committed.lock().await;
        committed.wallets.insert(record.wid, record);
        Ok(())
    }

    async fn unregister(&self, wid: u32) -> Result<()> {
        let mut committed = self.committed.lock().await;
        committed.wallets.remove(&wid);
        committed.accounts.retain(|(w, _), _| *w != wid);
        for paths in committed.paths_by_hash.values_mut() {
            paths.retain(|p| p.wid != wid);
        }
        committed.spent_outpoints.remove(&wid);
        Ok(())
    }

    async fn start(&self, wid: u32) -> Result<()> {
        let committed = self.committed.lock().await.clone();
        self.staging.lock().await.insert(wid, committed);
        Ok(())
    }

    async fn commit(&self, wid: u32) -> Result<()> {
        let staged = self
            .staging
            .lock()
            .await
            .remove(&wid)
            .ok_or_else(|| Error::Database("no open batch for this wallet".into()))?;
        *self.committed.lock().await = staged;
        Ok(())
    }

    async fn abort(&self, wid: u32) -> Result<()> {
        self.staging.lock().await.remove(&wid);
        Ok(())
    }

    async fn save_wallet(&self, record: WalletRecord) -> Result<()> {
        self.with_staged(record.wid, |s| {
            s.wallets.insert(record.wid, record);
        })
        .await
    }

    async fn save_account(&self, wid: u32, account: Account) -> Result<()> {
        self.with_staged(wid, |s| {
            s.accounts.insert((wid, account.account_index), account);
        })
        .await
    }

    async fn save_addresses(&self, wid: u32, entries: Vec<(Vec<u8>, Path)>) -> Result<()> {
        self.with_staged(wid, |s| {
            for (hash, path) in entries {
                s.paths_by_hash.entry(hash).or_default().push(path);
            }
        })
        .await
    }

    async fn get_wallet(&self, wid: u32) -> Result<WalletRecord> {
        self.committed
            .lock()
            .await
            .wallets
            .get(&wid)
            .cloned()
            .ok_or(Error::NotInitialized)
    }

    async fn get_account(&self, wid: u32, account_index: u32) -> Result<Account> {
        self.committed
            .lock()
            .await
            .accounts
            .get(&(wid, account_index))
            .cloned()
            .ok_or(Error::AccountNotFound)
    }

    async fn has_account(&self, wid: u32, account_index: u32) -> Result<bool> {
        Ok(self
            .committed
            .lock()
            .await
            .accounts
            .contains_key(&(wid, account_index)))
    }

    async fn get_accounts(&self, wid: u32) -> Result<Vec<Account>> {
        Ok(self
            .committed
            .lock()
            .await
            .accounts
            .iter()
            .filter(|((w, _), _)| *w == wid)
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn get_address_path(&self, wid: u32, hash: &[u8]) -> Result<Option<Path>> {
        Ok(self
            .committed
            .lock()
            .await
            .paths_by_hash
            .get(hash)
            .and_then(|paths| paths.iter().find(|p| p.wid == wid).copied()))
    }

    async fn get_wallet_paths(&self, wid: u32) -> Result<Vec<Path>> {
        Ok(self
            .committed
            .lock()
            .await
            .paths_by_hash
            .values()
            .flatten()
            .filter(|p| p.wid == wid)
            .copied()
            .collect())
    }

    async fn get_address_paths(&self, hash: &[u8]) -> Result<Vec<Path>> {
        Ok(self
            .committed
            .lock()
            .await
            .paths_by_hash
            .get(hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn has_address(&self, wid: u32, hash: &[u8]) -> Result<bool> {
        Ok(self
            .committed
            .lock()
            .await
            .paths_by_hash
            .get(hash)
            .map(|paths| paths.iter().any(|p| p.wid == wid))
            .unwrap_or(false))
    }

    async fn add_tx(&self, wid: u32, tx: Transaction) -> Result<()> {
        self.with_staged(wid, |s| {
            let spent = s.spent_outpoints.entry(wid).or_default();
            for input in &tx.input {
                spent.insert(input.previous_output);
            }
        })
        .await
    }

    async fn get_spent_outpoints(&self, wid: u32) -> Result<HashSet<OutPoint>> {
        Ok(self
            .committed
            .lock()
            .await
            .spent_outpoints
            .get(&wid)
            .cloned()
            .unwrap_or_default())
    }
}
}

#[cfg(test)]
mod tests {
    use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::Network as BtcNetwork;

    use super::*;

    fn test_account_key() -> Xpub {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(BtcNetwork::Testnet, b"storage-test-seed-bytes-0000000!").unwrap();
        let path: DerivationPath = "m/44'/1'/0'".parse().unwrap();
        let xprv = master.derive_priv(&secp, &path).unwrap();
        Xpub::from_priv(&secp, &xprv)
    }

    fn test_record(wid: u32) -> WalletRecord {
        WalletRecord {
            wid,
            network_magic: 0xD9B4BEF9,
            id: "WLTexample".into(),
            initialized: true,
            account_depth: 1,
            token: [7u8; 32],
            token_depth: 0,
            master_bytes: vec![0u8],
        }
    }

    #[test]
    fn wallet_record_round_trips() {
        let record = test_record(1);
        let bytes = record.to_bytes();
        let reloaded = WalletRecord::from_bytes(&bytes).unwrap();
        assert_eq!(reloaded.wid, record.wid);
        assert_eq!(reloaded.id, record.id);
        assert_eq!(reloaded.token, record.token);
    }

    #[tokio::test]
    async fn aborted_batch_leaves_committed_state_untouched() {
        let db = InMemoryWalletDb::new();
        db.register(test_record(1)).await.unwrap();

        db.start(1).await.unwrap();
        let account = Account::new(0, "default", test_account_key(), 1, 1, true).unwrap();
        db.save_account(1, account).await.unwrap();
        db.abort(1).await.unwrap();

        assert!(!db.has_account(1, 0).await.unwrap());
    }

    #[tokio::test]
    async fn committed_batch_is_visible_after_commit() {
        let db = InMemoryWalletDb::new();
        db.register(test_record(1)).await.unwrap();

        db.start(1).await.unwrap();
        let account = Account::new(0, "default", test_account_key(), 1, 1, true).unwrap();
        db.save_account(1, account).await.unwrap();
        db.commit(1).await.unwrap();

        assert!(db.has_account(1, 0).await.unwrap());
    }

    #[tokio::test]
    async fn save_without_open_batch_errors() {
        let db = InMemoryWalletDb::new();
        let account = Account::new(0, "default", test_account_key(), 1, 1, true).unwrap();
        assert!(db.save_account(1, account).await.is_err());
    }

    #[tokio::test]
    async fn saved_addresses_are_reverse_indexed_after_commit() {
        let db = InMemoryWalletDb::new();
        db.register(test_record(1)).await.unwrap();

        db.start(1).await.unwrap();
        let hash = vec![9u8; 20];
        let path = Path::new(1, 0, false, 3);
        db.save_addresses(1, vec![(hash.clone(), path)])
            .await
            .unwrap();
        db.commit(1).await.unwrap();

        assert!(db.has_address(1, &hash).await.unwrap());
        assert_eq!(db.get_address_path(1, &hash).await.unwrap(), Some(path));
    }

    #[tokio::test]
    async fn add_tx_persists_spent_outpoints_across_batches() {
        use bitcoin::absolute::LockTime;
        use bitcoin::hashes::Hash;
        use bitcoin::transaction::Version;
        use bitcoin::{ScriptBuf, Sequence, Transaction as BtcTransaction, TxIn, Txid, Witness};

        let db = InMemoryWalletDb::new();
        db.register(test_record(1)).await.unwrap();

        let outpoint = OutPoint::new(Txid::all_zeros(), 0);
        let tx = BtcTransaction {
            version: Version::non_standard(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![],
        };

        db.start(1).await.unwrap();
        db.add_tx(1, tx).await.unwrap();
        db.commit(1).await.unwrap();

        let spent = db.get_spent_outpoints(1).await.unwrap();
        assert!(spent.contains(&outpoint));
    }
}

//! Top-level wallet identity, account lifecycle, and funding/signing
//! orchestration. See spec §4.1, §4.4, §5.
//!
//! `write_lock` (modeled as the mutex guarding `WalletState`) serializes
//! every operation that mutates persisted state. `fund_lock` serializes
//! `fund`/`createTX`/`send`; `locked_coins` is the runtime reservation
//! table it protects for coins not yet spent on chain (spec §5 "Shared
//! resources"). `send` also records the spent outpoints via
//! `WalletDb::add_tx`, so the exclusion survives an `open` — `fund`
//! consults both tables. A `force` parameter on `fund` lets
//! `send`/`createTX`, which already hold `fund_lock` for the whole
//! sequence, recurse into `fund` without re-acquiring it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{OutPoint, Transaction, TxOut};
use tokio::sync::Mutex;
use wallet_common::Network;

use crate::account::Account;
use crate::error::{Error, Result};
use crate::events::{Event, EventSink};
use crate::id::{get_id, get_token};
use crate::keyring::Keyring;
use crate::master_key::{MasterKey, DEFAULT_UNLOCK_TIMEOUT_MS};
use crate::path::Path;
use crate::storage::{WalletDb, WalletRecord};
use crate::transaction_builder::{
    CoinSource, FeeEstimator, FundOptions, InlineWorkerPool, Mtx, SigningJob, SigningWorkerPool,
};

pub struct InitOptions {
    pub passphrase: Option<Vec<u8>>,
    pub witness: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            passphrase: None,
            witness: true,
        }
    }
}

pub struct CreateAccountOptions {
    pub name: String,
    pub m: u8,
    pub n: u8,
    pub witness: bool,
}

pub struct CreateTxOptions {
    pub account_index: Option<u32>,
    pub outputs: Vec<TxOut>,
    pub fund: FundOptions,
}

#[derive(Clone, Copy, Debug)]
pub struct SignOptions {
    pub sighash_type: EcdsaSighashType,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            sighash_type: EcdsaSighashType::All,
        }
    }
}

/// Everything mutated by a write-locked operation, guarded by one mutex
/// (spec §5 `writeLock`). Only account 0 is guaranteed resident after
/// `open`; other accounts load lazily on first touch.
struct WalletState {
    id: String,
    initialized: bool,
    account_depth: u32,
    token: [u8; 32],
    token_depth: u32,
    accounts: HashMap<u32, Account>,
}

pub struct Wallet<D: WalletDb, C: CoinSource, F: FeeEstimator> {
    wid: u32,
    network: Network,
    master: MasterKey,
    state: Mutex<WalletState>,
    /// `fundLock`'s runtime reservation table. Complements, not
    /// replaces, `WalletDb`'s persisted spent-outpoint record (spec §5).
    locked_coins: Mutex<HashSet<OutPoint>>,
    fund_lock: Mutex<()>,
    db: Arc<D>,
    coin_source: Arc<C>,
    fee_estimator: Arc<F>,
    events: Arc<dyn EventSink>,
    worker_pool: Arc<dyn SigningWorkerPool>,
}

impl<D: WalletDb, C: CoinSource, F: FeeEstimator> Wallet<D, C, F> {
    /// **init**: one-shot. Derives `id`/`token` from `root`, optionally
    /// encrypts the master, creates account 0 ("default"), and persists
    /// everything in one batch. Fails `AlreadyInitialized` if `wid` is
    /// already registered. Signs on `InlineWorkerPool` unless
    /// [`Wallet::with_worker_pool`] is called afterward.
    #[allow(clippy::too_many_arguments)]
    pub async fn init(
        wid: u32,
        network: Network,
        root: &Xpriv,
        options: InitOptions,
        db: Arc<D>,
        coin_source: Arc<C>,
        fee_estimator: Arc<F>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let span = tracing::info_span!("init", wid);
        let _enter = span.enter();

        if db.get_wallet(wid).await.is_ok() {
            return Err(Error::AlreadyInitialized);
        }

        let id = get_id(root, network)?;
        let master = MasterKey::from_key(root);
        if let Some(passphrase) = &options.passphrase {
            master.encrypt(passphrase).await?;
        }

        let token_depth = 0;
        let token = get_token(root, token_depth)?;

        let secp = Secp256k1::new();
        let path = account_derivation_path(44, network.bip44_coin_type(), 0)?;
        let account_xprv = root.derive_priv(&secp, &path)?;
        let account_key = Xpub::from_priv(&secp, &account_xprv);
        let mut account = Account::new(0, "default", account_key, 1, 1, options.witness)?;
        let derived = account.set_depth(wid, 1, 1)?;

        let mut accounts = HashMap::new();
        accounts.insert(0, account.clone());

        let wallet = Self {
            wid,
            network,
            master,
            state: Mutex::new(WalletState {
                id,
                initialized: true,
                account_depth: 1,
                token,
                token_depth,
                accounts,
            }),
            locked_coins: Mutex::new(HashSet::new()),
            fund_lock: Mutex::new(()),
            db,
            coin_source,
            fee_estimator,
            events,
            worker_pool: Arc::new(InlineWorkerPool),
        };

        let record = wallet.to_record(&*wallet.state.lock().await).await;
        wallet.db.register(record).await?;

        tracing::debug!(wid, "starting batch");
        wallet.db.start(wid).await?;
        let result: Result<()> = async {
            wallet.db.save_account(wid, account.clone()).await?;
            let entries: Vec<(Vec<u8>, Path)> =
                derived.iter().map(|(p, k)| (k.hash.clone(), *p)).collect();
            wallet.db.save_addresses(wid, entries).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                wallet.db.commit(wid).await?;
                Ok(wallet)
            }
            Err(e) => {
                tracing::warn!(wid, %e, "aborting batch");
                let _ = wallet.db.abort(wid).await;
                Err(e)
            }
        }
    }

    /// **open**: reattach a persisted wallet, loading account 0 into
    /// cache (other accounts load lazily).
    pub async fn open(
        wid: u32,
        network: Network,
        db: Arc<D>,
        coin_source: Arc<C>,
        fee_estimator: Arc<F>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let span = tracing::info_span!("open", wid);
        let _enter = span.enter();

        let record = db.get_wallet(wid).await?;
        let master = MasterKey::from_bytes(&record.master_bytes)?;
        let account = db.get_account(wid, 0).await?;

        let mut accounts = HashMap::new();
        accounts.insert(0, account);

        Ok(Self {
            wid,
            network,
            master,
            state: Mutex::new(WalletState {
                id: record.id,
                initialized: record.initialized,
                account_depth: record.account_depth,
                token: record.token,
                token_depth: record.token_depth,
                accounts,
            }),
            locked_coins: Mutex::new(HashSet::new()),
            fund_lock: Mutex::new(()),
            db,
            coin_source,
            fee_estimator,
            events,
            worker_pool: Arc::new(InlineWorkerPool),
        })
    }

    /// Overrides the default `InlineWorkerPool` — e.g. with
    /// `TokioWorkerPool` to keep signing off the caller's async task.
    pub fn with_worker_pool(mut self, worker_pool: Arc<dyn SigningWorkerPool>) -> Self {
        self.worker_pool = worker_pool;
        self
    }

    /// **destroy**: unregister from the database and zero the decrypted
    /// master. Per spec §5, undefined persistence if called while other
    /// operations are in flight — this is the caller's responsibility.
    pub async fn destroy(&self) -> Result<()> {
        let span = tracing::info_span!("destroy", wid = self.wid);
        let _enter = span.enter();
        self.master.destroy().await;
        self.db.unregister(self.wid).await
    }

    pub fn wid(&self) -> u32 {
        self.wid
    }

    pub async fn id(&self) -> String {
        self.state.lock().await.id.clone()
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.initialized
    }

    pub async fn account_depth(&self) -> u32 {
        self.state.lock().await.account_depth
    }

    pub async fn token(&self) -> ([u8; 32], u32) {
        let state = self.state.lock().await;
        (state.token, state.token_depth)
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if self.state.lock().await.initialized {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    async fn ensure_account_loaded(&self, state: &mut WalletState, index: u32) -> Result<()> {
        if !state.accounts.contains_key(&index) {
            let account = self.db.get_account(self.wid, index).await?;
            state.accounts.insert(index, account);
        }
        Ok(())
    }

    async fn to_record(&self, state: &WalletState) -> WalletRecord {
        WalletRecord {
            wid: self.wid,
            network_magic: self.network.magic(),
            id: state.id.clone(),
            initialized: state.initialized,
            account_depth: state.account_depth,
            token: state.token,
            token_depth: state.token_depth,
            master_bytes: self.master.to_bytes().await,
        }
    }

    /// **createAccount**: derives `master → m/purpose'/coin'/accountDepth'`
    /// (purpose 44' single-key, 87' multisig), builds the Account, runs
    /// its first depth advancement if the key set is already full (the
    /// `n == 1` case), and persists. Requires the master unlocked.
    pub async fn create_account(&self, options: CreateAccountOptions) -> Result<u32> {
        self.ensure_initialized().await?;
        let master = self.master.peek().await.ok_or(Error::MasterLocked)?;
        let mut state = self.state.lock().await;
        let account_index = state.account_depth;
        let span = tracing::info_span!("create_account", wid = self.wid, account_index);
        let _enter = span.enter();

        let purpose = if options.n > 1 { 87 } else { 44 };
        let secp = Secp256k1::new();
        let path = account_derivation_path(purpose, self.network.bip44_coin_type(), account_index)?;
        let account_xprv = master.derive_priv(&secp, &path)?;
        let account_key = Xpub::from_priv(&secp, &account_xprv);
        let mut account = Account::new(
            account_index,
            options.name,
            account_key,
            options.m,
            options.n,
            options.witness,
        )?;

        tracing::debug!(wid = self.wid, "starting batch");
        self.db.start(self.wid).await?;
        let result: Result<()> = async {
            let derived = if account.is_key_set_full() {
                account.set_depth(self.wid, 1, 1)?
            } else {
                Vec::new()
            };
            let entries: Vec<(Vec<u8>, Path)> =
                derived.iter().map(|(p, k)| (k.hash.clone(), *p)).collect();
            self.db.save_addresses(self.wid, entries).await?;
            self.db.save_account(self.wid, account.clone()).await?;
            state.account_depth += 1;
            let record = self.to_record(&state).await;
            self.db.save_wallet(record).await?;
            state.accounts.insert(account_index, account.clone());
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.db.commit(self.wid).await?;
                Ok(account_index)
            }
            Err(e) => {
                tracing::warn!(wid = self.wid, %e, "aborting batch");
                let _ = self.db.abort(self.wid).await;
                Err(e)
            }
        }
    }

    /// **addKey**: multisig only. Before the push would complete the key
    /// set, checks whether the resulting `(change=0, index=0)` address
    /// already belongs to a different account of this wallet (spec
    /// §4.2 "Key-set integrity") and refuses with `SharedScript` if so —
    /// without mutating the account. If the push completes the set, runs
    /// the first depth advancement.
    pub async fn add_key(&self, account_index: u32, key: Xpub) -> Result<()> {
        self.ensure_initialized().await?;
        let mut state = self.state.lock().await;
        let span = tracing::info_span!("add_key", wid = self.wid, account_index);
        let _enter = span.enter();

        self.ensure_account_loaded(&mut state, account_index).await?;

        tracing::debug!(wid = self.wid, "starting batch");
        self.db.start(self.wid).await?;
        let result: Result<()> = async {
            let account = state
                .accounts
                .get(&account_index)
                .expect("just loaded or already present");

            let mut candidate = account.clone();
            let completes_set = candidate.push_key(key)?;

            if completes_set {
                let candidate_ring = candidate.derive_keyring(false, 0)?;
                let colliding = self
                    .db
                    .get_address_paths(&candidate_ring.hash)
                    .await?
                    .into_iter()
                    .any(|p| p.wid == self.wid && p.account != account_index);
                if colliding {
                    return Err(Error::SharedScript);
                }
            }

            let account = state
                .accounts
                .get_mut(&account_index)
                .expect("just loaded or already present");
            account.push_key(key)?;
            let derived = if completes_set {
                account.set_depth(self.wid, 1, 1)?
            } else {
                Vec::new()
            };
            let entries: Vec<(Vec<u8>, Path)> =
                derived.iter().map(|(p, k)| (k.hash.clone(), *p)).collect();
            self.db.save_addresses(self.wid, entries).await?;
            self.db.save_account(self.wid, account.clone()).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.db.commit(self.wid).await?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(wid = self.wid, %e, "aborting batch");
                let _ = self.db.abort(self.wid).await;
                Err(e)
            }
        }
    }

    pub async fn remove_key(&self, account_index: u32, key: &Xpub) -> Result<()> {
        self.ensure_initialized().await?;
        let mut state = self.state.lock().await;
        let span = tracing::info_span!("remove_key", wid = self.wid, account_index);
        let _enter = span.enter();

        self.ensure_account_loaded(&mut state, account_index).await?;

        tracing::debug!(wid = self.wid, "starting batch");
        self.db.start(self.wid).await?;
        let result: Result<()> = async {
            let account = state
                .accounts
                .get_mut(&account_index)
                .expect("just loaded or already present");
            account.remove_key(key)?;
            self.db.save_account(self.wid, account.clone()).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.db.commit(self.wid).await?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(wid = self.wid, %e, "aborting batch");
                let _ = self.db.abort(self.wid).await;
                Err(e)
            }
        }
    }

    /// **setPassphrase**: decrypt-then-encrypt under the write lock. On
    /// failure (wrong `old` passphrase) the master state is unchanged,
    /// since `decrypt` never mutates on error.
    pub async fn set_passphrase(&self, old: Option<&[u8]>, new: &[u8]) -> Result<()> {
        self.ensure_initialized().await?;
        let _state = self.state.lock().await;
        let span = tracing::info_span!("set_passphrase", wid = self.wid);
        let _enter = span.enter();

        if self.master.is_encrypted().await {
            let old = old.ok_or(Error::BadPassphrase)?;
            self.master.decrypt(old).await?;
        }
        self.master.encrypt(new).await?;

        tracing::debug!(wid = self.wid, "starting batch");
        self.db.start(self.wid).await?;
        let record = self.to_record(&_state).await;
        let result = self.db.save_wallet(record).await;
        match result {
            Ok(()) => {
                self.db.commit(self.wid).await?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(wid = self.wid, %e, "aborting batch");
                let _ = self.db.abort(self.wid).await;
                Err(e)
            }
        }
    }

    /// **retoken**: increments `tokenDepth`, recomputes `token` from the
    /// (possibly transiently unlocked) master, and persists.
    pub async fn retoken(&self, passphrase: Option<&[u8]>) -> Result<()> {
        self.ensure_initialized().await?;
        let mut state = self.state.lock().await;
        let span = tracing::info_span!("retoken", wid = self.wid);
        let _enter = span.enter();

        let master = match self.master.peek().await {
            Some(key) => key,
            None => {
                let passphrase = passphrase.ok_or(Error::MasterLocked)?;
                self.master
                    .unlock(passphrase, Some(Duration::from_millis(DEFAULT_UNLOCK_TIMEOUT_MS)))
                    .await?
            }
        };

        tracing::debug!(wid = self.wid, "starting batch");
        self.db.start(self.wid).await?;
        let result: Result<()> = async {
            state.token_depth += 1;
            state.token = get_token(&master, state.token_depth)?;
            let record = self.to_record(&state).await;
            self.db.save_wallet(record).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.db.commit(self.wid).await?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(wid = self.wid, %e, "aborting batch");
                let _ = self.db.abort(self.wid).await;
                Err(e)
            }
        }
    }

    pub async fn unlock(&self, passphrase: &[u8], timeout: Option<Duration>) -> Result<()> {
        self.master.unlock(passphrase, timeout).await?;
        Ok(())
    }

    pub async fn lock(&self) -> Result<()> {
        self.master.lock().await
    }

    pub async fn get_path(&self, hash: &[u8]) -> Result<Option<Path>> {
        self.db.get_address_path(self.wid, hash).await
    }

    async fn account_snapshot(&self, index: u32) -> Result<Account> {
        let mut state = self.state.lock().await;
        self.ensure_account_loaded(&mut state, index).await?;
        Ok(state
            .accounts
            .get(&index)
            .expect("just loaded or already present")
            .clone())
    }

    /// **createReceive** / **createChange** / **createAddress**: advance
    /// one branch's depth by one through the account, persisting the
    /// newly derived addresses (plus lookahead).
    pub async fn create_address(&self, account_index: Option<u32>, change: bool) -> Result<Keyring> {
        self.ensure_initialized().await?;
        let index = account_index.unwrap_or(0);
        let mut state = self.state.lock().await;
        let span = tracing::info_span!("create_address", wid = self.wid, account_index = index, change);
        let _enter = span.enter();

        self.ensure_account_loaded(&mut state, index).await?;

        tracing::debug!(wid = self.wid, "starting batch");
        self.db.start(self.wid).await?;
        let result: Result<Keyring> = async {
            let account = state
                .accounts
                .get_mut(&index)
                .expect("just loaded or already present");
            let (new_receive, new_change) = if change {
                (account.receive_depth, account.change_depth + 1)
            } else {
                (account.receive_depth + 1, account.change_depth)
            };
            let derived = account.set_depth(self.wid, new_receive, new_change)?;
            let entries: Vec<(Vec<u8>, Path)> =
                derived.iter().map(|(p, k)| (k.hash.clone(), *p)).collect();
            self.db.save_addresses(self.wid, entries).await?;
            self.db.save_account(self.wid, account.clone()).await?;

            let ring = if change {
                account.change_address.clone().ok_or(Error::NotInitialized)?
            } else {
                account.receive_address.clone().ok_or(Error::NotInitialized)?
            };
            Ok(ring)
        }
        .await;

        match result {
            Ok(ring) => {
                self.db.commit(self.wid).await?;
                Ok(ring)
            }
            Err(e) => {
                tracing::warn!(wid = self.wid, %e, "aborting batch");
                let _ = self.db.abort(self.wid).await;
                Err(e)
            }
        }
    }

    pub async fn create_receive(&self, account_index: Option<u32>) -> Result<Keyring> {
        self.create_address(account_index, false).await
    }

    pub async fn create_change(&self, account_index: Option<u32>) -> Result<Keyring> {
        self.create_address(account_index, true).await
    }

    /// **fund**: see spec §4.4. `force` lets a caller already holding
    /// `fund_lock` (`createTX`/`send`) recurse without re-acquiring it.
    pub async fn fund(
        &self,
        mtx: &mut Mtx,
        account_index: Option<u32>,
        options: &FundOptions,
        force: bool,
    ) -> Result<()> {
        self.ensure_initialized().await?;
        if force {
            self.fund_inner(mtx, account_index, options).await
        } else {
            let _permit = self.fund_lock.lock().await;
            self.fund_inner(mtx, account_index, options).await
        }
    }

    async fn fund_inner(
        &self,
        mtx: &mut Mtx,
        account_index: Option<u32>,
        options: &FundOptions,
    ) -> Result<()> {
        let index = account_index.unwrap_or(0);
        let account = self.account_snapshot(index).await?;

        let mut locked_snapshot = self.locked_coins.lock().await.clone();
        locked_snapshot.extend(self.db.get_spent_outpoints(self.wid).await?);
        tracing::debug!(wid = self.wid, account_index = index, "funding transaction");
        mtx.fund(
            &*self.coin_source,
            &*self.fee_estimator,
            &account,
            self.wid,
            self.network,
            &locked_snapshot,
            options,
        )
        .await?;

        let mut locked = self.locked_coins.lock().await;
        for coin in &mtx.coins {
            locked.insert(coin.outpoint);
        }
        Ok(())
    }

    /// **createTX**: builds, funds (holding `fund_lock` for the whole
    /// call), BIP69-sorts, sanity-checks, and templates — without
    /// signing.
    pub async fn create_tx(&self, options: CreateTxOptions) -> Result<Mtx> {
        self.ensure_initialized().await?;
        let _permit = self.fund_lock.lock().await;
        self.create_tx_inner(options).await
    }

    async fn create_tx_inner(&self, options: CreateTxOptions) -> Result<Mtx> {
        let index = options.account_index.unwrap_or(0);
        let mut mtx = Mtx::new(options.outputs);
        self.fund_inner(&mut mtx, Some(index), &options.fund).await?;
        mtx.bip69_sort();
        mtx.check_transaction()?;
        mtx.check_inputs(options.fund.height)?;

        let account = self.account_snapshot(index).await?;
        mtx.script_inputs(&account)?;
        Ok(mtx)
    }

    pub async fn script_inputs(&self, mtx: &mut Mtx, account_index: Option<u32>) -> Result<()> {
        let account = self.account_snapshot(account_index.unwrap_or(0)).await?;
        mtx.script_inputs(&account)
    }

    /// **sign**: requires the master already unlocked (a passphrase-less
    /// `peek`, not a silent decrypt attempt) — `MasterLocked` otherwise.
    pub async fn sign(
        &self,
        mtx: &mut Mtx,
        account_index: Option<u32>,
        options: &SignOptions,
    ) -> Result<u32> {
        self.ensure_initialized().await?;
        self.sign_inner(mtx, account_index.unwrap_or(0), options).await
    }

    async fn sign_inner(&self, mtx: &mut Mtx, index: u32, options: &SignOptions) -> Result<u32> {
        let master = self.master.peek().await.ok_or(Error::MasterLocked)?;
        let account = self.account_snapshot(index).await?;

        tracing::debug!(wid = self.wid, account_index = index, "signing transaction");
        let outcome = self
            .worker_pool
            .run(SigningJob {
                mtx: mtx.clone(),
                account,
                master,
                coin_type: self.network.bip44_coin_type(),
                sighash_type: options.sighash_type,
            })
            .await?;
        *mtx = outcome.mtx;
        Ok(outcome.signed)
    }

    /// **send**: `createTX → sign → addTX → emit("send")`, all under
    /// `fund_lock`. Fails `NotFullySigned` without recording or emitting
    /// if signing left any input unsigned.
    pub async fn send(&self, options: CreateTxOptions, sign_options: &SignOptions) -> Result<Transaction> {
        self.ensure_initialized().await?;
        let index = options.account_index.unwrap_or(0);
        let _permit = self.fund_lock.lock().await;
        let span = tracing::info_span!("send", wid = self.wid, account_index = index);
        let _enter = span.enter();

        let mut mtx = self.create_tx_inner(options).await?;
        self.sign_inner(&mut mtx, index, sign_options).await?;
        if !mtx.is_fully_signed() {
            return Err(Error::NotFullySigned);
        }

        let tx = mtx.to_transaction();

        tracing::debug!(wid = self.wid, "starting batch");
        self.db.start(self.wid).await?;
        match self.db.add_tx(self.wid, tx.clone()).await {
            Ok(()) => self.db.commit(self.wid).await?,
            Err(e) => {
                tracing::warn!(wid = self.wid, %e, "aborting batch");
                let _ = self.db.abort(self.wid).await;
                return Err(e);
            }
        }

        self.events.emit(Event::Send(tx.clone()));
        Ok(tx)
    }

    /// **syncOutputDepth**: given paths matched on a confirmed
    /// transaction's outputs, raises each affected account's receive/
    /// change depth to `max(index) + 2` and emits an `address` event
    /// listing the newly derived receive addresses.
    pub async fn sync_output_depth(&self, matches: Vec<Path>) -> Result<()> {
        self.ensure_initialized().await?;
        if matches.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let span = tracing::info_span!("sync_output_depth", wid = self.wid);
        let _enter = span.enter();

        let mut max_receive: HashMap<u32, u32> = HashMap::new();
        let mut max_change: HashMap<u32, u32> = HashMap::new();
        for p in &matches {
            let table = if p.change { &mut max_change } else { &mut max_receive };
            table
                .entry(p.account)
                .and_modify(|m| *m = (*m).max(p.index))
                .or_insert(p.index);
        }
        let accounts: HashSet<u32> = max_receive.keys().chain(max_change.keys()).copied().collect();

        tracing::debug!(wid = self.wid, "starting batch");
        self.db.start(self.wid).await?;
        let result: Result<Vec<(Path, Keyring)>> = async {
            let mut new_receive_addresses = Vec::new();
            for account_index in accounts {
                self.ensure_account_loaded(&mut state, account_index).await?;
                let account = state
                    .accounts
                    .get_mut(&account_index)
                    .expect("just loaded or already present");

                let new_receive_depth = max_receive
                    .get(&account_index)
                    .map(|i| i + 2)
                    .unwrap_or(account.receive_depth);
                let new_change_depth = max_change
                    .get(&account_index)
                    .map(|i| i + 2)
                    .unwrap_or(account.change_depth);

                let derived = account.set_depth(self.wid, new_receive_depth, new_change_depth)?;
                let entries: Vec<(Vec<u8>, Path)> =
                    derived.iter().map(|(p, k)| (k.hash.clone(), *p)).collect();
                self.db.save_addresses(self.wid, entries).await?;
                self.db.save_account(self.wid, account.clone()).await?;
                new_receive_addresses.extend(derived.into_iter().filter(|(p, _)| !p.change));
            }
            Ok(new_receive_addresses)
        }
        .await;

        match result {
            Ok(new_receive_addresses) => {
                self.db.commit(self.wid).await?;
                self.events.emit(Event::Address {
                    wallet_id: state.id.clone(),
                    keyrings: new_receive_addresses,
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(wid = self.wid, %e, "aborting batch");
                let _ = self.db.abort(self.wid).await;
                Err(e)
            }
        }
    }
}

/// `m/purpose'/coin_type'/account_index'`.
fn account_derivation_path(purpose: u32, coin_type: u32, account_index: u32) -> Result<DerivationPath> {
    Ok(vec![
        ChildNumber::from_hardened_idx(purpose)?,
        ChildNumber::from_hardened_idx(coin_type)?,
        ChildNumber::from_hardened_idx(account_index)?,
    ]
    .into())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bitcoin::Network as BtcNetwork;

    use super::*;
    use crate::account::LOOKAHEAD;
    use crate::events::NullSink;
    use crate::storage::InMemoryWalletDb;
    use crate::transaction_builder::{InMemoryCoinSource, NoFeeEstimator};

    type TestWallet = Wallet<InMemoryWalletDb, InMemoryCoinSource, NoFeeEstimator>;

    fn test_root(seed: &[u8]) -> Xpriv {
        Xpriv::new_master(BtcNetwork::Bitcoin, seed).unwrap()
    }

    async fn new_test_wallet(wid: u32, seed: &[u8], options: InitOptions) -> TestWallet {
        let root = test_root(seed);
        Wallet::init(
            wid,
            Network::Bitcoin,
            &root,
            options,
            Arc::new(InMemoryWalletDb::new()),
            Arc::new(InMemoryCoinSource::new()),
            Arc::new(NoFeeEstimator),
            Arc::new(NullSink),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn init_creates_default_account_with_depth_one() {
        let wallet = new_test_wallet(1, b"wallet-test-seed-bytes-00000000!", InitOptions::default()).await;

        assert!(wallet.is_initialized().await);
        assert_eq!(wallet.account_depth().await, 1);

        let account = wallet.account_snapshot(0).await.unwrap();
        assert_eq!(account.receive_depth, 1);
        assert_eq!(account.change_depth, 1);

        let paths = wallet.db.get_wallet_paths(wallet.wid).await.unwrap();
        assert!(paths.len() >= 2 * (1 + LOOKAHEAD as usize));
    }

    #[tokio::test]
    async fn init_twice_on_the_same_wid_is_rejected() {
        let root = test_root(b"wallet-test-seed-bytes-00000001!");
        let db = Arc::new(InMemoryWalletDb::new());
        Wallet::init(
            1,
            Network::Bitcoin,
            &root,
            InitOptions::default(),
            db.clone(),
            Arc::new(InMemoryCoinSource::new()),
            Arc::new(NoFeeEstimator),
            Arc::new(NullSink),
        )
        .await
        .unwrap();

        let result = Wallet::init(
            1,
            Network::Bitcoin,
            &root,
            InitOptions::default(),
            db,
            Arc::new(InMemoryCoinSource::new()),
            Arc::new(NoFeeEstimator),
            Arc::new(NullSink),
        )
        .await;
        assert!(matches!(result, Err(Error::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn multisig_account_initializes_once_key_set_is_full() {
        let wallet = new_test_wallet(1, b"wallet-test-seed-bytes-00000002!", InitOptions::default()).await;

        let other_root = test_root(b"wallet-test-seed-bytes-00000003!");
        let secp = Secp256k1::new();
        let path = account_derivation_path(87, Network::Bitcoin.bip44_coin_type(), 1).unwrap();
        let key2 = Xpub::from_priv(&secp, &other_root.derive_priv(&secp, &path).unwrap());
        let third_root = test_root(b"wallet-test-seed-bytes-00000004!");
        let key3 = Xpub::from_priv(&secp, &third_root.derive_priv(&secp, &path).unwrap());

        let account_index = wallet
            .create_account(CreateAccountOptions {
                name: "joint".into(),
                m: 2,
                n: 3,
                witness: true,
            })
            .await
            .unwrap();

        assert!(!wallet.account_snapshot(account_index).await.unwrap().initialized);
        wallet.add_key(account_index, key2).await.unwrap();
        assert!(!wallet.account_snapshot(account_index).await.unwrap().initialized);

        wallet.add_key(account_index, key3).await.unwrap();
        let account = wallet.account_snapshot(account_index).await.unwrap();
        assert!(account.initialized);
        assert!(account.receive_address.is_some());
    }

    #[tokio::test]
    async fn passphrase_rotation_preserves_id_and_token() {
        let wallet = new_test_wallet(
            1,
            b"wallet-test-seed-bytes-00000005!",
            InitOptions {
                passphrase: Some(b"old".to_vec()),
                witness: true,
            },
        )
        .await;
        let id_before = wallet.id().await;
        let token_before = wallet.token().await;

        wallet.set_passphrase(Some(b"old"), b"new").await.unwrap();
        wallet.unlock(b"new", None).await.unwrap();
        assert!(matches!(
            wallet.set_passphrase(Some(b"old"), b"whatever").await,
            Err(Error::BadPassphrase)
        ));

        assert_eq!(wallet.id().await, id_before);
        assert_eq!(wallet.token().await, token_before);
    }

    #[tokio::test]
    async fn retoken_increments_depth_and_changes_token_only() {
        let wallet = new_test_wallet(1, b"wallet-test-seed-bytes-00000006!", InitOptions::default()).await;
        let id_before = wallet.id().await;
        let (_, depth_before) = wallet.token().await;

        wallet.retoken(None).await.unwrap();
        let (_, depth_after) = wallet.token().await;

        assert_eq!(depth_after, depth_before + 1);
        assert_eq!(wallet.id().await, id_before);
    }
}

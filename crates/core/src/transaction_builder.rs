//! Coin selection, fee math, BIP69 ordering, templating and signing. See
//! spec §4.4. `TXDB` (the transaction/UTXO index) and the fee estimator
//! are named external collaborators (spec §1, §6); this module only
//! consumes them through the `CoinSource`/`FeeEstimator` traits below.

use std::cmp::Ordering;
use std::collections::HashSet;

use bitcoin::absolute::LockTime;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::hashes::Hash as _;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use wallet_common::{async_trait_impl, Network, ScriptType};

use crate::account::Account;
use crate::error::{Error, Result};
use crate::keyring::Keyring;
use crate::path::Path;

/// One unspent output this account controls, as surfaced by the
/// out-of-scope TXDB collaborator.
#[derive(Clone, Debug)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: ScriptBuf,
    pub path: Path,
    /// Confirmation height; `None` for a coin still in the mempool.
    pub height: Option<u32>,
}

async_trait_impl! {
pub trait CoinSource: Send + Sync {
    async fn unspent_coins(&self, wid: u32, account_index: u32) -> Result<Vec<Coin>>;
}
}

/// Test double standing in for the real TXDB/UTXO index.
#[derive(Default)]
pub struct InMemoryCoinSource {
    coins: tokio::sync::Mutex<Vec<(u32, u32, Coin)>>,
}

impl InMemoryCoinSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, wid: u32, account_index: u32, coin: Coin) {
        self.coins.lock().await.push((wid, account_index, coin));
    }

    pub async fn remove_spent(&self, spent: &[OutPoint]) {
        self.coins
            .lock()
            .await
            .retain(|(_, _, coin)| !spent.contains(&coin.outpoint));
    }
}

async_trait_impl! {
impl CoinSource for InMemoryCoinSource {
    async fn unspent_coins(&self, wid: u32, account_index: u32) -> Result<Vec<Coin>> {
        Ok(self
            .coins
            .lock()
            .await
            .iter()
            .filter(|(w, a, _)| *w == wid && *a == account_index)
            .map(|(_, _, coin)| coin.clone())
            .collect())
    }
}
}

async_trait_impl! {
pub trait FeeEstimator: Send + Sync {
    /// Satoshis per kilobyte, or `None` if the estimator has no opinion
    /// right now (the caller falls back to the network's default rate).
    async fn estimate_fee_rate(&self) -> Result<Option<u64>>;
}
}

pub struct StaticFeeEstimator(pub u64);

async_trait_impl! {
impl FeeEstimator for StaticFeeEstimator {
    async fn estimate_fee_rate(&self) -> Result<Option<u64>> {
        Ok(Some(self.0))
    }
}
}

#[derive(Default)]
pub struct NoFeeEstimator;

async_trait_impl! {
impl FeeEstimator for NoFeeEstimator {
    async fn estimate_fee_rate(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}
}

/// One `Mtx::sign` call's worth of work, packaged so it can cross a
/// `tokio::task::spawn_blocking` boundary (spec §5's signing worker-pool
/// suspension point).
pub struct SigningJob {
    pub mtx: Mtx,
    pub account: Account,
    pub master: Xpriv,
    pub coin_type: u32,
    pub sighash_type: EcdsaSighashType,
}

pub struct SigningOutcome {
    pub mtx: Mtx,
    pub signed: u32,
}

/// Where per-input signing runs. `InlineWorkerPool` runs it on the
/// caller's task; `TokioWorkerPool` ships it to `spawn_blocking`. Both
/// must produce bit-identical output (spec §4.4): signing is pure CPU
/// work over data already in hand, so which one ran it is unobservable
/// other than through scheduling.
async_trait_impl! {
pub trait SigningWorkerPool: Send + Sync {
    async fn run(&self, job: SigningJob) -> Result<SigningOutcome>;
}
}

fn run_signing_job(mut job: SigningJob) -> Result<SigningOutcome> {
    let signed = job
        .mtx
        .sign(&job.account, &job.master, job.coin_type, job.sighash_type)?;
    Ok(SigningOutcome { mtx: job.mtx, signed })
}

#[derive(Default)]
pub struct InlineWorkerPool;

async_trait_impl! {
impl SigningWorkerPool for InlineWorkerPool {
    async fn run(&self, job: SigningJob) -> Result<SigningOutcome> {
        run_signing_job(job)
    }
}
}

/// Runs the signing loop on a blocking-pool thread so the wallet's own
/// async task stays free for other I/O while a large multisig batch is
/// signed.
#[derive(Default)]
pub struct TokioWorkerPool;

async_trait_impl! {
impl SigningWorkerPool for TokioWorkerPool {
    async fn run(&self, job: SigningJob) -> Result<SigningOutcome> {
        tokio::task::spawn_blocking(move || run_signing_job(job))
            .await
            .map_err(|e| Error::Sighash(format!("signing worker panicked: {e}")))?
    }
}
}

/// Coin selection algorithm. Default `Age`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    Age,
    Random,
    All,
}

#[derive(Clone, Debug)]
pub struct FundOptions {
    pub confirmed: bool,
    pub rate: Option<u64>,
    pub selection: Selection,
    pub round: bool,
    pub free: bool,
    pub fee: Option<u64>,
    pub subtract_fee: bool,
    pub height: u32,
}

impl Default for FundOptions {
    fn default() -> Self {
        Self {
            confirmed: false,
            rate: None,
            selection: Selection::default(),
            round: false,
            free: false,
            fee: None,
            subtract_fee: false,
            height: 0,
        }
    }
}

const DUST_THRESHOLD: u64 = 546;
/// Rough constant-size estimate of a single input/output's weight for fee
/// math, in the absence of an exact transaction-size model. Not
/// byte-exact; the spec leaves fee math "design-level" (§4.4).
const EST_INPUT_VBYTES: u64 = 68;
const EST_OUTPUT_VBYTES: u64 = 33;
const EST_BASE_VBYTES: u64 = 11;

fn estimate_vsize(num_inputs: usize, num_outputs: usize) -> u64 {
    EST_BASE_VBYTES + num_inputs as u64 * EST_INPUT_VBYTES + num_outputs as u64 * EST_OUTPUT_VBYTES
}

fn compute_fee(vsize: u64, rate: u64, round: bool) -> u64 {
    if round {
        vsize.div_ceil(1000) * rate
    } else {
        (vsize * rate) / 1000
    }
}

/// One not-yet-broadcast transaction under construction.
#[derive(Clone, Debug)]
pub struct Mtx {
    pub version: i32,
    pub lock_time: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub coins: Vec<Coin>,
    pub templates: Vec<Option<InputTemplate>>,
}

#[derive(Clone, Debug)]
pub struct InputTemplate {
    pub keyring: Keyring,
    pub path: Path,
    pub value: u64,
    /// One slot per cosigner in `keyring.cosigner_public_keys` order
    /// (length 1 for non-multisig). Slot 0 is always this wallet's own
    /// signature; other slots are filled by `install_signature` when
    /// combining externally-gathered cosigner signatures.
    pub signatures: Vec<Option<Vec<u8>>>,
}

impl Mtx {
    pub fn new(outputs: Vec<TxOut>) -> Self {
        Self {
            version: 2,
            lock_time: 0,
            inputs: Vec::new(),
            outputs,
            coins: Vec::new(),
            templates: Vec::new(),
        }
    }

    pub fn to_transaction(&self) -> Transaction {
        Transaction {
            version: Version::non_standard(self.version),
            lock_time: LockTime::from_consensus(self.lock_time),
            input: self.inputs.clone(),
            output: self.outputs.clone(),
        }
    }

    fn total_output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value.to_sat()).sum()
    }

    /// §4.4 `fund`: gather this account's unspent coins, drop locked
    /// ones, pick a fee rate, select coins to cover outputs + fee, and
    /// append the resulting inputs (plus a change output, if any) to
    /// `self`.
    pub async fn fund<C: CoinSource, F: FeeEstimator>(
        &mut self,
        coin_source: &C,
        fee_estimator: &F,
        account: &Account,
        wid: u32,
        network: Network,
        locked: &HashSet<OutPoint>,
        options: &FundOptions,
    ) -> Result<()> {
        let receive_change = account
            .change_address
            .clone()
            .ok_or(Error::NotInitialized)?;

        let mut coins = coin_source.unspent_coins(wid, account.account_index).await?;
        if options.confirmed {
            coins.retain(|c| c.height.map(|h| h > 0).unwrap_or(false));
        }
        coins.retain(|c| !locked.contains(&c.outpoint));

        let rate = match options.rate {
            Some(rate) => rate,
            None => fee_estimator
                .estimate_fee_rate()
                .await?
                .unwrap_or_else(|| network.default_relay_rate()),
        };

        order_coins_for_selection(&mut coins, options.selection);

        let target = self.total_output_value();
        let mut selected = Vec::new();
        let mut selected_value = 0u64;
        let mut fee;

        for coin in coins {
            selected_value += coin.value;
            selected.push(coin);

            if options.selection == Selection::All {
                continue;
            }
            let vsize = estimate_vsize(selected.len(), self.outputs.len() + 1);
            fee = options
                .fee
                .unwrap_or_else(|| if options.free { 0 } else { compute_fee(vsize, rate, options.round) });
            if selected_value >= target + fee {
                break;
            }
        }

        let vsize = estimate_vsize(selected.len(), self.outputs.len() + 1);
        fee = options
            .fee
            .unwrap_or_else(|| if options.free { 0 } else { compute_fee(vsize, rate, options.round) });

        if options.subtract_fee {
            if let Some(first) = self.outputs.first_mut() {
                let reduced = first.value.to_sat().checked_sub(fee).ok_or(Error::InsufficientFunds)?;
                first.value = Amount::from_sat(reduced);
            }
            fee = 0;
        }

        if selected_value < target + fee {
            return Err(Error::InsufficientFunds);
        }

        let change = selected_value - target - fee;
        if change > DUST_THRESHOLD {
            self.outputs.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: receive_change.script_pubkey.clone(),
            });
        }

        for coin in &selected {
            self.inputs.push(TxIn {
                previous_output: coin.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            });
        }
        self.coins = selected;
        self.templates = vec![None; self.inputs.len()];

        Ok(())
    }

    /// BIP69: inputs by `(prev_txid_le, prev_index)`, outputs by
    /// `(value, script_pubkey)`. Keeps `coins`/`templates` in step with
    /// `inputs`.
    pub fn bip69_sort(&mut self) {
        let mut input_order: Vec<usize> = (0..self.inputs.len()).collect();
        input_order.sort_by(|&a, &b| {
            let pa = &self.inputs[a].previous_output;
            let pb = &self.inputs[b].previous_output;
            let txid_cmp = pa
                .txid
                .to_raw_hash()
                .to_byte_array()
                .cmp(&pb.txid.to_raw_hash().to_byte_array());
            txid_cmp.then(pa.vout.cmp(&pb.vout))
        });
        self.inputs = input_order.iter().map(|&i| self.inputs[i].clone()).collect();
        self.coins = input_order.iter().map(|&i| self.coins[i].clone()).collect();
        self.templates = input_order.iter().map(|&i| self.templates[i].clone()).collect();

        self.outputs.sort_by(|a, b| {
            a.value
                .to_sat()
                .cmp(&b.value.to_sat())
                .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
        });
    }

    const MAX_TX_VBYTES: u64 = 100_000;
    const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

    /// The `CheckTransaction` predicate: structural sanity independent of
    /// the coins being spent.
    pub fn check_transaction(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(Error::CheckTransaction("no inputs"));
        }
        if self.outputs.is_empty() {
            return Err(Error::CheckTransaction("no outputs"));
        }
        let mut seen = HashSet::new();
        for input in &self.inputs {
            if !seen.insert(input.previous_output) {
                return Err(Error::CheckTransaction("duplicate input"));
            }
        }
        let mut total = 0u64;
        for output in &self.outputs {
            let value = output.value.to_sat();
            if value > Self::MAX_MONEY {
                return Err(Error::CheckTransaction("output value out of range"));
            }
            total = total
                .checked_add(value)
                .ok_or(Error::CheckTransaction("output sum overflow"))?;
        }
        if total > Self::MAX_MONEY {
            return Err(Error::CheckTransaction("output sum out of range"));
        }
        if estimate_vsize(self.inputs.len(), self.outputs.len()) > Self::MAX_TX_VBYTES {
            return Err(Error::CheckTransaction("exceeds size cap"));
        }
        Ok(())
    }

    /// The `CheckInputs` predicate: validates the coins being spent
    /// against the current chain height.
    pub fn check_inputs(&self, height: u32) -> Result<()> {
        if self.coins.len() != self.inputs.len() {
            return Err(Error::CheckInputs("coin/input count mismatch"));
        }
        for coin in &self.coins {
            if let Some(coin_height) = coin.height {
                if coin_height > height {
                    return Err(Error::CheckInputs("coin height ahead of chain tip"));
                }
            }
        }
        Ok(())
    }

    /// Derives keyrings for every recognized input and installs empty
    /// signature-slot templates, without signing.
    pub fn script_inputs(&mut self, account: &Account) -> Result<()> {
        for (i, coin) in self.coins.iter().enumerate() {
            let ring = account.derive_keyring(coin.path.change, coin.path.index)?;
            let slots = ring.cosigner_public_keys.len().max(1);
            self.templates[i] = Some(InputTemplate {
                keyring: ring,
                path: coin.path,
                value: coin.value,
                signatures: vec![None; slots],
            });
        }
        Ok(())
    }

    /// Installs an externally-gathered cosigner signature (for combining
    /// multisig signatures collected out of band) and finalizes the
    /// input's scriptSig/witness if the threshold is now met.
    pub fn install_signature(
        &mut self,
        input_index: usize,
        cosigner_index: usize,
        signature: Vec<u8>,
        account: &Account,
    ) -> Result<bool> {
        let template = self
            .templates
            .get_mut(input_index)
            .and_then(|t| t.as_mut())
            .ok_or(Error::CheckInputs("input has no template"))?;
        *template
            .signatures
            .get_mut(cosigner_index)
            .ok_or(Error::CheckInputs("cosigner index out of range"))? = Some(signature);
        finalize_input(&mut self.inputs[input_index], template, account)
    }

    /// §4.4 `sign`: derives each recognized input's child private key,
    /// checks it against the template's public key, signs, and installs
    /// our own signature slot (cosigner index 0). Returns the number of
    /// inputs that became fully signed as a result.
    pub fn sign(
        &mut self,
        account: &Account,
        master: &Xpriv,
        coin_type: u32,
        sighash_type: EcdsaSighashType,
    ) -> Result<u32> {
        let secp = Secp256k1::new();
        let base_path = account.derivation_path(coin_type)?;
        let tx = self.to_transaction();
        let mut cache = SighashCache::new(&tx);
        let mut signed = 0u32;

        for i in 0..self.templates.len() {
            let Some(template) = self.templates[i].clone() else {
                continue;
            };

            let mut children: Vec<ChildNumber> = base_path.to_vec();
            children.push(ChildNumber::from_normal_idx(template.path.change as u32)?);
            children.push(ChildNumber::from_normal_idx(template.path.index)?);
            let path = DerivationPath::from(children);
            let child = master.derive_priv(&secp, &path)?;
            let derived_pub = PublicKey::new(child.private_key.public_key(&secp));
            if derived_pub != template.keyring.public_key {
                return Err(Error::KeyMismatch);
            }

            let sighash: [u8; 32] = compute_sighash(
                &mut cache,
                i,
                &template,
                account.witness,
                account.script_type,
                sighash_type,
            )?;
            let message = Message::from_digest(sighash);
            let sig = secp.sign_ecdsa(&message, &child.private_key);
            let mut sig_bytes = sig.serialize_der().to_vec();
            sig_bytes.push(sighash_type.to_u32() as u8);

            let Some(template_mut) = self.templates[i].as_mut() else {
                continue;
            };
            template_mut.signatures[0] = Some(sig_bytes);

            if finalize_input(&mut self.inputs[i], template_mut, account)? {
                signed += 1;
            }
        }

        Ok(signed)
    }

    /// An input counts as signed only once `finalize_input` has actually
    /// populated its scriptSig/witness — for multisig that means `m` of
    /// `n` signatures, not just our own slot.
    pub fn is_fully_signed(&self) -> bool {
        !self.templates.is_empty()
            && (0..self.templates.len()).all(|i| match &self.templates[i] {
                None => false,
                Some(_) => !self.inputs[i].script_sig.is_empty() || !self.inputs[i].witness.is_empty(),
            })
    }
}

fn compute_sighash(
    cache: &mut SighashCache<&Transaction>,
    input_index: usize,
    template: &InputTemplate,
    witness: bool,
    script_type: ScriptType,
    sighash_type: EcdsaSighashType,
) -> Result<[u8; 32]> {
    let script_code = match script_type {
        ScriptType::PubkeyHash => {
            let hash = bitcoin::PubkeyHash::from_slice(&template.keyring.hash)
                .map_err(|e| Error::Sighash(e.to_string()))?;
            ScriptBuf::new_p2pkh(&hash)
        }
        ScriptType::Multisig => template
            .keyring
            .script
            .clone()
            .ok_or_else(|| Error::Sighash("missing redeem/witness script".into()))?,
    };

    if witness {
        Ok(cache
            .p2wsh_signature_hash(
                input_index,
                &script_code,
                Amount::from_sat(template.value),
                sighash_type,
            )
            .map_err(|e| Error::Sighash(e.to_string()))?
            .to_raw_hash()
            .to_byte_array())
    } else {
        Ok(cache
            .legacy_signature_hash(input_index, &script_code, sighash_type.to_u32())
            .map_err(|e| Error::Sighash(e.to_string()))?
            .to_raw_hash()
            .to_byte_array())
    }
}

/// Builds the final scriptSig/witness once enough signature slots are
/// filled (1 for single-key, `m` for multisig); returns whether it did.
fn finalize_input(input: &mut TxIn, template: &InputTemplate, account: &Account) -> Result<bool> {
    let have = template.signatures.iter().filter(|s| s.is_some()).count();
    let needed = if account.script_type == ScriptType::Multisig {
        account.m as usize
    } else {
        1
    };
    if have < needed {
        return Ok(false);
    }

    match account.script_type {
        ScriptType::PubkeyHash => {
            let sig = template.signatures[0].clone().ok_or(Error::NotFullySigned)?;
            let pubkey = template.keyring.public_key;
            if account.witness {
                let mut witness = Witness::new();
                witness.push(sig);
                witness.push(pubkey.to_bytes());
                input.witness = witness;
            } else {
                let script_sig = Builder::new()
                    .push_slice(push_bytes(sig)?)
                    .push_key(&pubkey)
                    .into_script();
                input.script_sig = script_sig;
            }
        }
        ScriptType::Multisig => {
            let redeem_script = template
                .keyring
                .script
                .clone()
                .ok_or_else(|| Error::Sighash("missing redeem script".into()))?;

            if account.witness {
                let mut witness = Witness::new();
                witness.push(Vec::new()); // CHECKMULTISIG's extra-pop dummy element
                for sig in template.signatures.iter().flatten() {
                    witness.push(sig.clone());
                }
                witness.push(redeem_script.to_bytes());
                input.witness = witness;
            } else {
                let mut builder = Builder::new().push_slice(PushBytesBuf::new());
                for sig in template.signatures.iter().flatten() {
                    builder = builder.push_slice(push_bytes(sig.clone())?);
                }
                let script_sig = builder.push_slice(push_bytes(redeem_script.to_bytes())?).into_script();
                input.script_sig = script_sig;
            }
        }
    }
    Ok(true)
}

fn push_bytes(data: Vec<u8>) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(data).map_err(|_| Error::Sighash("data too large to push onto script".into()))
}

fn order_coins_for_selection(coins: &mut [Coin], selection: Selection) {
    match selection {
        Selection::Age => coins.sort_by(|a, b| match (a.height, b.height) {
            (Some(ha), Some(hb)) => ha.cmp(&hb),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }),
        Selection::Random => {
            // Deterministic-free shuffle: fine for a coin-selection order
            // that only needs to avoid a fixed bias, not cryptographic
            // randomness. Uses a simple xorshift seeded from the first
            // outpoint so repeated calls in one process don't collide.
            let mut seed = coins
                .first()
                .map(|c| {
                    let bytes = c.outpoint.txid.to_raw_hash().to_byte_array();
                    u64::from_le_bytes(bytes[..8].try_into().unwrap())
                })
                .unwrap_or(0x9E3779B97F4A7C15)
                | 1;
            for i in (1..coins.len()).rev() {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                coins.swap(i, (seed as usize) % (i + 1));
            }
        }
        Selection::All => {}
    }
}

//! Standalone scenario coverage not already exercised by a module's own
//! `#[cfg(test)]` suite: a real BIP39 mnemonic end to end (account depth
//! one, `receiveDepth`/`changeDepth` one, ≥ lookahead addresses, and the
//! "WLT"-prefixed id), and concurrent `send` calls racing for the same
//! coin.

use std::sync::Arc;

use bip39::Mnemonic;
use bitcoin::bip32::Xpriv;
use bitcoin::hashes::Hash;
use bitcoin::{Amount, Network as BtcNetwork, OutPoint, Txid, TxOut};
use wallet_common::Network;
use wallet_core::storage::InMemoryWalletDb;
use wallet_core::transaction_builder::{Coin, InMemoryCoinSource, NoFeeEstimator};
use wallet_core::{CreateTxOptions, Error, FundOptions, InitOptions, NullSink, SignOptions, Wallet, WalletDb};

type TestWallet = Wallet<InMemoryWalletDb, InMemoryCoinSource, NoFeeEstimator>;

fn master_from_mnemonic(phrase: &str, network: BtcNetwork) -> Xpriv {
    let mnemonic = Mnemonic::parse(phrase).expect("canonical test mnemonic parses");
    let seed = mnemonic.to_seed("");
    Xpriv::new_master(network, &seed).expect("64-byte BIP39 seed is always a valid master key")
}

/// S1 — a fixed canonical mnemonic yields a deterministic, "WLT"-prefixed
/// id, and the account-0 default shape (S2) holds along the way.
#[tokio::test]
async fn fixed_mnemonic_yields_wlt_prefixed_id_and_default_account() {
    let root = master_from_mnemonic(
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        BtcNetwork::Bitcoin,
    );

    let db = Arc::new(InMemoryWalletDb::new());
    let wallet: TestWallet = Wallet::init(
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

    let id = wallet.id().await;
    assert!(id.starts_with("WLT"), "unexpected id prefix: {id}");

    let second_root = master_from_mnemonic(
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        BtcNetwork::Bitcoin,
    );
    assert_eq!(
        wallet_core::id::get_id(&second_root, Network::Bitcoin).unwrap(),
        id,
        "id must be a pure function of the master key and network"
    );

    let account = db.get_account(1, 0).await.unwrap();
    assert_eq!(account.account_index, 0);
    assert_eq!(account.name, "default");
    assert_eq!(account.receive_depth, 1);
    assert_eq!(account.change_depth, 1);

    let paths = db.get_wallet_paths(1).await.unwrap();
    assert!(paths.len() >= 2 * (1 + wallet_core::account::LOOKAHEAD as usize));
}

/// S6 — two `send` calls racing over a wallet with exactly one spendable
/// coin: exactly one succeeds, the other fails `InsufficientFunds`, never
/// both (no overlapping-input double spend).
#[tokio::test]
async fn concurrent_sends_never_double_spend_the_same_coin() {
    let root = master_from_mnemonic(
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        BtcNetwork::Testnet,
    );

    let coin_source = Arc::new(InMemoryCoinSource::new());
    let wallet: Arc<TestWallet> = Arc::new(
        Wallet::init(
            1,
            Network::Testnet,
            &root,
            InitOptions::default(),
            Arc::new(InMemoryWalletDb::new()),
            coin_source.clone(),
            Arc::new(NoFeeEstimator),
            Arc::new(NullSink),
        )
        .await
        .unwrap(),
    );

    let funding_ring = wallet.create_receive(None).await.unwrap();
    coin_source
        .add(
            1,
            0,
            Coin {
                outpoint: OutPoint::new(Txid::all_zeros(), 0),
                value: 100_000,
                script_pubkey: funding_ring.script_pubkey,
                path: wallet_core::Path::new(1, 0, false, 1),
                height: Some(10),
            },
        )
        .await;

    let output_script = wallet.create_receive(None).await.unwrap().script_pubkey;
    let make_options = || CreateTxOptions {
        account_index: None,
        outputs: vec![TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: output_script.clone(),
        }],
        fund: FundOptions {
            height: 100,
            ..FundOptions::default()
        },
    };

    let wallet_a = wallet.clone();
    let wallet_b = wallet.clone();
    let (a, b) = tokio::join!(
        wallet_a.send(make_options(), &SignOptions::default()),
        wallet_b.send(make_options(), &SignOptions::default())
    );

    let results = [a, b];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let insufficient = results
        .iter()
        .filter(|r| matches!(r, Err(Error::InsufficientFunds)))
        .count();

    assert_eq!(successes, 1, "exactly one send must win the race");
    assert_eq!(insufficient, 1, "the loser must fail InsufficientFunds, not succeed or fail some other way");
}

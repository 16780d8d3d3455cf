//! Hierarchical-deterministic Bitcoin wallet engine.
//!
//! Four subsystems: [`wallet`] (identity, account lifecycle, concurrency
//! discipline), [`account`] (BIP32/BIP44 address allocation), [`master_key`]
//! (key custody — clear/encrypted/unlocked), and [`transaction_builder`]
//! (coin selection, BIP69 ordering, signing).

pub mod account;
pub mod error;
pub mod events;
pub mod id;
pub mod keyring;
pub mod master_key;
pub mod path;
pub mod serialize;
pub mod storage;
pub mod transaction_builder;
pub mod wallet;

pub use account::Account;
pub use error::{Error, Result};
pub use events::{Event, EventSink, NullSink, RecordingSink};
pub use keyring::Keyring;
pub use master_key::MasterKey;
pub use path::Path;
pub use storage::{WalletDb, WalletRecord};
pub use transaction_builder::{
    CoinSource, FeeEstimator, FundOptions, InlineWorkerPool, Mtx, SigningJob, SigningOutcome,
    SigningWorkerPool, TokioWorkerPool,
};
pub use wallet::{CreateAccountOptions, CreateTxOptions, InitOptions, SignOptions, Wallet};

pub use wallet_common::{Network, ScriptType};

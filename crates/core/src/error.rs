use thiserror::Error;

/// Every error kind the core raises, per spec §7.
#[derive(Debug, Error)]
pub enum Error {
    #[error("wallet is not initialized")]
    NotInitialized,
    #[error("wallet is already initialized")]
    AlreadyInitialized,
    #[error("account not found")]
    AccountNotFound,
    #[error("cosigner key already belongs to this account's key set")]
    KeyExists,
    #[error("cosigner key is not part of this account's key set")]
    KeyAbsent,
    #[error("account's cosigner key set already holds n keys")]
    KeyLimit,
    #[error("multisig key set collides with an existing account in this wallet")]
    SharedScript,
    #[error("master key is locked")]
    MasterLocked,
    #[error("passphrase did not decrypt to valid key material")]
    BadPassphrase,
    #[error("coin selection could not cover outputs plus fee")]
    InsufficientFunds,
    #[error("selected coin is already reserved by another in-flight fund")]
    CoinLocked,
    #[error("transaction failed sanity checks: {0}")]
    CheckTransaction(&'static str),
    #[error("transaction inputs failed validation: {0}")]
    CheckInputs(&'static str),
    #[error("signing left the transaction only partially signed")]
    NotFullySigned,
    #[error("derived private key does not match keyring's public key")]
    KeyMismatch,
    #[error("invalid account index")]
    InvalidAccountIndex,
    #[error("invalid multisig threshold: m must be nonzero and no greater than n")]
    InvalidThreshold,
    #[error("invalid derivation path")]
    InvalidDerivationPath,
    #[error("invalid address")]
    InvalidAddress,
    #[error("transaction not found")]
    TransactionNotFound,
    #[error("bip32 error: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),
    #[error("secp256k1 error: {0}")]
    Secp256k1(#[from] bitcoin::secp256k1::Error),
    #[error("network error: {0}")]
    Network(#[from] wallet_common::Error),
    #[error("mnemonic error: {0}")]
    Mnemonic(#[from] bip39::Error),
    #[error("sighash error: {0}")]
    Sighash(String),
    #[error("database error")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;

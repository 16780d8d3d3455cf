//! The event model of spec §6: `send`, `address`, `balance`, `error`.
//! The core never broadcasts or persists these itself — it only emits
//! them to whatever sink the caller wired up.

use bitcoin::Transaction;

use crate::keyring::Keyring;
use crate::path::Path;

#[derive(Debug, Clone)]
pub enum Event {
    /// A transaction `send` produced, ready for the caller to broadcast.
    Send(Transaction),
    /// New receive addresses were derived for a wallet, e.g. from
    /// `syncOutputDepth`.
    Address {
        wallet_id: String,
        keyrings: Vec<(Path, Keyring)>,
    },
    /// A wallet's balance changed enough to be worth reporting.
    Balance { wallet_id: String, balance: u64 },
    /// A non-fatal error surfaced out of band (e.g. from a background
    /// worker), as opposed to a `Result::Err` returned directly to a
    /// caller.
    Error(String),
}

/// Where the core delivers events. `Wallet` holds one per instance;
/// tests and callers that don't care about events use `NullSink`.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

#[derive(Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Collects every emitted event in order, for assertions in tests.
#[derive(Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

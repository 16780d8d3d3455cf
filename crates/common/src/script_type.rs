use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Account script type. The spec folds this into `Account.type` and
/// coerces it to `Multisig` whenever `n > 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[repr(u8)]
pub enum ScriptType {
    /// https://bitcoinwiki.org/wiki/pay-to-pubkey-hash
    PubkeyHash = 0,
    /// Bare or P2SH/P2WSH multisig, selected whenever `n > 1`.
    Multisig = 1,
}

impl TryFrom<&str> for ScriptType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pubkeyhash" => Ok(ScriptType::PubkeyHash),
            "multisig" => Ok(ScriptType::Multisig),
            _ => Err(Error::InvalidScriptType),
        }
    }
}

impl TryFrom<u8> for ScriptType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ScriptType::PubkeyHash),
            1 => Ok(ScriptType::Multisig),
            _ => Err(Error::InvalidScriptType),
        }
    }
}

impl ScriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::PubkeyHash => "pubkeyhash",
            ScriptType::Multisig => "multisig",
        }
    }
}

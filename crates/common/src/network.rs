use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Bitcoin-like network parameters the core consults but never hardcodes.
///
/// Mirrors the collaborator described in the spec: `magic`, `type`,
/// `getRate()`, `fromMagic()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Network {
    Bitcoin,
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    /// Network magic, little-endian u32 as used in `getID` and the wallet
    /// record header.
    pub fn magic(&self) -> u32 {
        match self {
            Network::Bitcoin => 0xD9B4BEF9,
            Network::Testnet => 0x0709110B,
            Network::Signet => 0x40CF030A,
            Network::Regtest => 0xDAB5BFFA,
        }
    }

    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        match magic {
            0xD9B4BEF9 => Ok(Network::Bitcoin),
            0x0709110B => Ok(Network::Testnet),
            0x40CF030A => Ok(Network::Signet),
            0xDAB5BFFA => Ok(Network::Regtest),
            _ => Err(Error::InvalidNetwork),
        }
    }

    /// BIP44 coin type: 0' for mainnet, 1' for every test network.
    pub fn bip44_coin_type(&self) -> u32 {
        match self {
            Network::Bitcoin => 0,
            _ => 1,
        }
    }

    /// Fallback relay rate (sat/kvB) used when no fee estimator is wired up,
    /// see spec §4.4 step 3 ("fall back to the network's default relay
    /// rate").
    pub fn default_relay_rate(&self) -> u64 {
        match self {
            Network::Bitcoin => 1000,
            _ => 1000,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Network::Bitcoin => "main",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        }
    }
}

impl From<Network> for bitcoin::Network {
    fn from(value: Network) -> Self {
        match value {
            Network::Bitcoin => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_roundtrips_through_from_magic() {
        for network in [Network::Bitcoin, Network::Testnet, Network::Signet, Network::Regtest] {
            assert_eq!(Network::from_magic(network.magic()).unwrap(), network);
        }
    }

    #[test]
    fn unknown_magic_is_rejected() {
        assert!(Network::from_magic(0x1234_5678).is_err());
    }
}

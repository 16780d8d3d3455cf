//! BIP44 account sub-tree: derivation, multisig key-set management, and
//! receive/change depth advancement with lookahead. See spec §4.2.

use bitcoin::bip32::Xpub;
use wallet_common::ScriptType;

use crate::error::{Error, Result};
use crate::keyring::{self, Keyring};
use crate::path::Path;
use crate::serialize::{
    decode_xpub_raw, encode_xpub_raw, read_u32_le, read_u8, read_varstring, write_u32_le,
    write_u8, write_varstring,
};

/// Fixed number of unused addresses pre-derived past the current depth on
/// each branch, so payments to near-future addresses are recognized.
pub const LOOKAHEAD: u32 = 5;

/// The first index a branch advancement still needs to derive: `0` on a
/// branch that has never been advanced (nothing persisted yet), or
/// `current + LOOKAHEAD` once it has (everything below that was already
/// covered by the previous advancement's lookahead).
fn branch_range_start(current_depth: u32) -> u32 {
    if current_depth == 0 {
        0
    } else {
        current_depth + LOOKAHEAD
    }
}

#[derive(Clone, Debug)]
pub struct Account {
    pub account_index: u32,
    pub name: String,
    pub script_type: ScriptType,
    pub m: u8,
    pub n: u8,
    /// Cosigner HD public keys, in order; element 0 is always the
    /// account's own key.
    pub keys: Vec<Xpub>,
    pub witness: bool,
    pub receive_depth: u32,
    pub change_depth: u32,
    pub receive_address: Option<Keyring>,
    pub change_address: Option<Keyring>,
    pub initialized: bool,
}

impl Account {
    /// Constructs an account at `accountKey`'s path. `n > 1` always
    /// coerces `type` to multisig, per the data model invariant. A
    /// `keys` starts out holding only `account_key`; the account becomes
    /// eligible for initialization once it holds `n` keys (immediately,
    /// for `n == 1`). `initialized` only flips to `true` once the caller
    /// runs the first `set_depth` — see `is_key_set_full`.
    pub fn new(
        account_index: u32,
        name: impl Into<String>,
        account_key: Xpub,
        m: u8,
        n: u8,
        witness: bool,
    ) -> Result<Self> {
        if n == 0 || m == 0 || m > n {
            return Err(Error::InvalidThreshold);
        }
        let script_type = if n > 1 {
            ScriptType::Multisig
        } else {
            ScriptType::PubkeyHash
        };

        Ok(Self {
            account_index,
            name: name.into(),
            script_type,
            m,
            n,
            keys: vec![account_key],
            witness,
            receive_depth: 0,
            change_depth: 0,
            receive_address: None,
            change_address: None,
            initialized: false,
        })
    }

    /// Whether `keys` has reached its target size `n`. When this first
    /// becomes true the caller must run `set_depth(1, 1)` to complete
    /// initialization (derive the first receive/change addresses).
    pub fn is_key_set_full(&self) -> bool {
        self.keys.len() == self.n as usize
    }

    pub fn account_key(&self) -> &Xpub {
        &self.keys[0]
    }

    /// The BIP44 purpose field this account derives under: 44' for
    /// single-key accounts, 87' (BIP87) for multisig, derived from
    /// `script_type` rather than stored, since the persisted account
    /// record has no separate field for it.
    pub fn purpose(&self) -> u32 {
        match self.script_type {
            ScriptType::PubkeyHash => 44,
            ScriptType::Multisig => 87,
        }
    }

    /// `m/purpose'/coin_type'/account_index'`, the account's own BIP44
    /// sub-tree root. `coin_type` comes from the wallet's network, which
    /// the account itself doesn't know (see the "avoid back-pointers"
    /// design note).
    pub fn derivation_path(&self, coin_type: u32) -> Result<bitcoin::bip32::DerivationPath> {
        use bitcoin::bip32::ChildNumber;
        Ok(vec![
            ChildNumber::from_hardened_idx(self.purpose())?,
            ChildNumber::from_hardened_idx(coin_type)?,
            ChildNumber::from_hardened_idx(self.account_index)?,
        ]
        .into())
    }

    /// Appends a cosigner key. Returns `true` when the set has just
    /// reached size `n` (the caller must then run the first depth
    /// advancement to complete initialization — see `set_depth`).
    pub fn push_key(&mut self, key: Xpub) -> Result<bool> {
        if self.keys.len() >= self.n as usize {
            return Err(Error::KeyLimit);
        }
        if self.keys.iter().any(|k| k.public_key == key.public_key) {
            return Err(Error::KeyExists);
        }
        self.keys.push(key);
        Ok(self.keys.len() == self.n as usize)
    }

    /// Removes a cosigner key. Per spec §9's Open Question resolution, a
    /// fully-populated key set (`keys.len() == n`) refuses removal
    /// outright rather than un-initializing the account.
    pub fn remove_key(&mut self, key: &Xpub) -> Result<()> {
        if self.keys.len() == self.n as usize {
            return Err(Error::KeyLimit);
        }
        let pos = self
            .keys
            .iter()
            .position(|k| k.public_key == key.public_key)
            .ok_or(Error::KeyAbsent)?;
        if pos == 0 {
            // keys[0] is always the account's own key; never removable.
            return Err(Error::KeyAbsent);
        }
        self.keys.remove(pos);
        Ok(())
    }

    /// Derives the keyring for one `(change, index)` path.
    pub fn derive_keyring(&self, change: bool, index: u32) -> Result<Keyring> {
        keyring::derive(
            self.account_key(),
            &self.keys,
            change,
            index,
            self.script_type,
            self.witness,
            self.m,
        )
    }

    /// Advances `receive_depth`/`change_depth` toward `(new_receive,
    /// new_change)`. For each branch where the requested depth exceeds
    /// the current one, derives addresses covering `[current, new +
    /// LOOKAHEAD)` — minus whatever lookahead the previous advancement
    /// on that branch already persisted — and returns every `(Path,
    /// Keyring)` pair the caller must persist into the reverse address
    /// index before committing. On any derivation error the caller must
    /// drop the whole batch — this method makes no partial mutation to
    /// `self` when it errs.
    pub fn set_depth(
        &mut self,
        wid: u32,
        new_receive_depth: u32,
        new_change_depth: u32,
    ) -> Result<Vec<(Path, Keyring)>> {
        let mut derived = Vec::new();

        if new_receive_depth > self.receive_depth {
            derived.extend(self.derive_branch_range(
                wid,
                false,
                branch_range_start(self.receive_depth),
                new_receive_depth + LOOKAHEAD,
            )?);
        }
        if new_change_depth > self.change_depth {
            derived.extend(self.derive_branch_range(
                wid,
                true,
                branch_range_start(self.change_depth),
                new_change_depth + LOOKAHEAD,
            )?);
        }

        if new_receive_depth > self.receive_depth {
            self.receive_address = Some(self.derive_keyring(false, new_receive_depth - 1)?);
            self.receive_depth = new_receive_depth;
        }
        if new_change_depth > self.change_depth {
            self.change_address = Some(self.derive_keyring(true, new_change_depth - 1)?);
            self.change_depth = new_change_depth;
        }
        if !self.initialized && new_receive_depth > 0 && new_change_depth > 0 {
            self.initialized = true;
        }

        Ok(derived)
    }

    fn derive_branch_range(
        &self,
        wid: u32,
        change: bool,
        from: u32,
        to: u32,
    ) -> Result<Vec<(Path, Keyring)>> {
        (from..to)
            .map(|index| {
                let ring = self.derive_keyring(change, index)?;
                Ok((Path::new(wid, self.account_index, change, index), ring))
            })
            .collect()
    }

    /// `[varstring name][initialized:u8][type:u8][m:u8][n:u8][witness:u8]
    /// [accountIndex:u32LE][receiveDepth:u32LE][changeDepth:u32LE]
    /// [accountKey:82 bytes][keyCount:u8][keys: keyCount × 82 bytes]`.
    /// The leading `network_magic` field of the full account record (spec
    /// §6) is written by the wallet record writer, which owns the
    /// network; this method covers everything after it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varstring(&mut buf, &self.name);
        write_u8(&mut buf, self.initialized as u8);
        write_u8(&mut buf, self.script_type as u8);
        write_u8(&mut buf, self.m);
        write_u8(&mut buf, self.n);
        write_u8(&mut buf, self.witness as u8);
        write_u32_le(&mut buf, self.account_index);
        write_u32_le(&mut buf, self.receive_depth);
        write_u32_le(&mut buf, self.change_depth);
        buf.extend_from_slice(&encode_xpub_raw(self.account_key()));
        write_u8(&mut buf, self.keys.len() as u8);
        for key in &self.keys {
            buf.extend_from_slice(&encode_xpub_raw(key));
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let name = read_varstring(data, &mut pos)?;
        let initialized = read_u8(data, &mut pos)? != 0;
        let script_type = ScriptType::try_from(read_u8(data, &mut pos)?)?;
        let m = read_u8(data, &mut pos)?;
        let n = read_u8(data, &mut pos)?;
        let witness = read_u8(data, &mut pos)? != 0;
        let account_index = read_u32_le(data, &mut pos)?;
        let receive_depth = read_u32_le(data, &mut pos)?;
        let change_depth = read_u32_le(data, &mut pos)?;

        let account_key_bytes = data
            .get(pos..pos + 82)
            .ok_or_else(|| Error::Database("truncated account record (account key)".into()))?;
        let account_key = decode_xpub_raw(account_key_bytes)?;
        pos += 82;

        let key_count = read_u8(data, &mut pos)? as usize;
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            let bytes = data
                .get(pos..pos + 82)
                .ok_or_else(|| Error::Database("truncated account record (cosigner key)".into()))?;
            keys.push(decode_xpub_raw(bytes)?);
            pos += 82;
        }
        if keys.first().map(|k| k.public_key) != Some(account_key.public_key) {
            return Err(Error::Database(
                "account record's keys[0] does not match its account key".into(),
            ));
        }

        Ok(Self {
            account_index,
            name,
            script_type,
            m,
            n,
            keys,
            witness,
            receive_depth,
            change_depth,
            receive_address: None,
            change_address: None,
            initialized,
        })
    }
}

use serde::{Deserialize, Serialize};

/// `(wid, account, change, index)`, unique, reverse-indexed by address
/// hash. See spec §3 "Path".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path {
    pub wid: u32,
    pub account: u32,
    pub change: bool,
    pub index: u32,
}

impl Path {
    pub fn new(wid: u32, account: u32, change: bool, index: u32) -> Self {
        Self {
            wid,
            account,
            change,
            index,
        }
    }
}

// Bitcoin Dev Kit
// Written in 2020 by Alekos Filini <alekos.filini@gmail.com>
//
// Copyright (c) 2020-2021 Bitcoin Dev Kit Developers
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::{OutPoint, Script, Txid};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Fee unit: `satoshis` charged for every started chunk of `bytes`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeeUnit {
    /// Satoshis charged per unit
    pub satoshis: u64,
    /// Size of the unit in bytes
    pub bytes: u64,
}

impl FeeUnit {
    /// Create a new [`FeeUnit`]
    pub const fn new(satoshis: u64, bytes: u64) -> Self {
        FeeUnit { satoshis, bytes }
    }

    /// Fee for a transaction of `size` bytes, always rounded up to the next full unit
    pub fn fee_for_size(&self, size: u64) -> Result<u64, Error> {
        if self.bytes == 0 {
            return Err(Error::InvalidFeeUnit);
        }

        let units = size / self.bytes + u64::from(size % self.bytes != 0);
        Ok(units * self.satoshis)
    }
}

impl std::default::Default for FeeUnit {
    fn default() -> Self {
        FeeUnit::new(1, 1000)
    }
}

/// An unspent output owned by one of the users of the engine
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UtxoRecord {
    /// Owner of the output
    pub owner_id: String,
    /// Reference to a transaction output
    pub outpoint: OutPoint,
    /// Value in satoshis
    pub satoshis: u64,
    /// Locking script of the output
    pub script_pubkey: Script,
    /// Owner specific instructions on how to unlock the output, passed through unchanged
    pub spending_instructions: serde_json::Value,
    /// Estimated size of the input spending this output, when it differs from the default
    pub estimated_input_size: Option<u64>,
    /// Last time the output was reserved by a selection
    pub touched_at: u64,
    /// Creation time
    pub created_at: u64,
}

impl UtxoRecord {
    /// Order in which outputs are offered to coin selection: least recently touched first, then
    /// oldest, then by txid and vout
    pub fn selection_order(&self, other: &Self) -> Ordering {
        self.touched_at
            .cmp(&other.touched_at)
            .then(self.created_at.cmp(&other.created_at))
            .then_with(|| {
                self.outpoint
                    .txid
                    .to_string()
                    .cmp(&other.outpoint.txid.to_string())
            })
            .then(self.outpoint.vout.cmp(&other.outpoint.vout))
    }

    /// Id of the transaction that created the output
    pub fn txid(&self) -> Txid {
        self.outpoint.txid
    }
}

/// Sort `records` in the order expected by coin selection
pub fn sort_for_selection(records: &mut [UtxoRecord]) {
    records.sort_by(UtxoRecord::selection_order);
}

/// A locking script known to belong to one of the owners
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Destination {
    /// Owner of the destination
    pub owner_id: String,
    /// Locking script
    pub script_pubkey: Script,
    /// Instructions copied into every [`UtxoRecord`] paying this destination
    pub spending_instructions: serde_json::Value,
}

/// Return the current timestamp in seconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn can_store_fee_unit_in_const() {
        const _MY_UNIT: FeeUnit = FeeUnit::new(1, 20);
    }

    #[test]
    fn test_fee_is_rounded_up() {
        let unit = FeeUnit::new(1, 20);

        assert_eq!(unit.fee_for_size(0).unwrap(), 0);
        assert_eq!(unit.fee_for_size(1).unwrap(), 1);
        assert_eq!(unit.fee_for_size(20).unwrap(), 1);
        assert_eq!(unit.fee_for_size(21).unwrap(), 2);

        let unit = FeeUnit::new(5, 1000);
        assert_eq!(unit.fee_for_size(1001).unwrap(), 10);
    }

    #[test]
    fn test_zero_bytes_fee_unit() {
        assert_matches!(
            FeeUnit::new(1, 0).fee_for_size(10),
            Err(Error::InvalidFeeUnit)
        );
    }
}

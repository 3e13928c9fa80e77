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

//! Recorded transactions
//!
//! A [`Transaction`] is the ledger entry of a transaction known to the engine. Its id always
//! derives from its bytes: there is no way to change the hex of a record once built.

use std::collections::BTreeMap;
use std::convert::TryFrom;

use bitcoin::{BlockHash, Txid};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::blockchain::BroadcastStatus;
use crate::error::Error;
use crate::extended::ExtendedTransaction;
use crate::types::get_timestamp;
use crate::wallet::draft::DraftConfiguration;

mod status;

pub use status::TxStatus;

/// Free-form metadata
pub type Metadata = Map<String, Value>;

/// Direction of a transaction from the point of view of an owner
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The owner received value
    Incoming,
    /// The owner sent value
    Outgoing,
}

/// A transaction recorded by the engine
///
/// Deserializing a record checks that its id matches the stored bytes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "StoredTransaction")]
pub struct Transaction {
    id: Txid,
    hex: String,
    status: TxStatus,

    /// Owners of the spent outputs
    pub input_owners: Vec<String>,
    /// Owners of the created outputs
    pub output_owners: Vec<String>,
    /// Metadata attached to the transaction
    #[serde(default)]
    pub metadata: Metadata,
    /// Metadata visible only to each owner
    #[serde(default)]
    pub owner_metadata: BTreeMap<String, Metadata>,
    /// Net value received (positive) or sent (negative) by each owner
    #[serde(default)]
    pub owner_values: BTreeMap<String, i64>,
    /// Number of inputs
    pub num_inputs: u32,
    /// Number of outputs
    pub num_outputs: u32,
    /// Value transferred, change excluded when known
    pub total_value: u64,
    /// Fee, when known
    pub fee: Option<u64>,
    /// Hash of the block including the transaction
    pub block_hash: Option<BlockHash>,
    /// Height of the block including the transaction
    pub block_height: Option<u32>,
    /// Draft the transaction was built from
    pub draft_id: Option<String>,
    /// Creation time
    pub created_at: u64,
}

#[derive(Deserialize)]
struct StoredTransaction {
    id: Txid,
    hex: String,
    status: TxStatus,
    input_owners: Vec<String>,
    output_owners: Vec<String>,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    owner_metadata: BTreeMap<String, Metadata>,
    #[serde(default)]
    owner_values: BTreeMap<String, i64>,
    num_inputs: u32,
    num_outputs: u32,
    total_value: u64,
    fee: Option<u64>,
    block_hash: Option<BlockHash>,
    block_height: Option<u32>,
    draft_id: Option<String>,
    created_at: u64,
}

impl TryFrom<StoredTransaction> for Transaction {
    type Error = Error;

    fn try_from(stored: StoredTransaction) -> Result<Self, Self::Error> {
        let txid = ExtendedTransaction::from_hex(&stored.hex)?.txid();
        if txid != stored.id {
            return Err(Error::Generic(format!(
                "Stored id {} doesn't match transaction {}",
                stored.id, txid
            )));
        }

        Ok(Transaction {
            id: txid,
            hex: stored.hex.to_lowercase(),
            status: stored.status,
            input_owners: stored.input_owners,
            output_owners: stored.output_owners,
            metadata: stored.metadata,
            owner_metadata: stored.owner_metadata,
            owner_values: stored.owner_values,
            num_inputs: stored.num_inputs,
            num_outputs: stored.num_outputs,
            total_value: stored.total_value,
            fee: stored.fee,
            block_hash: stored.block_hash,
            block_height: stored.block_height,
            draft_id: stored.draft_id,
            created_at: stored.created_at,
        })
    }
}

impl Transaction {
    /// Build a record from a hex string, in plain or extended encoding
    pub fn from_hex(hex: &str) -> Result<Self, Error> {
        let parsed = ExtendedTransaction::from_hex(hex)?;
        Ok(Self::with_hex(&parsed, hex.to_lowercase()))
    }

    /// Build a record from a parsed transaction, storing it in extended encoding when
    /// `as_extended` is true and plain encoding otherwise
    pub fn from_extended(tx: &ExtendedTransaction, as_extended: bool) -> Result<Self, Error> {
        let hex = if as_extended {
            tx.to_extended_hex()?
        } else {
            tx.to_raw_hex()
        };

        Ok(Self::with_hex(tx, hex))
    }

    fn with_hex(tx: &ExtendedTransaction, hex: String) -> Self {
        let inner = tx.transaction();

        Transaction {
            id: tx.txid(),
            hex,
            status: TxStatus::Created,
            input_owners: vec![],
            output_owners: vec![],
            metadata: Metadata::new(),
            owner_metadata: BTreeMap::new(),
            owner_values: BTreeMap::new(),
            num_inputs: inner.input.len() as u32,
            num_outputs: inner.output.len() as u32,
            total_value: tx.output_value(),
            fee: None,
            block_hash: None,
            block_height: None,
            draft_id: None,
            created_at: get_timestamp(),
        }
    }

    /// Tie the record to a draft
    pub fn with_draft_id(mut self, draft_id: &str) -> Self {
        self.draft_id = Some(draft_id.to_string());
        self
    }

    /// Id of the transaction
    pub fn id(&self) -> Txid {
        self.id
    }

    /// Hex of the transaction, in the encoding it was received in
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Current status
    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Parse the stored hex
    pub fn parse(&self) -> Result<ExtendedTransaction, Error> {
        ExtendedTransaction::from_hex(&self.hex)
    }

    /// Move to `to`, if the lifecycle allows it
    pub(crate) fn transition(&mut self, to: TxStatus) -> Result<(), Error> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidStatusTransition {
                from: self.status,
                to,
            });
        }

        self.status = to;
        Ok(())
    }

    /// Update the status with the one reported by the broadcaster
    ///
    /// Mined statuses move the transaction to [`TxStatus::Mined`], problematic ones to
    /// [`TxStatus::Problematic`]; other statuses, or changes not allowed by the lifecycle, are
    /// ignored. Returns whether the status changed.
    pub fn update_from_broadcast_status(&mut self, status: BroadcastStatus) -> bool {
        let target = if status.is_mined() {
            TxStatus::Mined
        } else if status.is_problematic() {
            TxStatus::Problematic
        } else {
            log::debug!(
                "Broadcaster returned neutral status {} for {}, status won't be updated",
                status,
                self.id
            );
            return false;
        };

        if target == self.status {
            return false;
        }

        match self.transition(target) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Ignoring status {} for {}: {}", status, self.id, e);
                false
            }
        }
    }

    /// Move a mined transaction back after a reorg
    pub fn mark_reverted(&mut self) -> Result<(), Error> {
        self.transition(TxStatus::Reverted)
    }

    /// Update the metadata of `owner_id`, a `null` value removes the key
    pub fn update_metadata(&mut self, owner_id: &str, metadata: Metadata) -> Result<(), Error> {
        if owner_id.is_empty() {
            return Err(Error::Generic("Missing owner id".to_string()));
        }

        let entry = self
            .owner_metadata
            .entry(owner_id.to_string())
            .or_insert_with(Metadata::new);
        for (key, value) in metadata {
            if value.is_null() {
                entry.remove(&key);
            } else {
                entry.insert(key, value);
            }
        }

        Ok(())
    }

    /// Whether `owner_id` is on either side of the transaction
    pub fn is_owner_associated(&self, owner_id: &str) -> bool {
        !owner_id.is_empty()
            && (self.input_owners.iter().any(|o| o == owner_id)
                || self.output_owners.iter().any(|o| o == owner_id))
    }

    /// Net value received by `owner_id`
    pub fn value_for(&self, owner_id: &str) -> i64 {
        self.owner_values.get(owner_id).copied().unwrap_or(0)
    }

    /// Direction of the transaction for `owner_id`
    pub fn direction_for(&self, owner_id: &str) -> Direction {
        if self.value_for(owner_id) > 0 {
            Direction::Incoming
        } else {
            Direction::Outgoing
        }
    }

    pub(crate) fn add_input_owner(&mut self, owner_id: &str, satoshis: u64) {
        if !self.input_owners.iter().any(|o| o == owner_id) {
            self.input_owners.push(owner_id.to_string());
        }
        *self.owner_values.entry(owner_id.to_string()).or_insert(0) -= satoshis as i64;
    }

    pub(crate) fn add_output_owner(&mut self, owner_id: &str, satoshis: u64) {
        if !self.output_owners.iter().any(|o| o == owner_id) {
            self.output_owners.push(owner_id.to_string());
        }
        *self.owner_values.entry(owner_id.to_string()).or_insert(0) += satoshis as i64;
    }

    /// Compute value and fee, using the draft configuration when available
    pub(crate) fn compute_values(
        &mut self,
        tx: &ExtendedTransaction,
        draft: Option<&DraftConfiguration>,
    ) {
        let output_value = tx.output_value();

        match draft {
            Some(configuration) => {
                self.total_value = output_value.saturating_sub(configuration.change_satoshis);
                self.fee = Some(configuration.fee);
            }
            None if tx.is_fully_sourced() => {
                self.total_value = output_value;
                self.fee = Some(tx.sourced_input_value().saturating_sub(output_value));
            }
            None => {
                self.total_value = output_value;
                self.fee = None;
            }
        }
    }
}

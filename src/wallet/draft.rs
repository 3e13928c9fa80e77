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

//! Draft transactions
//!
//! A draft is an unsigned transaction funded by the UTXOs of its owner. The inputs stay reserved
//! until the signed transaction is recorded, completing the draft, or the draft is canceled.

use std::fmt;

use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::hex::{FromHex, ToHex};
use bitcoin::{PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::extended::ExtendedTransaction;
use crate::types::{FeeUnit, UtxoRecord};
use crate::wallet::utils::varint_len;

/// Paymail routing of an output
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PaymailP4 {
    /// Alias of the receiver
    pub alias: String,
    /// Domain of the receiver
    pub domain: String,
    /// Paymail of the sender
    pub from_paymail: String,
}

impl PaymailP4 {
    /// `alias@domain`
    pub fn receiver(&self) -> String {
        format!("{}@{}", self.alias, self.domain)
    }
}

/// Requested output of a draft
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionOutput {
    /// Value in satoshis
    pub satoshis: u64,
    /// Locking script, hex encoded
    pub script: String,
    /// Receiver: address, paymail or handle
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    /// Paymail routing, when paying a paymail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymail_p4: Option<PaymailP4>,
    /// Whether the output carries tokens
    #[serde(default)]
    pub token: bool,
    /// Whether the output returns token change to the sender
    #[serde(default)]
    pub token_change: bool,
    /// Whether the output pays a token transfer fee
    #[serde(default)]
    pub token_fee: bool,
}

impl TransactionOutput {
    /// Output paying `satoshis` to `script_pubkey`
    pub fn new(to: &str, script_pubkey: &Script, satoshis: u64) -> Self {
        TransactionOutput {
            satoshis,
            script: script_pubkey.to_hex(),
            to: to.to_string(),
            ..Default::default()
        }
    }

    /// Decoded locking script
    pub fn script_pubkey(&self) -> Result<Script, Error> {
        Ok(Script::from(Vec::<u8>::from_hex(&self.script)?))
    }

    /// Output to add to the transaction
    pub fn to_txout(&self) -> Result<TxOut, Error> {
        Ok(TxOut {
            value: self.satoshis,
            script_pubkey: self.script_pubkey()?,
        })
    }
}

/// Status of a draft
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    /// Waiting to be signed and recorded
    Draft,
    /// Recorded
    Complete,
    /// Canceled, the inputs have been released
    Canceled,
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DraftStatus::Draft => "draft",
            DraftStatus::Complete => "complete",
            DraftStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// How a draft was funded
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DraftConfiguration {
    /// Requested outputs, in transaction order
    pub outputs: Vec<TransactionOutput>,
    /// Reserved inputs, in transaction order
    pub inputs: Vec<UtxoRecord>,
    /// Value of the change output, appended after the requested outputs
    pub change_satoshis: u64,
    /// Locking script of the change output
    pub change_script: Option<Script>,
    /// Fee paid by the transaction
    pub fee: u64,
    /// Fee unit used to compute the fee
    pub fee_unit: FeeUnit,
}

/// An unsigned transaction waiting to be recorded
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DraftTransaction {
    /// Unique id
    pub id: String,
    /// Owner of the inputs
    pub owner_id: String,
    /// Unsigned transaction, in extended encoding
    pub hex: String,
    /// Funding details
    pub configuration: DraftConfiguration,
    /// Status
    pub status: DraftStatus,
    /// Id of the recorded transaction
    pub final_txid: Option<Txid>,
    /// Creation time
    pub created_at: u64,
}

impl DraftTransaction {
    /// Whether the draft can still be recorded or canceled
    pub fn is_open(&self) -> bool {
        self.status == DraftStatus::Draft
    }

    /// Mark the draft as recorded under `txid`
    pub fn complete(&mut self, txid: Txid) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::DraftNotOpen(self.id.clone()));
        }

        self.status = DraftStatus::Complete;
        self.final_txid = Some(txid);
        Ok(())
    }

    /// Mark the draft as canceled
    pub fn cancel(&mut self) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::DraftNotOpen(self.id.clone()));
        }

        self.status = DraftStatus::Canceled;
        Ok(())
    }

    /// Outpoints of the reserved inputs
    pub fn outpoints(&self) -> Vec<bitcoin::OutPoint> {
        self.configuration
            .inputs
            .iter()
            .map(|utxo| utxo.outpoint)
            .collect()
    }
}

/// Estimated size of a transaction paying `outputs`, without inputs
///
/// The input count is assumed to fit in a single byte.
pub fn estimate_base_size(outputs: &[TxOut]) -> u64 {
    let outputs_size: u64 = outputs.iter().map(|o| serialize(o).len() as u64).sum();

    // version + locktime + input count + output count
    4 + 4 + 1 + varint_len(outputs.len() as u64) + outputs_size
}

/// Assemble the unsigned transaction spending `inputs`, carrying their source outputs
pub fn build_unsigned(inputs: &[UtxoRecord], outputs: Vec<TxOut>) -> Result<ExtendedTransaction, Error> {
    let tx = Transaction {
        version: 1,
        lock_time: PackedLockTime::ZERO,
        input: inputs
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: Script::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            })
            .collect(),
        output: outputs,
    };

    let mut extended = ExtendedTransaction::new(tx);
    for (index, utxo) in inputs.iter().enumerate() {
        extended.set_source_output(
            index,
            TxOut {
                value: utxo.satoshis,
                script_pubkey: utxo.script_pubkey.clone(),
            },
        )?;
    }

    Ok(extended)
}

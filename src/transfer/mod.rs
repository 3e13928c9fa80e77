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

//! Token transfers
//!
//! A token transfer happens in two steps. The sender first submits an [`Intent`]: the engine
//! computes the fee, splits the sender's banknotes into outputs and stores a [`TransferIntent`].
//! The sender then builds and signs the transaction paying those outputs and submits it as a
//! [`Transfer`] referencing the intent, which is checked against the stored outputs before being
//! recorded.

use bitcoin::Transaction;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::tokens::{token_operation, TokenOperation};
use crate::transaction::Metadata;
use crate::types::get_timestamp;
use crate::wallet::draft::TransactionOutput;
use crate::wallet::utils::sha256_hex;

pub mod validator;

pub use validator::{DefaultIntentValidator, IntentValidator, TransferOutputs};

/// Metadata key exempting a transfer from fees
pub const FEE_FREE_KEY: &str = "fee_free";

/// A chunk of token value
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Banknote {
    /// Token units
    #[serde(rename = "value")]
    pub amount: u64,
    /// Token id the units belong to
    pub serial: String,
}

impl Banknote {
    /// Create a banknote
    pub fn new(amount: u64, serial: &str) -> Self {
        Banknote {
            amount,
            serial: serial.to_string(),
        }
    }
}

/// Transfer requested by a sender
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Intent {
    /// Paymail of the sender
    pub sender_id: String,
    /// Paymail of the receiver
    pub receiver_id: String,
    /// Nonce chosen by the sender
    pub nonce: String,
    /// Token being transferred
    pub asset_id: String,
    /// Amount transferred, fee included
    pub amount: u64,
    /// Banknotes funding the transfer
    pub banknotes: Vec<Banknote>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Metadata,
}

impl Intent {
    /// Whether the sender asked for a transfer without fees
    pub fn is_fee_free(&self) -> bool {
        self.metadata.contains_key(FEE_FREE_KEY)
    }
}

/// Answer to a validated [`Intent`]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ValidationResponse {
    /// Nonce chosen by the engine
    pub nonce: String,
    /// Outputs the transaction must pay
    pub outputs: Vec<TransactionOutput>,
}

/// Operations allowed without a stored intent
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpecialOperation {
    /// New tokens are put in circulation
    Issue,
    /// Tokens are taken out of circulation
    Redeem,
}

/// Signed transaction submitted for a transfer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Transfer {
    /// Id of the [`TransferIntent`]
    pub ref_id: String,
    /// Transaction hex, plain or extended
    pub tx_hex: String,
    /// Special operation, when the transfer has no intent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_operation: Option<SpecialOperation>,
}

/// A validated intent, waiting for its transaction
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransferIntent {
    /// SHA-256 of the sender nonce followed by the engine nonce, hex encoded
    pub id: String,
    /// Paymail of the sender
    pub sender_id: String,
    /// Paymail of the receiver
    pub receiver_id: String,
    /// Nonce chosen by the engine
    pub nonce: String,
    /// Token being transferred
    pub asset_id: String,
    /// Amount transferred, fee included
    pub amount: u64,
    /// Banknotes funding the transfer
    pub banknotes: Vec<Banknote>,
    /// Outputs the transaction must pay
    pub outputs: Vec<TransactionOutput>,
    /// Creation time
    pub created_at: u64,
}

impl TransferIntent {
    /// Store the outcome of the validation of `intent`
    pub fn new(intent: &Intent, server_nonce: &str, outputs: Vec<TransactionOutput>) -> Self {
        TransferIntent {
            id: Self::compute_id(&intent.nonce, server_nonce),
            sender_id: intent.sender_id.clone(),
            receiver_id: intent.receiver_id.clone(),
            nonce: server_nonce.to_string(),
            asset_id: intent.asset_id.clone(),
            amount: intent.amount,
            banknotes: intent.banknotes.clone(),
            outputs,
            created_at: get_timestamp(),
        }
    }

    /// Id of the intent with the given nonces
    pub fn compute_id(caller_nonce: &str, server_nonce: &str) -> String {
        sha256_hex(format!("{}{}", caller_nonce, server_nonce).as_bytes())
    }
}

/// Check that `tx` pays every token output of `intent`
///
/// Transfers without a stored intent are accepted only for special operations.
pub fn compare_scripts(
    intent: Option<&TransferIntent>,
    tx: &Transaction,
    transfer: &Transfer,
) -> Result<(), Error> {
    let intent = match intent {
        Some(intent) => intent,
        None if transfer.special_operation.is_some() => return Ok(()),
        None => {
            return Err(Error::TransferMismatch(format!(
                "Transfer intent {} not found",
                transfer.ref_id
            )))
        }
    };

    let mut tx_operations: Vec<TokenOperation> = tx
        .output
        .iter()
        .filter_map(|txout| token_operation(&txout.script_pubkey))
        .collect();

    for (index, output) in intent.outputs.iter().enumerate() {
        let expected = token_operation(&output.script_pubkey()?).ok_or_else(|| {
            Error::TransferMismatch(format!("Intent output {} is not a token output", index))
        })?;

        // each transaction output pays at most one intent output
        match tx_operations.iter().position(|op| *op == expected) {
            Some(position) => {
                tx_operations.swap_remove(position);
            }
            None => {
                return Err(Error::TransferMismatch(format!(
                    "Transaction doesn't pay intent output {} ({} {:?})",
                    index, expected.amt, expected.id
                )))
            }
        }
    }

    Ok(())
}

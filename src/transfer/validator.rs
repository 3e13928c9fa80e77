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

//! Intent validation
//!
//! The [`IntentValidator`] trait turns an [`Intent`] into the token outputs of its transaction.
//! [`DefaultIntentValidator`] charges the first applicable fee band of the token and splits the
//! banknotes largest first: the fee is paid first, then the receiver, and whatever is left goes
//! back to the sender as token change.

use bitcoin::hashes::hex::ToHex;

use crate::error::Error;
use crate::tokens::{transfer_script, AssetRules};
use crate::transfer::{Banknote, Intent};
use crate::wallet::draft::TransactionOutput;

/// Token outputs of a transfer, by role
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferOutputs {
    /// Outputs paying the receiver
    pub receiver: Vec<TransactionOutput>,
    /// Outputs paying the fee
    pub fee: Vec<TransactionOutput>,
    /// Outputs returning change to the sender
    pub change: Vec<TransactionOutput>,
}

impl TransferOutputs {
    /// All the outputs: receiver first, then fee, then change
    pub fn into_outputs(self) -> Vec<TransactionOutput> {
        let mut outputs = self.receiver;
        outputs.extend(self.fee);
        outputs.extend(self.change);
        outputs
    }
}

/// Fee charged on a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeCharge {
    /// Token units
    pub amount: u64,
    /// Who receives the fee
    pub recipient: String,
}

/// Trait for objects that check intents and compute their outputs
pub trait IntentValidator: std::fmt::Debug + Send + Sync {
    /// Reject intents that can't be honored regardless of the token rules
    fn validate_sender(&self, intent: &Intent) -> Result<(), Error>;

    /// Compute the outputs of `intent`
    ///
    /// `rules` is `None` when the transfer is exempt from fees.
    fn tx_outputs(
        &self,
        intent: &Intent,
        rules: Option<&AssetRules>,
        token_output_satoshis: u64,
    ) -> Result<TransferOutputs, Error>;
}

/// Default intent validator
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultIntentValidator;

impl IntentValidator for DefaultIntentValidator {
    fn validate_sender(&self, intent: &Intent) -> Result<(), Error> {
        if intent.sender_id.is_empty() || intent.receiver_id.is_empty() {
            return Err(Error::Generic("Missing sender or receiver".to_string()));
        }
        if intent.nonce.is_empty() {
            return Err(Error::Generic("Missing nonce".to_string()));
        }
        if intent.amount == 0 {
            return Err(Error::Generic("Transfer amount must be positive".to_string()));
        }

        Ok(())
    }

    fn tx_outputs(
        &self,
        intent: &Intent,
        rules: Option<&AssetRules>,
        token_output_satoshis: u64,
    ) -> Result<TransferOutputs, Error> {
        let available: u64 = intent.banknotes.iter().map(|b| b.amount).sum();
        if available < intent.amount {
            return Err(Error::InsufficientBanknotes {
                needed: intent.amount,
                available,
            });
        }

        let charge = transfer_fee(intent, rules)?;
        let fee = charge.as_ref().map(|c| c.amount).unwrap_or(0);

        let mut pool: Vec<Banknote> = intent
            .banknotes
            .iter()
            .filter(|b| b.amount > 0)
            .cloned()
            .collect();
        let fee_chunks = split_fee(&mut pool, fee);
        let (receiver_chunks, change_chunks) = split_share(pool, intent.amount - fee);

        let output = |to: &str, chunk: &Banknote| TransactionOutput {
            satoshis: token_output_satoshis,
            script: transfer_script(&chunk.serial, chunk.amount).to_hex(),
            to: to.to_string(),
            token: true,
            ..Default::default()
        };

        let fee_recipient = charge.map(|c| c.recipient).unwrap_or_default();
        Ok(TransferOutputs {
            receiver: receiver_chunks
                .iter()
                .map(|chunk| output(&intent.receiver_id, chunk))
                .collect(),
            fee: fee_chunks
                .iter()
                .map(|chunk| TransactionOutput {
                    token_fee: true,
                    ..output(&fee_recipient, chunk)
                })
                .collect(),
            change: change_chunks
                .iter()
                .map(|chunk| TransactionOutput {
                    token_change: true,
                    ..output(&intent.sender_id, chunk)
                })
                .collect(),
        })
    }
}

/// Fee due on `intent`, if any
pub fn transfer_fee(intent: &Intent, rules: Option<&AssetRules>) -> Result<Option<FeeCharge>, Error> {
    let rules = match rules {
        Some(rules) if !intent.is_fee_free() && intent.receiver_id != rules.emitter_id => rules,
        _ => return Ok(None),
    };

    let band = match rules.applicable_band(intent.amount) {
        Some(band) => band,
        None => return Ok(None),
    };

    let fee = band.fee_for(intent.amount);
    if fee == 0 {
        return Ok(None);
    }
    if fee >= intent.amount {
        return Err(Error::FeeExceedsTransfer {
            fee,
            amount: intent.amount,
        });
    }

    Ok(Some(FeeCharge {
        amount: fee,
        recipient: band.recipient.clone(),
    }))
}

fn sort_descending(pool: &mut [Banknote]) {
    pool.sort_by(|a, b| b.amount.cmp(&a.amount));
}

/// Take `fee` out of `pool`, largest banknotes first
///
/// The banknote exceeding the remaining fee is split and its remainder returned to the pool.
/// The pool is left sorted by descending amount.
pub fn split_fee(pool: &mut Vec<Banknote>, fee: u64) -> Vec<Banknote> {
    sort_descending(pool);

    let mut remaining = fee;
    let mut taken = Vec::new();
    while remaining > 0 && !pool.is_empty() {
        let chunk = pool.remove(0);
        if chunk.amount <= remaining {
            remaining -= chunk.amount;
            taken.push(chunk);
        } else {
            taken.push(Banknote::new(remaining, &chunk.serial));
            pool.push(Banknote::new(chunk.amount - remaining, &chunk.serial));
            remaining = 0;
        }
    }

    sort_descending(pool);
    taken
}

// Returns the chunks paying `share` and the chunks left over
fn split_share(pool: Vec<Banknote>, share: u64) -> (Vec<Banknote>, Vec<Banknote>) {
    let mut remaining = share;
    let mut paid = Vec::new();
    let mut change = Vec::new();

    for chunk in pool {
        if remaining == 0 {
            change.push(chunk);
        } else if chunk.amount <= remaining {
            remaining -= chunk.amount;
            paid.push(chunk);
        } else {
            paid.push(Banknote::new(remaining, &chunk.serial));
            change.push(Banknote::new(chunk.amount - remaining, &chunk.serial));
            remaining = 0;
        }
    }

    (paid, change)
}

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

//! Token collaborators
//!
//! The engine doesn't keep a token ledger: transfers are checked and registered by a
//! [`TokenVerifier`], and the fees charged on them are described by a [`FeeRuleProvider`].

use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub mod bsv21;

pub use bsv21::{is_token_transaction, token_operation, transfer_script, TokenOperation};

/// Token transfer submitted to the [`TokenVerifier`]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferMessage {
    /// Paymail of the sender
    pub sender_id: String,
    /// Paymail of the receiver
    pub receiver_id: String,
    /// Outputs returning token change to the sender
    pub sender_vouts: Vec<u32>,
    /// Outputs paying the receiver
    pub receiver_vouts: Vec<u32>,
    /// Outputs paying the transfer fee
    pub fee_vouts: Vec<u32>,
    /// Transaction hex
    pub hex: String,
    /// Token being transferred, when it can be read from the transfer output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
}

/// Outcome of a successful verification
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The transfer was valid and has been registered
    Registered,
    /// The transfer had already been registered
    AlreadyKnown,
}

/// Trait for objects that verify and register token transfers
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify `message`, registering the transfer when valid
    async fn verify_and_register(&self, message: &TransferMessage) -> Result<VerifyOutcome, Error>;
}

/// How a fee is computed
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FeeKind {
    /// Fixed amount
    Fixed(u64),
    /// Percentage of the transferred amount, rounded up
    Percentage(f64),
}

/// Fee applied to transfers with amount in `from..to`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeeBand {
    /// Lower bound, inclusive
    pub from: u64,
    /// Upper bound, exclusive
    pub to: u64,
    /// Fee kind and value
    pub fee: FeeKind,
    /// Who receives the fee
    pub recipient: String,
}

impl FeeBand {
    /// Whether the band applies to `amount`
    pub fn contains(&self, amount: u64) -> bool {
        self.from <= amount && amount < self.to
    }

    /// Fee due on `amount`
    pub fn fee_for(&self, amount: u64) -> u64 {
        match self.fee {
            FeeKind::Fixed(value) => value,
            FeeKind::Percentage(p) => ((amount as f64 * p) / 100.0).ceil() as u64,
        }
    }
}

/// Transfer rules of a token
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AssetRules {
    /// Owner of the token: transfers to the emitter are never charged
    pub emitter_id: String,
    /// Fee bands, checked in order
    #[serde(default)]
    pub fees: Vec<FeeBand>,
}

impl AssetRules {
    /// First band applying to `amount`
    pub fn applicable_band(&self, amount: u64) -> Option<&FeeBand> {
        self.fees.iter().find(|band| band.contains(amount))
    }
}

/// Trait for objects that know the transfer rules of tokens
#[async_trait]
pub trait FeeRuleProvider: Send + Sync {
    /// Rules of the token `asset_id`
    async fn rules_for(&self, asset_id: &str) -> Result<AssetRules, Error>;
}

#[async_trait]
impl<T: TokenVerifier + ?Sized> TokenVerifier for Arc<T> {
    async fn verify_and_register(&self, message: &TransferMessage) -> Result<VerifyOutcome, Error> {
        self.deref().verify_and_register(message).await
    }
}

#[async_trait]
impl<T: FeeRuleProvider + ?Sized> FeeRuleProvider for Arc<T> {
    async fn rules_for(&self, asset_id: &str) -> Result<AssetRules, Error> {
        self.deref().rules_for(asset_id).await
    }
}

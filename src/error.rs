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

use std::fmt;

use bitcoin::Txid;

use crate::blockchain::BroadcastStatus;
use crate::transaction::TxStatus;

/// Errors that can be thrown by the [`Engine`](crate::wallet::Engine)
#[derive(Debug)]
pub enum Error {
    /// Generic error
    Generic(String),
    /// The UTXO set of the owner is not enough to cover the requested outputs plus fee
    InsufficientFunds {
        /// Sats needed to fund the outputs and the fee
        needed: u64,
        /// Sats available for spending
        available: u64,
    },
    /// The fee unit charges per zero bytes
    InvalidFeeUnit,
    /// The source transaction resolver returned data inconsistent with the request
    SourceResolution(String),
    /// None of the outputs of an external transaction pays a known destination
    NoMatchingOutputs,
    /// The token verifier rejected the transfer, or the transfer message could not be built
    TokenValidationFailed(String),
    /// Malformed transaction hex
    InvalidHex,
    /// No transaction was provided
    EmptyTransaction,
    /// The requested status change is not allowed by the lifecycle
    InvalidStatusTransition {
        /// Current status
        from: TxStatus,
        /// Requested status
        to: TxStatus,
    },
    /// The broadcaster refused the transaction
    BroadcastRejected {
        /// Id of the rejected transaction
        txid: Txid,
        /// Status reported by the broadcaster
        status: BroadcastStatus,
    },
    /// The broadcast was interrupted: the transaction may or may not have reached the network.
    /// Check whether it has been recorded before retrying.
    BroadcastOutcomeUnknown {
        /// Id of the transaction being broadcast
        txid: Txid,
    },
    /// A collaborator call exceeded the configured deadline
    Timeout,
    /// Waiting for the given key lock exceeded the configured deadline
    LockTimeout(String),
    /// Thrown when a draft is not found in the database
    DraftNotFound(String),
    /// The draft has already been completed or canceled
    DraftNotOpen(String),
    /// The draft of a token transaction has no receiver output
    NoTransferOutput,
    /// The transfer fee would consume the whole transferred amount
    FeeExceedsTransfer {
        /// Computed fee
        fee: u64,
        /// Transferred amount
        amount: u64,
    },
    /// The banknotes of a transfer intent do not cover the amount
    InsufficientBanknotes {
        /// Amount that must be covered, fee included
        needed: u64,
        /// Total value of the banknotes
        available: u64,
    },
    /// The transaction of a transfer doesn't match its intent
    TransferMismatch(String),
    /// Happens when trying to spend an UTXO that is not in the database
    UnknownUtxo,
    /// Requested draft output has no recipients
    NoRecipients,
    /// The transaction has not been recorded
    TransactionNotFound(Txid),

    /// Encoding error
    Encode(bitcoin::consensus::encode::Error),
    /// Hex decoding error
    Hex(bitcoin::hashes::hex::Error),
    /// Error serializing or deserializing JSON data
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic(err) => write!(f, "Generic error: {}", err),
            Self::InsufficientFunds { needed, available } => write!(
                f,
                "Insufficient funds: {} sat available of {} sat needed",
                available, needed
            ),
            Self::InvalidFeeUnit => write!(f, "Fee unit must charge per at least one byte"),
            Self::SourceResolution(err) => {
                write!(f, "Failed to resolve source transactions: {}", err)
            }
            Self::NoMatchingOutputs => write!(f, "No output matches a known destination"),
            Self::TokenValidationFailed(err) => write!(f, "Token validation failed: {}", err),
            Self::InvalidHex => write!(f, "Invalid transaction hex"),
            Self::EmptyTransaction => write!(f, "Empty transaction"),
            Self::InvalidStatusTransition { from, to } => {
                write!(f, "Invalid status transition: {} -> {}", from, to)
            }
            Self::BroadcastRejected { txid, status } => {
                write!(f, "Broadcast of {} rejected with status {:?}", txid, status)
            }
            Self::BroadcastOutcomeUnknown { txid } => write!(
                f,
                "Broadcast of {} interrupted, outcome unknown",
                txid
            ),
            Self::Timeout => write!(f, "Deadline exceeded"),
            Self::LockTimeout(key) => write!(f, "Timed out waiting for lock `{}`", key),
            Self::DraftNotFound(id) => write!(f, "Draft transaction {} not found", id),
            Self::DraftNotOpen(id) => write!(f, "Draft transaction {} is not open", id),
            Self::NoTransferOutput => write!(f, "Draft has no token transfer output"),
            Self::FeeExceedsTransfer { fee, amount } => write!(
                f,
                "Fee of {} would cover all of the transfer of {}",
                fee, amount
            ),
            Self::InsufficientBanknotes { needed, available } => write!(
                f,
                "Insufficient banknotes: {} available of {} needed",
                available, needed
            ),
            Self::TransferMismatch(err) => write!(f, "Transfer validation failed: {}", err),
            Self::UnknownUtxo => write!(f, "UTXO not found in the database"),
            Self::NoRecipients => write!(f, "Cannot build a draft without outputs"),
            Self::TransactionNotFound(txid) => write!(f, "Transaction {} not found", txid),
            Self::Encode(err) => write!(f, "Encoding error: {}", err),
            Self::Hex(err) => write!(f, "Hex decoding error: {}", err),
            Self::Json(err) => write!(f, "Serialize/Deserialize JSON error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

macro_rules! impl_error {
    ( $from:ty, $to:ident ) => {
        impl_error!($from, $to, Error);
    };
    ( $from:ty, $to:ident, $impl_for:ty ) => {
        impl std::convert::From<$from> for $impl_for {
            fn from(err: $from) -> Self {
                <$impl_for>::$to(err)
            }
        }
    };
}

impl_error!(bitcoin::consensus::encode::Error, Encode);
impl_error!(bitcoin::hashes::hex::Error, Hex);
impl_error!(serde_json::Error, Json);

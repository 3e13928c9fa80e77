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

//! Network collaborators
//!
//! This module defines the traits through which the engine talks to the network: a
//! [`Broadcaster`] that submits transactions and a [`SourceResolver`] that returns the bodies of
//! previously mined transactions.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::extended::ExtendedTransaction;

/// Status of a transaction as reported by the broadcaster
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastStatus {
    /// The broadcaster has no information about the transaction
    Unknown,
    /// Waiting in the broadcaster queue
    Queued,
    /// Received by the broadcaster
    Received,
    /// Stored by the broadcaster
    Stored,
    /// Announced to the network
    AnnouncedToNetwork,
    /// Requested by a node
    RequestedByNetwork,
    /// Sent to a node
    SentToNetwork,
    /// Accepted by a node
    AcceptedByNetwork,
    /// Seen in the mempool of a node
    SeenOnNetwork,
    /// Included in a block
    Mined,
    /// Buried deep enough to be considered final
    Immutable,
    /// Seen in a mempool, but its parents are unknown
    SeenInOrphanMempool,
    /// Another transaction spending the same inputs was seen
    DoubleSpendAttempted,
    /// Rejected by the network
    Rejected,
}

impl BroadcastStatus {
    /// Whether the transaction made it into a block
    pub fn is_mined(&self) -> bool {
        matches!(self, BroadcastStatus::Mined | BroadcastStatus::Immutable)
    }

    /// Whether the transaction is unlikely to ever be mined
    pub fn is_problematic(&self) -> bool {
        matches!(
            self,
            BroadcastStatus::Rejected
                | BroadcastStatus::DoubleSpendAttempted
                | BroadcastStatus::SeenInOrphanMempool
        )
    }
}

impl fmt::Display for BroadcastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Trait for objects that can submit transactions to the network
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Submit a transaction, returning the status reported by the network
    ///
    /// An `Err` means the submission itself failed, a problematic status means the network
    /// refused the transaction.
    async fn broadcast(&self, tx: &ExtendedTransaction) -> Result<BroadcastStatus, Error>;
}

/// Trait for objects that can fetch the bodies of previous transactions
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Fetch the transactions with the given ids
    ///
    /// The result should contain exactly one entry per requested id: callers validate it and
    /// treat any missing, extra or duplicated entry as an error.
    async fn get_transactions(&self, txids: &[Txid]) -> Result<Vec<Option<Transaction>>, Error>;
}

#[async_trait]
impl<T: Broadcaster + ?Sized> Broadcaster for Arc<T> {
    async fn broadcast(&self, tx: &ExtendedTransaction) -> Result<BroadcastStatus, Error> {
        self.deref().broadcast(tx).await
    }
}

#[async_trait]
impl<T: SourceResolver + ?Sized> SourceResolver for Arc<T> {
    async fn get_transactions(&self, txids: &[Txid]) -> Result<Vec<Option<Transaction>>, Error> {
        self.deref().get_transactions(txids).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(BroadcastStatus::Mined.is_mined());
        assert!(BroadcastStatus::Immutable.is_mined());
        assert!(!BroadcastStatus::SeenOnNetwork.is_mined());

        assert!(BroadcastStatus::Rejected.is_problematic());
        assert!(BroadcastStatus::DoubleSpendAttempted.is_problematic());
        assert!(BroadcastStatus::SeenInOrphanMempool.is_problematic());
        assert!(!BroadcastStatus::Queued.is_problematic());
    }

    #[test]
    fn test_status_serde() {
        let status: BroadcastStatus = serde_json::from_str("\"SEEN_IN_ORPHAN_MEMPOOL\"").unwrap();
        assert_eq!(status, BroadcastStatus::SeenInOrphanMempool);
        assert_eq!(
            serde_json::to_string(&BroadcastStatus::AcceptedByNetwork).unwrap(),
            "\"ACCEPTED_BY_NETWORK\""
        );
    }
}

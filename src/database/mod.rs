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

//! Database types
//!
//! This module provides the implementation of some defaults database types, along with traits that
//! can be implemented externally to let the [`Engine`](crate::wallet::Engine) use customized
//! databases.
//!
//! It's important to note that the databases defined here only contains "blockchain-related" data.
//! They can be seen more as a cache than a critical piece of storage that contains secrets and
//! keys.
//!
//! The currently recommended database is [`MemoryDatabase`], which is a good choice for tests and
//! short-lived services.

use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{OutPoint, Script, Txid};

use crate::blockchain::SourceResolver;
use crate::error::Error;
use crate::transaction::Transaction;
use crate::transfer::TransferIntent;
use crate::types::{Destination, UtxoRecord};
use crate::wallet::draft::DraftTransaction;

pub mod memory;
pub use memory::MemoryDatabase;

/// Trait for the storage of spendable outputs
///
/// Reserved outputs belong to a pending draft: they are never returned by
/// [`list_spendable`](UtxoStore::list_spendable) until they are released.
#[async_trait]
pub trait UtxoStore: Send + Sync {
    /// Spendable, non reserved outputs of `owner_id`, in no particular order
    async fn list_spendable(&self, owner_id: &str) -> Result<Vec<UtxoRecord>, Error>;
    /// Fetch an output, reserved or not
    async fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoRecord>, Error>;
    /// Reserve the given outputs, updating their `touched_at`
    ///
    /// Fails with [`Error::UnknownUtxo`] without reserving anything if one of them is missing.
    async fn reserve(&self, outpoints: &[OutPoint], touched_at: u64) -> Result<(), Error>;
    /// Make the given outputs spendable again, missing ones are ignored
    async fn release(&self, outpoints: &[OutPoint]) -> Result<(), Error>;
    /// Remove the outputs spent by a recorded transaction, returning the removed records
    async fn apply_spend(&self, outpoints: &[OutPoint]) -> Result<Vec<UtxoRecord>, Error>;
    /// Store the outputs created by a recorded transaction
    async fn apply_create(&self, records: &[UtxoRecord]) -> Result<(), Error>;
}

/// Trait for the engine storage
///
/// The [`SourceResolver`] implementation returns the recorded transactions, which makes every
/// recorded transaction available as a source for the extended format.
#[async_trait]
pub trait Database: UtxoStore + SourceResolver {
    /// Fetch a recorded transaction
    async fn get_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, Error>;
    /// Insert or replace a recorded transaction
    async fn save_transaction(&self, transaction: &Transaction) -> Result<(), Error>;

    /// Fetch a draft by id
    async fn get_draft(&self, id: &str) -> Result<Option<DraftTransaction>, Error>;
    /// Insert or replace a draft
    async fn save_draft(&self, draft: &DraftTransaction) -> Result<(), Error>;

    /// Find the destination with the given locking script
    async fn get_destination(&self, script: &Script) -> Result<Option<Destination>, Error>;
    /// Insert or replace a destination
    async fn save_destination(&self, destination: &Destination) -> Result<(), Error>;

    /// Fetch a transfer intent by id
    async fn get_transfer_intent(&self, id: &str) -> Result<Option<TransferIntent>, Error>;
    /// Insert or replace a transfer intent
    async fn save_transfer_intent(&self, intent: &TransferIntent) -> Result<(), Error>;
}

/// Helpers built on top of [`Database`], implemented for every database
#[async_trait]
pub trait DatabaseUtils: Database {
    /// Whether `script` pays one of the owners
    async fn is_mine(&self, script: &Script) -> Result<bool, Error> {
        self.get_destination(script).await.map(|o| o.is_some())
    }

    /// Fetch a draft, failing with [`Error::DraftNotFound`] if missing
    async fn get_draft_or_err(&self, id: &str) -> Result<DraftTransaction, Error> {
        self.get_draft(id)
            .await?
            .ok_or_else(|| Error::DraftNotFound(id.to_string()))
    }
}

impl<T: Database + ?Sized> DatabaseUtils for T {}

#[async_trait]
impl<T: UtxoStore + ?Sized> UtxoStore for Arc<T> {
    async fn list_spendable(&self, owner_id: &str) -> Result<Vec<UtxoRecord>, Error> {
        self.deref().list_spendable(owner_id).await
    }
    async fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoRecord>, Error> {
        self.deref().get_utxo(outpoint).await
    }
    async fn reserve(&self, outpoints: &[OutPoint], touched_at: u64) -> Result<(), Error> {
        self.deref().reserve(outpoints, touched_at).await
    }
    async fn release(&self, outpoints: &[OutPoint]) -> Result<(), Error> {
        self.deref().release(outpoints).await
    }
    async fn apply_spend(&self, outpoints: &[OutPoint]) -> Result<Vec<UtxoRecord>, Error> {
        self.deref().apply_spend(outpoints).await
    }
    async fn apply_create(&self, records: &[UtxoRecord]) -> Result<(), Error> {
        self.deref().apply_create(records).await
    }
}

#[async_trait]
impl<T: Database + ?Sized> Database for Arc<T> {
    async fn get_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        self.deref().get_transaction(txid).await
    }
    async fn save_transaction(&self, transaction: &Transaction) -> Result<(), Error> {
        self.deref().save_transaction(transaction).await
    }

    async fn get_draft(&self, id: &str) -> Result<Option<DraftTransaction>, Error> {
        self.deref().get_draft(id).await
    }
    async fn save_draft(&self, draft: &DraftTransaction) -> Result<(), Error> {
        self.deref().save_draft(draft).await
    }

    async fn get_destination(&self, script: &Script) -> Result<Option<Destination>, Error> {
        self.deref().get_destination(script).await
    }
    async fn save_destination(&self, destination: &Destination) -> Result<(), Error> {
        self.deref().save_destination(destination).await
    }

    async fn get_transfer_intent(&self, id: &str) -> Result<Option<TransferIntent>, Error> {
        self.deref().get_transfer_intent(id).await
    }
    async fn save_transfer_intent(&self, intent: &TransferIntent) -> Result<(), Error> {
        self.deref().save_transfer_intent(intent).await
    }
}

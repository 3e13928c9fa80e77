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

//! In-memory ephemeral database
//!
//! This module defines an in-memory database type called [`MemoryDatabase`] that is based on a
//! set of [`BTreeMap`]s behind a single lock.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bitcoin::{OutPoint, Script, Txid};
use tokio::sync::RwLock;

use crate::blockchain::SourceResolver;
use crate::database::{Database, UtxoStore};
use crate::error::Error;
use crate::transaction::Transaction;
use crate::transfer::TransferIntent;
use crate::types::{Destination, UtxoRecord};
use crate::wallet::draft::DraftTransaction;

#[derive(Debug, Clone)]
struct StoredUtxo {
    record: UtxoRecord,
    reserved: bool,
}

#[derive(Debug, Default)]
struct Tables {
    utxos: BTreeMap<OutPoint, StoredUtxo>,
    transactions: BTreeMap<Txid, Transaction>,
    drafts: BTreeMap<String, DraftTransaction>,
    destinations: BTreeMap<Script, Destination>,
    intents: BTreeMap<String, TransferIntent>,
}

/// In-memory ephemeral database
///
/// This database can be used as a temporary storage for engines that are not kept persistent
/// across restarts, and in tests.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: RwLock<Tables>,
}

impl MemoryDatabase {
    /// Create a new empty database
    pub fn new() -> Self {
        MemoryDatabase::default()
    }

    /// Number of stored UTXOs, reserved ones included
    pub async fn utxo_count(&self) -> usize {
        self.tables.read().await.utxos.len()
    }

    /// Number of recorded transactions
    pub async fn transaction_count(&self) -> usize {
        self.tables.read().await.transactions.len()
    }
}

#[async_trait]
impl UtxoStore for MemoryDatabase {
    async fn list_spendable(&self, owner_id: &str) -> Result<Vec<UtxoRecord>, Error> {
        let tables = self.tables.read().await;

        Ok(tables
            .utxos
            .values()
            .filter(|stored| !stored.reserved && stored.record.owner_id == owner_id)
            .map(|stored| stored.record.clone())
            .collect())
    }

    async fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoRecord>, Error> {
        let tables = self.tables.read().await;

        Ok(tables.utxos.get(outpoint).map(|stored| stored.record.clone()))
    }

    async fn reserve(&self, outpoints: &[OutPoint], touched_at: u64) -> Result<(), Error> {
        let mut tables = self.tables.write().await;

        if outpoints.iter().any(|o| !tables.utxos.contains_key(o)) {
            return Err(Error::UnknownUtxo);
        }

        for outpoint in outpoints {
            if let Some(stored) = tables.utxos.get_mut(outpoint) {
                stored.reserved = true;
                stored.record.touched_at = touched_at;
            }
        }

        Ok(())
    }

    async fn release(&self, outpoints: &[OutPoint]) -> Result<(), Error> {
        let mut tables = self.tables.write().await;

        for outpoint in outpoints {
            if let Some(stored) = tables.utxos.get_mut(outpoint) {
                stored.reserved = false;
            }
        }

        Ok(())
    }

    async fn apply_spend(&self, outpoints: &[OutPoint]) -> Result<Vec<UtxoRecord>, Error> {
        let mut tables = self.tables.write().await;

        Ok(outpoints
            .iter()
            .filter_map(|outpoint| tables.utxos.remove(outpoint))
            .map(|stored| stored.record)
            .collect())
    }

    async fn apply_create(&self, records: &[UtxoRecord]) -> Result<(), Error> {
        let mut tables = self.tables.write().await;

        for record in records {
            tables.utxos.insert(
                record.outpoint,
                StoredUtxo {
                    record: record.clone(),
                    reserved: false,
                },
            );
        }

        Ok(())
    }
}

#[async_trait]
impl SourceResolver for MemoryDatabase {
    async fn get_transactions(
        &self,
        txids: &[Txid],
    ) -> Result<Vec<Option<bitcoin::Transaction>>, Error> {
        let tables = self.tables.read().await;

        txids
            .iter()
            .map(|txid| match tables.transactions.get(txid) {
                Some(record) => Ok(Some(record.parse()?.into_transaction())),
                None => Ok(None),
            })
            .collect()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn get_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        Ok(self.tables.read().await.transactions.get(txid).cloned())
    }

    async fn save_transaction(&self, transaction: &Transaction) -> Result<(), Error> {
        self.tables
            .write()
            .await
            .transactions
            .insert(transaction.id(), transaction.clone());

        Ok(())
    }

    async fn get_draft(&self, id: &str) -> Result<Option<DraftTransaction>, Error> {
        Ok(self.tables.read().await.drafts.get(id).cloned())
    }

    async fn save_draft(&self, draft: &DraftTransaction) -> Result<(), Error> {
        self.tables
            .write()
            .await
            .drafts
            .insert(draft.id.clone(), draft.clone());

        Ok(())
    }

    async fn get_destination(&self, script: &Script) -> Result<Option<Destination>, Error> {
        Ok(self.tables.read().await.destinations.get(script).cloned())
    }

    async fn save_destination(&self, destination: &Destination) -> Result<(), Error> {
        self.tables
            .write()
            .await
            .destinations
            .insert(destination.script_pubkey.clone(), destination.clone());

        Ok(())
    }

    async fn get_transfer_intent(&self, id: &str) -> Result<Option<TransferIntent>, Error> {
        Ok(self.tables.read().await.intents.get(id).cloned())
    }

    async fn save_transfer_intent(&self, intent: &TransferIntent) -> Result<(), Error> {
        self.tables
            .write()
            .await
            .intents
            .insert(intent.id.clone(), intent.clone());

        Ok(())
    }
}

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

use async_trait::async_trait;
use bitcoin::Txid;

use super::{broadcast, lookup_destinations, persist, process_utxos, RecordContext, RecordTxStrategy};
use crate::error::Error;
use crate::extended::{is_extended_hex, ExtendedTransaction};
use crate::tokens::is_token_transaction;
use crate::transaction::{Metadata, Transaction, TxStatus};

/// Transaction coming from outside of the engine
///
/// It is recorded only if at least one of its outputs pays a known destination.
#[derive(Debug, Clone)]
pub struct ExternalIncomingTx {
    tx: Option<ExtendedTransaction>,
    is_extended: bool,
    metadata: Metadata,
}

impl ExternalIncomingTx {
    /// Wrap an already parsed transaction
    pub fn new(tx: Option<ExtendedTransaction>, is_extended: bool) -> Self {
        ExternalIncomingTx {
            tx,
            is_extended,
            metadata: Metadata::new(),
        }
    }

    /// Parse `hex`, remembering whether it was in the extended encoding
    pub fn from_hex(hex: &str) -> Result<Self, Error> {
        let tx = ExtendedTransaction::from_hex(hex)?;
        Ok(Self::new(Some(tx), is_extended_hex(hex)))
    }

    /// Attach metadata to the recorded transaction
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    fn tx(&self) -> Result<&ExtendedTransaction, Error> {
        self.tx.as_ref().ok_or(Error::EmptyTransaction)
    }
}

#[async_trait]
impl RecordTxStrategy for ExternalIncomingTx {
    fn name(&self) -> &'static str {
        "external"
    }

    fn validate(&self) -> Result<(), Error> {
        self.tx().map(|_| ())
    }

    fn txid(&self) -> Result<Txid, Error> {
        Ok(self.tx()?.txid())
    }

    async fn execute(&self, ctx: &RecordContext<'_>) -> Result<Transaction, Error> {
        let tx = self.tx()?;
        let txid = tx.txid();

        let destinations = lookup_destinations(ctx, tx.transaction()).await;
        if destinations.is_empty() {
            log::debug!("Transaction {} doesn't pay any known destination", txid);
            return Err(Error::NoMatchingOutputs);
        }

        let mut record = Transaction::from_extended(tx, self.is_extended)?;
        record.metadata = self.metadata.clone();

        if is_token_transaction(tx.transaction()) {
            log::info!("Recording token transaction {}", txid);
        }

        let changes = process_utxos(ctx, &mut record, tx, &destinations).await?;
        record.compute_values(tx, None);

        broadcast(ctx, tx).await?;
        record.transition(TxStatus::Broadcasted)?;

        persist(ctx, &record, &changes, None).await;

        Ok(record)
    }
}

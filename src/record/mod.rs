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

//! Recording of incoming transactions
//!
//! A transaction enters the ledger through a [`RecordTxStrategy`]:
//!
//! - [`ExternalIncomingTx`] for transactions found on the network or submitted by a third party,
//!   which are recorded only if they pay one of the known destinations;
//! - [`InternalIncomingTx`] for transactions built from a draft, which may carry a token transfer
//!   that must be accepted by the [`TokenVerifier`] before being broadcast.
//!
//! The [`Engine`](crate::wallet::Engine) runs every strategy under a lock keyed by its
//! [`lock_key`](RecordTxStrategy::lock_key) and skips it entirely when the transaction is already
//! recorded. Once the broadcast succeeded nothing is rolled back: persistence errors are logged
//! and the recorded transaction is returned anyway.

use async_trait::async_trait;
use bitcoin::{OutPoint, Txid};

use crate::blockchain::{BroadcastStatus, Broadcaster};
use crate::config::EngineConfig;
use crate::database::Database;
use crate::error::Error;
use crate::extended::ExtendedTransaction;
use crate::tokens::TokenVerifier;
use crate::transaction::Transaction;
use crate::types::{get_timestamp, Destination, UtxoRecord};
use crate::wallet::draft::DraftTransaction;
use crate::wallet::utils::with_timeout;

mod external;
mod internal;

pub use external::ExternalIncomingTx;
pub use internal::{build_transfer_message, InternalIncomingTx};

/// Collaborators available to a strategy
pub struct RecordContext<'a> {
    /// Storage
    pub database: &'a dyn Database,
    /// Broadcaster
    pub broadcaster: &'a dyn Broadcaster,
    /// Token verifier
    pub verifier: &'a dyn TokenVerifier,
    /// Configuration
    pub config: &'a EngineConfig,
}

impl std::fmt::Debug for RecordContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordContext")
            .field("config", &self.config)
            .finish()
    }
}

/// Trait for the ways a transaction can be recorded
#[async_trait]
pub trait RecordTxStrategy: std::fmt::Debug + Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Check the input, before any lock is taken
    fn validate(&self) -> Result<(), Error>;

    /// Id of the transaction being recorded
    fn txid(&self) -> Result<Txid, Error>;

    /// Key serializing concurrent recordings of the same transaction
    fn lock_key(&self) -> Result<String, Error> {
        Ok(format!("incoming-{}", self.txid()?))
    }

    /// Key of the draft consumed by the transaction, held together with
    /// [`lock_key`](Self::lock_key)
    fn draft_lock_key(&self) -> Option<String> {
        None
    }

    /// Record the transaction. Called with the lock held, only if the transaction is not
    /// recorded yet.
    async fn execute(&self, ctx: &RecordContext<'_>) -> Result<Transaction, Error>;
}

/// Changes to apply to the UTXO set once a transaction is broadcast
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtxoChanges {
    /// Spent outputs
    pub spent: Vec<OutPoint>,
    /// Created outputs
    pub created: Vec<UtxoRecord>,
}

/// Known destinations paid by `tx`, with the index of the output paying them
///
/// Lookup failures are logged and the output is skipped.
pub(crate) async fn lookup_destinations(
    ctx: &RecordContext<'_>,
    tx: &bitcoin::Transaction,
) -> Vec<(u32, Destination)> {
    let mut destinations = Vec::new();

    for (vout, txout) in tx.output.iter().enumerate() {
        let lookup = with_timeout(
            ctx.config.io_timeout(),
            ctx.database.get_destination(&txout.script_pubkey),
        )
        .await;

        match lookup {
            Ok(Some(destination)) => destinations.push((vout as u32, destination)),
            Ok(None) => {}
            Err(e) => log::warn!(
                "Failed to look up the destination of output {}:{}: {}",
                tx.txid(),
                vout,
                e
            ),
        }
    }

    destinations
}

/// Associate the owners of the spent and created outputs to `record`, returning the changes to
/// the UTXO set
pub(crate) async fn process_utxos(
    ctx: &RecordContext<'_>,
    record: &mut Transaction,
    tx: &ExtendedTransaction,
    destinations: &[(u32, Destination)],
) -> Result<UtxoChanges, Error> {
    let mut changes = UtxoChanges::default();

    for txin in &tx.transaction().input {
        let outpoint = txin.previous_output;
        let utxo = with_timeout(ctx.config.io_timeout(), ctx.database.get_utxo(&outpoint)).await?;

        if let Some(utxo) = utxo {
            record.add_input_owner(&utxo.owner_id, utxo.satoshis);
            changes.spent.push(outpoint);
        }
    }

    let now = get_timestamp();
    for (vout, destination) in destinations {
        let txout = &tx.transaction().output[*vout as usize];
        record.add_output_owner(&destination.owner_id, txout.value);

        changes.created.push(UtxoRecord {
            owner_id: destination.owner_id.clone(),
            outpoint: OutPoint::new(record.id(), *vout),
            satoshis: txout.value,
            script_pubkey: txout.script_pubkey.clone(),
            spending_instructions: destination.spending_instructions.clone(),
            estimated_input_size: None,
            touched_at: now,
            created_at: now,
        });
    }

    Ok(changes)
}

/// Submit `tx` to the broadcaster
///
/// A deadline hit while waiting for the broadcaster is reported as
/// [`Error::BroadcastOutcomeUnknown`], a problematic status as [`Error::BroadcastRejected`].
pub(crate) async fn broadcast(
    ctx: &RecordContext<'_>,
    tx: &ExtendedTransaction,
) -> Result<BroadcastStatus, Error> {
    let txid = tx.txid();

    let status = match with_timeout(ctx.config.io_timeout(), ctx.broadcaster.broadcast(tx)).await
    {
        Ok(status) => status,
        Err(Error::Timeout) => {
            log::warn!("Broadcast of {} timed out, outcome unknown", txid);
            return Err(Error::BroadcastOutcomeUnknown { txid });
        }
        Err(e) => return Err(e),
    };

    if status.is_problematic() {
        log::warn!("Broadcast of {} rejected with status {}", txid, status);
        return Err(Error::BroadcastRejected { txid, status });
    }

    log::info!("Broadcasted {}, status {}", txid, status);
    Ok(status)
}

/// Store a broadcast transaction and apply its UTXO changes
///
/// Errors are logged and swallowed: the transaction is already on the network.
pub(crate) async fn persist(
    ctx: &RecordContext<'_>,
    record: &Transaction,
    changes: &UtxoChanges,
    draft: Option<DraftTransaction>,
) {
    if let Err(e) = try_persist(ctx, record, changes, draft).await {
        log::error!(
            "Failed to persist broadcasted transaction {}: {}",
            record.id(),
            e
        );
    }
}

async fn try_persist(
    ctx: &RecordContext<'_>,
    record: &Transaction,
    changes: &UtxoChanges,
    draft: Option<DraftTransaction>,
) -> Result<(), Error> {
    let timeout = ctx.config.io_timeout();

    with_timeout(timeout, ctx.database.save_transaction(record)).await?;
    with_timeout(timeout, ctx.database.apply_spend(&changes.spent)).await?;
    with_timeout(timeout, ctx.database.apply_create(&changes.created)).await?;

    if let Some(mut draft) = draft {
        draft.complete(record.id())?;
        with_timeout(timeout, ctx.database.save_draft(&draft)).await?;
    }

    Ok(())
}

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
use bitcoin::{TxOut, Txid};

use super::{broadcast, lookup_destinations, persist, process_utxos, RecordContext, RecordTxStrategy};
use crate::database::DatabaseUtils;
use crate::error::Error;
use crate::extended::ExtendedTransaction;
use crate::tokens::{is_token_transaction, token_operation, TransferMessage};
use crate::transaction::{Transaction, TxStatus};
use crate::wallet::draft::DraftTransaction;
use crate::wallet::utils::with_timeout;

/// Transaction built by the engine from one of its drafts
#[derive(Debug, Clone)]
pub struct InternalIncomingTx {
    tx: Option<Transaction>,
}

impl InternalIncomingTx {
    /// Wrap a ledger transaction, usually tied to a draft
    pub fn new(tx: Option<Transaction>) -> Self {
        InternalIncomingTx { tx }
    }

    fn tx(&self) -> Result<&Transaction, Error> {
        self.tx.as_ref().ok_or(Error::EmptyTransaction)
    }
}

#[async_trait]
impl RecordTxStrategy for InternalIncomingTx {
    fn name(&self) -> &'static str {
        "internal"
    }

    fn validate(&self) -> Result<(), Error> {
        self.tx()?.parse().map(|_| ())
    }

    fn txid(&self) -> Result<Txid, Error> {
        Ok(self.tx()?.id())
    }

    fn draft_lock_key(&self) -> Option<String> {
        self.tx
            .as_ref()
            .and_then(|tx| tx.draft_id.as_ref())
            .map(|id| format!("draft-{}", id))
    }

    async fn execute(&self, ctx: &RecordContext<'_>) -> Result<Transaction, Error> {
        let mut record = self.tx()?.clone();
        let mut parsed = record.parse()?;

        let draft = match &record.draft_id {
            Some(id) => {
                let draft =
                    with_timeout(ctx.config.io_timeout(), ctx.database.get_draft_or_err(id))
                        .await?;
                if !draft.is_open() {
                    return Err(Error::DraftNotOpen(id.clone()));
                }
                attach_draft_sources(&mut parsed, &draft);
                Some(draft)
            }
            None => None,
        };

        if is_token_transaction(parsed.transaction()) {
            verify_transfer(ctx, &record, draft.as_ref()).await?;
        }

        let destinations = lookup_destinations(ctx, parsed.transaction()).await;
        let changes = process_utxos(ctx, &mut record, &parsed, &destinations).await?;
        record.compute_values(&parsed, draft.as_ref().map(|d| &d.configuration));

        broadcast(ctx, &parsed).await?;
        record.transition(TxStatus::Broadcasted)?;

        persist(ctx, &record, &changes, draft).await;

        Ok(record)
    }
}

// Inputs funded by the draft get their source output from the reserved records
fn attach_draft_sources(tx: &mut ExtendedTransaction, draft: &DraftTransaction) {
    let outpoints: Vec<_> = tx
        .transaction()
        .input
        .iter()
        .map(|txin| txin.previous_output)
        .collect();

    for (index, outpoint) in outpoints.iter().enumerate() {
        if tx.source_output(index).is_some() {
            continue;
        }

        if let Some(utxo) = draft
            .configuration
            .inputs
            .iter()
            .find(|utxo| utxo.outpoint == *outpoint)
        {
            let txout = TxOut {
                value: utxo.satoshis,
                script_pubkey: utxo.script_pubkey.clone(),
            };
            if let Err(e) = tx.set_source_output(index, txout) {
                log::debug!("Can't attach source of input {}: {}", index, e);
            }
        }
    }
}

async fn verify_transfer(
    ctx: &RecordContext<'_>,
    record: &Transaction,
    draft: Option<&DraftTransaction>,
) -> Result<(), Error> {
    let draft = draft.ok_or_else(|| {
        Error::TokenValidationFailed(format!(
            "Token transaction {} has no draft",
            record.id()
        ))
    })?;

    let message = build_transfer_message(record, draft).map_err(|e| match e {
        Error::TokenValidationFailed(_) => e,
        e => Error::TokenValidationFailed(e.to_string()),
    })?;

    let outcome = with_timeout(
        ctx.config.io_timeout(),
        ctx.verifier.verify_and_register(&message),
    )
    .await
    .map_err(|e| {
        log::warn!("Token transfer {} refused: {}", record.id(), e);
        Error::TokenValidationFailed(e.to_string())
    })?;

    log::debug!("Token transfer {} verified: {:?}", record.id(), outcome);
    Ok(())
}

/// Describe the token transfer performed by `record` according to the outputs of its draft
///
/// Token change outputs belong to the sender, token fee outputs to the fee recipients, and all
/// other token outputs to the receiver. The last receiver output identifies the receiver and the
/// token.
pub fn build_transfer_message(
    record: &Transaction,
    draft: &DraftTransaction,
) -> Result<TransferMessage, Error> {
    let mut sender_vouts = Vec::new();
    let mut receiver_vouts = Vec::new();
    let mut fee_vouts = Vec::new();
    let mut transfer_output = None;

    for (vout, output) in draft.configuration.outputs.iter().enumerate() {
        if !output.token {
            continue;
        }

        let vout = vout as u32;
        if output.token_change {
            sender_vouts.push(vout);
        } else if output.token_fee {
            fee_vouts.push(vout);
        } else {
            receiver_vouts.push(vout);
            transfer_output = Some(output);
        }
    }

    let transfer_output = transfer_output.ok_or(Error::NoTransferOutput)?;
    let paymail = transfer_output.paymail_p4.as_ref();

    Ok(TransferMessage {
        sender_id: paymail
            .map(|p4| p4.from_paymail.clone())
            .unwrap_or_else(|| draft.owner_id.clone()),
        receiver_id: paymail
            .map(|p4| p4.receiver())
            .unwrap_or_else(|| transfer_output.to.clone()),
        sender_vouts,
        receiver_vouts,
        fee_vouts,
        hex: record.hex().to_string(),
        asset_id: token_operation(&transfer_output.script_pubkey()?).and_then(|op| op.id),
    })
}

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
#![allow(missing_docs)]
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{
    OutPoint, PackedLockTime, PubkeyHash, Script, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};

use crate::blockchain::{BroadcastStatus, Broadcaster, SourceResolver};
use crate::database::{Database, UtxoStore};
use crate::error::Error;
use crate::extended::ExtendedTransaction;
use crate::tokens::{AssetRules, FeeRuleProvider, TokenVerifier, TransferMessage, VerifyOutcome};
use crate::transaction::Transaction as LedgerTransaction;
use crate::transfer::TransferIntent;
use crate::types::{Destination, FeeUnit, UtxoRecord};
use crate::wallet::draft::{
    build_unsigned, DraftConfiguration, DraftStatus, DraftTransaction, TransactionOutput,
};

pub fn p2pkh_script(seed: u8) -> Script {
    Script::new_p2pkh(&PubkeyHash::from_inner([seed; 20]))
}

pub fn txid(seed: u8) -> Txid {
    Txid::from_inner([seed; 32])
}

/// A transaction with a single input spending `txid(seed):0`, paying `values` to
/// `p2pkh_script(seed)`
pub fn source_tx(values: &[u64], seed: u8) -> Transaction {
    Transaction {
        version: 1,
        lock_time: PackedLockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(txid(seed), 0),
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: values
            .iter()
            .map(|value| TxOut {
                value: *value,
                script_pubkey: p2pkh_script(seed),
            })
            .collect(),
    }
}

pub fn spending_tx(inputs: &[OutPoint], outputs: &[(u64, Script)]) -> Transaction {
    Transaction {
        version: 1,
        lock_time: PackedLockTime::ZERO,
        input: inputs
            .iter()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: Script::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|(value, script_pubkey)| TxOut {
                value: *value,
                script_pubkey: script_pubkey.clone(),
            })
            .collect(),
    }
}

/// An output of `txid(seed)` paying `p2pkh_script(seed)`, touched and created at `seed`
pub fn utxo_record(owner_id: &str, seed: u8, vout: u32, satoshis: u64) -> UtxoRecord {
    UtxoRecord {
        owner_id: owner_id.to_string(),
        outpoint: OutPoint::new(txid(seed), vout),
        satoshis,
        script_pubkey: p2pkh_script(seed),
        spending_instructions: serde_json::Value::Null,
        estimated_input_size: None,
        touched_at: seed as u64,
        created_at: seed as u64,
    }
}

pub fn destination(owner_id: &str, seed: u8) -> Destination {
    Destination {
        owner_id: owner_id.to_string(),
        script_pubkey: p2pkh_script(seed),
        spending_instructions: serde_json::json!({ "seed": seed }),
    }
}

/// An open draft spending `inputs` to a single output, paying a fee of 1 sat
pub fn draft_transaction(id: &str, owner_id: &str, inputs: Vec<UtxoRecord>) -> DraftTransaction {
    let total: u64 = inputs.iter().map(|utxo| utxo.satoshis).sum();
    let output = TransactionOutput::new("", &p2pkh_script(99), total.saturating_sub(1));
    let tx = build_unsigned(&inputs, vec![output.to_txout().unwrap()]).unwrap();

    DraftTransaction {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        hex: tx.to_extended_hex().unwrap(),
        configuration: DraftConfiguration {
            outputs: vec![output],
            inputs,
            change_satoshis: 0,
            change_script: None,
            fee: 1,
            fee_unit: FeeUnit::default(),
        },
        status: DraftStatus::Draft,
        final_txid: None,
        created_at: 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolverBehavior {
    Exact,
    SkipFirst,
    NullFirst,
    ExtraEntry,
    DuplicateFirst,
    Unrequested,
    Slow(Duration),
}

#[derive(Debug)]
pub struct MockResolver {
    transactions: HashMap<Txid, Transaction>,
    behavior: ResolverBehavior,
    requests: Mutex<Vec<Vec<Txid>>>,
}

impl MockResolver {
    pub fn new(transactions: Vec<Transaction>, behavior: ResolverBehavior) -> Self {
        MockResolver {
            transactions: transactions.into_iter().map(|tx| (tx.txid(), tx)).collect(),
            behavior,
            requests: Mutex::new(vec![]),
        }
    }

    pub fn requests(&self) -> Vec<Vec<Txid>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceResolver for MockResolver {
    async fn get_transactions(&self, txids: &[Txid]) -> Result<Vec<Option<Transaction>>, Error> {
        self.requests.lock().unwrap().push(txids.to_vec());

        let mut response: Vec<Option<Transaction>> = txids
            .iter()
            .map(|txid| self.transactions.get(txid).cloned())
            .collect();

        match self.behavior {
            ResolverBehavior::Exact => {}
            ResolverBehavior::SkipFirst => {
                response.remove(0);
            }
            ResolverBehavior::NullFirst => response[0] = None,
            ResolverBehavior::ExtraEntry => response.push(response[0].clone()),
            ResolverBehavior::DuplicateFirst => response[1] = response[0].clone(),
            ResolverBehavior::Unrequested => response[0] = Some(source_tx(&[1], 200)),
            ResolverBehavior::Slow(delay) => tokio::time::sleep(delay).await,
        }

        Ok(response)
    }
}

#[derive(Debug)]
pub struct MockBroadcaster {
    status: BroadcastStatus,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockBroadcaster {
    pub fn new(status: BroadcastStatus) -> Self {
        MockBroadcaster {
            status,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broadcaster for MockBroadcaster {
    async fn broadcast(&self, _tx: &ExtendedTransaction) -> Result<BroadcastStatus, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        Ok(self.status)
    }
}

#[derive(Debug, Default)]
pub struct MockVerifier {
    fail: bool,
    messages: Mutex<Vec<TransferMessage>>,
}

impl MockVerifier {
    pub fn failing() -> Self {
        MockVerifier {
            fail: true,
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<TransferMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenVerifier for MockVerifier {
    async fn verify_and_register(&self, message: &TransferMessage) -> Result<VerifyOutcome, Error> {
        self.messages.lock().unwrap().push(message.clone());

        if self.fail {
            Err(Error::Generic("invalid transfer".to_string()))
        } else {
            Ok(VerifyOutcome::Registered)
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockRules(pub AssetRules);

impl Default for MockRules {
    fn default() -> Self {
        MockRules(AssetRules {
            emitter_id: "emitter@example.com".to_string(),
            fees: vec![],
        })
    }
}

#[async_trait]
impl FeeRuleProvider for MockRules {
    async fn rules_for(&self, _asset_id: &str) -> Result<AssetRules, Error> {
        Ok(self.0.clone())
    }
}

/// Database refusing to store transactions
#[derive(Debug, Default)]
pub struct ReadOnlyTransactions<D>(pub D);

#[async_trait]
impl<D: Database> UtxoStore for ReadOnlyTransactions<D> {
    async fn list_spendable(&self, owner_id: &str) -> Result<Vec<UtxoRecord>, Error> {
        self.0.list_spendable(owner_id).await
    }
    async fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoRecord>, Error> {
        self.0.get_utxo(outpoint).await
    }
    async fn reserve(&self, outpoints: &[OutPoint], touched_at: u64) -> Result<(), Error> {
        self.0.reserve(outpoints, touched_at).await
    }
    async fn release(&self, outpoints: &[OutPoint]) -> Result<(), Error> {
        self.0.release(outpoints).await
    }
    async fn apply_spend(&self, outpoints: &[OutPoint]) -> Result<Vec<UtxoRecord>, Error> {
        self.0.apply_spend(outpoints).await
    }
    async fn apply_create(&self, records: &[UtxoRecord]) -> Result<(), Error> {
        self.0.apply_create(records).await
    }
}

#[async_trait]
impl<D: Database> SourceResolver for ReadOnlyTransactions<D> {
    async fn get_transactions(&self, txids: &[Txid]) -> Result<Vec<Option<Transaction>>, Error> {
        self.0.get_transactions(txids).await
    }
}

#[async_trait]
impl<D: Database> Database for ReadOnlyTransactions<D> {
    async fn get_transaction(&self, txid: &Txid) -> Result<Option<LedgerTransaction>, Error> {
        self.0.get_transaction(txid).await
    }
    async fn save_transaction(&self, _transaction: &LedgerTransaction) -> Result<(), Error> {
        Err(Error::Generic("storage unavailable".to_string()))
    }
    async fn get_draft(&self, id: &str) -> Result<Option<DraftTransaction>, Error> {
        self.0.get_draft(id).await
    }
    async fn save_draft(&self, draft: &DraftTransaction) -> Result<(), Error> {
        self.0.save_draft(draft).await
    }
    async fn get_destination(&self, script: &Script) -> Result<Option<Destination>, Error> {
        self.0.get_destination(script).await
    }
    async fn save_destination(&self, destination: &Destination) -> Result<(), Error> {
        self.0.save_destination(destination).await
    }
    async fn get_transfer_intent(&self, id: &str) -> Result<Option<TransferIntent>, Error> {
        self.0.get_transfer_intent(id).await
    }
    async fn save_transfer_intent(&self, intent: &TransferIntent) -> Result<(), Error> {
        self.0.save_transfer_intent(intent).await
    }
}

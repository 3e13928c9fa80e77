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

//! Engine
//!
//! This module defines the [`Engine`] structure.

use bitcoin::{OutPoint, Script, TxOut, Txid};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

pub mod coin_selection;
pub mod draft;
pub mod locks;
pub(crate) mod utils;

use coin_selection::{
    CoinSelectionAlgorithm, CoinSelectionResult, DefaultCoinSelectionAlgorithm, SelectionRequest,
};
use draft::{
    build_unsigned, estimate_base_size, DraftConfiguration, DraftStatus, DraftTransaction,
    TransactionOutput,
};
use locks::KeyLocks;
use utils::{random_hex, with_timeout};

use crate::blockchain::{BroadcastStatus, Broadcaster};
use crate::config::EngineConfig;
use crate::database::{Database, DatabaseUtils};
use crate::error::Error;
use crate::extended::{is_extended_hex, Converter, ExtendedTransaction};
use crate::record::{ExternalIncomingTx, InternalIncomingTx, RecordContext, RecordTxStrategy};
use crate::tokens::{FeeRuleProvider, TokenVerifier};
use crate::transaction::{Metadata, Transaction};
use crate::transfer::{
    compare_scripts, DefaultIntentValidator, Intent, IntentValidator, Transfer, TransferIntent,
    ValidationResponse,
};
use crate::types::*;

/// The wallet engine
///
/// The `Engine` ties together the storage `D`, the broadcaster `B`, the token verifier `T` and
/// the fee rule provider `F`. All its methods take `&self`: wrap it in an
/// [`Arc`](std::sync::Arc) to share it between tasks. Operations on the same owner or on the same
/// transaction are serialized through key locks, everything else runs in parallel.
#[derive(Debug)]
pub struct Engine<D, B, T, F> {
    database: D,
    broadcaster: B,
    verifier: T,
    rules: F,

    config: EngineConfig,
    locks: KeyLocks,
    intent_validator: Box<dyn IntentValidator>,
}

impl<D, B, T, F> Engine<D, B, T, F>
where
    D: Database,
    B: Broadcaster,
    T: TokenVerifier,
    F: FeeRuleProvider,
{
    /// Create a new engine
    pub fn new(database: D, broadcaster: B, verifier: T, rules: F, config: EngineConfig) -> Self {
        Engine {
            database,
            broadcaster,
            verifier,
            rules,
            config,
            locks: KeyLocks::new(),
            intent_validator: Box::new(DefaultIntentValidator),
        }
    }

    /// Replace the [`IntentValidator`] used by [`validate_intent`](Self::validate_intent)
    pub fn with_intent_validator<V: IntentValidator + 'static>(mut self, validator: V) -> Self {
        self.intent_validator = Box::new(validator);
        self
    }

    /// Return a reference to the internal database
    pub fn database(&self) -> &D {
        &self.database
    }

    /// Return a reference to the broadcaster
    pub fn broadcaster(&self) -> &B {
        &self.broadcaster
    }

    /// Return a reference to the token verifier
    pub fn verifier(&self) -> &T {
        &self.verifier
    }

    /// Return a reference to the configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn record_context(&self) -> RecordContext<'_> {
        RecordContext {
            database: &self.database,
            broadcaster: &self.broadcaster,
            verifier: &self.verifier,
            config: &self.config,
        }
    }

    /// Select and reserve the inputs funding `request` with the
    /// [`DefaultCoinSelectionAlgorithm`]
    pub async fn select_inputs(
        &self,
        owner_id: &str,
        request: &SelectionRequest,
    ) -> Result<CoinSelectionResult, Error> {
        self.select_inputs_with(owner_id, request, &DefaultCoinSelectionAlgorithm::default())
            .await
    }

    /// Select and reserve the inputs funding `request` with a custom coin selection algorithm
    ///
    /// The selection runs under a lock on the owner: concurrent selections never return the same
    /// output. Selected outputs stay reserved until they are spent by a recorded transaction or
    /// released with [`release_inputs`](Self::release_inputs).
    pub async fn select_inputs_with<Cs: CoinSelectionAlgorithm>(
        &self,
        owner_id: &str,
        request: &SelectionRequest,
        coin_selection: &Cs,
    ) -> Result<CoinSelectionResult, Error> {
        let io_timeout = self.config.io_timeout();
        let _guard = self
            .locks
            .acquire(&format!("select-{}", owner_id), self.config.lock_timeout())
            .await?;

        let mut utxos = with_timeout(io_timeout, self.database.list_spendable(owner_id)).await?;
        sort_for_selection(&mut utxos);

        let mut selection = coin_selection.coin_select(utxos, request)?;
        if !selection.selected.is_empty() {
            let now = get_timestamp();
            with_timeout(
                io_timeout,
                self.database.reserve(&selection.outpoints(), now),
            )
            .await?;

            for utxo in &mut selection.selected {
                utxo.touched_at = now;
            }
        }

        debug!(
            "Selected {} inputs for `{}`: {} sat, change {} sat, fee {} sat",
            selection.selected.len(),
            owner_id,
            selection.selected_amount,
            selection.change,
            selection.fee
        );

        Ok(selection)
    }

    /// Make reserved outputs spendable again
    pub async fn release_inputs(&self, outpoints: &[OutPoint]) -> Result<(), Error> {
        with_timeout(self.config.io_timeout(), self.database.release(outpoints)).await
    }

    /// Fund `outputs` with the outputs of `owner_id` and store the unsigned transaction as a
    /// draft
    ///
    /// A change output paying `change_script` is appended when the selection leaves change.
    pub async fn create_draft(
        &self,
        owner_id: &str,
        outputs: Vec<TransactionOutput>,
        change_script: Option<Script>,
    ) -> Result<DraftTransaction, Error> {
        if outputs.is_empty() {
            return Err(Error::NoRecipients);
        }

        let txouts = outputs
            .iter()
            .map(TransactionOutput::to_txout)
            .collect::<Result<Vec<_>, _>>()?;
        let request = SelectionRequest {
            target: txouts.iter().map(|txout| txout.value).sum(),
            base_size: estimate_base_size(&txouts),
            default_input_size: self.config.default_input_size,
            change_output_size: self.config.change_output_size,
            fee_unit: self.config.fee_unit,
        };

        let selection = self.select_inputs(owner_id, &request).await?;

        match self
            .store_draft(owner_id, outputs, txouts, change_script, &selection)
            .await
        {
            Ok(draft) => Ok(draft),
            Err(e) => {
                if let Err(release_err) = self.release_inputs(&selection.outpoints()).await {
                    error!(
                        "Failed to release the inputs of a failed draft for `{}`: {}",
                        owner_id, release_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn store_draft(
        &self,
        owner_id: &str,
        outputs: Vec<TransactionOutput>,
        mut txouts: Vec<TxOut>,
        change_script: Option<Script>,
        selection: &CoinSelectionResult,
    ) -> Result<DraftTransaction, Error> {
        let change_script = match (selection.change, change_script) {
            (0, _) => None,
            (change, Some(script)) => {
                txouts.push(TxOut {
                    value: change,
                    script_pubkey: script.clone(),
                });
                Some(script)
            }
            (_, None) => return Err(Error::Generic("Missing change script".to_string())),
        };

        let tx = build_unsigned(&selection.selected, txouts)?;
        let draft = DraftTransaction {
            id: random_hex(16),
            owner_id: owner_id.to_string(),
            hex: tx.to_extended_hex()?,
            configuration: DraftConfiguration {
                outputs,
                inputs: selection.selected.clone(),
                change_satoshis: selection.change,
                change_script,
                fee: selection.fee,
                fee_unit: self.config.fee_unit,
            },
            status: DraftStatus::Draft,
            final_txid: None,
            created_at: get_timestamp(),
        };

        with_timeout(self.config.io_timeout(), self.database.save_draft(&draft)).await?;
        info!("Created draft {} for `{}`", draft.id, owner_id);

        Ok(draft)
    }

    /// Cancel an open draft, releasing its inputs
    pub async fn cancel_draft(&self, draft_id: &str) -> Result<DraftTransaction, Error> {
        let io_timeout = self.config.io_timeout();
        let _guard = self
            .locks
            .acquire(&format!("draft-{}", draft_id), self.config.lock_timeout())
            .await?;

        let mut draft = with_timeout(io_timeout, self.database.get_draft_or_err(draft_id)).await?;
        draft.cancel()?;

        self.release_inputs(&draft.outpoints()).await?;
        with_timeout(io_timeout, self.database.save_draft(&draft)).await?;
        info!("Canceled draft {}", draft_id);

        Ok(draft)
    }

    /// Convert a transaction to the extended format, using the recorded transactions as sources
    pub async fn convert(&self, hex: &str) -> Result<String, Error> {
        Converter::new(&self.database, self.config.io_timeout())
            .convert_hex(hex)
            .await
    }

    /// Record a transaction through `strategy`
    ///
    /// Recording the same transaction concurrently is safe: the first caller records it, the
    /// others get the recorded transaction back without a second broadcast.
    pub async fn record_transaction<S: RecordTxStrategy>(
        &self,
        strategy: &S,
    ) -> Result<Transaction, Error> {
        strategy.validate()?;
        let txid = strategy.txid()?;

        let _guard = self
            .locks
            .acquire(&strategy.lock_key()?, self.config.lock_timeout())
            .await?;
        let _draft_guard = match strategy.draft_lock_key() {
            Some(key) => Some(self.locks.acquire(&key, self.config.lock_timeout()).await?),
            None => None,
        };

        if let Some(existing) =
            with_timeout(self.config.io_timeout(), self.database.get_transaction(&txid)).await?
        {
            debug!(
                "Transaction {} already recorded, skipping {} recording",
                txid,
                strategy.name()
            );
            return Ok(existing);
        }

        let recorded = strategy.execute(&self.record_context()).await?;
        info!(
            "Recorded {} transaction {} as {}",
            strategy.name(),
            txid,
            recorded.status()
        );

        Ok(recorded)
    }

    /// Record a transaction found outside of the engine, in plain or extended encoding
    pub async fn record_external(&self, hex: &str) -> Result<Transaction, Error> {
        self.record_transaction(&ExternalIncomingTx::from_hex(hex)?)
            .await
    }

    /// Record the signed transaction of a draft
    pub async fn record_internal(&self, hex: &str, draft_id: &str) -> Result<Transaction, Error> {
        let tx = Transaction::from_hex(hex)?.with_draft_id(draft_id);
        self.record_transaction(&InternalIncomingTx::new(Some(tx)))
            .await
    }

    /// Validate a token transfer intent, computing the outputs its transaction must pay
    pub async fn validate_intent(&self, intent: &Intent) -> Result<ValidationResponse, Error> {
        let io_timeout = self.config.io_timeout();
        self.intent_validator.validate_sender(intent)?;

        let rules = if intent.is_fee_free() {
            None
        } else {
            Some(with_timeout(io_timeout, self.rules.rules_for(&intent.asset_id)).await?)
        };

        let outputs = self
            .intent_validator
            .tx_outputs(intent, rules.as_ref(), self.config.token_output_satoshis)?
            .into_outputs();

        let server_nonce = random_hex(32);
        let stored = TransferIntent::new(intent, &server_nonce, outputs.clone());
        with_timeout(io_timeout, self.database.save_transfer_intent(&stored)).await?;
        debug!(
            "Stored transfer intent {} from `{}` to `{}`",
            stored.id, stored.sender_id, stored.receiver_id
        );

        Ok(ValidationResponse {
            nonce: server_nonce,
            outputs,
        })
    }

    /// Check the transaction of a token transfer against its intent, then record it
    pub async fn validate_and_record_transfer(
        &self,
        transfer: &Transfer,
    ) -> Result<Transaction, Error> {
        let tx = ExtendedTransaction::from_hex(&transfer.tx_hex)?;

        let intent = with_timeout(
            self.config.io_timeout(),
            self.database.get_transfer_intent(&transfer.ref_id),
        )
        .await?;
        compare_scripts(intent.as_ref(), tx.transaction(), transfer)?;

        let mut metadata = Metadata::new();
        metadata.insert(
            "transfer".to_string(),
            json!({
                "ref_id": transfer.ref_id,
                "special_operation": transfer.special_operation,
            }),
        );

        let strategy = ExternalIncomingTx::new(Some(tx), is_extended_hex(&transfer.tx_hex))
            .with_metadata(metadata);
        self.record_transaction(&strategy).await
    }

    async fn update_recorded<R, Fu>(&self, txid: &Txid, update: Fu) -> Result<R, Error>
    where
        Fu: FnOnce(&mut Transaction) -> Result<(R, bool), Error>,
    {
        let io_timeout = self.config.io_timeout();
        let _guard = self
            .locks
            .acquire(&format!("incoming-{}", txid), self.config.lock_timeout())
            .await?;

        let mut tx = with_timeout(io_timeout, self.database.get_transaction(txid))
            .await?
            .ok_or(Error::TransactionNotFound(*txid))?;

        let (result, changed) = update(&mut tx)?;
        if changed {
            with_timeout(io_timeout, self.database.save_transaction(&tx)).await?;
        }

        Ok(result)
    }

    /// Apply a status reported by the broadcaster to a recorded transaction
    ///
    /// Returns whether the status changed.
    pub async fn update_from_broadcast_status(
        &self,
        txid: &Txid,
        status: BroadcastStatus,
    ) -> Result<bool, Error> {
        self.update_recorded(txid, |tx| {
            let changed = tx.update_from_broadcast_status(status);
            Ok((changed, changed))
        })
        .await
    }

    /// Move a mined transaction back after a reorg
    pub async fn mark_reverted(&self, txid: &Txid) -> Result<Transaction, Error> {
        self.update_recorded(txid, |tx| {
            tx.mark_reverted()?;
            Ok((tx.clone(), true))
        })
        .await
    }

    /// Update the metadata `owner_id` attached to a recorded transaction
    pub async fn update_metadata(
        &self,
        txid: &Txid,
        owner_id: &str,
        metadata: Metadata,
    ) -> Result<Transaction, Error> {
        self.update_recorded(txid, |tx| {
            if !tx.is_owner_associated(owner_id) {
                return Err(Error::Generic(format!(
                    "`{}` is not associated with transaction {}",
                    owner_id,
                    tx.id()
                )));
            }

            tx.update_metadata(owner_id, metadata)?;
            Ok((tx.clone(), true))
        })
        .await
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::Arc;

    use bitcoin::consensus::encode::serialize_hex;
    use bitcoin::hashes::hex::ToHex;

    use super::*;
    use crate::database::{MemoryDatabase, UtxoStore};
    use crate::tokens::{transfer_script, AssetRules, FeeBand, FeeKind};
    use crate::transaction::TxStatus;
    use crate::transfer::Banknote;
    use crate::testutils::*;

    const TOKEN_ID: &str = "0761072ea3519adcbf4c2b9061bf64cb52243533f72d1cec47280a6eabfb3ad5_0";

    type TestEngine = Engine<MemoryDatabase, MockBroadcaster, MockVerifier, MockRules>;

    fn get_engine_with(broadcaster: MockBroadcaster, verifier: MockVerifier) -> TestEngine {
        Engine::new(
            MemoryDatabase::new(),
            broadcaster,
            verifier,
            MockRules::default(),
            EngineConfig::default(),
        )
    }

    fn get_engine() -> TestEngine {
        get_engine_with(
            MockBroadcaster::new(BroadcastStatus::SeenOnNetwork),
            MockVerifier::default(),
        )
    }

    async fn fund(engine: &TestEngine, utxos: &[UtxoRecord]) {
        engine.database().apply_create(utxos).await.unwrap();
    }

    fn request(target: u64) -> SelectionRequest {
        SelectionRequest {
            target,
            base_size: 44,
            default_input_size: 148,
            change_output_size: 34,
            fee_unit: FeeUnit::default(),
        }
    }

    #[tokio::test]
    async fn test_select_inputs_reserves() {
        let engine = get_engine();
        fund(
            &engine,
            &[utxo_record("alice", 1, 0, 5_000), utxo_record("alice", 2, 0, 8_000)],
        )
        .await;

        let selection = engine.select_inputs("alice", &request(3_000)).await.unwrap();
        assert_eq!(selection.selected.len(), 1);
        assert_eq!(selection.selected[0].satoshis, 5_000);

        let spendable = engine.database().list_spendable("alice").await.unwrap();
        assert_eq!(spendable.len(), 1);
        assert_eq!(spendable[0].satoshis, 8_000);

        engine.release_inputs(&selection.outpoints()).await.unwrap();
        assert_eq!(
            engine.database().list_spendable("alice").await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_select_inputs_insufficient_funds() {
        let engine = get_engine();
        fund(&engine, &[utxo_record("alice", 1, 0, 5_000)]).await;

        assert_matches!(
            engine.select_inputs("alice", &request(10_000)).await,
            Err(Error::InsufficientFunds {
                available: 5_000,
                ..
            })
        );
        // nothing stays reserved
        assert_eq!(
            engine.database().list_spendable("alice").await.unwrap().len(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_selections_are_disjoint() {
        let engine = Arc::new(get_engine());
        let utxos: Vec<_> = (1..=10)
            .map(|seed| utxo_record("alice", seed, 0, 10_000))
            .collect();
        fund(&engine, &utxos).await;

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.select_inputs("alice", &request(5_000)).await })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let selection = handle.await.unwrap().unwrap();
            for outpoint in selection.outpoints() {
                assert!(seen.insert(outpoint), "{} selected twice", outpoint);
            }
        }

        assert_eq!(seen.len(), 5);
        assert_eq!(
            engine.database().list_spendable("alice").await.unwrap().len(),
            5
        );
    }

    #[tokio::test]
    async fn test_create_draft() {
        let engine = get_engine();
        fund(
            &engine,
            &[utxo_record("alice", 1, 0, 5_000), utxo_record("alice", 2, 0, 8_000)],
        )
        .await;

        let draft = engine
            .create_draft(
                "alice",
                vec![TransactionOutput::new("bob", &p2pkh_script(3), 6_000)],
                Some(p2pkh_script(1)),
            )
            .await
            .unwrap();

        // 44 + 2 * 148 + 34 bytes at 1 sat/kB
        assert_eq!(draft.configuration.fee, 1);
        assert_eq!(draft.configuration.change_satoshis, 6_999);
        assert_eq!(draft.configuration.inputs.len(), 2);
        assert!(draft.is_open());

        let tx = ExtendedTransaction::from_hex(&draft.hex).unwrap();
        assert!(tx.is_fully_sourced());
        assert_eq!(tx.transaction().output.len(), 2);
        assert_eq!(tx.transaction().output[1].value, 6_999);

        assert!(engine
            .database()
            .list_spendable("alice")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            engine.database().get_draft(&draft.id).await.unwrap(),
            Some(draft)
        );
    }

    #[tokio::test]
    async fn test_create_draft_errors() {
        let engine = get_engine();
        fund(&engine, &[utxo_record("alice", 1, 0, 5_000)]).await;

        assert_matches!(
            engine.create_draft("alice", vec![], None).await,
            Err(Error::NoRecipients)
        );

        // change is needed but there's nowhere to send it
        assert_matches!(
            engine
                .create_draft(
                    "alice",
                    vec![TransactionOutput::new("bob", &p2pkh_script(3), 1_000)],
                    None,
                )
                .await,
            Err(Error::Generic(_))
        );
        assert_eq!(
            engine.database().list_spendable("alice").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_draft() {
        let engine = get_engine();
        fund(&engine, &[utxo_record("alice", 1, 0, 5_000)]).await;

        let draft = engine
            .create_draft(
                "alice",
                vec![TransactionOutput::new("bob", &p2pkh_script(3), 1_000)],
                Some(p2pkh_script(1)),
            )
            .await
            .unwrap();

        let canceled = engine.cancel_draft(&draft.id).await.unwrap();
        assert_eq!(canceled.status, DraftStatus::Canceled);
        assert_eq!(
            engine.database().list_spendable("alice").await.unwrap().len(),
            1
        );

        assert_matches!(
            engine.cancel_draft(&draft.id).await,
            Err(Error::DraftNotOpen(_))
        );
        assert_matches!(
            engine.cancel_draft("missing").await,
            Err(Error::DraftNotFound(_))
        );
    }

    #[tokio::test]
    async fn test_convert_from_recorded_sources() {
        let engine = get_engine();

        let source = source_tx(&[1_000], 1);
        let record = Transaction::from_hex(&serialize_hex(&source)).unwrap();
        engine.database().save_transaction(&record).await.unwrap();

        let tx = spending_tx(
            &[bitcoin::OutPoint::new(source.txid(), 0)],
            &[(900, p2pkh_script(2))],
        );
        let extended = engine.convert(&serialize_hex(&tx)).await.unwrap();

        let parsed = ExtendedTransaction::from_hex(&extended).unwrap();
        assert_eq!(parsed.source_output(0), Some(&source.output[0]));
        assert_eq!(engine.convert(&extended).await.unwrap(), extended);
    }

    #[tokio::test]
    async fn test_record_internal() {
        let engine = get_engine();
        fund(
            &engine,
            &[utxo_record("alice", 1, 0, 5_000), utxo_record("alice", 2, 0, 8_000)],
        )
        .await;
        for destination in &[destination("alice", 1), destination("bob", 3)] {
            engine
                .database()
                .save_destination(destination)
                .await
                .unwrap();
        }

        let draft = engine
            .create_draft(
                "alice",
                vec![TransactionOutput::new("bob", &p2pkh_script(3), 6_000)],
                Some(p2pkh_script(1)),
            )
            .await
            .unwrap();

        let recorded = engine.record_internal(&draft.hex, &draft.id).await.unwrap();
        assert_eq!(recorded.status(), TxStatus::Broadcasted);
        assert_eq!(recorded.draft_id.as_deref(), Some(draft.id.as_str()));
        assert_eq!(recorded.total_value, 6_000);
        assert_eq!(recorded.fee, Some(1));
        assert_eq!(recorded.value_for("alice"), -6_001);
        assert_eq!(recorded.value_for("bob"), 6_000);

        let completed = engine.database().get_draft(&draft.id).await.unwrap().unwrap();
        assert_eq!(completed.status, DraftStatus::Complete);
        assert_eq!(completed.final_txid, Some(recorded.id()));

        let alice = engine.database().list_spendable("alice").await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].satoshis, 6_999);
        assert_eq!(alice[0].outpoint, OutPoint::new(recorded.id(), 1));
        assert_eq!(
            engine.database().list_spendable("bob").await.unwrap()[0].satoshis,
            6_000
        );

        // recording again returns the stored transaction
        let again = engine.record_internal(&draft.hex, &draft.id).await.unwrap();
        assert_eq!(again, recorded);
        assert_eq!(engine.broadcaster().calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_record_internal_conflicting_copies() {
        let engine = Arc::new(get_engine_with(
            MockBroadcaster::new(BroadcastStatus::SeenOnNetwork)
                .with_delay(std::time::Duration::from_millis(50)),
            MockVerifier::default(),
        ));
        fund(&engine, &[utxo_record("alice", 1, 0, 5_000)]).await;
        let draft = engine
            .create_draft(
                "alice",
                vec![TransactionOutput::new("bob", &p2pkh_script(3), 4_000)],
                Some(p2pkh_script(1)),
            )
            .await
            .unwrap();

        // two signatures of the same draft, with different ids
        let copies: Vec<String> = (1..=2u8)
            .map(|n| {
                let mut tx = ExtendedTransaction::from_hex(&draft.hex)
                    .unwrap()
                    .into_transaction();
                tx.input[0].script_sig = Script::from(vec![n]);
                serialize_hex(&tx)
            })
            .collect();
        assert_ne!(copies[0], copies[1]);

        let handles: Vec<_> = copies
            .into_iter()
            .map(|hex| {
                let engine = Arc::clone(&engine);
                let draft_id = draft.id.clone();
                tokio::spawn(async move { engine.record_internal(&hex, &draft_id).await })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::DraftNotOpen(id)) if *id == draft.id)));
        assert_eq!(engine.broadcaster().calls(), 1);
        assert_eq!(engine.database().transaction_count().await, 1);
    }

    async fn token_draft(engine: &TestEngine) -> DraftTransaction {
        fund(engine, &[utxo_record("alice", 1, 0, 5_000)]).await;

        let outputs = vec![
            TransactionOutput {
                satoshis: 1,
                script: transfer_script(TOKEN_ID, 6).to_hex(),
                to: "bob@example.com".to_string(),
                token: true,
                ..Default::default()
            },
            TransactionOutput {
                satoshis: 1,
                script: transfer_script(TOKEN_ID, 4).to_hex(),
                to: "alice@example.com".to_string(),
                token: true,
                token_change: true,
                ..Default::default()
            },
        ];

        engine
            .create_draft("alice", outputs, Some(p2pkh_script(1)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_record_internal_token_transfer() {
        let engine = get_engine();
        let draft = token_draft(&engine).await;

        let recorded = engine.record_internal(&draft.hex, &draft.id).await.unwrap();
        assert_eq!(recorded.status(), TxStatus::Broadcasted);

        let messages = engine.verifier().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].receiver_vouts, vec![0]);
        assert_eq!(messages[0].sender_vouts, vec![1]);
        assert_eq!(messages[0].receiver_id, "bob@example.com");
        assert_eq!(messages[0].sender_id, "alice");
    }

    #[tokio::test]
    async fn test_record_internal_token_rejected() {
        let engine = get_engine_with(
            MockBroadcaster::new(BroadcastStatus::SeenOnNetwork),
            MockVerifier::failing(),
        );
        let draft = token_draft(&engine).await;

        assert_matches!(
            engine.record_internal(&draft.hex, &draft.id).await,
            Err(Error::TokenValidationFailed(_))
        );
        assert_eq!(engine.broadcaster().calls(), 0);
        assert_eq!(engine.database().transaction_count().await, 0);
        assert!(engine
            .database()
            .get_draft(&draft.id)
            .await
            .unwrap()
            .unwrap()
            .is_open());
    }

    #[tokio::test]
    async fn test_record_internal_missing_draft() {
        let engine = get_engine();
        let tx = source_tx(&[1_000], 1);

        assert_matches!(
            engine.record_internal(&serialize_hex(&tx), "missing").await,
            Err(Error::DraftNotFound(_))
        );
        assert_matches!(
            engine.record_internal("zz", "missing").await,
            Err(Error::InvalidHex)
        );
    }

    #[tokio::test]
    async fn test_record_external_persist_failure() {
        let database = ReadOnlyTransactions(MemoryDatabase::new());
        database.save_destination(&destination("bob", 2)).await.unwrap();
        let engine = Engine::new(
            database,
            MockBroadcaster::new(BroadcastStatus::SeenOnNetwork),
            MockVerifier::default(),
            MockRules::default(),
            EngineConfig::default(),
        );

        let mut tx = source_tx(&[1_000], 1);
        tx.output[0].script_pubkey = p2pkh_script(2);

        let recorded = engine.record_external(&serialize_hex(&tx)).await.unwrap();
        assert_eq!(recorded.status(), TxStatus::Broadcasted);
        assert_eq!(engine.broadcaster().calls(), 1);
        assert_eq!(engine.database().0.transaction_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_record_external_concurrent_duplicates() {
        let engine = Arc::new(get_engine());
        engine
            .database()
            .save_destination(&destination("bob", 2))
            .await
            .unwrap();

        let mut tx = source_tx(&[1_000], 1);
        tx.output[0].script_pubkey = p2pkh_script(2);
        let hex = serialize_hex(&tx);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let hex = hex.clone();
                tokio::spawn(async move { engine.record_external(&hex).await })
            })
            .collect();

        for handle in handles {
            let recorded = handle.await.unwrap().unwrap();
            assert_eq!(recorded.id(), tx.txid());
        }

        assert_eq!(engine.broadcaster().calls(), 1);
        assert_eq!(engine.database().transaction_count().await, 1);
        assert_eq!(
            engine.database().list_spendable("bob").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_status_updates() {
        let engine = get_engine();
        engine
            .database()
            .save_destination(&destination("bob", 2))
            .await
            .unwrap();

        let mut tx = source_tx(&[1_000], 1);
        tx.output[0].script_pubkey = p2pkh_script(2);
        let txid = engine
            .record_external(&serialize_hex(&tx))
            .await
            .unwrap()
            .id();

        assert!(!engine
            .update_from_broadcast_status(&txid, BroadcastStatus::SeenOnNetwork)
            .await
            .unwrap());
        assert!(engine
            .update_from_broadcast_status(&txid, BroadcastStatus::Mined)
            .await
            .unwrap());
        assert_eq!(
            engine
                .database()
                .get_transaction(&txid)
                .await
                .unwrap()
                .unwrap()
                .status(),
            TxStatus::Mined
        );

        let reverted = engine.mark_reverted(&txid).await.unwrap();
        assert_eq!(reverted.status(), TxStatus::Reverted);
        assert_matches!(
            engine.mark_reverted(&txid).await,
            Err(Error::InvalidStatusTransition { .. })
        );

        let unknown = source_tx(&[1], 50).txid();
        assert_matches!(
            engine
                .update_from_broadcast_status(&unknown, BroadcastStatus::Mined)
                .await,
            Err(Error::TransactionNotFound(_))
        );
    }

    #[tokio::test]
    async fn test_update_metadata() {
        let engine = get_engine();
        engine
            .database()
            .save_destination(&destination("bob", 2))
            .await
            .unwrap();

        let mut tx = source_tx(&[1_000], 1);
        tx.output[0].script_pubkey = p2pkh_script(2);
        let txid = engine
            .record_external(&serialize_hex(&tx))
            .await
            .unwrap()
            .id();

        let mut metadata = Metadata::new();
        metadata.insert("note".to_string(), json!("salary"));
        let updated = engine
            .update_metadata(&txid, "bob", metadata.clone())
            .await
            .unwrap();
        assert_eq!(updated.owner_metadata["bob"]["note"], json!("salary"));

        assert_matches!(
            engine.update_metadata(&txid, "carol", metadata).await,
            Err(Error::Generic(_))
        );
    }

    fn intent(amount: u64) -> Intent {
        Intent {
            sender_id: "alice@example.com".to_string(),
            receiver_id: "bob@example.com".to_string(),
            nonce: "caller-nonce".to_string(),
            asset_id: TOKEN_ID.to_string(),
            amount,
            banknotes: vec![Banknote::new(5, TOKEN_ID), Banknote::new(3, TOKEN_ID)],
            metadata: Metadata::new(),
        }
    }

    fn engine_with_fee() -> TestEngine {
        let rules = MockRules(AssetRules {
            emitter_id: "emitter@example.com".to_string(),
            fees: vec![FeeBand {
                from: 0,
                to: 1_000,
                fee: FeeKind::Fixed(1),
                recipient: "treasury@example.com".to_string(),
            }],
        });

        Engine::new(
            MemoryDatabase::new(),
            MockBroadcaster::new(BroadcastStatus::SeenOnNetwork),
            MockVerifier::default(),
            rules,
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_validate_intent() {
        let engine = engine_with_fee();

        let response = engine.validate_intent(&intent(6)).await.unwrap();
        assert_eq!(response.nonce.len(), 64);
        // the fee is taken out of the 5, the receiver gets 4 + 1 and the sender 2 back
        assert_eq!(response.outputs.len(), 4);
        assert!(response.outputs[2].token_fee);
        assert!(response.outputs[3].token_change);
        assert_eq!(response.outputs[2].to, "treasury@example.com");

        let id = TransferIntent::compute_id("caller-nonce", &response.nonce);
        let stored = engine
            .database()
            .get_transfer_intent(&id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.outputs, response.outputs);

        // a second validation gets a fresh nonce
        let other = engine.validate_intent(&intent(6)).await.unwrap();
        assert_ne!(other.nonce, response.nonce);
    }

    #[tokio::test]
    async fn test_validate_intent_insufficient_banknotes() {
        let engine = engine_with_fee();

        assert_matches!(
            engine.validate_intent(&intent(9)).await,
            Err(Error::InsufficientBanknotes {
                needed: 9,
                available: 8
            })
        );
    }

    #[tokio::test]
    async fn test_validate_and_record_transfer() {
        let engine = engine_with_fee();
        engine
            .database()
            .save_destination(&destination("bob", 2))
            .await
            .unwrap();

        let response = engine.validate_intent(&intent(6)).await.unwrap();
        let ref_id = TransferIntent::compute_id("caller-nonce", &response.nonce);

        let mut outputs: Vec<_> = response
            .outputs
            .iter()
            .map(|o| (o.satoshis, o.script_pubkey().unwrap()))
            .collect();
        outputs.push((500, p2pkh_script(2)));
        let source = source_tx(&[1_000], 1);
        let tx = spending_tx(&[OutPoint::new(source.txid(), 0)], &outputs);

        // dropping a token output breaks the transfer
        let incomplete = spending_tx(&[OutPoint::new(source.txid(), 0)], &outputs[1..]);
        assert_matches!(
            engine
                .validate_and_record_transfer(&Transfer {
                    ref_id: ref_id.clone(),
                    tx_hex: serialize_hex(&incomplete),
                    special_operation: None,
                })
                .await,
            Err(Error::TransferMismatch(_))
        );
        assert_eq!(engine.broadcaster().calls(), 0);

        let recorded = engine
            .validate_and_record_transfer(&Transfer {
                ref_id: ref_id.clone(),
                tx_hex: serialize_hex(&tx),
                special_operation: None,
            })
            .await
            .unwrap();
        assert_eq!(recorded.status(), TxStatus::Broadcasted);
        assert_eq!(recorded.metadata["transfer"]["ref_id"], json!(ref_id));
        assert_eq!(engine.broadcaster().calls(), 1);
    }
}

#![allow(unused)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{
    OutPoint, PackedLockTime, PubkeyHash, Script, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use wallet_engine::blockchain::{BroadcastStatus, Broadcaster};
use wallet_engine::database::{Database, MemoryDatabase, UtxoStore};
use wallet_engine::tokens::{AssetRules, FeeRuleProvider, TokenVerifier, TransferMessage, VerifyOutcome};
use wallet_engine::{Destination, Engine, EngineConfig, Error, ExtendedTransaction, UtxoRecord};

pub type TestEngine = Engine<MemoryDatabase, CountingBroadcaster, AcceptAll, NoFees>;

/// Broadcaster accepting everything, counting the calls
#[derive(Debug, Default)]
pub struct CountingBroadcaster {
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl CountingBroadcaster {
    pub fn slow(delay: Duration) -> Self {
        CountingBroadcaster {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broadcaster for CountingBroadcaster {
    async fn broadcast(&self, _tx: &ExtendedTransaction) -> Result<BroadcastStatus, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        Ok(BroadcastStatus::SeenOnNetwork)
    }
}

#[derive(Debug, Default)]
pub struct AcceptAll {
    messages: Mutex<Vec<TransferMessage>>,
}

#[async_trait]
impl TokenVerifier for AcceptAll {
    async fn verify_and_register(&self, message: &TransferMessage) -> Result<VerifyOutcome, Error> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(VerifyOutcome::Registered)
    }
}

#[derive(Debug, Default)]
pub struct NoFees;

#[async_trait]
impl FeeRuleProvider for NoFees {
    async fn rules_for(&self, _asset_id: &str) -> Result<AssetRules, Error> {
        Ok(AssetRules {
            emitter_id: "emitter@example.com".to_string(),
            fees: vec![],
        })
    }
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn get_engine_with(broadcaster: CountingBroadcaster, config: EngineConfig) -> TestEngine {
    init_logger();
    Engine::new(
        MemoryDatabase::new(),
        broadcaster,
        AcceptAll::default(),
        NoFees,
        config,
    )
}

pub fn get_engine() -> TestEngine {
    get_engine_with(CountingBroadcaster::default(), EngineConfig::default())
}

pub fn script(seed: u8) -> Script {
    Script::new_p2pkh(&PubkeyHash::from_inner([seed; 20]))
}

/// Register `script(seed)` as a destination of `owner_id`
pub async fn add_destination(engine: &TestEngine, owner_id: &str, seed: u8) {
    engine
        .database()
        .save_destination(&Destination {
            owner_id: owner_id.to_string(),
            script_pubkey: script(seed),
            spending_instructions: serde_json::json!({ "path": format!("m/0/{}", seed) }),
        })
        .await
        .unwrap();
}

pub fn transaction(inputs: &[OutPoint], outputs: &[(u64, Script)]) -> Transaction {
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

/// A transaction coming from outside, spending an unknown output
pub fn incoming(seed: u8, outputs: &[(u64, Script)]) -> Transaction {
    transaction(&[OutPoint::new(Txid::from_inner([seed; 32]), 0)], outputs)
}

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

// only enables the `doc_cfg` feature when
// the `docsrs` configuration attribute is defined
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A non-custodial wallet backend.
//!
//! The crate tracks spendable outputs for many owners, picks inputs for new transactions,
//! rewrites transactions into the extended (proof-carrying) format and records incoming
//! transactions through an idempotent state machine.
//!
//! Everything is reachable from the [`Engine`], which is generic over the storage, broadcast,
//! token verification and fee-rule collaborators:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use wallet_engine::*;
//! # use wallet_engine::database::MemoryDatabase;
//! # async fn run<B, T, F>(broadcaster: B, verifier: T, rules: F) -> Result<(), Error>
//! # where B: wallet_engine::blockchain::Broadcaster, T: wallet_engine::tokens::TokenVerifier,
//! #       F: wallet_engine::tokens::FeeRuleProvider {
//! let engine = Arc::new(Engine::new(
//!     MemoryDatabase::new(),
//!     broadcaster,
//!     verifier,
//!     rules,
//!     EngineConfig::default(),
//! ));
//!
//! let recorded = engine.record_external("0100000001...").await?;
//! println!("recorded {} as {}", recorded.id(), recorded.status());
//! # Ok(())
//! # }
//! ```

pub extern crate bitcoin;
extern crate log;
extern crate serde;
#[macro_use]
extern crate serde_json;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

#[macro_use]
pub(crate) mod error;
pub mod blockchain;
pub mod config;
pub mod database;
pub mod extended;
pub mod record;
pub mod tokens;
pub mod transaction;
pub mod transfer;
pub(crate) mod types;
pub mod wallet;

#[cfg(test)]
pub(crate) mod testutils;

pub use config::EngineConfig;
pub use error::Error;
pub use extended::ExtendedTransaction;
pub use transaction::{Transaction, TxStatus};
pub use types::*;
pub use wallet::Engine;

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

//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::FeeUnit;

/// Estimated size of a P2PKH output
pub const P2PKH_OUTPUT_SIZE: u64 = 34;
/// Estimated size of an input spending a P2PKH output
pub const P2PKH_INPUT_SIZE: u64 = 148;

/// [`Engine`](crate::wallet::Engine) configuration options
///
/// Every field has a default, so a partial JSON document is a valid configuration:
///
/// ```
/// # use wallet_engine::EngineConfig;
/// let config = EngineConfig::from_json(r#"{"io_timeout_secs": 5}"#)?;
/// assert_eq!(config.io_timeout_secs, 5);
/// assert_eq!(config.change_output_size, 34);
/// # Ok::<(), wallet_engine::Error>(())
/// ```
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Fee unit used when funding drafts
    pub fee_unit: FeeUnit,
    /// Estimated size of the change output
    pub change_output_size: u64,
    /// Estimated size of an input, unless the UTXO carries its own estimate
    pub default_input_size: u64,
    /// Value of every token output built from a banknote
    pub token_output_satoshis: u64,
    /// Deadline for every call to a collaborator
    pub io_timeout_secs: u64,
    /// Deadline for acquiring a key lock
    pub lock_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            fee_unit: FeeUnit::default(),
            change_output_size: P2PKH_OUTPUT_SIZE,
            default_input_size: P2PKH_INPUT_SIZE,
            token_output_satoshis: 1,
            io_timeout_secs: 30,
            lock_timeout_secs: 10,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a JSON document, validating the fee unit
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: EngineConfig = serde_json::from_str(json)?;
        if config.fee_unit.bytes == 0 {
            return Err(Error::InvalidFeeUnit);
        }

        Ok(config)
    }

    /// Deadline for collaborator calls
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    /// Deadline for acquiring a key lock
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

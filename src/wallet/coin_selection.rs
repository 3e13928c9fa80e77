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

//! Coin selection
//!
//! This module provides the trait [`CoinSelectionAlgorithm`] that can be implemented to
//! define custom coin selection algorithms.
//!
//! The coin selection algorithm is not globally part of an [`Engine`](super::Engine), instead it
//! is chosen whenever a [`Engine::select_inputs_with`](super::Engine::select_inputs_with) call is
//! made. [`Engine::select_inputs`](super::Engine::select_inputs) and draft creation use the
//! [`DefaultCoinSelectionAlgorithm`].
//!
//! Algorithms receive the spendable outputs of an owner already sorted by
//! [`UtxoRecord::selection_order`], and must not reorder them in the result.
//!
//! ## Example
//!
//! ```
//! # use wallet_engine::wallet::coin_selection::*;
//! # use wallet_engine::*;
//! #[derive(Debug)]
//! struct SpendEverything;
//!
//! impl CoinSelectionAlgorithm for SpendEverything {
//!     fn coin_select(
//!         &self,
//!         utxos: Vec<UtxoRecord>,
//!         request: &SelectionRequest,
//!     ) -> Result<CoinSelectionResult, Error> {
//!         let selected_amount: u64 = utxos.iter().map(|u| u.satoshis).sum();
//!         let size = request.base_size
//!             + utxos.len() as u64 * request.default_input_size
//!             + request.change_output_size;
//!         let fee = request.fee_unit.fee_for_size(size)?;
//!
//!         if selected_amount < request.target + fee {
//!             return Err(Error::InsufficientFunds {
//!                 needed: request.target + fee,
//!                 available: selected_amount,
//!             });
//!         }
//!
//!         Ok(CoinSelectionResult {
//!             change: selected_amount - request.target - fee,
//!             selected: utxos,
//!             selected_amount,
//!             fee,
//!         })
//!     }
//! }
//! ```

use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{FeeUnit, UtxoRecord};

/// Default coin selection algorithm used by [`Engine`](super::Engine) if not overridden
pub type DefaultCoinSelectionAlgorithm = OldestFirstCoinSelection;

/// What a coin selection has to fund
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRequest {
    /// Sum of the values of the requested outputs
    pub target: u64,
    /// Estimated size of the transaction without inputs and without the change output
    pub base_size: u64,
    /// Estimated size of an input, unless the UTXO carries its own estimate
    pub default_input_size: u64,
    /// Estimated size of the change output
    pub change_output_size: u64,
    /// Fee unit
    pub fee_unit: FeeUnit,
}

/// Result of a successful coin selection
#[derive(Debug, Clone, PartialEq)]
pub struct CoinSelectionResult {
    /// Selected UTXOs, in selection order
    pub selected: Vec<UtxoRecord>,
    /// Sum of the selected UTXOs' value
    pub selected_amount: u64,
    /// Value of the change output, `0` means no change output
    pub change: u64,
    /// Total fee amount in satoshi
    pub fee: u64,
}

impl CoinSelectionResult {
    /// Outpoints of the selected UTXOs
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.selected.iter().map(|utxo| utxo.outpoint).collect()
    }
}

/// Trait for generalized coin selection algorithms
///
/// This trait can be implemented to make the [`Engine`](super::Engine) use a customized coin
/// selection algorithm when it funds drafts.
///
/// For an example see [this module](crate::wallet::coin_selection)'s documentation.
pub trait CoinSelectionAlgorithm: std::fmt::Debug + Send + Sync {
    /// Perform the coin selection
    ///
    /// - `utxos`: the spendable outputs of the owner, sorted by
    ///            [`UtxoRecord::selection_order`]
    /// - `request`: the amount to fund and the fee model
    fn coin_select(
        &self,
        utxos: Vec<UtxoRecord>,
        request: &SelectionRequest,
    ) -> Result<CoinSelectionResult, Error>;
}

/// Minimal change selection over the oldest outputs
///
/// This coin selection algorithm walks the UTXOs in the given order and considers every prefix
/// of the list. A prefix is sufficient when it covers the target plus the fee, including the fee
/// for a change output when one is needed. Among the sufficient prefixes the one leaving the
/// smallest change wins, the shortest one on ties.
///
/// Since the list is sorted by last selection time, outputs that have been waiting the longest
/// are spent first and none of them starves.
#[derive(Debug, Default, Clone, Copy)]
pub struct OldestFirstCoinSelection;

impl CoinSelectionAlgorithm for OldestFirstCoinSelection {
    fn coin_select(
        &self,
        mut utxos: Vec<UtxoRecord>,
        request: &SelectionRequest,
    ) -> Result<CoinSelectionResult, Error> {
        let fee_unit = request.fee_unit;
        if fee_unit.bytes == 0 {
            return Err(Error::InvalidFeeUnit);
        }

        log::debug!(
            "target = `{}`, base_size = `{}`, fee_unit = `{:?}`, candidates = `{}`",
            request.target,
            request.base_size,
            fee_unit,
            utxos.len()
        );

        if utxos.is_empty() && request.target == 0 {
            return Ok(CoinSelectionResult {
                selected: vec![],
                selected_amount: 0,
                change: 0,
                fee: 0,
            });
        }

        let target = request.target as i64;
        let mut value = 0i64;
        let mut size = request.base_size;
        let mut fee_no_change = fee_unit.fee_for_size(size)?;
        // (prefix length, change, fee)
        let mut best: Option<(usize, i64, u64)> = None;

        for (index, utxo) in utxos.iter().enumerate() {
            value += utxo.satoshis as i64;
            size += utxo
                .estimated_input_size
                .unwrap_or(request.default_input_size);

            fee_no_change = fee_unit.fee_for_size(size)?;
            let fee_with_change = fee_unit.fee_for_size(size + request.change_output_size)?;

            let remaining = value - target;
            let (change, fee) = if remaining - fee_no_change as i64 <= 0 {
                (remaining - fee_no_change as i64, fee_no_change)
            } else {
                (remaining - fee_with_change as i64, fee_with_change)
            };

            if change >= 0 && best.map_or(true, |(_, best_change, _)| change < best_change) {
                log::trace!(
                    "Prefix of {} is the best so far, change = `{}`",
                    index + 1,
                    change
                );
                best = Some((index + 1, change, fee));
            }
        }

        let (len, change, fee) = match best {
            Some(best) => best,
            None => {
                return Err(Error::InsufficientFunds {
                    needed: request.target + fee_no_change,
                    available: value as u64,
                })
            }
        };

        utxos.truncate(len);
        let selected_amount = utxos.iter().map(|utxo| utxo.satoshis).sum();

        log::debug!(
            "Selected {} UTXOs, selected_amount = `{}`, change = `{}`, fee = `{}`",
            len,
            selected_amount,
            change,
            fee
        );

        Ok(CoinSelectionResult {
            selected: utxos,
            selected_amount,
            change: change as u64,
            fee,
        })
    }
}

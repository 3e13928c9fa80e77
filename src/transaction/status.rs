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

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a recorded transaction
///
/// ```text
/// Created -> Broadcasted -> Mined -> Reverted
///                       \-> Problematic
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    /// Recorded but not yet submitted
    Created,
    /// Accepted by the broadcaster
    Broadcasted,
    /// Included in a block
    Mined,
    /// The block including it was reorganized away
    Reverted,
    /// Rejected, double spent or stuck
    Problematic,
}

impl TxStatus {
    /// Whether the lifecycle allows moving from `self` to `to`
    pub fn can_transition_to(&self, to: TxStatus) -> bool {
        use TxStatus::*;

        matches!(
            (self, to),
            (Created, Broadcasted)
                | (Broadcasted, Mined)
                | (Broadcasted, Problematic)
                | (Mined, Reverted)
        )
    }

    /// Whether no further transition is possible
    pub fn is_final(&self) -> bool {
        matches!(self, TxStatus::Reverted | TxStatus::Problematic)
    }
}

impl Default for TxStatus {
    fn default() -> Self {
        TxStatus::Created
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Created => "CREATED",
            TxStatus::Broadcasted => "BROADCASTED",
            TxStatus::Mined => "MINED",
            TxStatus::Reverted => "REVERTED",
            TxStatus::Problematic => "PROBLEMATIC",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_transitions() {
        use TxStatus::*;

        let all = [Created, Broadcasted, Mined, Reverted, Problematic];
        let allowed = [
            (Created, Broadcasted),
            (Broadcasted, Mined),
            (Broadcasted, Problematic),
            (Mined, Reverted),
        ];

        for from in all.iter() {
            for to in all.iter() {
                assert_eq!(
                    from.can_transition_to(*to),
                    allowed.contains(&(*from, *to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_final_statuses() {
        assert!(TxStatus::Reverted.is_final());
        assert!(TxStatus::Problematic.is_final());
        assert!(!TxStatus::Mined.is_final());
    }
}

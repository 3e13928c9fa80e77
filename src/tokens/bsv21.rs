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

//! BSV-21 inscriptions
//!
//! Token operations are carried by an ordinal envelope embedded in an output script:
//!
//! ```text
//! OP_FALSE OP_IF "ord" OP_1 "application/bsv-20" OP_0 <json> OP_ENDIF
//! ```
//!
//! where `<json>` describes the operation, for instance
//! `{"p":"bsv-20","op":"transfer","id":"<txid>_<vout>","amt":"10"}`.

use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::{Builder, Instruction};
use bitcoin::{Script, Transaction};
use serde::{Deserialize, Serialize};

/// Content type of BSV-20/BSV-21 payloads
pub const BSV20_CONTENT_TYPE: &str = "application/bsv-20";
/// Protocol identifier inside the payload
pub const BSV20_PROTOCOL: &str = "bsv-20";

const ORD_TAG: &[u8] = b"ord";

/// Operation described by a BSV-21 payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenOperation {
    /// Protocol, always `bsv-20`
    pub p: String,
    /// Operation name, for instance `transfer` or `deploy+mint`
    pub op: String,
    /// Token id, absent for deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Amount, encoded as a decimal string
    pub amt: String,
}

impl TokenOperation {
    /// Build a transfer of `amount` units of `token_id`
    pub fn transfer(token_id: &str, amount: u64) -> Self {
        TokenOperation {
            p: BSV20_PROTOCOL.to_string(),
            op: "transfer".to_string(),
            id: Some(token_id.to_string()),
            amt: amount.to_string(),
        }
    }

    /// Amount as an integer, if well formed
    pub fn amount(&self) -> Option<u64> {
        self.amt.parse().ok()
    }
}

/// An ordinal envelope found in a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inscription {
    /// Content type field, when present
    pub content_type: Option<String>,
    /// Body of the inscription
    pub content: Vec<u8>,
}

/// Script carrying a BSV-21 transfer inscription for `token_id`
pub fn transfer_script(token_id: &str, amount: u64) -> Script {
    inscription_script(&TokenOperation::transfer(token_id, amount))
}

/// Script carrying the inscription of `operation`
pub fn inscription_script(operation: &TokenOperation) -> Script {
    // serializing a struct of strings can't fail
    let payload = serde_json::to_vec(operation).unwrap_or_default();

    Builder::new()
        .push_opcode(opcodes::OP_FALSE)
        .push_opcode(opcodes::all::OP_IF)
        .push_slice(ORD_TAG)
        .push_opcode(opcodes::all::OP_PUSHNUM_1)
        .push_slice(BSV20_CONTENT_TYPE.as_bytes())
        .push_opcode(opcodes::OP_FALSE)
        .push_slice(&payload)
        .push_opcode(opcodes::all::OP_ENDIF)
        .into_script()
}

/// Look for an ordinal envelope anywhere in `script`
pub fn find_inscription(script: &Script) -> Option<Inscription> {
    let instructions = script
        .instructions()
        .collect::<Result<Vec<_>, _>>()
        .ok()?;

    let start = instructions.windows(3).position(|w| {
        matches!(
            w,
            [Instruction::PushBytes(f), Instruction::Op(op), Instruction::PushBytes(tag)]
                if f.is_empty() && *op == opcodes::all::OP_IF && *tag == ORD_TAG
        )
    })?;

    let mut inscription = Inscription {
        content_type: None,
        content: vec![],
    };
    let mut fields = instructions[start + 3..].iter();
    loop {
        let field = match fields.next()? {
            Instruction::Op(op) if *op == opcodes::all::OP_ENDIF => return Some(inscription),
            Instruction::Op(op) if *op == opcodes::all::OP_PUSHNUM_1 => 1,
            Instruction::PushBytes(b) if b.is_empty() => 0,
            Instruction::PushBytes(b) if b.len() == 1 => b[0],
            _ => return None,
        };
        let value = match fields.next()? {
            Instruction::PushBytes(b) => b,
            _ => return None,
        };

        match field {
            0 => inscription.content.extend_from_slice(value),
            1 => inscription.content_type = Some(String::from_utf8_lossy(value).into_owned()),
            _ => {}
        }
    }
}

/// Token operation inscribed in `script`, if any
pub fn token_operation(script: &Script) -> Option<TokenOperation> {
    let inscription = find_inscription(script)?;
    if inscription.content_type.as_deref() != Some(BSV20_CONTENT_TYPE) {
        return None;
    }

    let operation: TokenOperation = serde_json::from_slice(&inscription.content).ok()?;
    if operation.p != BSV20_PROTOCOL {
        return None;
    }

    Some(operation)
}

/// Whether any output of `tx` carries a token operation
pub fn is_token_transaction(tx: &Transaction) -> bool {
    tx.output
        .iter()
        .any(|txout| token_operation(&txout.script_pubkey).is_some())
}

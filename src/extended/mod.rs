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

//! Extended transaction format
//!
//! The extended format carries, next to every input, the value and the locking script of the
//! output it spends. This lets a light client check the scripts and the fee of a transaction
//! without fetching its parents.
//!
//! ```text
//! version(4) | 00 00 00 00 00 EF | varint(n_in)
//!   n_in * [ prev txid(32) | prev vout(4) | varint script_sig | sequence(4)
//!            | source satoshis(8) | varint source locking script ]
//! varint(n_out) | outputs | locktime(4)
//! ```
//!
//! All the integers are little-endian. Parsing accepts both this encoding and the plain one.

use std::collections::HashMap;
use std::io;

use bitcoin::consensus::encode::{self, deserialize, serialize, VarInt};
use bitcoin::consensus::{Decodable, Encodable};
use bitcoin::hashes::hex::{FromHex, ToHex};
use bitcoin::{OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use crate::error::Error;

pub mod converter;

pub use converter::Converter;

/// Bytes following the version in the extended encoding
pub const EXTENDED_MARKER: [u8; 6] = [0x00, 0x00, 0x00, 0x00, 0x00, 0xEF];

const EXTENDED_MARKER_HEX: &str = "0000000000ef";

/// Whether `hex` looks like the extended encoding of a transaction
///
/// Only the marker is checked, the rest of the data may still be invalid.
pub fn is_extended_hex(hex: &str) -> bool {
    hex.len() > 20
        && hex
            .get(8..20)
            .map(|marker| marker.eq_ignore_ascii_case(EXTENDED_MARKER_HEX))
            .unwrap_or(false)
}

fn is_extended_bytes(bytes: &[u8]) -> bool {
    bytes.len() > 10 && bytes[4..10] == EXTENDED_MARKER
}

/// A transaction together with the outputs spent by its inputs, when known
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedTransaction {
    tx: Transaction,
    source_outputs: Vec<Option<TxOut>>,
}

impl ExtendedTransaction {
    /// Wrap a transaction without any source output
    pub fn new(tx: Transaction) -> Self {
        let source_outputs = vec![None; tx.input.len()];
        ExtendedTransaction { tx, source_outputs }
    }

    /// Parse either the plain or the extended encoding
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if is_extended_bytes(bytes) {
            let mut cursor = io::Cursor::new(bytes);
            let parsed = Self::decode_extended(&mut cursor)?;
            if cursor.position() as usize != bytes.len() {
                return Err(Error::Encode(encode::Error::ParseFailed(
                    "data not consumed entirely when explicitly deserializing",
                )));
            }

            Ok(parsed)
        } else {
            Ok(Self::new(deserialize(bytes)?))
        }
    }

    /// Parse a hex string in either encoding
    pub fn from_hex(hex: &str) -> Result<Self, Error> {
        let bytes = Vec::<u8>::from_hex(hex).map_err(|_| Error::InvalidHex)?;
        Self::from_bytes(&bytes).map_err(|e| {
            log::debug!("Failed to parse transaction: {}", e);
            Error::InvalidHex
        })
    }

    fn decode_extended<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let version = i32::consensus_decode(r)?;

        let mut marker = [0u8; 6];
        r.read_exact(&mut marker)?;
        if marker != EXTENDED_MARKER {
            return Err(encode::Error::ParseFailed("invalid extended format marker"));
        }

        let n_in = VarInt::consensus_decode(r)?.0;
        let mut input = Vec::new();
        let mut source_outputs = Vec::new();
        for _ in 0..n_in {
            let previous_output = OutPoint::consensus_decode(r)?;
            let script_sig = Script::consensus_decode(r)?;
            let sequence = Sequence::consensus_decode(r)?;
            let value = u64::consensus_decode(r)?;
            let script_pubkey = Script::consensus_decode(r)?;

            input.push(TxIn {
                previous_output,
                script_sig,
                sequence,
                witness: Witness::default(),
            });
            source_outputs.push(Some(TxOut {
                value,
                script_pubkey,
            }));
        }

        let output = Vec::<TxOut>::consensus_decode(r)?;
        let lock_time = PackedLockTime::consensus_decode(r)?;

        Ok(ExtendedTransaction {
            tx: Transaction {
                version,
                lock_time,
                input,
                output,
            },
            source_outputs,
        })
    }

    /// Id of the transaction, computed on the plain encoding
    pub fn txid(&self) -> Txid {
        self.tx.txid()
    }

    /// The underlying transaction
    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Consume `self`, returning the underlying transaction
    pub fn into_transaction(self) -> Transaction {
        self.tx
    }

    /// Output spent by the input at `index`, if known
    pub fn source_output(&self, index: usize) -> Option<&TxOut> {
        self.source_outputs.get(index).and_then(Option::as_ref)
    }

    /// Attach the output spent by the input at `index`
    pub fn set_source_output(&mut self, index: usize, txout: TxOut) -> Result<(), Error> {
        match self.source_outputs.get_mut(index) {
            Some(slot) => {
                *slot = Some(txout);
                Ok(())
            }
            None => Err(Error::Generic(format!("Input {} doesn't exist", index))),
        }
    }

    /// Whether every input carries its source output
    pub fn is_fully_sourced(&self) -> bool {
        self.source_outputs.iter().all(Option::is_some)
    }

    /// Distinct ids of the transactions spent by inputs without a source output, in order of
    /// first appearance
    pub fn unsourced_txids(&self) -> Vec<Txid> {
        let mut txids: Vec<Txid> = Vec::new();
        for (txin, source) in self.tx.input.iter().zip(&self.source_outputs) {
            let txid = txin.previous_output.txid;
            if source.is_none() && !txids.contains(&txid) {
                txids.push(txid);
            }
        }

        txids
    }

    /// Fill every missing source output from `sources`, keyed by txid
    pub fn attach_sources(&mut self, sources: &HashMap<Txid, Transaction>) -> Result<(), Error> {
        for (txin, slot) in self.tx.input.iter().zip(self.source_outputs.iter_mut()) {
            if slot.is_some() {
                continue;
            }

            let outpoint = txin.previous_output;
            let source = sources.get(&outpoint.txid).ok_or_else(|| {
                Error::SourceResolution(format!("Missing source transaction {}", outpoint.txid))
            })?;
            let txout = source.output.get(outpoint.vout as usize).ok_or_else(|| {
                Error::SourceResolution(format!(
                    "Output {} doesn't exist in source transaction {}",
                    outpoint.vout, outpoint.txid
                ))
            })?;

            *slot = Some(txout.clone());
        }

        Ok(())
    }

    /// Sum of the values of the known source outputs
    pub fn sourced_input_value(&self) -> u64 {
        self.source_outputs
            .iter()
            .flatten()
            .map(|txout| txout.value)
            .sum()
    }

    /// Sum of the values of the outputs
    pub fn output_value(&self) -> u64 {
        self.tx.output.iter().map(|txout| txout.value).sum()
    }

    /// Plain encoding
    pub fn to_raw_bytes(&self) -> Vec<u8> {
        serialize(&self.tx)
    }

    /// Plain encoding as lowercase hex
    pub fn to_raw_hex(&self) -> String {
        self.to_raw_bytes().to_hex()
    }

    /// Extended encoding, failing if any input lacks its source output
    pub fn to_extended_bytes(&self) -> Result<Vec<u8>, Error> {
        let sources = self
            .source_outputs
            .iter()
            .enumerate()
            .map(|(index, source)| {
                source.as_ref().ok_or_else(|| {
                    Error::SourceResolution(format!("Input {} has no source output", index))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut buf = Vec::new();
        self.write_extended(&sources, &mut buf)
            .map_err(encode::Error::from)?;

        Ok(buf)
    }

    /// Extended encoding as lowercase hex
    pub fn to_extended_hex(&self) -> Result<String, Error> {
        Ok(self.to_extended_bytes()?.to_hex())
    }

    fn write_extended<W: io::Write + ?Sized>(
        &self,
        sources: &[&TxOut],
        w: &mut W,
    ) -> Result<usize, io::Error> {
        let mut len = self.tx.version.consensus_encode(w)?;
        w.write_all(&EXTENDED_MARKER)?;
        len += EXTENDED_MARKER.len();

        len += VarInt(self.tx.input.len() as u64).consensus_encode(w)?;
        for (txin, source) in self.tx.input.iter().zip(sources) {
            len += txin.previous_output.consensus_encode(w)?;
            len += txin.script_sig.consensus_encode(w)?;
            len += txin.sequence.consensus_encode(w)?;
            len += source.value.consensus_encode(w)?;
            len += source.script_pubkey.consensus_encode(w)?;
        }

        len += self.tx.output.consensus_encode(w)?;
        len += self.tx.lock_time.consensus_encode(w)?;

        Ok(len)
    }
}

impl From<Transaction> for ExtendedTransaction {
    fn from(tx: Transaction) -> Self {
        ExtendedTransaction::new(tx)
    }
}

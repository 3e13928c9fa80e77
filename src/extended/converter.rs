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

//! Conversion to the extended format
//!
//! The [`Converter`] fills the missing source outputs of a transaction with a single batched call
//! to a [`SourceResolver`], and refuses any answer that doesn't match the request exactly.

use std::collections::HashMap;
use std::time::Duration;

use bitcoin::{Transaction, Txid};

use crate::blockchain::SourceResolver;
use crate::error::Error;
use crate::extended::ExtendedTransaction;
use crate::wallet::utils::with_timeout;

/// Converts transactions to the extended format
#[derive(Debug)]
pub struct Converter<'a, R: SourceResolver + ?Sized> {
    resolver: &'a R,
    timeout: Duration,
}

impl<'a, R: SourceResolver + ?Sized> Converter<'a, R> {
    /// Create a converter, bounding every resolver call by `timeout`
    pub fn new(resolver: &'a R, timeout: Duration) -> Self {
        Converter { resolver, timeout }
    }

    /// Convert a hex string in either encoding, returning the extended encoding
    pub async fn convert_hex(&self, hex: &str) -> Result<String, Error> {
        self.convert(ExtendedTransaction::from_hex(hex)?).await
    }

    /// Resolve the missing source outputs of `tx` and return its extended encoding
    ///
    /// A transaction already carrying all its source outputs is returned without querying the
    /// resolver.
    pub async fn convert(&self, mut tx: ExtendedTransaction) -> Result<String, Error> {
        if tx.is_fully_sourced() {
            return tx.to_extended_hex();
        }

        let txids = tx.unsourced_txids();
        log::debug!("Resolving {} source transactions for {}", txids.len(), tx.txid());

        let response = with_timeout(self.timeout, self.resolver.get_transactions(&txids)).await?;
        let sources = check_response(&txids, response)?;

        tx.attach_sources(&sources)?;
        tx.to_extended_hex()
    }
}

fn check_response(
    requested: &[Txid],
    response: Vec<Option<Transaction>>,
) -> Result<HashMap<Txid, Transaction>, Error> {
    if response.len() != requested.len() {
        return Err(Error::SourceResolution(format!(
            "Requested {} transactions, received {}",
            requested.len(),
            response.len()
        )));
    }

    let mut sources = HashMap::with_capacity(response.len());
    for (index, entry) in response.into_iter().enumerate() {
        let tx = entry.ok_or_else(|| {
            Error::SourceResolution(format!("Transaction {} not found", requested[index]))
        })?;
        let txid = tx.txid();

        if !requested.contains(&txid) {
            return Err(Error::SourceResolution(format!(
                "Received unrequested transaction {}",
                txid
            )));
        }
        if sources.insert(txid, tx).is_some() {
            return Err(Error::SourceResolution(format!(
                "Received transaction {} twice",
                txid
            )));
        }
    }

    Ok(sources)
}

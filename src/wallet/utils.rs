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

use std::future::Future;
use std::time::Duration;

use bitcoin::hashes::hex::ToHex;
use bitcoin::hashes::{sha256, Hash};
use rand::RngCore;

use crate::error::Error;

/// Await `future`, failing with [`Error::Timeout`] if it takes longer than `timeout`
pub(crate) async fn with_timeout<T, F>(timeout: Duration, future: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::Timeout)?
}

/// `len` random bytes, hex encoded
pub(crate) fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);

    bytes.to_hex()
}

/// Hex encoded SHA-256 of `data`
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    sha256::Hash::hash(data).into_inner()[..].to_hex()
}

/// Size of the compact encoding of `n`
pub(crate) fn varint_len(n: u64) -> u64 {
    match n {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x10000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

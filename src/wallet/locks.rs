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

//! Named locks
//!
//! [`KeyLocks`] serializes the work done on the same key (a txid being recorded, an owner whose
//! UTXOs are being selected) while letting work on different keys run in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::Error;

/// Set of async locks identified by a string key
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Guard returned by [`KeyLocks::acquire`], the key is released on drop
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    /// Create an empty set of locks
    pub fn new() -> Self {
        KeyLocks::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        // the map is never left in an inconsistent state
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until `key` is free and take it, failing with [`Error::LockTimeout`] after `timeout`
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<KeyGuard<'_>, Error> {
        let mutex = Arc::clone(self.map().entry(key.to_string()).or_default());

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                log::trace!("Acquired lock `{}`", key);

                Ok(KeyGuard {
                    locks: self,
                    key: key.to_string(),
                    guard: Some(guard),
                })
            }
            Err(_) => {
                self.cleanup(key);
                log::debug!("Timed out waiting for lock `{}`", key);

                Err(Error::LockTimeout(key.to_string()))
            }
        }
    }

    /// Whether somebody holds or waits for `key`
    pub fn is_locked(&self, key: &str) -> bool {
        self.map().contains_key(key)
    }

    fn cleanup(&self, key: &str) {
        let mut map = self.map();
        let unused = map
            .get(key)
            .map(|mutex| Arc::strong_count(mutex) == 1)
            .unwrap_or(false);

        if unused {
            map.remove(key);
        }
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.cleanup(&self.key);
        log::trace!("Released lock `{}`", self.key);
    }
}

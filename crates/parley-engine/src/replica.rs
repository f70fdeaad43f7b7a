//! Shared handle to the local replica store.
//!
//! The store serializes all mutations behind one owned mutex: concurrent
//! upserts from the sync engine and the outbox worker on the same message id
//! take turns instead of racing. Reads go through the same lock; every
//! operation is a short synchronous SQLite call, so holders never block on
//! the network.

use std::sync::{Arc, Mutex};

use parley_store::{Database, StoreError};

use crate::error::{EngineError, Result};

/// Cloneable, thread-safe handle to the [`Database`].
#[derive(Clone)]
pub struct Replica {
    inner: Arc<Mutex<Database>>,
}

impl Replica {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    /// Run a closure against the locked store.
    ///
    /// Never hold the guard across an await point; do the store work, release,
    /// then talk to the network.
    pub fn with<T>(&self, f: impl FnOnce(&Database) -> std::result::Result<T, StoreError>) -> Result<T> {
        let guard = self.inner.lock().map_err(|_| EngineError::LockPoisoned)?;
        f(&guard).map_err(EngineError::from)
    }
}

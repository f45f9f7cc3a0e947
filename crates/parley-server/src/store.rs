//! Shared handle to the SQLite store.
//!
//! `rusqlite::Connection` is `Send` but not `Sync`, so every manager goes
//! through one mutex. Closures passed to [`StoreHandle::with`] run
//! synchronously and must not await.

use std::sync::{Arc, Mutex};

use parley_store::Database;

#[derive(Clone)]
pub struct StoreHandle {
    db: Arc<Mutex<Database>>,
}

impl StoreHandle {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn with<T>(&self, f: impl FnOnce(&Database) -> T) -> T {
        // A panic mid-closure leaves no open transaction behind (it rolls
        // back on drop), so a poisoned lock is safe to reuse.
        let db = self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&db)
    }

    /// Run `f` in a single transaction.
    pub fn tx<T>(
        &self,
        f: impl FnOnce(&Database) -> parley_store::Result<T>,
    ) -> parley_store::Result<T> {
        self.with(|db| db.in_transaction(f))
    }
}

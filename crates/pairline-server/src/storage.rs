//! The one SQLite handle shared by the queue actor and the safety ledger.

use std::sync::{Arc, Mutex, MutexGuard};

use pairline_store::{Database, Location, StoreError};

pub type SharedDatabase = Arc<Mutex<Database>>;

pub fn open(location: &Location) -> Result<SharedDatabase, StoreError> {
    Ok(Arc::new(Mutex::new(Database::open(location)?)))
}

/// A panic while holding the lock leaves the store unusable; callers treat
/// that like any other store failure.
pub fn lock(db: &SharedDatabase) -> Result<MutexGuard<'_, Database>, StoreError> {
    db.lock()
        .map_err(|_| StoreError::Unavailable("database lock poisoned".into()))
}

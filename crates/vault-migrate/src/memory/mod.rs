//! In-memory node stores.
//!
//! Used by the test suites and for rehearsing a migration plan without
//! database connections. Both stores implement the same traits as the
//! MSSQL/PostgreSQL adapters.

mod destination;
mod source;

pub use destination::MemoryDestination;
pub use source::MemorySource;

use std::sync::{Mutex, MutexGuard};

use crate::error::{MigrateError, Result};

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| MigrateError::Store("memory store lock poisoned".into()))
}

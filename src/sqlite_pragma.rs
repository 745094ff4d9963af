//! Shared SQLite connection tuning
//!
//! Every connection opened by the sync loop, the scoring job or a reader goes
//! through [`apply_optimized_pragmas`] so they agree on journal mode and locking.

use rusqlite::Connection;
use std::time::Duration;

/// Pages between automatic WAL checkpoints
pub const WAL_AUTOCHECKPOINT_PAGES: i64 = 1000;

/// How long a writer waits on a locked database before giving up
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply WAL mode, NORMAL sync, in-memory temp store, mmap, page cache and
/// autocheckpoint settings.
///
/// WAL lets the scoring job read a consistent snapshot of `edges` while the
/// sync loop keeps writing, and lets score readers keep seeing the previous
/// generation until a publish commits.
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", 268_435_456i64)?;
    conn.pragma_update(None, "cache_size", -64_000i64)?;
    conn.pragma_update(None, "wal_autocheckpoint", WAL_AUTOCHECKPOINT_PAGES)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

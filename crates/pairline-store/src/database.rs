//! The SQLite handle behind the safety ledger and the match queue.
//!
//! Opening a [`Database`] always brings the schema up to date first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Report transactions from concurrent connections queue up for this long
/// before failing with `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the server keeps its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// `pairline.db` in the platform data directory.
    DataDir,
    File(PathBuf),
    /// Private to this process and gone on restart.
    Memory,
}

impl Location {
    /// `""` means the data directory and `":memory:"` an in-memory database.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" => Location::DataDir,
            ":memory:" => Location::Memory,
            other => Location::File(PathBuf::from(other)),
        }
    }
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(location: &Location) -> Result<Self> {
        match location {
            Location::DataDir => Self::open_at(&default_path()?),
            Location::File(path) => Self::open_at(path),
            Location::Memory => Self::open_in_memory(),
        }
    }

    /// Open or create a database file, creating missing parent directories.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "opening database");
        let conn = Connection::open(path)?;
        // Readers never block the report writer; NORMAL is durable under WAL.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::prepare(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn schema_version(&self) -> Result<u32> {
        migrations::schema_version(&self.conn)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// File backing this database; `None` when in memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}

/// `pairline.db` in the platform data directory:
/// - Linux:   `~/.local/share/pairline/`
/// - macOS:   `~/Library/Application Support/net.pairline.pairline/`
/// - Windows: `{FOLDERID_RoamingAppData}\pairline\pairline\data\`
pub fn default_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("net", "pairline", "pairline").ok_or(StoreError::NoDataDir)?;
    Ok(dirs.data_dir().join("pairline.db"))
}

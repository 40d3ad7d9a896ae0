//! On-disk persistence for the database.
//!
//! Two files under the data directory:
//!
//! - `address.db`: an 8-byte little-endian block height header followed
//!   by 81-byte address records. Appended on every accepted registration;
//!   the header is rewritten whenever the height advances.
//! - `routing.db`: 24-byte routing records, rewritten wholesale on
//!   graceful shutdown. The snapshot is written oldest-first so that
//!   replaying it through `put_routing_entry` restores the newest-first
//!   history order.
//!
//! Missing files are empty state at height 0. A file that fails to read
//! or parse is fatal at startup, and a failed write is fatal at runtime:
//! the daemon cannot continue with a diverging on-disk view.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::info;

use crate::wire::{
    self, ADDRESS_RECORD_SIZE, BLOCK_HEIGHT_SIZE, ROUTING_RECORD_SIZE, WireError,
};

use super::{Db, DbError, RegistrationRecord};

/// Address log file name.
pub const ADDRESS_DB_FILE: &str = "address.db";

/// Routing snapshot file name.
pub const ROUTING_DB_FILE: &str = "routing.db";

impl Db {
    /// Open the database under `data_dir`, replaying the address log and
    /// the routing snapshot.
    pub fn open(data_dir: PathBuf) -> Result<Self, DbError> {
        fs::create_dir_all(&data_dir).map_err(|source| DbError::Io {
            path: data_dir.clone(),
            source,
        })?;
        let mut db = Db::new(data_dir);
        db.load_address_log()?;
        db.load_routing_snapshot()?;
        info!(
            height = db.height,
            addresses = db.registered_count(),
            routes = db.routing_entries().len(),
            "database restored"
        );
        Ok(db)
    }

    fn address_db_path(&self) -> PathBuf {
        self.data_dir.join(ADDRESS_DB_FILE)
    }

    fn routing_db_path(&self) -> PathBuf {
        self.data_dir.join(ROUTING_DB_FILE)
    }

    fn load_address_log(&mut self) -> Result<(), DbError> {
        let path = self.address_db_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(DbError::Io { path, source }),
        };
        if bytes.is_empty() {
            // Kickstart a fresh log with the genesis header.
            fs::write(&path, wire::encode_block_height(0)).map_err(|source| DbError::Io {
                path,
                source,
            })?;
            return Ok(());
        }

        if bytes.len() < BLOCK_HEIGHT_SIZE
            || (bytes.len() - BLOCK_HEIGHT_SIZE) % ADDRESS_RECORD_SIZE != 0
        {
            return Err(DbError::Corrupt(WireError::ShortRecord {
                kind: "address log",
                expected: BLOCK_HEIGHT_SIZE,
                got: bytes.len(),
            }));
        }

        self.height = wire::decode_block_height(&bytes[..BLOCK_HEIGHT_SIZE])?;
        for chunk in bytes[BLOCK_HEIGHT_SIZE..].chunks_exact(ADDRESS_RECORD_SIZE) {
            let record = wire::decode_address_record(chunk)?;
            self.insert_record(record)?;
        }
        Ok(())
    }

    fn load_routing_snapshot(&mut self) -> Result<(), DbError> {
        let path = self.routing_db_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(DbError::Io { path, source }),
        };
        if bytes.len() % ROUTING_RECORD_SIZE != 0 {
            return Err(DbError::Corrupt(WireError::ShortRecord {
                kind: "routing snapshot",
                expected: ROUTING_RECORD_SIZE,
                got: bytes.len(),
            }));
        }
        for chunk in bytes.chunks_exact(ROUTING_RECORD_SIZE) {
            let entry = wire::decode_routing_record(chunk)?;
            self.put_routing_entry(entry)?;
        }
        Ok(())
    }

    /// Append one accepted registration to the address log.
    pub(super) fn append_record_to_log(&self, record: &RegistrationRecord) -> Result<(), DbError> {
        let path = self.address_db_path();
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|source| DbError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(&wire::encode_address_record(record))
            .map_err(|source| DbError::Io { path, source })
    }

    /// Advance the synced block height, rewriting the log header.
    pub fn advance_height(&mut self, height: u64) -> Result<(), DbError> {
        self.height = height;
        let path = self.address_db_path();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|source| DbError::Io {
                path: path.clone(),
                source,
            })?;
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&wire::encode_block_height(height)))
            .map_err(|source| DbError::Io { path, source })?;
        info!(height, "block height advanced");
        Ok(())
    }

    /// Rewrite the routing snapshot wholesale.
    pub fn save_routing_snapshot(&self) -> Result<(), DbError> {
        let mut entries = self.routing_entries();
        entries.reverse();
        let mut buf = Vec::with_capacity(entries.len() * ROUTING_RECORD_SIZE);
        for entry in &entries {
            buf.extend_from_slice(&wire::encode_routing_record(entry));
        }
        let path = self.routing_db_path();
        fs::write(&path, buf).map_err(|source| DbError::Io { path, source })?;
        info!(routes = entries.len(), "routing snapshot written");
        Ok(())
    }
}

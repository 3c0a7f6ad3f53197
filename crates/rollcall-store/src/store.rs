//! Encrypted descriptor storage.
//!
//! Each descriptor row holds a sealed blob: a random 12-byte nonce followed
//! by the AES-256-GCM ciphertext of the 128 little-endian `f32` values. The
//! key lives beside the database and never enters SQLite.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use rollcall_core::repository::{DescriptorSample, DescriptorStore, RepositoryError};
use rollcall_core::{Descriptor, IdentityId, DESCRIPTOR_DIM};

const DESCRIPTOR_BYTE_LEN: usize = DESCRIPTOR_DIM * 4;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const KEY_FILE: &str = ".key";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("failed to seal descriptor")]
    EncryptionFailed,
    #[error("descriptor blob failed authentication (wrong key or corrupted row)")]
    DecryptionFailed,
    #[error("descriptor payload is {0} bytes, expected {DESCRIPTOR_BYTE_LEN}")]
    InvalidBlob(usize),
    #[error("descriptor has {0} values, expected {DESCRIPTOR_DIM}")]
    InvalidDescriptorDim(usize),
    #[error("descriptor holds a non-finite value")]
    InvalidDescriptorValue,
    #[error("invalid stored record: {0}")]
    InvalidRecord(String),
    #[error("descriptor key {path} holds {len} bytes, expected {KEY_LEN}")]
    KeyLength { path: PathBuf, len: usize },
    #[error("descriptor key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

impl From<StoreError> for RepositoryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Db(_) | StoreError::KeyIo(_) | StoreError::KeyLength { .. } => {
                RepositoryError::Unavailable(e.to_string())
            }
            StoreError::InvalidDescriptorDim(actual) => RepositoryError::InvalidDescriptor {
                expected: DESCRIPTOR_DIM,
                actual,
            },
            other => RepositoryError::Backend(other.to_string()),
        }
    }
}

/// Per-installation key sealing descriptor blobs.
struct DescriptorKey([u8; KEY_LEN]);

impl DescriptorKey {
    /// In-memory stores never outlive the process, so their key is fixed.
    fn ephemeral() -> Self {
        Self([0u8; KEY_LEN])
    }

    /// Read the key beside the database, creating it on first open.
    fn load_or_create(path: &Path) -> Result<Self, StoreError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let len = bytes.len();
                let key = <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
                    StoreError::KeyLength {
                        path: path.to_path_buf(),
                        len,
                    }
                })?;
                tracing::debug!(path = %path.display(), "descriptor key loaded");
                Ok(Self(key))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut key = [0u8; KEY_LEN];
                OsRng.fill_bytes(&mut key);
                write_owner_only(path, &key)?;
                tracing::info!(path = %path.display(), "descriptor key created");
                Ok(Self(key))
            }
            Err(e) => Err(StoreError::KeyIo(e)),
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

/// `create_new` so that a racing opener can never replace a key in use.
fn write_owner_only(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(StoreError::KeyIo)?;
    file.write_all(bytes).map_err(StoreError::KeyIo)
}

fn key_path(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .map_or_else(|| PathBuf::from(KEY_FILE), |dir| dir.join(KEY_FILE))
}

/// SQLite-backed descriptor and attendance storage.
///
/// Descriptors are sealed with the installation key (`{db_dir}/.key`,
/// mode 0600) before they reach the `samples` table.
pub struct SqliteStore {
    pub(crate) conn: Connection,
    cipher: Aes256Gcm,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::KeyIo)?;
        }
        let key = DescriptorKey::load_or_create(&key_path(db_path))?;
        let conn = Connection::open(db_path)?;
        tracing::info!(path = %db_path.display(), "descriptor store opened");
        Self::with_connection(conn, key)
    }

    /// In-memory database, for tests and tooling.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, DescriptorKey::ephemeral())
    }

    fn with_connection(conn: Connection, key: DescriptorKey) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS samples (
                 id TEXT PRIMARY KEY,
                 identity TEXT NOT NULL,
                 descriptor BLOB NOT NULL,
                 confidence REAL NOT NULL,
                 captured_at TEXT NOT NULL,
                 source_image_ref TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_samples_identity ON samples(identity);
             CREATE TABLE IF NOT EXISTS decisions (
                 id TEXT PRIMARY KEY,
                 identity TEXT,
                 status TEXT NOT NULL,
                 rejection TEXT,
                 confidence REAL NOT NULL,
                 track_id INTEGER,
                 decided_at TEXT NOT NULL,
                 record TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_decisions_identity ON decisions(identity);",
        )?;
        Ok(Self {
            conn,
            cipher: key.cipher(),
        })
    }

    pub fn count_samples(&self) -> Result<u64, StoreError> {
        let count: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))?;
        Ok(count)
    }

    fn query_samples(&self, identity: Option<&IdentityId>) -> Result<Vec<DescriptorSample>, StoreError> {
        type Row = (String, String, Vec<u8>, f64, String, Option<String>);
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Row> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        };

        const COLUMNS: &str = "SELECT id, identity, descriptor, confidence, captured_at, source_image_ref FROM samples";
        let rows: Vec<Row> = match identity {
            Some(id) => {
                let mut stmt = self.conn.prepare(&format!("{COLUMNS} WHERE identity = ?1"))?;
                let rows = stmt.query_map([id.as_str()], map_row)?;
                let collected = rows.collect::<Result<Vec<Row>, _>>()?;
                collected
            }
            None => {
                let mut stmt = self.conn.prepare(COLUMNS)?;
                let rows = stmt.query_map([], map_row)?;
                let collected = rows.collect::<Result<Vec<Row>, _>>()?;
                collected
            }
        };

        let mut samples = Vec::with_capacity(rows.len());
        for (id, identity, blob, confidence, captured_at, source_image_ref) in rows {
            let values = self.open_descriptor(&blob)?;
            let descriptor =
                Descriptor::new(values).map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
            samples.push(DescriptorSample {
                id: Uuid::parse_str(&id).map_err(|e| StoreError::InvalidRecord(e.to_string()))?,
                identity_id: IdentityId::new(identity),
                descriptor,
                confidence: confidence as f32,
                captured_at: parse_timestamp(&captured_at)?,
                source_image_ref,
            });
        }
        Ok(samples)
    }

    fn seal_descriptor(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        check_descriptor(values)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), descriptor_bytes(values).as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;
        Ok([nonce.as_slice(), sealed.as_slice()].concat())
    }

    fn open_descriptor(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let payload = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| StoreError::DecryptionFailed)?;
        descriptor_from_bytes(&payload)
    }
}

impl DescriptorStore for SqliteStore {
    fn samples_for(&self, identity: &IdentityId) -> Result<Vec<DescriptorSample>, RepositoryError> {
        Ok(self.query_samples(Some(identity))?)
    }

    fn all_samples(&self) -> Result<Vec<DescriptorSample>, RepositoryError> {
        Ok(self.query_samples(None)?)
    }

    fn insert(&mut self, sample: &DescriptorSample) -> Result<(), RepositoryError> {
        let blob = self.seal_descriptor(sample.descriptor.values())?;
        self.conn
            .execute(
                "INSERT INTO samples (id, identity, descriptor, confidence, captured_at, source_image_ref)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    sample.id.to_string(),
                    sample.identity_id.as_str(),
                    blob,
                    sample.confidence as f64,
                    sample.captured_at.to_rfc3339(),
                    sample.source_image_ref,
                ],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    fn delete(&mut self, ids: &[Uuid]) -> Result<usize, RepositoryError> {
        let tx = self.conn.transaction().map_err(StoreError::from)?;
        let mut removed = 0;
        {
            let mut stmt = tx
                .prepare("DELETE FROM samples WHERE id = ?1")
                .map_err(StoreError::from)?;
            for id in ids {
                removed += stmt.execute([id.to_string()]).map_err(StoreError::from)?;
            }
        }
        tx.commit().map_err(StoreError::from)?;
        Ok(removed)
    }

    fn delete_identity(&mut self, identity: &IdentityId) -> Result<usize, RepositoryError> {
        let removed = self
            .conn
            .execute("DELETE FROM samples WHERE identity = ?1", [identity.as_str()])
            .map_err(StoreError::from)?;
        Ok(removed)
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRecord(format!("timestamp {s:?}: {e}")))
}

fn descriptor_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`descriptor_bytes`]; rejects anything but 128 finite values.
fn descriptor_from_bytes(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != DESCRIPTOR_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    check_descriptor(&values)?;
    Ok(values)
}

fn check_descriptor(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != DESCRIPTOR_DIM {
        return Err(StoreError::InvalidDescriptorDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidDescriptorValue);
    }
    Ok(())
}

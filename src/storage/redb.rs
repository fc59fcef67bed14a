//! ReDB storage implementation for the APK signer.
//!
//! Provides persistent storage for:
//! - Application keystores (one immutable entry per application id)
//! - Package objects (unsigned uploads and signed outputs), keyed `{bucket}/{path}`
//!
//! ReDB serializes write transactions, so the check-then-insert in
//! [`KeyStorage::put_app_key`] is an atomic create-if-absent.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
};

use super::{KeyStorage, PackageStorage, StorageError, StorageResult};
use crate::config::Buckets;

const APP_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("app_keys");
const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

/// Storage wrapper for ReDB.
///
/// Thread-safe via internal Arc. Clone is cheap.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
    buckets: Buckets,
    signed_url_base: String,
}

impl RedbStorage {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open(path: &Path, buckets: Buckets, signed_url_base: &str) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Backend(e.to_string()))?;
        }

        let db = Database::create(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        let storage = Self::init(db, buckets, signed_url_base)?;

        tracing::info!(path = %path.display(), "Opened storage database");
        Ok(storage)
    }

    /// Open an in-memory database for testing.
    #[cfg(test)]
    pub fn open_memory() -> StorageResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Self::init(db, Buckets::default(), "http://localhost/objects")
    }

    fn init(db: Database, buckets: Buckets, signed_url_base: &str) -> StorageResult<Self> {
        let write_txn = db.begin_write()?;
        {
            // Just opening the tables creates them if they don't exist
            let _ = write_txn.open_table(APP_KEYS)?;
            let _ = write_txn.open_table(OBJECTS)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            buckets,
            signed_url_base: signed_url_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn buckets(&self) -> &Buckets {
        &self.buckets
    }

    fn object_key(bucket: &str, path: &str) -> String {
        format!("{bucket}/{}", path.trim_start_matches('/'))
    }

    /// Store an object, replacing any previous content.
    pub fn put_object(&self, bucket: &str, path: &str, bytes: &[u8]) -> StorageResult<()> {
        let key = Self::object_key(bucket, path);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OBJECTS)?;
            table.insert(key.as_str(), bytes)?;
        }
        write_txn.commit()?;
        tracing::debug!(key = %key, size = bytes.len(), "Stored object");
        Ok(())
    }

    /// Read an object.
    pub fn get_object(&self, bucket: &str, path: &str) -> StorageResult<Vec<u8>> {
        let key = Self::object_key(bucket, path);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS)?;

        table
            .get(key.as_str())?
            .map(|v| v.value().to_vec())
            .ok_or_else(|| StorageError::NoSuchObject {
                bucket: bucket.to_string(),
                path: path.to_string(),
            })
    }

    /// Number of stored keystores (for admin and tests).
    pub fn app_key_count(&self) -> StorageResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(APP_KEYS)?;
        Ok(table.len()?)
    }
}

impl KeyStorage for RedbStorage {
    fn get_app_key(&self, apk_id: &str) -> StorageResult<Vec<u8>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(APP_KEYS)?;

        table
            .get(apk_id)?
            .map(|v| v.value().to_vec())
            .ok_or_else(|| StorageError::NoSuchKey(apk_id.to_string()))
    }

    fn put_app_key(&self, key_material: &[u8], apk_id: &str) -> StorageResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(APP_KEYS)?;
            if table.get(apk_id)?.is_some() {
                return Err(StorageError::AppKeyAlreadyExists(apk_id.to_string()));
            }
            table.insert(apk_id, key_material)?;
        }
        write_txn.commit()?;
        tracing::debug!(apk_id, bucket = %self.buckets.keys, "Stored keystore");
        Ok(())
    }
}

impl PackageStorage for RedbStorage {
    fn get_package(&self, path: &str) -> StorageResult<Vec<u8>> {
        self.get_object(&self.buckets.unsigned, path)
    }

    fn put_signed_package(&self, package: &mut dyn Read, path: &str) -> StorageResult<()> {
        let mut bytes = Vec::new();
        package
            .read_to_end(&mut bytes)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.put_object(&self.buckets.signed, path, &bytes)
    }

    fn bucket_key_exists(&self, bucket: &str, path: &str) -> StorageResult<bool> {
        let key = Self::object_key(bucket, path);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS)?;
        Ok(table.get(key.as_str())?.is_some())
    }

    fn signed_package_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.signed_url_base,
            self.buckets.signed,
            path.trim_start_matches('/')
        )
    }
}

// Conversion from ReDB error types

impl From<redb::Error> for StorageError {
    fn from(err: redb::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        Self::Backend(err.to_string())
    }
}

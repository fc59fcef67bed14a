//! Storage layer for the APK signer.
//!
//! The signing core only sees two narrow capabilities:
//! - [`KeyStorage`]: one immutable keystore per application id, created if absent
//! - [`PackageStorage`]: unsigned inputs and signed outputs
//!
//! [`RedbStorage`] implements both over an embedded ReDB database.

pub mod redb;

use std::io::Read;

use thiserror::Error;

pub use self::redb::RedbStorage;

/// Storage failures. `NoSuchKey` and `AppKeyAlreadyExists` are expected signals.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("No keystore stored for {0}")]
    NoSuchKey(String),

    #[error("A keystore already exists for {0}")]
    AppKeyAlreadyExists(String),

    #[error("No such object: {bucket}/{path}")]
    NoSuchObject { bucket: String, path: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable keystore slots, one per application id.
pub trait KeyStorage: Send + Sync {
    /// Fetch the stored keystore; [`StorageError::NoSuchKey`] when absent.
    fn get_app_key(&self, apk_id: &str) -> StorageResult<Vec<u8>>;

    /// Store a keystore unless one exists; [`StorageError::AppKeyAlreadyExists`]
    /// when another writer got there first. Never overwrites.
    fn put_app_key(&self, key_material: &[u8], apk_id: &str) -> StorageResult<()>;
}

/// Package objects addressed by bucket and path.
pub trait PackageStorage: Send + Sync {
    /// Read an unsigned package from the unsigned bucket.
    fn get_package(&self, path: &str) -> StorageResult<Vec<u8>>;

    /// Write a signed package into the signed bucket.
    fn put_signed_package(&self, package: &mut dyn Read, path: &str) -> StorageResult<()>;

    fn bucket_key_exists(&self, bucket: &str, path: &str) -> StorageResult<bool>;

    /// Public URL of a signed package.
    fn signed_package_url(&self, path: &str) -> String;
}

//! Signing identity resolution.
//!
//! Decides, per signing operation, whether an application's keystore is
//! fetched, generated and persisted, or generated and thrown away:
//!
//! - **Developer mode**: fetch the stored keystore; if there is none, generate
//!   one and store it with create-if-absent. A writer that loses that race drops
//!   its own keystore and re-fetches the winner's, so concurrent first signings
//!   converge on one identity.
//! - **Reviewer mode**: always generate a disposable keystore whose
//!   distinguished name carries the reviewer marker. Storage is never touched.
//!
//! Every keystore lives in its own private temporary directory owned by the
//! returned [`SigningIdentity`]; dropping the identity removes it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::config::{SigningConfig, UserMode};
use crate::error::{SigningError, SigningFailure, SigningResult};
use crate::storage::{KeyStorage, StorageError};
use crate::tools::{KeystoreRequest, Toolchain};

const KEYSTORE_FILE: &str = "identity.keystore";

/// How an identity came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOrigin {
    /// Downloaded from storage.
    Fetched,
    /// Generated here and accepted by storage.
    Generated,
    /// Generated here, never persisted (reviewer mode).
    Disposable,
}

/// A keystore on local disk, scoped to one signing operation.
#[derive(Debug)]
pub struct SigningIdentity {
    apk_id: String,
    distinguished_name: String,
    alias: String,
    origin: IdentityOrigin,
    fingerprint: String,
    keystore_path: PathBuf,
    // Removed on drop, taking the keystore with it.
    _scratch: TempDir,
}

impl SigningIdentity {
    pub fn apk_id(&self) -> &str {
        &self.apk_id
    }

    pub fn distinguished_name(&self) -> &str {
        &self.distinguished_name
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn origin(&self) -> IdentityOrigin {
        self.origin
    }

    /// Hex SHA-256 of the keystore bytes.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn keystore_path(&self) -> &Path {
        &self.keystore_path
    }

    pub fn key_material(&self) -> std::io::Result<Vec<u8>> {
        fs::read(&self.keystore_path)
    }
}

/// Hex SHA-256 of keystore bytes.
pub fn fingerprint(key_material: &[u8]) -> String {
    hex::encode(Sha256::digest(key_material))
}

/// Escape a value for use inside an RFC 4514 distinguished name.
fn escape_dn_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        let leading = i == 0 && (c == ' ' || c == '#');
        if leading || matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    if escaped.ends_with(' ') {
        escaped.pop();
        escaped.push_str("\\ ");
    }
    escaped
}

/// Distinguished name for `apk_id` in `mode`.
///
/// Developer identities read `CN=Generated key for ID <id>, <suffix>`;
/// reviewer identities read `CN=<marker> <id>, <suffix>`.
pub fn distinguished_name(config: &SigningConfig, apk_id: &str, mode: UserMode) -> String {
    let common_name = escape_dn_value(&match mode {
        UserMode::Developer => format!("Generated key for ID {apk_id}"),
        UserMode::Reviewer => format!("{} {apk_id}", config.reviewer_marker),
    });
    if config.dn_suffix.is_empty() {
        format!("CN={common_name}")
    } else {
        format!("CN={common_name}, {}", config.dn_suffix)
    }
}

/// Resolves one usable [`SigningIdentity`] per signing operation.
pub struct KeystoreManager<T> {
    config: Arc<SigningConfig>,
    storage: Arc<dyn KeyStorage>,
    toolchain: Arc<T>,
}

impl<T: Toolchain> KeystoreManager<T> {
    pub fn new(config: Arc<SigningConfig>, storage: Arc<dyn KeyStorage>, toolchain: Arc<T>) -> Self {
        Self {
            config,
            storage,
            toolchain,
        }
    }

    /// Resolve the identity `apk_id` signs with under `mode`.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_identity(
        &self,
        apk_id: &str,
        mode: UserMode,
    ) -> SigningResult<SigningIdentity> {
        match mode {
            UserMode::Reviewer => {
                let identity = self
                    .generate(apk_id, UserMode::Reviewer, IdentityOrigin::Disposable)
                    .await?;
                tracing::info!(fingerprint = %identity.fingerprint(), "Generated disposable reviewer keystore");
                Ok(identity)
            }
            UserMode::Developer => self.resolve_developer(apk_id).await,
        }
    }

    async fn resolve_developer(&self, apk_id: &str) -> SigningResult<SigningIdentity> {
        if let Some(identity) = self.fetch(apk_id)? {
            tracing::info!(fingerprint = %identity.fingerprint(), "Using stored keystore");
            return Ok(identity);
        }

        let identity = self
            .generate(apk_id, UserMode::Developer, IdentityOrigin::Generated)
            .await?;
        let key_material = identity.key_material().map_err(|e| SigningError::new(apk_id, e))?;

        match self.storage.put_app_key(&key_material, apk_id) {
            Ok(()) => {
                tracing::info!(fingerprint = %identity.fingerprint(), "Generated and stored new keystore");
                Ok(identity)
            }
            Err(StorageError::AppKeyAlreadyExists(_)) => {
                tracing::warn!(
                    discarded = %identity.fingerprint(),
                    "Keystore created concurrently; discarding ours and using the stored one"
                );
                drop(identity);
                // One retry only: the winner's keystore must be there now.
                self.fetch(apk_id)?
                    .ok_or_else(|| SigningError::new(apk_id, SigningFailure::RepeatedCollision))
            }
            Err(e) => Err(SigningError::new(apk_id, e)),
        }
    }

    /// Download the stored keystore, or `None` when storage has no entry.
    fn fetch(&self, apk_id: &str) -> SigningResult<Option<SigningIdentity>> {
        let key_material = match self.storage.get_app_key(apk_id) {
            Ok(bytes) => bytes,
            Err(StorageError::NoSuchKey(_)) => return Ok(None),
            Err(e) => return Err(SigningError::new(apk_id, e)),
        };

        let scratch = self.scratch().map_err(|e| SigningError::new(apk_id, e))?;
        let keystore_path = scratch.path().join(KEYSTORE_FILE);
        fs::write(&keystore_path, &key_material).map_err(|e| SigningError::new(apk_id, e))?;

        Ok(Some(SigningIdentity {
            apk_id: apk_id.to_string(),
            distinguished_name: distinguished_name(&self.config, apk_id, UserMode::Developer),
            alias: self.config.key_alias.clone(),
            origin: IdentityOrigin::Fetched,
            fingerprint: fingerprint(&key_material),
            keystore_path,
            _scratch: scratch,
        }))
    }

    /// Generate a keystore with the identity-generation tool.
    async fn generate(
        &self,
        apk_id: &str,
        mode: UserMode,
        origin: IdentityOrigin,
    ) -> SigningResult<SigningIdentity> {
        let scratch = self.scratch().map_err(|e| SigningError::new(apk_id, e))?;
        let keystore_path = scratch.path().join(KEYSTORE_FILE);
        let dname = distinguished_name(&self.config, apk_id, mode);

        let request = KeystoreRequest {
            keystore: &keystore_path,
            alias: &self.config.key_alias,
            distinguished_name: &dname,
            params: &self.config.key_params,
            store_passwd: &self.config.store_passwd,
            key_passwd: &self.config.key_passwd,
        };
        self.toolchain
            .gen_keystore(&request)
            .await
            .map_err(|e| SigningError::new(apk_id, e))?;

        let key_material = fs::read(&keystore_path).map_err(|e| SigningError::new(apk_id, e))?;

        Ok(SigningIdentity {
            apk_id: apk_id.to_string(),
            distinguished_name: dname,
            alias: self.config.key_alias.clone(),
            origin,
            fingerprint: fingerprint(&key_material),
            keystore_path,
            _scratch: scratch,
        })
    }

    fn scratch(&self) -> std::io::Result<TempDir> {
        fs::create_dir_all(&self.config.temp_dir)?;
        tempfile::Builder::new()
            .prefix("keystore_")
            .tempdir_in(&self.config.temp_dir)
    }
}

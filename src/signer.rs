//! Package signing orchestration.
//!
//! [`SigningOrchestrator::sign`] stages the unsigned package locally, resolves
//! a signing identity through the [`KeystoreManager`], runs the package signer
//! and hands back the signed file.
//!
//! All local state for one call lives in a private scratch directory under the
//! configured temp root. On failure everything is removed before the error is
//! returned; on success only the signed file is left, owned by the returned
//! [`SignedPackage`] and removed when it is dropped.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::config::{SigningConfig, UserMode};
use crate::error::{SigningError, SigningResult};
use crate::keystore::{IdentityOrigin, KeystoreManager};
use crate::storage::KeyStorage;
use crate::tools::{PackageSignRequest, Toolchain, ToolResult, Verification};

const UNSIGNED_FILE: &str = "unsigned.apk";
const SIGNED_FILE: &str = "signed.apk";

/// Where the unsigned package comes from.
pub enum PackageSource<'a> {
    /// Already on local disk; read in place and left untouched.
    LocalFile(&'a Path),
    /// In memory.
    Bytes(&'a [u8]),
    /// Any other stream; copied to local disk first.
    Reader(&'a mut (dyn Read + Send)),
}

/// A signed package on local disk, positioned at the start for reading.
///
/// Dropping it removes the file.
#[derive(Debug)]
pub struct SignedPackage {
    file: File,
    path: PathBuf,
    apk_id: String,
    distinguished_name: String,
    fingerprint: String,
    origin: IdentityOrigin,
    _scratch: TempDir,
}

impl SignedPackage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn apk_id(&self) -> &str {
        &self.apk_id
    }

    /// Distinguished name of the identity that signed this package.
    pub fn distinguished_name(&self) -> &str {
        &self.distinguished_name
    }

    /// Fingerprint of the keystore that signed this package.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn identity_origin(&self) -> IdentityOrigin {
        self.origin
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Rewind and read the whole package.
    pub fn to_bytes(&mut self) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        self.file.read_to_end(&mut bytes)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(bytes)
    }
}

impl Read for SignedPackage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for SignedPackage {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

/// Signs packages with identities resolved per application id.
pub struct SigningOrchestrator<T> {
    config: Arc<SigningConfig>,
    keystores: KeystoreManager<T>,
    toolchain: Arc<T>,
}

impl<T: Toolchain> SigningOrchestrator<T> {
    pub fn new(config: SigningConfig, storage: Arc<dyn KeyStorage>, toolchain: T) -> Self {
        let config = Arc::new(config);
        let toolchain = Arc::new(toolchain);
        Self {
            keystores: KeystoreManager::new(config.clone(), storage, toolchain.clone()),
            config,
            toolchain,
        }
    }

    pub fn mode(&self) -> UserMode {
        self.config.mode
    }

    pub fn config(&self) -> &SigningConfig {
        &self.config
    }

    pub fn toolchain(&self) -> &T {
        &self.toolchain
    }

    /// Sign `source` for `apk_id` with the deployment's configured mode.
    #[tracing::instrument(skip(self, source), fields(mode = %self.config.mode))]
    pub async fn sign(&self, apk_id: &str, source: PackageSource<'_>) -> SigningResult<SignedPackage> {
        let scratch = self.scratch().map_err(|e| SigningError::new(apk_id, e))?;
        let staged = stage_package(source, scratch.path()).map_err(|e| SigningError::new(apk_id, e))?;

        let identity = self
            .keystores
            .resolve_identity(apk_id, self.config.mode)
            .await?;

        let signed_path = scratch.path().join(SIGNED_FILE);
        let request = PackageSignRequest {
            unsigned: staged.path(),
            signed: &signed_path,
            keystore: identity.keystore_path(),
            alias: identity.alias(),
            params: &self.config.key_params,
            store_passwd: &self.config.store_passwd,
            key_passwd: &self.config.key_passwd,
        };
        self.toolchain
            .sign_package(&request)
            .await
            .map_err(|e| SigningError::new(apk_id, e))?;

        if let Staged::Copy(path) = &staged {
            fs::remove_file(path).map_err(|e| SigningError::new(apk_id, e))?;
        }
        let file = File::open(&signed_path).map_err(|e| SigningError::new(apk_id, e))?;

        tracing::info!(
            fingerprint = %identity.fingerprint(),
            origin = ?identity.origin(),
            "Signed package"
        );

        Ok(SignedPackage {
            file,
            path: signed_path,
            apk_id: apk_id.to_string(),
            distinguished_name: identity.distinguished_name().to_string(),
            fingerprint: identity.fingerprint().to_string(),
            origin: identity.origin(),
            _scratch: scratch,
        })
    }

    /// Run the independent verification step against a signed package.
    pub async fn verify(&self, package: &Path) -> ToolResult<Verification> {
        self.toolchain.verify_package(package).await
    }

    fn scratch(&self) -> io::Result<TempDir> {
        fs::create_dir_all(&self.config.temp_dir)?;
        tempfile::Builder::new()
            .prefix("apk_signer_")
            .tempdir_in(&self.config.temp_dir)
    }
}

/// Unsigned package as the signer will read it.
enum Staged {
    InPlace(PathBuf),
    Copy(PathBuf),
}

impl Staged {
    fn path(&self) -> &Path {
        match self {
            Self::InPlace(path) | Self::Copy(path) => path,
        }
    }
}

fn stage_package(source: PackageSource<'_>, scratch: &Path) -> io::Result<Staged> {
    let target = scratch.join(UNSIGNED_FILE);
    match source {
        PackageSource::LocalFile(path) => {
            if !path.is_file() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("unsigned package not found: {}", path.display()),
                ));
            }
            Ok(Staged::InPlace(path.to_path_buf()))
        }
        PackageSource::Bytes(bytes) => {
            fs::write(&target, bytes)?;
            Ok(Staged::Copy(target))
        }
        PackageSource::Reader(reader) => {
            let mut file = File::create(&target)?;
            io::copy(reader, &mut file)?;
            file.sync_all()?;
            Ok(Staged::Copy(target))
        }
    }
}

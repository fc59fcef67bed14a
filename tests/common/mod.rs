//! Shared test utilities for APK signer integration tests.
//!
//! [`FakeToolchain`] stands in for `keytool`/`jarsigner`: it writes a unique
//! keystore per generation and "signs" by appending the keystore fingerprint
//! to the package. [`CountingStorage`] wraps real storage with call counters.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use apk_signer::config::{SigningConfig, UserMode};
use apk_signer::keystore::fingerprint;
use apk_signer::storage::{KeyStorage, RedbStorage, StorageResult};
use apk_signer::tools::{
    KeystoreRequest, PackageSignRequest, ToolError, ToolResult, Toolchain, Verification,
};
use apk_signer::SigningOrchestrator;
use tempfile::TempDir;

pub const SIGNATURE_MARKER: &[u8] = b"\n--signed-by:";

#[derive(Default)]
pub struct FakeToolchain {
    pub generated: AtomicUsize,
    pub signed: AtomicUsize,
    pub dnames: Mutex<Vec<String>>,
    /// Delay inside generation so concurrent first requests overlap.
    pub gen_delay: Option<Duration>,
    pub fail_sign: bool,
}

impl FakeToolchain {
    pub fn with_gen_delay(delay: Duration) -> Self {
        Self {
            gen_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn failing_sign() -> Self {
        Self {
            fail_sign: true,
            ..Self::default()
        }
    }
}

impl Toolchain for FakeToolchain {
    async fn gen_keystore(&self, request: &KeystoreRequest<'_>) -> ToolResult<()> {
        let n = self.generated.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.gen_delay {
            tokio::time::sleep(delay).await;
        }
        self.dnames
            .lock()
            .unwrap()
            .push(request.distinguished_name.to_string());
        let material = format!("{}|{}|#{n}", request.alias, request.distinguished_name);
        std::fs::write(request.keystore, material).unwrap();
        Ok(())
    }

    async fn sign_package(&self, request: &PackageSignRequest<'_>) -> ToolResult<()> {
        if self.fail_sign {
            return Err(ToolError::Failed {
                tool: "jarsigner".to_string(),
                code: Some(1),
                output: "jarsigner error: java.lang.RuntimeException: keystore load".to_string(),
            });
        }
        self.signed.fetch_add(1, Ordering::SeqCst);
        let mut bytes = std::fs::read(request.unsigned).unwrap();
        let keystore = std::fs::read(request.keystore).unwrap();
        bytes.extend_from_slice(SIGNATURE_MARKER);
        bytes.extend_from_slice(fingerprint(&keystore).as_bytes());
        std::fs::write(request.signed, bytes).unwrap();
        Ok(())
    }

    async fn verify_package(&self, package: &Path) -> ToolResult<Verification> {
        let bytes = std::fs::read(package).unwrap();
        let verified = bytes
            .windows(SIGNATURE_MARKER.len())
            .any(|w| w == SIGNATURE_MARKER);
        Ok(Verification {
            verified,
            report: if verified { "jar verified." } else { "jar is unsigned." }.to_string(),
        })
    }
}

/// Fingerprint a fake-signed package was signed with.
pub fn signed_with(package: &[u8]) -> Option<String> {
    let at = package
        .windows(SIGNATURE_MARKER.len())
        .rposition(|w| w == SIGNATURE_MARKER)?;
    String::from_utf8(package[at + SIGNATURE_MARKER.len()..].to_vec()).ok()
}

/// Key storage wrapper counting every call.
pub struct CountingStorage {
    pub inner: RedbStorage,
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
}

impl CountingStorage {
    pub fn new(inner: RedbStorage) -> Self {
        Self {
            inner,
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst) + self.puts.load(Ordering::SeqCst)
    }
}

impl KeyStorage for CountingStorage {
    fn get_app_key(&self, apk_id: &str) -> StorageResult<Vec<u8>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_app_key(apk_id)
    }

    fn put_app_key(&self, key_material: &[u8], apk_id: &str) -> StorageResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put_app_key(key_material, apk_id)
    }
}

/// Temp directories and storage for one test.
pub struct TestEnv {
    pub root: TempDir,
    pub storage: RedbStorage,
}

impl TestEnv {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let storage = RedbStorage::open(
            &root.path().join("db").join("apk-signer.redb"),
            apk_signer::config::Buckets::default(),
            "http://localhost:5500/objects",
        )
        .unwrap();
        Self { root, storage }
    }

    /// Directory the signing core creates its temp files in.
    pub fn keys_temp(&self) -> std::path::PathBuf {
        self.root.path().join("keys")
    }

    pub fn signing_config(&self, mode: UserMode) -> SigningConfig {
        SigningConfig::for_tests(mode, self.keys_temp())
    }

    pub fn orchestrator<T: Toolchain>(
        &self,
        mode: UserMode,
        storage: Arc<dyn KeyStorage>,
        toolchain: T,
    ) -> SigningOrchestrator<T> {
        SigningOrchestrator::new(self.signing_config(mode), storage, toolchain)
    }

    /// Number of entries left in the signing temp directory.
    pub fn leftovers(&self) -> usize {
        std::fs::read_dir(self.keys_temp()).map_or(0, Iterator::count)
    }
}

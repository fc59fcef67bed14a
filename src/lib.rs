// Crate-level lint configuration
// Allow noisy pedantic/cargo lints that aren't worth fixing individually
#![allow(clippy::multiple_crate_versions)] // Transitive deps, can't easily fix
#![allow(clippy::missing_errors_doc)] // Would require extensive doc changes
#![allow(clippy::missing_panics_doc)] // Would require extensive doc changes
#![allow(clippy::must_use_candidate)] // Too many false positives for internal APIs
#![allow(clippy::module_name_repetitions)] // Acceptable for clarity (e.g., StorageError in storage mod)
#![allow(clippy::doc_markdown)] // Too strict about backticks in docs
#![allow(clippy::missing_const_for_fn)] // Often debatable, runtime doesn't benefit

//! APK Signer Service
//!
//! Signs Android application packages with per-application keys managed by
//! the service, using the JDK's `keytool` and `jarsigner`.
//!
//! ## Modes
//!
//! - **Developer**: each application id gets one keystore, generated on first
//!   use and reused forever. Concurrent first requests race on a
//!   create-if-absent store; the loser discards its keystore and re-fetches.
//!
//! - **Reviewer**: every request signs with a fresh disposable keystore whose
//!   subject carries a reviewer marker. Nothing is ever persisted.
//!
//! ## Local state
//!
//! Keystores and package copies only ever live in private temp directories
//! that are removed on every exit path. The only file that survives a call is
//! the signed package handed back to the caller, removed when it is dropped.

pub mod config;
pub mod error;
pub mod keystore;
pub mod middleware;
pub mod routes;
pub mod signer;
pub mod storage;
pub mod tools;

#[cfg(feature = "otel")]
pub mod telemetry;

#[cfg(not(feature = "otel"))]
pub mod telemetry {
    //! Stub telemetry module when OpenTelemetry is disabled.

    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    /// Initialize tracing with console output only.
    ///
    /// `LOG_FORMAT=json` switches to JSON lines.
    pub fn init_tracing() {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "apk_signer=info,actix_web=info".into());
        let registry = tracing_subscriber::registry().with(env_filter);

        if super::json_logs() {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        } else {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }

    /// No-op shutdown when OpenTelemetry is disabled.
    pub fn shutdown_tracing() {}
}

fn json_logs() -> bool {
    std::env::var("LOG_FORMAT").is_ok_and(|v| v.trim().eq_ignore_ascii_case("json"))
}

// Re-export commonly used types
pub use config::{Settings, SigningConfig, UserMode};
pub use error::{ServiceError, SigningError};
pub use keystore::{KeystoreManager, SigningIdentity};
pub use signer::{PackageSource, SignedPackage, SigningOrchestrator};
pub use storage::{KeyStorage, PackageStorage, RedbStorage};
pub use tools::{JavaToolchain, Toolchain};

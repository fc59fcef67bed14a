//! Service configuration derived from environment variables.
//!
//! Configuration is loaded once at startup and validated before the service starts.
//! The signing core never reads the environment itself: it receives a
//! [`SigningConfig`] built from these settings.
//!
//! ## Environment Variables
//!
//! ### HTTP
//! - `APK_SIGNER_HOST`: Bind address (default: :: for dual-stack IPv4/IPv6)
//! - `APK_SIGNER_PORT`: HTTP port (default: 5500)
//! - `APK_SIGNER_BODY_LIMIT_MB`: Maximum upload size (default: 16)
//! - `APK_SIGNER_CREDENTIALS`: Comma-separated `id:key` pairs of Hawk credentials
//! - `APK_SIGNER_SKIP_AUTH`: Disable caller authentication (development only)
//! - `APK_SIGNER_AUTH_SKEW_SECS`: Accepted Hawk timestamp skew (default: 60)
//! - `RUST_LOG`: Log level filter
//!
//! ### Signing
//! - `APK_USER_MODE`: "developer" or "reviewer" (default: developer)
//! - `APK_SIGNER_KEYS_TEMP_DIR`: Root for per-operation temporary files
//! - `APK_SIGNER_VALIDITY_DAYS`, `APK_SIGNER_KEY_ALG`, `APK_SIGNER_KEY_SIZE`
//! - `APK_SIGNER_SIGALG`, `APK_SIGNER_DIGESTALG`
//! - `APK_SIGNER_KEY_ALIAS`, `APK_SIGNER_STORE_PASSWD`, `APK_SIGNER_KEY_PASSWD`
//! - `APK_SIGNER_DN_SUFFIX`, `APK_SIGNER_REVIEWER_MARKER`
//!
//! ### Toolchain
//! - `APK_SIGNER_KEYTOOL`, `APK_SIGNER_JARSIGNER`: Tool names or absolute paths
//! - `APK_SIGNER_EXTRA_PATHS`: Extra search directories, colon separated
//! - `APK_SIGNER_TOOL_TIMEOUT_MS`: Upper bound for a single tool run
//!
//! ### Storage
//! - `APK_SIGNER_DB_PATH`: Path to ReDB database file
//! - `APK_SIGNER_UNSIGNED_BUCKET`, `APK_SIGNER_SIGNED_BUCKET`, `APK_SIGNER_KEYS_BUCKET`
//! - `APK_SIGNER_SIGNED_URL_BASE`: Public prefix for signed package URLs

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const DEFAULT_PORT: u16 = 5500;
const DEFAULT_BODY_LIMIT_MB: usize = 16;
const DEFAULT_TOOL_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_AUTH_SKEW_SECS: u64 = 60;
// 25 years, long enough to outlive any installed package.
const DEFAULT_VALIDITY_DAYS: u32 = 9125;
const DEFAULT_KEY_SIZE: u32 = 2048;
const DEFAULT_KEY_ALIAS: &str = "apksigner";
const DEFAULT_DN_SUFFIX: &str =
    "OU=APK Factory, O=Marketplace, L=Mountain View, ST=California, C=US";
const DEFAULT_REVIEWER_MARKER: &str = "REVIEWER:";
// Development passphrase, rejected by `validate` in production.
const DEV_STORE_PASSWD: &str = "apk-signer-dev";

/// Helper to get trimmed env var or empty string.
fn env_trim(name: &str) -> String {
    env::var(name).unwrap_or_default().trim().to_string()
}

/// Helper to get lowercase env var.
fn env_lower(name: &str) -> String {
    env_trim(name).to_lowercase()
}

fn env_or(name: &str, default: &str) -> String {
    let value = env_trim(name);
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn env_opt(name: &str) -> Option<String> {
    let value = env_trim(name);
    if value.is_empty() { None } else { Some(value) }
}

/// Check if a string value is truthy.
fn is_truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes")
}

/// Operating mode of the deployment.
///
/// Developer deployments persist one identity per application and reuse it;
/// reviewer deployments sign with a throwaway identity every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserMode {
    #[default]
    Developer,
    Reviewer,
}

impl FromStr for UserMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "developer" => Ok(Self::Developer),
            "reviewer" => Ok(Self::Reviewer),
            other => Err(format!(
                "Invalid user mode '{other}'. Must be 'developer' or 'reviewer'."
            )),
        }
    }
}

impl fmt::Display for UserMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Developer => write!(f, "developer"),
            Self::Reviewer => write!(f, "reviewer"),
        }
    }
}

/// A passphrase that is wiped on drop and never printed.
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

/// Key generation parameters handed to the identity-generation tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParams {
    pub validity_days: u32,
    pub key_alg: String,
    pub key_size: u32,
    pub sig_alg: String,
    pub digest_alg: String,
}

impl Default for KeyParams {
    fn default() -> Self {
        Self {
            validity_days: DEFAULT_VALIDITY_DAYS,
            key_alg: "RSA".to_string(),
            key_size: DEFAULT_KEY_SIZE,
            sig_alg: "SHA256withRSA".to_string(),
            digest_alg: "SHA-256".to_string(),
        }
    }
}

/// Everything the signing core needs, passed in at construction time.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    pub mode: UserMode,
    /// Root directory for per-operation temporary files.
    pub temp_dir: PathBuf,
    pub key_alias: String,
    pub store_passwd: Secret,
    pub key_passwd: Secret,
    pub key_params: KeyParams,
    /// Trailing DN attributes appended after the common name.
    pub dn_suffix: String,
    pub reviewer_marker: String,
}

impl SigningConfig {
    /// Configuration for tests: development passphrases, default key parameters.
    pub fn for_tests(mode: UserMode, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            temp_dir: temp_dir.into(),
            key_alias: DEFAULT_KEY_ALIAS.to_string(),
            store_passwd: Secret::new(DEV_STORE_PASSWD),
            key_passwd: Secret::new(DEV_STORE_PASSWD),
            key_params: KeyParams::default(),
            dn_suffix: DEFAULT_DN_SUFFIX.to_string(),
            reviewer_marker: DEFAULT_REVIEWER_MARKER.to_string(),
        }
    }
}

/// Where to find the external signing tools and how long they may run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub keytool: String,
    pub jarsigner: String,
    pub extra_paths: Vec<PathBuf>,
    pub timeout: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            keytool: "keytool".to_string(),
            jarsigner: "jarsigner".to_string(),
            extra_paths: Vec::new(),
            timeout: Duration::from_millis(DEFAULT_TOOL_TIMEOUT_MS),
        }
    }
}

/// Durable storage bucket names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buckets {
    pub unsigned: String,
    pub signed: String,
    pub keys: String,
}

impl Default for Buckets {
    fn default() -> Self {
        Self {
            unsigned: "unsigned-apks".to_string(),
            signed: "signed-apks".to_string(),
            keys: "apk-keystores".to_string(),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    port: u16,
    host: IpAddr,
    body_limit_bytes: usize,
    is_production: bool,
    credentials: HashMap<String, Secret>,
    skip_auth: bool,
    auth_skew: Duration,

    db_path: PathBuf,
    buckets: Buckets,
    signed_url_base: String,

    signing: SigningConfig,
    tools: ToolConfig,
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// # Panics
    ///
    /// Panics if `APK_USER_MODE` is set to something other than developer or reviewer.
    #[allow(clippy::too_many_lines)]
    pub fn from_env() -> Self {
        let port = env_trim("APK_SIGNER_PORT")
            .parse::<u16>()
            .unwrap_or(DEFAULT_PORT);

        // Default to IPv6 unspecified (::) for dual-stack support.
        let host = env_trim("APK_SIGNER_HOST")
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED));

        let body_limit_mb = env_trim("APK_SIGNER_BODY_LIMIT_MB")
            .parse::<usize>()
            .unwrap_or(DEFAULT_BODY_LIMIT_MB);
        let body_limit_bytes = body_limit_mb.saturating_mul(1024 * 1024);

        let app_env = env_lower("APP_ENV");
        let rust_env = env_lower("RUST_ENV");
        let is_production = app_env == "production" || rust_env == "production";

        let credentials = parse_credentials(&env_trim("APK_SIGNER_CREDENTIALS"));
        let skip_auth = is_truthy(&env_lower("APK_SIGNER_SKIP_AUTH"));
        let auth_skew = Duration::from_secs(
            env_trim("APK_SIGNER_AUTH_SKEW_SECS")
                .parse::<u64>()
                .unwrap_or(DEFAULT_AUTH_SKEW_SECS),
        );

        let db_path = PathBuf::from(env_or("APK_SIGNER_DB_PATH", "./.data/apk-signer.redb"));

        let defaults = Buckets::default();
        let buckets = Buckets {
            unsigned: env_or("APK_SIGNER_UNSIGNED_BUCKET", &defaults.unsigned),
            signed: env_or("APK_SIGNER_SIGNED_BUCKET", &defaults.signed),
            keys: env_or("APK_SIGNER_KEYS_BUCKET", &defaults.keys),
        };
        let signed_url_base = env_or(
            "APK_SIGNER_SIGNED_URL_BASE",
            &format!("http://localhost:{port}/objects"),
        );

        let mode_str = env_trim("APK_USER_MODE");
        let mode = if mode_str.is_empty() {
            UserMode::default()
        } else {
            mode_str
                .parse()
                .unwrap_or_else(|e| panic!("APK_USER_MODE configuration error: {e}"))
        };

        let temp_dir = env_opt("APK_SIGNER_KEYS_TEMP_DIR").map_or_else(env::temp_dir, PathBuf::from);

        let key_defaults = KeyParams::default();
        let key_params = KeyParams {
            validity_days: env_trim("APK_SIGNER_VALIDITY_DAYS")
                .parse()
                .unwrap_or(key_defaults.validity_days),
            key_alg: env_or("APK_SIGNER_KEY_ALG", &key_defaults.key_alg),
            key_size: env_trim("APK_SIGNER_KEY_SIZE")
                .parse()
                .unwrap_or(key_defaults.key_size),
            sig_alg: env_or("APK_SIGNER_SIGALG", &key_defaults.sig_alg),
            digest_alg: env_or("APK_SIGNER_DIGESTALG", &key_defaults.digest_alg),
        };

        let store_passwd = env_or("APK_SIGNER_STORE_PASSWD", DEV_STORE_PASSWD);
        let key_passwd = env_opt("APK_SIGNER_KEY_PASSWD").unwrap_or_else(|| store_passwd.clone());

        let signing = SigningConfig {
            mode,
            temp_dir,
            key_alias: env_or("APK_SIGNER_KEY_ALIAS", DEFAULT_KEY_ALIAS),
            store_passwd: Secret::new(store_passwd),
            key_passwd: Secret::new(key_passwd),
            key_params,
            dn_suffix: env_or("APK_SIGNER_DN_SUFFIX", DEFAULT_DN_SUFFIX),
            reviewer_marker: env_or("APK_SIGNER_REVIEWER_MARKER", DEFAULT_REVIEWER_MARKER),
        };

        let tool_defaults = ToolConfig::default();
        let tools = ToolConfig {
            keytool: env_or("APK_SIGNER_KEYTOOL", &tool_defaults.keytool),
            jarsigner: env_or("APK_SIGNER_JARSIGNER", &tool_defaults.jarsigner),
            extra_paths: env::split_paths(&env_trim("APK_SIGNER_EXTRA_PATHS"))
                .filter(|p| !p.as_os_str().is_empty())
                .collect(),
            timeout: env_trim("APK_SIGNER_TOOL_TIMEOUT_MS")
                .parse::<u64>()
                .map_or(tool_defaults.timeout, Duration::from_millis),
        };

        Self {
            port,
            host,
            body_limit_bytes,
            is_production,
            credentials,
            skip_auth,
            auth_skew,
            db_path,
            buckets,
            signed_url_base,
            signing,
            tools,
        }
    }

    /// Create settings for tests.
    pub fn for_tests(mode: UserMode, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            port: DEFAULT_PORT,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            body_limit_bytes: DEFAULT_BODY_LIMIT_MB * 1024 * 1024,
            is_production: false,
            credentials: HashMap::new(),
            skip_auth: true,
            auth_skew: Duration::from_secs(DEFAULT_AUTH_SKEW_SECS),
            db_path: PathBuf::from("./.data/test-apk-signer.redb"),
            buckets: Buckets::default(),
            signed_url_base: format!("http://localhost:{DEFAULT_PORT}/objects"),
            signing: SigningConfig::for_tests(mode, temp_dir),
            tools: ToolConfig::default(),
        }
    }

    /// Validate settings.
    ///
    /// Returns an error message if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.is_production {
            if self.signing.store_passwd.expose() == DEV_STORE_PASSWD {
                return Err("APK_SIGNER_STORE_PASSWD is required in production.".to_string());
            }
            if self.skip_auth {
                return Err("APK_SIGNER_SKIP_AUTH cannot be enabled in production.".to_string());
            }
        }

        if !self.skip_auth && self.credentials.is_empty() {
            return Err("APK_SIGNER_CREDENTIALS is required unless APK_SIGNER_SKIP_AUTH=1. \
                 Provide comma-separated id:key pairs."
                .to_string());
        }

        if self.signing.key_alias.is_empty() {
            return Err("APK_SIGNER_KEY_ALIAS must not be empty.".to_string());
        }

        if self.signing.key_params.key_size < 1024 || self.signing.key_params.validity_days == 0 {
            return Err(
                "APK_SIGNER_KEY_SIZE must be >= 1024 and APK_SIGNER_VALIDITY_DAYS > 0.".to_string(),
            );
        }

        if !self.skip_auth && self.auth_skew.is_zero() {
            return Err("APK_SIGNER_AUTH_SKEW_SECS must be greater than zero.".to_string());
        }

        if self.tools.timeout.is_zero() {
            return Err("APK_SIGNER_TOOL_TIMEOUT_MS must be greater than zero.".to_string());
        }

        if self.buckets.unsigned == self.buckets.signed {
            return Err(
                "APK_SIGNER_UNSIGNED_BUCKET and APK_SIGNER_SIGNED_BUCKET must differ.".to_string(),
            );
        }

        Ok(())
    }

    /// Replace the caller credentials (used for tests).
    #[must_use]
    pub fn with_credentials(mut self, credentials: &str) -> Self {
        self.credentials = parse_credentials(credentials);
        self.skip_auth = false;
        self
    }

    // Getters

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_bytes
    }

    pub fn credentials(&self) -> &HashMap<String, Secret> {
        &self.credentials
    }

    pub fn skip_auth(&self) -> bool {
        self.skip_auth
    }

    /// Largest accepted difference between a Hawk timestamp and server time.
    pub fn auth_skew(&self) -> Duration {
        self.auth_skew
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    pub fn buckets(&self) -> &Buckets {
        &self.buckets
    }

    pub fn signed_url_base(&self) -> &str {
        &self.signed_url_base
    }

    pub fn signing(&self) -> &SigningConfig {
        &self.signing
    }

    pub fn mode(&self) -> UserMode {
        self.signing.mode
    }

    pub fn tools(&self) -> &ToolConfig {
        &self.tools
    }
}

/// Parse `id:key,id:key` into a credential map keyed by id.
fn parse_credentials(raw: &str) -> HashMap<String, Secret> {
    raw.split(',')
        .filter_map(|pair| {
            let (id, secret) = pair.split_once(':')?;
            let (id, secret) = (id.trim(), secret.trim());
            if id.is_empty() || secret.is_empty() {
                return None;
            }
            Some((id.to_string(), Secret::new(secret)))
        })
        .collect()
}

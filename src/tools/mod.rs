//! External signing toolchain.
//!
//! Two tools do the cryptographic work:
//! - `keytool` generates a key pair and self-signed certificate into a keystore
//! - `jarsigner` signs (and verifies) the package with that keystore
//!
//! The [`Toolchain`] trait is the seam between the signing core and these
//! processes. [`JavaToolchain`] is the production implementation.

pub mod invoker;
pub mod locator;

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::config::{KeyParams, Secret, ToolConfig};

pub use invoker::{Invocation, ToolInvoker};
pub use locator::ExecutableLocator;

// Environment variables used to hand passphrases to the Java tools.
const STOREPASS_ENV: &str = "APK_SIGNER_TOOL_STOREPASS";
const KEYPASS_ENV: &str = "APK_SIGNER_TOOL_KEYPASS";

/// Failures at the external process boundary.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Executable not found: {name} (searched {searched} directories)")]
    ExecutableNotFound { name: String, searched: usize },

    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with code {code:?}: {output}")]
    Failed {
        tool: String,
        code: Option<i32>,
        output: String,
    },

    #[error("{tool} timed out after {timeout:?}")]
    TimedOut { tool: String, timeout: Duration },
}

impl ToolError {
    /// The tool ran (or was started) and did not complete successfully.
    pub fn is_execution_error(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::TimedOut { .. })
    }
}

pub type ToolResult<T> = Result<T, ToolError>;

/// Parameters for generating a new keystore.
#[derive(Debug, Clone, Copy)]
pub struct KeystoreRequest<'a> {
    /// Destination; must not exist yet.
    pub keystore: &'a Path,
    pub alias: &'a str,
    pub distinguished_name: &'a str,
    pub params: &'a KeyParams,
    pub store_passwd: &'a Secret,
    pub key_passwd: &'a Secret,
}

/// Parameters for signing one package.
#[derive(Debug, Clone, Copy)]
pub struct PackageSignRequest<'a> {
    pub unsigned: &'a Path,
    pub signed: &'a Path,
    pub keystore: &'a Path,
    pub alias: &'a str,
    pub params: &'a KeyParams,
    pub store_passwd: &'a Secret,
    pub key_passwd: &'a Secret,
}

/// Outcome of a package verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub verified: bool,
    /// Tool output up to, not including, trailing warnings.
    pub report: String,
}

/// The identity generator and package signer.
pub trait Toolchain: Send + Sync {
    /// Write a fresh key pair to `request.keystore`.
    fn gen_keystore(
        &self,
        request: &KeystoreRequest<'_>,
    ) -> impl Future<Output = ToolResult<()>> + Send;

    /// Sign `request.unsigned` into `request.signed`.
    fn sign_package(
        &self,
        request: &PackageSignRequest<'_>,
    ) -> impl Future<Output = ToolResult<()>> + Send;

    /// Independently check a signed package.
    fn verify_package(&self, package: &Path) -> impl Future<Output = ToolResult<Verification>> + Send;
}

/// `keytool` + `jarsigner` from a JDK.
#[derive(Debug, Clone)]
pub struct JavaToolchain {
    keytool: PathBuf,
    jarsigner: PathBuf,
    invoker: ToolInvoker,
}

impl JavaToolchain {
    /// Resolve both tools up front so a missing JDK fails at startup.
    pub fn locate(config: &ToolConfig) -> ToolResult<Self> {
        let locator = ExecutableLocator::from_env(&config.extra_paths);
        let keytool = locator.locate(&config.keytool)?;
        let jarsigner = locator.locate(&config.jarsigner)?;

        tracing::info!(
            keytool = %keytool.display(),
            jarsigner = %jarsigner.display(),
            "Located signing toolchain"
        );

        Ok(Self {
            keytool,
            jarsigner,
            invoker: ToolInvoker::new(config.timeout),
        })
    }

    pub fn keytool(&self) -> &Path {
        &self.keytool
    }

    pub fn jarsigner(&self) -> &Path {
        &self.jarsigner
    }
}

impl Toolchain for JavaToolchain {
    async fn gen_keystore(&self, request: &KeystoreRequest<'_>) -> ToolResult<()> {
        let invocation = Invocation::new(&self.keytool)
            .args(keytool_genkey_args(request))
            .secret_env(STOREPASS_ENV, request.store_passwd)
            .secret_env(KEYPASS_ENV, request.key_passwd);
        self.invoker.invoke(invocation).await?;
        Ok(())
    }

    async fn sign_package(&self, request: &PackageSignRequest<'_>) -> ToolResult<()> {
        let invocation = Invocation::new(&self.jarsigner)
            .args(jarsigner_sign_args(request))
            .secret_env(STOREPASS_ENV, request.store_passwd)
            .secret_env(KEYPASS_ENV, request.key_passwd);
        self.invoker.invoke(invocation).await?;
        Ok(())
    }

    async fn verify_package(&self, package: &Path) -> ToolResult<Verification> {
        let invocation = Invocation::new(&self.jarsigner)
            .args(["-verify", "-verbose"])
            .arg(package);
        let output = self.invoker.invoke(invocation).await?;
        Ok(parse_verification(&output))
    }
}

/// `keytool -genkeypair` arguments; passphrases come from the environment.
pub fn keytool_genkey_args(request: &KeystoreRequest<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-genkeypair",
        "-noprompt",
        "-storetype",
        "JKS",
        "-alias",
        request.alias,
        "-keyalg",
        request.params.key_alg.as_str(),
        "-keysize",
        request.params.key_size.to_string().as_str(),
        "-validity",
        request.params.validity_days.to_string().as_str(),
        "-dname",
        request.distinguished_name,
        "-storepass:env",
        STOREPASS_ENV,
        "-keypass:env",
        KEYPASS_ENV,
        "-keystore",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push(request.keystore.as_os_str().to_os_string());
    args
}

/// `jarsigner` arguments for signing into a separate output file.
pub fn jarsigner_sign_args(request: &PackageSignRequest<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-sigalg",
        request.params.sig_alg.as_str(),
        "-digestalg",
        request.params.digest_alg.as_str(),
        "-storepass:env",
        STOREPASS_ENV,
        "-keypass:env",
        KEYPASS_ENV,
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push("-keystore".into());
    args.push(request.keystore.as_os_str().to_os_string());
    args.push("-signedjar".into());
    args.push(request.signed.as_os_str().to_os_string());
    args.push(request.unsigned.as_os_str().to_os_string());
    args.push(request.alias.into());
    args
}

/// Interpret `jarsigner -verify -verbose` output.
///
/// `jarsigner` exits 0 for unsigned jars too, so the verdict comes from the
/// text: everything before the first `Warning:` line must end with
/// `jar verified.`.
pub fn parse_verification(output: &str) -> Verification {
    let report = output
        .lines()
        .take_while(|line| !line.starts_with("Warning:"))
        .collect::<Vec<_>>()
        .join("\n");
    Verification {
        verified: report.trim().ends_with("jar verified."),
        report,
    }
}

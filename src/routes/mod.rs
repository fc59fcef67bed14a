//! HTTP route handlers for the APK signer.

pub mod health;
pub mod objects;
pub mod sign;

pub use health::{build_info, health};
pub use sign::{SignApkRequest, SignApkResponse};

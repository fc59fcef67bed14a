pub mod auth;
pub mod hawk;

pub use auth::CredentialAuth;

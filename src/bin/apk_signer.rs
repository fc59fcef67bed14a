//! APK Signer Service
//!
//! Accepts unsigned packages, signs them with per-application keys and stores
//! the signed result.
//!
//! ## Startup
//!
//! - Load and validate settings
//! - Open the storage database
//! - Locate `keytool` and `jarsigner`; refuse to start without them

use std::sync::Arc;

use actix_web::{App, HttpServer, middleware, web};
use anyhow::Context;
use apk_signer::{
    config::Settings,
    middleware::CredentialAuth,
    routes,
    signer::SigningOrchestrator,
    storage::{KeyStorage, RedbStorage},
    telemetry,
    tools::JavaToolchain,
};
use tracing_actix_web::TracingLogger;

struct AppState {
    storage: RedbStorage,
    signer: SigningOrchestrator<JavaToolchain>,
}

fn build_state(settings: &Settings) -> anyhow::Result<AppState> {
    let storage = RedbStorage::open(
        settings.db_path(),
        settings.buckets().clone(),
        settings.signed_url_base(),
    )
    .context("Failed to open storage database")?;

    let toolchain =
        JavaToolchain::locate(settings.tools()).context("Signing toolchain unavailable")?;

    let key_storage: Arc<dyn KeyStorage> = Arc::new(storage.clone());
    let signer = SigningOrchestrator::new(settings.signing().clone(), key_storage, toolchain);

    Ok(AppState { storage, signer })
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize tracing first
    telemetry::init_tracing();

    // Load and validate settings
    let settings = Settings::from_env();
    if let Err(message) = settings.validate() {
        tracing::error!("{message}");
        std::process::exit(1);
    }

    let state = match build_state(&settings) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Startup failed: {e:#}");
            std::process::exit(1);
        }
    };

    let addr = settings.socket_addr();
    tracing::info!(
        addr = %addr,
        mode = %settings.mode(),
        temp_dir = %settings.signing().temp_dir.display(),
        "Starting APK signer"
    );

    let body_limit = settings.body_limit_bytes();
    let auth = CredentialAuth::new(&settings);
    let settings_data = web::Data::new(settings);
    let storage_data = web::Data::new(state.storage);
    let signer_data = web::Data::new(state.signer);

    HttpServer::new(move || {
        App::new()
            // Request tracing
            .wrap(TracingLogger::default())
            .wrap(auth.clone())
            // Default headers
            .wrap(middleware::DefaultHeaders::new().add(("X-Service", "apk-signer")))
            // Body limits
            .app_data(web::JsonConfig::default().limit(body_limit))
            .app_data(web::PayloadConfig::new(body_limit))
            // Shared state
            .app_data(settings_data.clone())
            .app_data(storage_data.clone())
            .app_data(signer_data.clone())
            // Routes
            .configure(routes::health::configure)
            .configure(routes::objects::configure)
            .configure(routes::sign::configure::<JavaToolchain>)
    })
    .bind(addr)?
    .run()
    .await?;

    telemetry::shutdown_tracing();
    Ok(())
}

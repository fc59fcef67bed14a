//! Package object endpoints.
//!
//! `PUT` accepts unsigned uploads only; `GET` serves unsigned and signed
//! packages. Keystores are not objects and are never reachable here.

use actix_web::{HttpResponse, ResponseError, web};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Settings;
use crate::error::ServiceError;
use crate::storage::{RedbStorage, StorageError};

const APK_CONTENT_TYPE: &str = "application/vnd.android.package-archive";

/// Response of an upload.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct UploadResponse {
    pub bucket: String,
    pub path: String,
    pub sha256: String,
}

/// PUT /objects/{bucket}/{path}
///
/// Store an unsigned package. Returns the hash callers pass to `/sign`.
#[tracing::instrument(skip(storage, settings, body), fields(size = body.len()))]
pub async fn put_object(
    storage: web::Data<RedbStorage>,
    settings: web::Data<Settings>,
    path: web::Path<(String, String)>,
    body: web::Bytes,
) -> HttpResponse {
    let (bucket, key) = path.into_inner();
    if bucket != settings.buckets().unsigned {
        return ServiceError::InvalidInput(format!(
            "uploads are only accepted into {}",
            settings.buckets().unsigned
        ))
        .error_response();
    }
    if body.is_empty() {
        return ServiceError::InvalidInput("empty package".to_string()).error_response();
    }

    match storage.put_object(&bucket, &key, &body) {
        Ok(()) => HttpResponse::Created().json(UploadResponse {
            bucket,
            path: key,
            sha256: hex::encode(Sha256::digest(&body)),
        }),
        Err(e) => {
            tracing::error!(error = %e, "Failed to store object");
            ServiceError::from(e).error_response()
        }
    }
}

/// GET /objects/{bucket}/{path}
///
/// Download an unsigned or signed package.
#[tracing::instrument(skip(storage, settings))]
pub async fn get_object(
    storage: web::Data<RedbStorage>,
    settings: web::Data<Settings>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (bucket, key) = path.into_inner();
    let buckets = settings.buckets();
    if bucket != buckets.unsigned && bucket != buckets.signed {
        return HttpResponse::NotFound().json(serde_json::json!({
            "error": "Unknown bucket"
        }));
    }

    match storage.get_object(&bucket, &key) {
        Ok(bytes) => HttpResponse::Ok().content_type(APK_CONTENT_TYPE).body(bytes),
        Err(StorageError::NoSuchObject { .. }) => HttpResponse::NotFound().json(serde_json::json!({
            "error": "Object not found"
        })),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read object");
            ServiceError::from(e).error_response()
        }
    }
}

/// Configure object routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/objects/{bucket}/{path:.*}")
            .route(web::put().to(put_object))
            .route(web::get().to(get_object)),
    );
}

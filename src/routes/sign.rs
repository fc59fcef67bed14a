//! Signing HTTP endpoint.
//!
//! The caller names an unsigned package already uploaded to the unsigned
//! bucket, its expected SHA-256, the application id, and where the signed
//! package should go. Requests are validated before the signing core runs.

use actix_web::{HttpResponse, ResponseError, web};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Settings;
use crate::error::{ServiceError, ServiceResult};
use crate::signer::{PackageSource, SigningOrchestrator};
use crate::storage::{PackageStorage, RedbStorage};
use crate::tools::Toolchain;

/// Body of `POST /sign`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SignApkRequest {
    pub apk_id: String,
    pub unsigned_apk_s3_path: String,
    pub unsigned_apk_s3_hash: String,
    pub signed_apk_s3_path: String,
}

impl SignApkRequest {
    fn validate(&self) -> ServiceResult<()> {
        let fields = [
            ("apk_id", &self.apk_id),
            ("unsigned_apk_s3_path", &self.unsigned_apk_s3_path),
            ("unsigned_apk_s3_hash", &self.unsigned_apk_s3_hash),
            ("signed_apk_s3_path", &self.signed_apk_s3_path),
        ];
        match fields.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((name, _)) => Err(ServiceError::InvalidInput(format!("{name} is required"))),
            None => Ok(()),
        }
    }
}

/// Response of `POST /sign`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct SignApkResponse {
    pub signed_apk_s3_url: String,
}

/// POST /sign
///
/// Sign an uploaded package and store the result.
#[tracing::instrument(skip_all, fields(apk_id = %request.apk_id))]
pub async fn sign_apk<T: Toolchain + 'static>(
    signer: web::Data<SigningOrchestrator<T>>,
    storage: web::Data<RedbStorage>,
    settings: web::Data<Settings>,
    request: web::Json<SignApkRequest>,
) -> HttpResponse {
    match handle_sign(&signer, &storage, &settings, request.into_inner()).await {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(e) => {
            tracing::error!(error = %e, "Sign request failed");
            e.error_response()
        }
    }
}

async fn handle_sign<T: Toolchain>(
    signer: &SigningOrchestrator<T>,
    storage: &RedbStorage,
    settings: &Settings,
    request: SignApkRequest,
) -> ServiceResult<SignApkResponse> {
    request.validate()?;

    let bucket = &settings.buckets().unsigned;
    if !storage.bucket_key_exists(bucket, &request.unsigned_apk_s3_path)? {
        return Err(ServiceError::SourceNotFound(format!(
            "{bucket}/{}",
            request.unsigned_apk_s3_path
        )));
    }

    let unsigned = storage.get_package(&request.unsigned_apk_s3_path)?;
    let actual = hex::encode(Sha256::digest(&unsigned));
    let expected = request.unsigned_apk_s3_hash.trim();
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(ServiceError::HashMismatch {
            expected: expected.to_string(),
            actual,
        });
    }

    let mut signed = signer
        .sign(&request.apk_id, PackageSource::Bytes(&unsigned))
        .await?;
    storage.put_signed_package(&mut signed, &request.signed_apk_s3_path)?;

    Ok(SignApkResponse {
        signed_apk_s3_url: storage.signed_package_url(&request.signed_apk_s3_path),
    })
}

/// Configure signing routes.
pub fn configure<T: Toolchain + 'static>(cfg: &mut web::ServiceConfig) {
    cfg.route("/sign", web::post().to(sign_apk::<T>));
}

//! Caller authentication middleware.
//!
//! Every caller holds a credential id and a shared key, and signs each request
//! with a Hawk `Authorization` header (see [`super::hawk`]). An
//! `X-Credential-Id` header, when sent, must name the same credential as the
//! Hawk id. Health and build-info endpoints stay public. With
//! `APK_SIGNER_SKIP_AUTH` set, all requests pass and every request logs a
//! warning.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{self, Service, ServiceRequest, ServiceResponse, Transform, forward_ready};
use actix_web::{Error, ResponseError, http::header, web};
use futures_util::future::{LocalBoxFuture, Ready, ready};

use super::hawk::{HawkError, HawkVerifier, RequestParts, now_secs};
use crate::config::{Secret, Settings};
use crate::error::ServiceError;

const CREDENTIAL_ID_HEADER: &str = "x-credential-id";

/// Middleware enforcing per-caller Hawk authentication.
#[derive(Clone)]
pub struct CredentialAuth {
    skip: bool,
    verifier: Arc<HawkVerifier>,
}

impl CredentialAuth {
    /// Build from service settings.
    pub fn new(settings: &Settings) -> Self {
        Self::from_config(
            settings.skip_auth(),
            settings.credentials().clone(),
            settings.auth_skew(),
        )
    }

    /// Build directly from config (used for tests).
    pub fn from_config(skip: bool, credentials: HashMap<String, Secret>, skew: Duration) -> Self {
        Self {
            skip,
            verifier: Arc::new(HawkVerifier::new(credentials, skew)),
        }
    }

    fn is_public_path(path: &str) -> bool {
        matches!(path, "/health" | "/build-info")
    }
}

impl<S, B> Transform<S, ServiceRequest> for CredentialAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = CredentialAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(CredentialAuthMiddleware {
            service: Rc::new(service),
            skip: self.skip,
            verifier: self.verifier.clone(),
        }))
    }
}

pub struct CredentialAuthMiddleware<S> {
    service: Rc<S>,
    skip: bool,
    verifier: Arc<HawkVerifier>,
}

impl<S, B> Service<ServiceRequest> for CredentialAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let verifier = self.verifier.clone();
        let skip = self.skip;

        Box::pin(async move {
            if skip {
                tracing::warn!("Hawk authentication disabled via settings");
            } else if !CredentialAuth::is_public_path(req.path()) {
                // The MAC covers the body, so read it here and hand it back.
                let body = req.extract::<web::Bytes>().await?;
                let outcome = authenticate(&verifier, &req, &body);
                req.set_payload(dev::Payload::from(body));

                if let Err(e) = outcome {
                    tracing::info!(path = %req.path(), reason = %e, "Denying access");
                    let (req, _pl) = req.into_parts();
                    let response = ServiceError::Unauthorized.error_response();
                    return Ok(ServiceResponse::new(req, response.map_into_right_body()));
                }
            }

            service
                .call(req)
                .await
                .map(ServiceResponse::map_into_left_body)
        })
    }
}

fn authenticate(
    verifier: &HawkVerifier,
    req: &ServiceRequest,
    body: &[u8],
) -> Result<String, HawkError> {
    let headers = req.headers();
    let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let connection = req.connection_info();
    let (host, port) = split_host(connection.host(), connection.scheme());
    let resource = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.path(), |pq| pq.as_str());

    let request = RequestParts {
        method: req.method().as_str(),
        resource,
        host,
        port,
        content_type: text(header::CONTENT_TYPE.as_str()),
        body,
    };
    let id = verifier.verify(text(header::AUTHORIZATION.as_str()), &request, now_secs())?;

    if let Some(claimed) = text(CREDENTIAL_ID_HEADER).map(str::trim) {
        if claimed != id {
            return Err(HawkError::UnknownCredential(claimed.to_string()));
        }
    }
    tracing::debug!(credential_id = %id, "Authenticated request");
    Ok(id)
}

/// Split `host[:port]`, defaulting the port from the scheme.
fn split_host<'a>(authority: &'a str, scheme: &str) -> (&'a str, u16) {
    let default_port = if scheme == "https" { 443 } else { 80 };
    match authority.rsplit_once(':') {
        // Bracketed IPv6 without a port ends in `]`.
        Some((host, port)) if !port.ends_with(']') => {
            (host, port.parse().unwrap_or(default_port))
        }
        _ => (authority, default_port),
    }
}

#[cfg(test)]
mod tests {
    use crate::middleware::hawk::client_header;
    use super::*;
    use actix_web::{App, HttpResponse, http::StatusCode, test, web};

    const HOST: &str = "localhost:5500";

    fn key() -> Secret {
        Secret::new("s3cret")
    }

    fn auth() -> CredentialAuth {
        CredentialAuth::from_config(
            false,
            HashMap::from([("build-bot".to_string(), key())]),
            Duration::from_secs(60),
        )
    }

    fn signed(path: &str, body: &'static [u8], ts: u64, nonce: &str) -> test::TestRequest {
        let parts = RequestParts {
            method: "POST",
            resource: path,
            host: "localhost",
            port: 5500,
            content_type: Some("application/json"),
            body,
        };
        test::TestRequest::post()
            .uri(path)
            .insert_header((header::HOST, HOST))
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .insert_header((
                header::AUTHORIZATION,
                client_header("build-bot", &key(), ts, nonce, &parts).unwrap(),
            ))
            .set_payload(body)
    }

    async fn call(auth: CredentialAuth, req: test::TestRequest) -> StatusCode {
        let app = test::init_service(
            App::new()
                .wrap(auth)
                .route("/health", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/sign", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route(
                    "/sign",
                    web::post().to(|body: web::Bytes| async move {
                        HttpResponse::Ok().body(body)
                    }),
                ),
        )
        .await;
        test::call_service(&app, req.to_request()).await.status()
    }

    #[::core::prelude::v1::test]
    fn test_split_host() {
        assert_eq!(split_host("localhost:5500", "http"), ("localhost", 5500));
        assert_eq!(split_host("signer.internal", "https"), ("signer.internal", 443));
        assert_eq!(split_host("[::1]", "http"), ("[::1]", 80));
        assert_eq!(split_host("[::1]:8080", "http"), ("[::1]", 8080));
    }

    #[actix_rt::test]
    async fn allows_public_routes_without_credentials() {
        let status = call(auth(), test::TestRequest::get().uri("/health")).await;
        assert!(status.is_success());
    }

    #[actix_rt::test]
    async fn rejects_missing_and_bearer_credentials() {
        let status = call(auth(), test::TestRequest::get().uri("/sign")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let bearer = test::TestRequest::get()
            .uri("/sign")
            .insert_header(("x-credential-id", "build-bot"))
            .insert_header(("authorization", "Bearer s3cret"));
        assert_eq!(call(auth(), bearer).await, StatusCode::UNAUTHORIZED);
    }

    #[actix_rt::test]
    async fn accepts_signed_request_and_passes_body_through() {
        let app = test::init_service(App::new().wrap(auth()).route(
            "/sign",
            web::post().to(|body: web::Bytes| async move { HttpResponse::Ok().body(body) }),
        ))
        .await;
        let body: &'static [u8] = b"{\"apk_id\":\"app-42\"}";
        let req = signed("/sign", body, now_secs(), "n-1").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(test::read_body(resp).await, body);
    }

    #[actix_rt::test]
    async fn rejects_tampered_body() {
        let parts = RequestParts {
            method: "POST",
            resource: "/sign",
            host: "localhost",
            port: 5500,
            content_type: Some("application/json"),
            body: b"{\"apk_id\":\"app-42\"}",
        };
        let req = test::TestRequest::post()
            .uri("/sign")
            .insert_header((header::HOST, HOST))
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .insert_header((
                header::AUTHORIZATION,
                client_header("build-bot", &key(), now_secs(), "n-2", &parts).unwrap(),
            ))
            .set_payload(&b"{\"apk_id\":\"app-666\"}"[..]);
        assert_eq!(call(auth(), req).await, StatusCode::UNAUTHORIZED);
    }

    #[actix_rt::test]
    async fn rejects_wrong_mac() {
        let parts = RequestParts {
            method: "POST",
            resource: "/sign",
            host: "localhost",
            port: 5500,
            content_type: None,
            body: b"",
        };
        let forged = client_header("build-bot", &Secret::new("guess"), now_secs(), "n-3", &parts).unwrap();
        let req = test::TestRequest::post()
            .uri("/sign")
            .insert_header((header::HOST, HOST))
            .insert_header((header::AUTHORIZATION, forged));
        assert_eq!(call(auth(), req).await, StatusCode::UNAUTHORIZED);
    }

    #[actix_rt::test]
    async fn rejects_stale_timestamp() {
        let req = signed("/sign", b"{}", now_secs() - 600, "n-4");
        assert_eq!(call(auth(), req).await, StatusCode::UNAUTHORIZED);
    }

    #[actix_rt::test]
    async fn rejects_replayed_request() {
        let auth = auth();
        let app = test::init_service(App::new().wrap(auth).route(
            "/sign",
            web::post().to(|| async { HttpResponse::Ok().finish() }),
        ))
        .await;
        let ts = now_secs();
        let first = test::call_service(&app, signed("/sign", b"{}", ts, "n-5").to_request()).await;
        assert!(first.status().is_success());
        let replay = test::call_service(&app, signed("/sign", b"{}", ts, "n-5").to_request()).await;
        assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_rt::test]
    async fn rejects_mismatched_credential_id_header() {
        let req = signed("/sign", b"{}", now_secs(), "n-6").insert_header(("x-credential-id", "intruder"));
        assert_eq!(call(auth(), req).await, StatusCode::UNAUTHORIZED);
    }

    #[actix_rt::test]
    async fn skip_lets_everything_through() {
        let auth = CredentialAuth::from_config(true, HashMap::new(), Duration::from_secs(60));
        let status = call(auth, test::TestRequest::get().uri("/sign")).await;
        assert!(status.is_success());
    }
}

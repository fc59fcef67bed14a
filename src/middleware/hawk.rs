//! Hawk request authentication.
//!
//! Callers sign every request with a shared key looked up by credential id:
//!
//! ```text
//! Authorization: Hawk id="build-bot", ts="1353832234", nonce="j4h3g2",
//!                hash="<payload hash>", mac="<request mac>"
//! ```
//!
//! The MAC is HMAC-SHA256 over the method, path and query, host, port,
//! timestamp, nonce and payload hash. The payload hash covers the content type
//! and the raw body, so a tampered body fails verification. Timestamps outside
//! the accepted skew and nonces already seen inside that window are rejected.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::Secret;

type HmacSha256 = Hmac<Sha256>;

const HEADER_PREFIX: &str = "hawk.1.header";
const PAYLOAD_PREFIX: &str = "hawk.1.payload";

/// Reasons a request is refused. Callers only ever see a bare 401.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HawkError {
    #[error("missing authorization header")]
    MissingHeader,

    #[error("malformed authorization header: {0}")]
    Malformed(String),

    #[error("unknown credential id {0}")]
    UnknownCredential(String),

    #[error("credential key cannot be used as an HMAC key")]
    InvalidKey,

    #[error("request MAC does not match")]
    BadMac,

    #[error("payload hash missing or does not match the body")]
    BadPayloadHash,

    #[error("timestamp {ts} is outside the accepted window around {now}")]
    StaleTimestamp { ts: u64, now: u64 },

    #[error("nonce already used")]
    ReplayedNonce,
}

/// Attributes of a `Hawk` authorization header.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HawkHeader {
    pub id: String,
    pub ts: u64,
    pub nonce: String,
    pub hash: Option<String>,
    pub ext: Option<String>,
    pub mac: String,
    pub app: Option<String>,
    pub dlg: Option<String>,
}

impl HawkHeader {
    pub fn parse(header: &str) -> Result<Self, HawkError> {
        let header = header.trim();
        let attributes = match header.split_once(' ') {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("hawk") => rest,
            _ => return Err(HawkError::Malformed("not a Hawk header".to_string())),
        };

        let mut values: HashMap<&str, &str> = HashMap::new();
        let mut rest = attributes.trim_start_matches([' ', ',']);
        while !rest.is_empty() {
            let (key, after_key) = rest
                .split_once("=\"")
                .ok_or_else(|| HawkError::Malformed("expected key=\"value\"".to_string()))?;
            let key = key.trim();
            let (value, after_value) = after_key
                .split_once('"')
                .ok_or_else(|| HawkError::Malformed(format!("unterminated value for {key}")))?;
            if !matches!(key, "id" | "ts" | "nonce" | "hash" | "ext" | "mac" | "app" | "dlg") {
                return Err(HawkError::Malformed(format!("unknown attribute {key}")));
            }
            if values.insert(key, value).is_some() {
                return Err(HawkError::Malformed(format!("duplicate attribute {key}")));
            }
            rest = after_value.trim_start_matches([' ', ',']);
        }

        let required = |key: &str| {
            values
                .get(key)
                .filter(|v| !v.is_empty())
                .map(|v| (*v).to_string())
                .ok_or_else(|| HawkError::Malformed(format!("missing {key}")))
        };
        let optional = |key: &str| values.get(key).map(|v| (*v).to_string());

        Ok(Self {
            id: required("id")?,
            ts: required("ts")?
                .parse()
                .map_err(|_| HawkError::Malformed("ts is not a number".to_string()))?,
            nonce: required("nonce")?,
            mac: required("mac")?,
            hash: optional("hash"),
            ext: optional("ext"),
            app: optional("app"),
            dlg: optional("dlg"),
        })
    }
}

/// The parts of a request that are covered by the MAC.
#[derive(Debug, Clone, Copy)]
pub struct RequestParts<'a> {
    pub method: &'a str,
    /// Path and query, exactly as sent.
    pub resource: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

/// Base64 SHA-256 of the content type (without parameters) and body.
pub fn payload_hash(content_type: Option<&str>, body: &[u8]) -> String {
    let content_type = content_type
        .and_then(|ct| ct.split(';').next())
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let mut hasher = Sha256::new();
    hasher.update(PAYLOAD_PREFIX.as_bytes());
    hasher.update(b"\n");
    hasher.update(content_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hasher.update(b"\n");
    BASE64.encode(hasher.finalize())
}

fn normalized_string(header: &HawkHeader, request: &RequestParts<'_>) -> String {
    let mut normalized = format!(
        "{HEADER_PREFIX}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
        header.ts,
        header.nonce,
        request.method.to_ascii_uppercase(),
        request.resource,
        request.host.to_ascii_lowercase(),
        request.port,
        header.hash.as_deref().unwrap_or_default(),
        header.ext.as_deref().unwrap_or_default(),
    );
    if let Some(app) = &header.app {
        normalized.push_str(&format!(
            "{app}\n{}\n",
            header.dlg.as_deref().unwrap_or_default()
        ));
    }
    normalized
}

fn mac_for(key: &Secret, normalized: &str) -> Result<HmacSha256, HawkError> {
    let mut mac =
        HmacSha256::new_from_slice(key.expose().as_bytes()).map_err(|_| HawkError::InvalidKey)?;
    mac.update(normalized.as_bytes());
    Ok(mac)
}

/// Build an authorization header for `request` (client side and tests).
pub fn client_header(
    id: &str,
    key: &Secret,
    ts: u64,
    nonce: &str,
    request: &RequestParts<'_>,
) -> Result<String, HawkError> {
    let mut header = HawkHeader {
        id: id.to_string(),
        ts,
        nonce: nonce.to_string(),
        hash: Some(payload_hash(request.content_type, request.body)),
        ..HawkHeader::default()
    };
    let mac = mac_for(key, &normalized_string(&header, request))?;
    header.mac = BASE64.encode(mac.finalize().into_bytes());

    Ok(format!(
        "Hawk id=\"{}\", ts=\"{}\", nonce=\"{}\", hash=\"{}\", mac=\"{}\"",
        header.id,
        header.ts,
        header.nonce,
        header.hash.as_deref().unwrap_or_default(),
        header.mac
    ))
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Checks Hawk headers against a credential map and remembers recent nonces.
pub struct HawkVerifier {
    credentials: HashMap<String, Secret>,
    skew: Duration,
    // (credential id, nonce) -> timestamp
    seen: Mutex<HashMap<(String, String), u64>>,
}

impl HawkVerifier {
    pub fn new(credentials: HashMap<String, Secret>, skew: Duration) -> Self {
        Self {
            credentials,
            skew,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Verify `authorization` for `request` at time `now`, returning the
    /// authenticated credential id.
    pub fn verify(
        &self,
        authorization: Option<&str>,
        request: &RequestParts<'_>,
        now: u64,
    ) -> Result<String, HawkError> {
        let header = HawkHeader::parse(authorization.ok_or(HawkError::MissingHeader)?)?;
        let key = self
            .credentials
            .get(&header.id)
            .ok_or_else(|| HawkError::UnknownCredential(header.id.clone()))?;

        let provided = BASE64
            .decode(&header.mac)
            .map_err(|_| HawkError::Malformed("mac is not base64".to_string()))?;
        mac_for(key, &normalized_string(&header, request))?
            .verify_slice(&provided)
            .map_err(|_| HawkError::BadMac)?;

        // The MAC covers the claimed hash; now bind the claim to the body.
        match &header.hash {
            Some(hash) if *hash == payload_hash(request.content_type, request.body) => {}
            None if request.body.is_empty() => {}
            _ => return Err(HawkError::BadPayloadHash),
        }

        let skew = self.skew.as_secs();
        if header.ts.abs_diff(now) > skew {
            return Err(HawkError::StaleTimestamp { ts: header.ts, now });
        }

        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.retain(|_, ts| ts.abs_diff(now) <= skew);
        if seen
            .insert((header.id.clone(), header.nonce.clone()), header.ts)
            .is_some()
        {
            return Err(HawkError::ReplayedNonce);
        }

        Ok(header.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Published Hawk example credentials.
    const ID: &str = "dh37fgj492je";
    const KEY: &str = "werxhqb98rpaxn39848xrunpaw3489ruxnpa98w4rxn";
    const TS: u64 = 1_353_832_234;

    fn key() -> Secret {
        Secret::new(KEY)
    }

    fn verifier() -> HawkVerifier {
        HawkVerifier::new(
            HashMap::from([(ID.to_string(), key())]),
            Duration::from_secs(60),
        )
    }

    fn post<'a>(body: &'a [u8]) -> RequestParts<'a> {
        RequestParts {
            method: "POST",
            resource: "/resource/1?b=1&a=2",
            host: "example.com",
            port: 8000,
            content_type: Some("text/plain"),
            body,
        }
    }

    #[test]
    fn test_reference_mac_without_payload() {
        let header = HawkHeader {
            id: ID.to_string(),
            ts: TS,
            nonce: "j4h3g2".to_string(),
            ext: Some("some-app-ext-data".to_string()),
            ..HawkHeader::default()
        };
        let request = RequestParts {
            method: "GET",
            resource: "/resource/1?b=1&a=2",
            host: "example.com",
            port: 8000,
            content_type: None,
            body: b"",
        };
        let mac = mac_for(&key(), &normalized_string(&header, &request)).unwrap();
        assert_eq!(
            BASE64.encode(mac.finalize().into_bytes()),
            "6R4rV5iE+NPoym+WwjeHzjAGXUtLNIxmo1vpMofpLAE="
        );
    }

    #[test]
    fn test_reference_payload_hash_and_mac() {
        let body = b"Thank you for flying Hawk";
        let hash = payload_hash(Some("text/plain; charset=utf-8"), body);
        assert_eq!(hash, "Yi9LfIIFRtBEPt74PVmbTF/xVAwPn7ub15ePICfgnuY=");

        let header = format!(
            "Hawk id=\"{ID}\", ts=\"{TS}\", nonce=\"j4h3g2\", hash=\"{hash}\", \
             ext=\"some-app-ext-data\", mac=\"aSe1DERmZuRl3pI36/9BdZmnErTw3sNzOOAUlfeKjVw=\""
        );
        assert_eq!(verifier().verify(Some(&header), &post(body), TS), Ok(ID.to_string()));
    }

    #[test]
    fn test_parse_header() {
        let header = HawkHeader::parse(
            "Hawk id=\"a\", ts=\"5\", nonce=\"n\", ext=\"x, y\", mac=\"m\"",
        )
        .unwrap();
        assert_eq!(header.id, "a");
        assert_eq!(header.ts, 5);
        assert_eq!(header.ext.as_deref(), Some("x, y"));
        assert_eq!(header.hash, None);

        for bad in [
            "Bearer abc",
            "Hawk id=\"a\", ts=\"5\", nonce=\"n\"",
            "Hawk id=\"a\", ts=\"soon\", nonce=\"n\", mac=\"m\"",
            "Hawk id=\"a\", id=\"b\", ts=\"5\", nonce=\"n\", mac=\"m\"",
            "Hawk id=\"a\", ts=\"5\", nonce=\"n\", mac=\"m\", role=\"admin\"",
            "Hawk id=\"a",
        ] {
            assert!(
                matches!(HawkHeader::parse(bad), Err(HawkError::Malformed(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_client_header_round_trip() {
        let body = b"{\"apk_id\":\"app-42\"}";
        let request = post(body);
        let header = client_header(ID, &key(), TS, "abc123", &request).unwrap();
        assert_eq!(verifier().verify(Some(&header), &request, TS + 10), Ok(ID.to_string()));
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let request = post(b"{\"apk_id\":\"app-42\"}");
        let header = client_header(ID, &key(), TS, "abc123", &request).unwrap();

        let tampered = post(b"{\"apk_id\":\"app-666\"}");
        assert_eq!(
            verifier().verify(Some(&header), &tampered, TS),
            Err(HawkError::BadPayloadHash)
        );
    }

    #[test]
    fn test_wrong_key_and_altered_request_are_rejected() {
        let request = post(b"body");
        let forged = client_header(ID, &Secret::new("not the key"), TS, "abc123", &request).unwrap();
        assert_eq!(
            verifier().verify(Some(&forged), &request, TS),
            Err(HawkError::BadMac)
        );

        let header = client_header(ID, &key(), TS, "abc123", &request).unwrap();
        let other_path = RequestParts {
            resource: "/resource/2",
            ..request
        };
        assert_eq!(
            verifier().verify(Some(&header), &other_path, TS),
            Err(HawkError::BadMac)
        );
    }

    #[test]
    fn test_unknown_id_and_missing_header() {
        let request = post(b"");
        let header = client_header("stranger", &key(), TS, "abc123", &request).unwrap();
        assert_eq!(
            verifier().verify(Some(&header), &request, TS),
            Err(HawkError::UnknownCredential("stranger".to_string()))
        );
        assert_eq!(
            verifier().verify(None, &request, TS),
            Err(HawkError::MissingHeader)
        );
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let request = post(b"body");
        let header = client_header(ID, &key(), TS, "abc123", &request).unwrap();
        assert_eq!(
            verifier().verify(Some(&header), &request, TS + 3600),
            Err(HawkError::StaleTimestamp { ts: TS, now: TS + 3600 })
        );
    }

    #[test]
    fn test_replayed_nonce_is_rejected() {
        let verifier = verifier();
        let request = post(b"body");
        let header = client_header(ID, &key(), TS, "once", &request).unwrap();

        assert!(verifier.verify(Some(&header), &request, TS).is_ok());
        assert_eq!(
            verifier.verify(Some(&header), &request, TS + 1),
            Err(HawkError::ReplayedNonce)
        );

        let fresh = client_header(ID, &key(), TS, "twice", &request).unwrap();
        assert!(verifier.verify(Some(&fresh), &request, TS + 1).is_ok());
    }
}

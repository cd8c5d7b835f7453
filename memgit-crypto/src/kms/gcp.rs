//! Google Cloud KMS backend over the v1 REST API.

use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{CryptoError, Result};
use crate::kms::KeyManagementClient;

/// Where the master key lives and how to reach it.
#[derive(Clone)]
pub struct CloudKmsSettings {
    /// API root, e.g. `https://cloudkms.googleapis.com`.
    pub endpoint: String,
    /// GCP project id.
    pub project_id: String,
    /// Key ring location, usually `global`.
    pub location: String,
    /// Key ring name.
    pub key_ring: String,
    /// Crypto key name.
    pub key_name: String,
    /// OAuth2 bearer token with `cloudkms.cryptoKeyVersions.useToEncrypt/Decrypt`.
    pub access_token: String,
    /// Hard timeout for a single HTTP call.
    pub request_timeout: Duration,
    /// Extra attempts after a transient failure.
    pub max_retries: u32,
}

impl std::fmt::Debug for CloudKmsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudKmsSettings")
            .field("endpoint", &self.endpoint)
            .field("project_id", &self.project_id)
            .field("location", &self.location)
            .field("key_ring", &self.key_ring)
            .field("key_name", &self.key_name)
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl CloudKmsSettings {
    /// Full resource name of the crypto key.
    #[must_use]
    pub fn key_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}",
            self.project_id, self.location, self.key_ring, self.key_name
        )
    }
}

/// Cloud KMS client. Blocking: every call is a synchronous HTTPS request
/// bounded by `request_timeout`.
#[derive(Debug)]
pub struct CloudKms {
    settings: CloudKmsSettings,
    http: Client,
    key_path: String,
}

impl CloudKms {
    /// Build a client.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyManagement`] if the HTTP client cannot be
    /// constructed or a required setting is empty.
    pub fn new(settings: CloudKmsSettings) -> Result<Self> {
        for (name, value) in [
            ("project_id", &settings.project_id),
            ("key_ring", &settings.key_ring),
            ("key_name", &settings.key_name),
        ] {
            if value.trim().is_empty() {
                return Err(CryptoError::KeyManagement(format!("{name} is required")));
            }
        }

        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| CryptoError::KeyManagement(e.to_string()))?;
        let key_path = settings.key_path();

        Ok(Self {
            settings,
            http,
            key_path,
        })
    }

    /// Resource name of the master key.
    #[must_use]
    pub fn key_path(&self) -> &str {
        &self.key_path
    }

    fn url(&self, verb: &str) -> String {
        format!(
            "{}/v1/{}:{verb}",
            self.settings.endpoint.trim_end_matches('/'),
            self.key_path
        )
    }

    /// POST `body` to `:{verb}` and pull `field` out of the response as
    /// base64-decoded bytes. Retries only transient failures.
    fn call(&self, verb: &str, body: &Value, field: &str) -> Result<Vec<u8>> {
        let url = self.url(verb);
        let mut last_error = CryptoError::Unavailable("no attempt made".into());

        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                debug!(verb, attempt = attempt + 1, "Retrying KMS call");
            }

            let start = Instant::now();
            let result = self
                .http
                .post(&url)
                .bearer_auth(&self.settings.access_token)
                .json(body)
                .send();
            let latency_ms = start.elapsed().as_millis();

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let json: Value = resp
                        .json()
                        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
                    let encoded = json[field].as_str().ok_or_else(|| {
                        CryptoError::Encoding(format!("KMS response missing `{field}`"))
                    })?;
                    debug!(verb, latency_ms, "KMS call succeeded");
                    return Ok(STANDARD.decode(encoded)?);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().unwrap_or_default();
                    warn!(verb, %status, latency_ms, "KMS call failed");
                    let err = classify_status(status, &text);
                    if !matches!(err, CryptoError::Unavailable(_)) {
                        return Err(err);
                    }
                    last_error = err;
                }
                Err(e) => {
                    warn!(verb, error = %e, latency_ms, "KMS request error");
                    let err = CryptoError::from(e);
                    if !matches!(err, CryptoError::Unavailable(_)) {
                        return Err(err);
                    }
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }
}

fn classify_status(status: StatusCode, body: &str) -> CryptoError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        CryptoError::Unavailable(format!("HTTP {status}: {body}"))
    } else {
        CryptoError::KeyManagement(format!("HTTP {status}: {body}"))
    }
}

impl KeyManagementClient for CloudKms {
    fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let body = json!({ "plaintext": STANDARD.encode(plaintext) });
        self.call("encrypt", &body, "ciphertext")
    }

    fn unwrap(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let body = json!({ "ciphertext": STANDARD.encode(ciphertext) });
        self.call("decrypt", &body, "plaintext")
    }

    fn describe(&self) -> String {
        format!("gcp:{}", self.key_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(endpoint: &str) -> CloudKmsSettings {
        CloudKmsSettings {
            endpoint: endpoint.to_string(),
            project_id: "memory-prod".into(),
            location: "global".into(),
            key_ring: "memory-ring".into(),
            key_name: "master".into(),
            access_token: "ya29.secret".into(),
            request_timeout: Duration::from_millis(500),
            max_retries: 1,
        }
    }

    #[test]
    fn builds_resource_urls() {
        let kms = CloudKms::new(settings("https://cloudkms.googleapis.com/")).expect("client");
        assert_eq!(
            kms.key_path(),
            "projects/memory-prod/locations/global/keyRings/memory-ring/cryptoKeys/master"
        );
        assert_eq!(
            kms.url("encrypt"),
            "https://cloudkms.googleapis.com/v1/projects/memory-prod/locations/global/keyRings/memory-ring/cryptoKeys/master:encrypt"
        );
    }

    #[test]
    fn missing_settings_are_rejected() {
        let mut s = settings("https://cloudkms.googleapis.com");
        s.key_ring = " ".into();
        assert!(matches!(CloudKms::new(s), Err(CryptoError::KeyManagement(_))));
    }

    #[test]
    fn token_never_appears_in_debug() {
        let rendered = format!("{:?}", settings("https://cloudkms.googleapis.com"));
        assert!(!rendered.contains("ya29"));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            CryptoError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            CryptoError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "denied"),
            CryptoError::KeyManagement(_)
        ));
    }

    #[test]
    fn unreachable_backend_is_unavailable() {
        // Nothing listens on port 9 of the loopback interface.
        let kms = CloudKms::new(settings("http://127.0.0.1:9")).expect("client");
        let err = kms.wrap(b"key").expect_err("nothing is listening");
        assert!(matches!(err, CryptoError::Unavailable(_)), "got {err:?}");
    }
}

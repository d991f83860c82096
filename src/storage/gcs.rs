//! Google Cloud Storage backend
//!
//! Credentials come from a service-account key JSON stored in a Kubernetes
//! Secret. The key signs an RS256 assertion which is exchanged for an OAuth
//! access token; objects are then accessed through the JSON API.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crd::SecretKeyRef;
use crate::storage::{Credential, CredentialResolver, ObjectStorage, StorageError};

/// Public JSON API endpoint
pub const GCS_BASE_URL: &str = "https://storage.googleapis.com";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Fields of a service-account key file used for token exchange
#[derive(Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: SecretString,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    pub fn from_json(bytes: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(bytes)
            .map_err(|e| StorageError::Credential(format!("invalid service account key: {}", e)))
    }

    pub fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }

    /// Signed RS256 assertion for the OAuth JWT bearer grant
    pub fn assertion(&self, now: DateTime<Utc>) -> Result<String, StorageError> {
        #[derive(Debug, Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            scope: &'a str,
            aud: &'a str,
            iat: i64,
            exp: i64,
        }

        let claims = Claims {
            iss: &self.client_email,
            scope: STORAGE_SCOPE,
            aud: self.token_uri(),
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.expose_secret().as_bytes())
            .map_err(|e| StorageError::Credential(format!("invalid private key: {}", e)))?;

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| StorageError::Credential(format!("failed to sign assertion: {}", e)))
    }
}

/// Resolves service-account secrets into OAuth access tokens
#[derive(Clone)]
pub struct ServiceAccountResolver {
    client: Client,
    http: reqwest::Client,
}

impl ServiceAccountResolver {
    pub fn new(client: Client, http: reqwest::Client) -> Self {
        Self { client, http }
    }

    async fn read_key(
        &self,
        namespace: &str,
        secret: &SecretKeyRef,
    ) -> Result<ServiceAccountKey, StorageError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let found = api
            .get_opt(&secret.name)
            .await
            .map_err(|e| StorageError::Http {
                status: None,
                message: format!("failed to read secret {}: {}", secret.name, e),
            })?
            .ok_or_else(|| StorageError::NotFound(format!("secret {}/{}", namespace, secret.name)))?;

        let data = found
            .data
            .as_ref()
            .and_then(|d| d.get(&secret.key))
            .ok_or_else(|| {
                StorageError::NotFound(format!(
                    "key {} in secret {}/{}",
                    secret.key, namespace, secret.name
                ))
            })?;

        ServiceAccountKey::from_json(&data.0)
    }

    async fn exchange(&self, key: &ServiceAccountKey) -> Result<Credential, StorageError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }

        let now = Utc::now();
        let assertion = key.assertion(now)?;
        let response = self
            .http
            .post(key.token_uri())
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(request_error)?;

        let response = check_status(response, "token exchange").await?;
        let payload: TokenResponse = response.json().await.map_err(request_error)?;

        Ok(Credential {
            token: SecretString::from(payload.access_token),
            expires_at: now + Duration::seconds(payload.expires_in),
        })
    }
}

#[async_trait]
impl CredentialResolver for ServiceAccountResolver {
    async fn resolve(
        &self,
        namespace: &str,
        secret: &SecretKeyRef,
    ) -> Result<Credential, StorageError> {
        let key = self.read_key(namespace, secret).await?;
        debug!(secret = %secret.name, account = %key.client_email, "exchanging service account assertion");
        self.exchange(&key).await
    }
}

/// Object storage over the GCS JSON API
#[derive(Clone)]
pub struct GcsStorage {
    http: reqwest::Client,
    base_url: Url,
}

impl GcsStorage {
    pub fn new(http: reqwest::Client) -> Result<Self, StorageError> {
        Self::with_base_url(http, GCS_BASE_URL)
    }

    /// Point the client at another endpoint (e.g. a local emulator)
    pub fn with_base_url(http: reqwest::Client, base_url: &str) -> Result<Self, StorageError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| StorageError::Invalid(format!("invalid base url {}: {}", base_url, e)))?;
        Ok(Self { http, base_url })
    }

    /// Build `{base}/{segments...}` with every segment percent-encoded
    fn url(&self, segments: &[&str]) -> Result<Url, StorageError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StorageError::Invalid(format!("base url {} cannot have a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url, StorageError> {
        self.url(&["storage", "v1", "b", bucket, "o", key])
    }
}

#[async_trait]
impl ObjectStorage for GcsStorage {
    async fn put(
        &self,
        credential: &Credential,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError> {
        let url = self.url(&["upload", "storage", "v1", "b", bucket, "o"])?;
        let size = bytes.len();
        let response = self
            .http
            .post(url)
            .query(&[("uploadType", "media"), ("name", key)])
            .bearer_auth(credential.token.expose_secret())
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .body(bytes)
            .send()
            .await
            .map_err(request_error)?;

        check_status(response, key).await?;
        debug!(bucket, key, size, "uploaded object");
        Ok(())
    }

    async fn get(
        &self,
        credential: &Credential,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<u8>, StorageError> {
        let url = self.object_url(bucket, key)?;
        let response = self
            .http
            .get(url)
            .query(&[("alt", "media")])
            .bearer_auth(credential.token.expose_secret())
            .send()
            .await
            .map_err(request_error)?;

        let response = check_status(response, key).await?;
        let bytes = response.bytes().await.map_err(request_error)?;
        debug!(bucket, key, size = bytes.len(), "downloaded object");
        Ok(bytes.to_vec())
    }

    async fn list(
        &self,
        credential: &Credential,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<String>, StorageError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ObjectList {
            #[serde(default)]
            items: Vec<ObjectItem>,
            next_page_token: Option<String>,
        }

        #[derive(Deserialize)]
        struct ObjectItem {
            name: String,
        }

        let url = self.url(&["storage", "v1", "b", bucket, "o"])?;
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(url.clone())
                .query(&[("prefix", prefix), ("fields", "items(name),nextPageToken")])
                .bearer_auth(credential.token.expose_secret());
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request.send().await.map_err(request_error)?;
            let response = check_status(response, bucket).await?;
            let page: ObjectList = response.json().await.map_err(request_error)?;

            keys.extend(page.items.into_iter().map(|item| item.name));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(bucket, prefix, count = keys.len(), "listed objects");
        Ok(keys)
    }

    async fn delete(
        &self,
        credential: &Credential,
        bucket: &str,
        key: &str,
    ) -> Result<(), StorageError> {
        let url = self.object_url(bucket, key)?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(credential.token.expose_secret())
            .send()
            .await
            .map_err(request_error)?;

        check_status(response, key).await?;
        debug!(bucket, key, "deleted object");
        Ok(())
    }
}

fn request_error(e: reqwest::Error) -> StorageError {
    if e.is_timeout() {
        StorageError::Timeout(e.to_string())
    } else {
        StorageError::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

async fn check_status(
    response: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(StorageError::NotFound(what.to_string()));
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unable to read response body".to_string());
    Err(StorageError::Http {
        status: Some(status.as_u16()),
        message,
    })
}

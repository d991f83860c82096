//! Object storage and credential seams used by backup and restore
//!
//! The backup executor and restore controller only see these traits.
//! `gcs` holds the Google Cloud Storage implementation.

pub mod gcs;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use thiserror::Error;

use crate::crd::SecretKeyRef;

pub use gcs::{GcsStorage, ServiceAccountResolver};

/// Errors returned by credential resolution and object storage calls
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("storage request failed (status {status:?}): {message}")]
    Http {
        status: Option<u16>,
        message: String,
    },

    #[error("invalid storage request: {0}")]
    Invalid(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Timeout(_) => true,
            StorageError::Http { status: None, .. } => true,
            StorageError::Http {
                status: Some(code), ..
            } => *code == 429 || *code == 408 || *code >= 500,
            StorageError::NotFound(_) => false,
            StorageError::Credential(_) => false,
            StorageError::Invalid(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Short-lived storage access token
///
/// Held for a single storage operation and never serialized.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

/// Turns a secret reference into a storage credential
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(
        &self,
        namespace: &str,
        secret: &SecretKeyRef,
    ) -> Result<Credential, StorageError>;
}

/// Bucket-scoped object storage
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` at `key`; returns once storage acknowledged the write
    async fn put(
        &self,
        credential: &Credential,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError>;

    async fn get(
        &self,
        credential: &Credential,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<u8>, StorageError>;

    /// All keys under `prefix`
    async fn list(
        &self,
        credential: &Credential,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<String>, StorageError>;

    async fn delete(
        &self,
        credential: &Credential,
        bucket: &str,
        key: &str,
    ) -> Result<(), StorageError>;
}

/// Bound a storage or credential call; expiry maps to `StorageError::Timeout`
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout(what.to_string())),
    }
}

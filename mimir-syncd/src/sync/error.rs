use std::io;
use std::path::PathBuf;

use mimir_core::{ApiErrorClass, ContentError};
use serde::Serialize;
use thiserror::Error;

use super::transfer::TransferError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote call failed: {0}")]
    Remote(#[from] ContentError),
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid input: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Auth,
    NotFound,
    Network,
    Validation,
    Filesystem,
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Remote(err) => match err.classification() {
                Some(ApiErrorClass::Auth) => ErrorKind::Auth,
                Some(ApiErrorClass::NotFound) => ErrorKind::NotFound,
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient) => ErrorKind::Network,
                Some(ApiErrorClass::Permanent) => ErrorKind::Validation,
                None => match err {
                    ContentError::Request(_) => ErrorKind::Network,
                    _ => ErrorKind::Validation,
                },
            },
            SyncError::Transfer(TransferError::Io(_) | TransferError::NoFileName(_)) => {
                ErrorKind::Filesystem
            }
            SyncError::Transfer(TransferError::Url(_)) => ErrorKind::Validation,
            SyncError::Transfer(_) => ErrorKind::Network,
            SyncError::Io { .. } => ErrorKind::Filesystem,
            SyncError::Validation(_) => ErrorKind::Validation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(err) => err.is_retryable(),
            SyncError::Transfer(err) => err.is_retryable(),
            _ => false,
        }
    }
}

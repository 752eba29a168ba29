//! Crate-wide error type (spec §7).

use crate::crypto::CryptoError;
use thiserror::Error;

/// Top-level error surfaced across the crate's public operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid document header")]
    InvalidHeader,
    #[error("header upgrade rejected")]
    HeaderUpgradeRejected,
    #[error("operation not authorized for this key")]
    Unauthorized,
    #[error("inbound message failed schema validation")]
    SchemaRejected,
    #[error("document request timed out")]
    DocumentRequestTimeout,
    #[error("transport closed")]
    TransportClosed,
    #[error("storage operation failed: {0}")]
    StorageFailure(#[source] anyhow::Error),
    #[error("cryptographic operation failed: {0}")]
    CryptoFailure(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, Error>;

// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid MAC")]
    InvalidMac,

    #[error("Invalid padding")]
    InvalidPadding,

    #[error("Invalid length: {0}")]
    InvalidLength(String),

    #[error("Invalid base64: {0}")]
    InvalidBase64(String),

    #[error("Unknown encryption version: {0}")]
    UnknownVersion(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),
}

impl CryptoError {
    pub fn invalid_length(msg: impl Into<String>) -> Self {
        Self::InvalidLength(msg.into())
    }

    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    pub fn encryption(msg: impl Into<String>) -> Self {
        Self::Encryption(msg.into())
    }

    pub fn decryption(msg: impl Into<String>) -> Self {
        Self::Decryption(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum KeepError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Transport unavailable")]
    TransportUnavailable,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("User rejected")]
    UserRejected,

    #[error("Signing capability failed: {0}")]
    Capability(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KeepError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Short machine-readable label, used in audit entries and UI events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::Timeout(_) => "timeout",
            Self::TransportUnavailable => "transport_unavailable",
            Self::Remote(_) => "remote",
            Self::Validation(_) => "validation",
            Self::PermissionDenied(_) => "permission_denied",
            Self::UserRejected => "user_rejected",
            Self::Capability(_) => "capability",
            Self::Integrity(_) => "integrity",
            Self::Crypto(_) => "crypto",
            Self::Storage(_) => "storage",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::Serialization(_) => "serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, KeepError>;

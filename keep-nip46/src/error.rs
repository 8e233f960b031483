// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use keep_core::error::KeepError;

pub type Result<T> = std::result::Result<T, KeepError>;

/// Fixed, non-leaking error strings for replies sent to remote counterparts.
pub(crate) fn sanitize_error_for_client(e: &KeepError) -> &'static str {
    match e {
        KeepError::PermissionDenied(_) => "Permission denied",
        KeepError::UserRejected => "User rejected",
        KeepError::SessionNotFound(_) => "Unknown session",
        KeepError::Validation(_) | KeepError::InvalidInput(_) => "Invalid input",
        KeepError::Protocol(_) => "Invalid request",
        KeepError::Capability(_) => "Signing failed",
        KeepError::Integrity(_) => "Signature integrity check failed",
        KeepError::Crypto(_) => "Cryptographic operation failed",
        KeepError::Storage(_) => "Storage error",
        KeepError::Timeout(_) => "Timed out",
        KeepError::TransportUnavailable | KeepError::Remote(_) => "Signer unavailable",
        KeepError::Serialization(_) => "Data format error",
    }
}

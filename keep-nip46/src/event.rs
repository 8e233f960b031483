// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use chrono::Utc;
use keep_core::error::KeepError;
use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::capability::SignatureResult;
use crate::error::Result;
use crate::types::PartialEvent;

const MAX_FUTURE_SECS: i64 = 86400;

/// An unsigned event bound to the group key. Field order is part of the
/// contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub content: String,
    pub created_at: i64,
    pub kind: u16,
    pub pubkey: String,
    pub tags: Vec<Vec<String>>,
}

impl EventTemplate {
    /// Builds a template from the first `sign_event` parameter.
    pub fn from_params(params: &[String], pubkey: &PublicKey, max_size: usize) -> Result<Self> {
        let json = params
            .first()
            .ok_or_else(|| KeepError::InvalidInput("missing event".into()))?;
        if json.len() > max_size {
            return Err(KeepError::InvalidInput("event too large".into()));
        }
        let partial: PartialEvent = serde_json::from_str(json)
            .map_err(|e| KeepError::InvalidInput(format!("invalid event: {e}")))?;

        if partial.created_at < 0 {
            return Err(KeepError::InvalidInput("negative timestamp".into()));
        }
        if partial.created_at > Utc::now().timestamp() + MAX_FUTURE_SECS {
            return Err(KeepError::InvalidInput("timestamp too far in future".into()));
        }
        if partial.tags.iter().any(|t| t.is_empty()) {
            return Err(KeepError::InvalidInput("empty tag".into()));
        }

        Ok(Self {
            content: partial.content,
            created_at: partial.created_at,
            kind: partial.kind,
            pubkey: pubkey.to_hex(),
            tags: partial.tags,
        })
    }

    /// SHA-256 over `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(&self) -> Result<String> {
        let canonical = serde_json::to_string(&(
            0u8,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))?;
        Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    /// Checks the capability's answer against this template.
    pub fn seal(self, id: &str, signature: SignatureResult) -> Result<SignedEvent> {
        if !signature.id.eq_ignore_ascii_case(id) {
            return Err(KeepError::Integrity("signed id does not match template".into()));
        }
        if !signature.pubkey.eq_ignore_ascii_case(&self.pubkey) {
            return Err(KeepError::Integrity(
                "signing pubkey does not match group key".into(),
            ));
        }

        let signed = SignedEvent {
            content: self.content,
            created_at: self.created_at,
            id: id.to_lowercase(),
            kind: self.kind,
            pubkey: self.pubkey,
            sig: signature.signature.to_lowercase(),
            tags: self.tags,
        };
        signed.verify()?;
        Ok(signed)
    }
}

/// The event returned to the counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvent {
    pub content: String,
    pub created_at: i64,
    pub id: String,
    pub kind: u16,
    pub pubkey: String,
    pub sig: String,
    pub tags: Vec<Vec<String>>,
}

impl SignedEvent {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn verify(&self) -> Result<()> {
        let event = Event::from_json(self.to_json()?)
            .map_err(|e| KeepError::Integrity(format!("malformed signed event: {e}")))?;
        event
            .verify()
            .map_err(|e| KeepError::Integrity(format!("signature check failed: {e}")))
    }
}

// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Connect,
    GetPublicKey,
    SignEvent,
    Nip04Encrypt,
    Nip04Decrypt,
    Nip44Encrypt,
    Nip44Decrypt,
    PermissionDenied,
    UserRejected,
    SessionRegistered,
    SessionActivated,
    SessionUpdated,
    SessionRevoked,
}

impl AuditAction {
    pub fn for_method(method: &str) -> Option<Self> {
        match method {
            "connect" => Some(Self::Connect),
            "get_public_key" => Some(Self::GetPublicKey),
            "sign_event" => Some(Self::SignEvent),
            "nip04_encrypt" => Some(Self::Nip04Encrypt),
            "nip04_decrypt" => Some(Self::Nip04Decrypt),
            "nip44_encrypt" => Some(Self::Nip44Encrypt),
            "nip44_decrypt" => Some(Self::Nip44Decrypt),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::GetPublicKey => write!(f, "get_public_key"),
            Self::SignEvent => write!(f, "sign_event"),
            Self::Nip04Encrypt => write!(f, "nip04_encrypt"),
            Self::Nip04Decrypt => write!(f, "nip04_decrypt"),
            Self::Nip44Encrypt => write!(f, "nip44_encrypt"),
            Self::Nip44Decrypt => write!(f, "nip44_decrypt"),
            Self::PermissionDenied => write!(f, "permission_denied"),
            Self::UserRejected => write!(f, "user_rejected"),
            Self::SessionRegistered => write!(f, "session_registered"),
            Self::SessionActivated => write!(f, "session_activated"),
            Self::SessionUpdated => write!(f, "session_updated"),
            Self::SessionRevoked => write!(f, "session_revoked"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub app_pubkey: String,
    pub request_id: Option<String>,
    pub event_kind: Option<u16>,
    pub event_id: Option<String>,
    pub success: bool,
    pub reason: Option<String>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, app_pubkey: PublicKey) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            app_pubkey: app_pubkey.to_hex(),
            request_id: None,
            event_kind: None,
            event_id: None,
            success: true,
            reason: None,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_event_kind(mut self, kind: u16) -> Self {
        self.event_kind = Some(kind);
        self
    }

    pub fn with_event_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

impl std::fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "✓" } else { "✗" };
        write!(
            f,
            "[{}] {} {} {}",
            self.timestamp.format("%H:%M:%S"),
            status,
            &self.app_pubkey[..8.min(self.app_pubkey.len())],
            self.action
        )?;

        if let Some(kind) = self.event_kind {
            write!(f, " kind:{kind}")?;
        }

        if let Some(ref reason) = self.reason {
            write!(f, " ({reason})")?;
        }

        Ok(())
    }
}

/// In-memory log with a fixed capacity; the oldest entries go first.
pub struct AuditLog {
    entries: VecDeque<AuditEntry>,
    max_entries: usize,
}

impl AuditLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(1024)),
            max_entries,
        }
    }

    pub fn log(&mut self, entry: AuditEntry) {
        self.entries.push_back(entry);

        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    /// Newest first.
    pub fn recent(&self, count: usize) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter().rev().take(count)
    }

    pub fn by_app<'a>(&'a self, pubkey: &'a str) -> impl Iterator<Item = &'a AuditEntry> {
        self.entries.iter().filter(move |e| e.app_pubkey == pubkey)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use keep_bridge::{MessageBus, StoreController, StoreMap, StoreRecord};
use keep_core::error::KeepError;
use keep_core::relay::{normalize_relay_url, validate_relay_url, MAX_RELAYS};
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::error::Result;
use crate::invite::InviteToken;
use crate::policy::{PermissionPolicy, PolicyDelta};

pub const SESSION_DOMAIN: &str = "session";
pub const SESSION_UPDATED_TOPIC: &str = "session.updated";

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Revoked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One remote counterpart and its standing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub pubkey: PublicKey,
    pub status: SessionStatus,
    #[serde(default)]
    pub profile: SessionProfile,
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub policy: PermissionPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub created_at: i64,
}

impl Session {
    pub fn new_pending(
        pubkey: PublicKey,
        relays: Vec<String>,
        policy: PermissionPolicy,
        secret: Option<String>,
    ) -> Self {
        Self {
            pubkey,
            status: SessionStatus::Pending,
            profile: SessionProfile::default(),
            relays,
            policy,
            secret,
            created_at: Utc::now().timestamp(),
        }
    }

    fn from_invite(invite: &InviteToken) -> Self {
        let mut session = Self::new_pending(
            invite.client_pubkey,
            invite.relays.clone(),
            invite.policy.clone(),
            invite.secret.clone(),
        );
        session.profile = invite.profile.clone();
        session
    }

    pub fn is_revoked(&self) -> bool {
        self.status == SessionStatus::Revoked
    }

    /// Copy without the handshake secret, for anything leaving the backend.
    pub fn redacted(&self) -> Self {
        Self {
            secret: None,
            ..self.clone()
        }
    }

    pub fn app_id(&self) -> String {
        self.pubkey.to_hex()[..8].to_string()
    }

    fn secret_matches(&self, provided: Option<&str>) -> bool {
        let Some(expected) = &self.secret else {
            return true;
        };
        let Some(provided) = provided else {
            return false;
        };
        let expected_hash = Sha256::digest(expected.as_bytes());
        let provided_hash = Sha256::digest(provided.as_bytes());
        provided_hash.ct_eq(&expected_hash).into()
    }
}

/// All sessions ever registered, revoked ones included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionBook {
    pub sessions: Vec<Session>,
}

impl StoreRecord for SessionBook {
    const STORE_KEY: &'static str = "sessions";

    fn defaults() -> Self {
        Self::default()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let mut live = HashSet::new();
        for session in self.sessions.iter().filter(|s| !s.is_revoked()) {
            if !live.insert(session.pubkey) {
                return Err("more than one live session for a pubkey".into());
            }
        }
        Ok(())
    }
}

impl SessionBook {
    fn live(&self, pubkey: &PublicKey) -> Option<&Session> {
        self.sessions
            .iter()
            .find(|s| &s.pubkey == pubkey && !s.is_revoked())
    }

    fn live_mut(&mut self, pubkey: &PublicKey) -> Option<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|s| &s.pubkey == pubkey && !s.is_revoked())
    }
}

/// The UI's view: revoked sessions are kept in storage but never listed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionList {
    pub active: Vec<Session>,
    pub pending: Vec<Session>,
}

/// Mutable fields of a live session. The policy is merged, the rest replaced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<SessionProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relays: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyDelta>,
}

impl SessionPatch {
    pub fn policy(delta: PolicyDelta) -> Self {
        Self {
            policy: Some(delta),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Registered(Session),
    Activated(Session),
    Updated(Session),
    Revoked(Session),
}

impl SessionEvent {
    pub fn session(&self) -> &Session {
        match self {
            SessionEvent::Registered(s)
            | SessionEvent::Activated(s)
            | SessionEvent::Updated(s)
            | SessionEvent::Revoked(s) => s,
        }
    }
}

/// Drives the pending → active → revoked lifecycle. Every transition is
/// persisted, broadcast and audited.
pub struct SessionManager {
    store: Arc<StoreController<SessionBook>>,
    bus: Option<MessageBus>,
    audit: Arc<Mutex<AuditLog>>,
    events: broadcast::Sender<SessionEvent>,
    lock: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(
        store: Arc<StoreController<SessionBook>>,
        bus: Option<MessageBus>,
        audit: Arc<Mutex<AuditLog>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            bus,
            audit,
            events,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// The live session for `pubkey`, or the most recent revoked one.
    pub fn get(&self, pubkey: &PublicKey) -> Option<Session> {
        let book = self.store.snapshot()?;
        if let Some(live) = book.live(pubkey) {
            return Some(live.clone());
        }
        book.sessions
            .iter()
            .rev()
            .find(|s| &s.pubkey == pubkey)
            .cloned()
    }

    pub fn list(&self) -> SessionList {
        let Some(book) = self.store.snapshot() else {
            return SessionList::default();
        };
        let mut list = SessionList::default();
        for session in &book.sessions {
            match session.status {
                SessionStatus::Active => list.active.push(session.redacted()),
                SessionStatus::Pending => list.pending.push(session.redacted()),
                SessionStatus::Revoked => {}
            }
        }
        list
    }

    pub async fn register(&self, invite: &InviteToken) -> Result<Session> {
        let _guard = self.lock.lock().await;
        let mut book = self.book()?;
        let pubkey = invite.client_pubkey;

        if let Some(existing) = book.live(&pubkey) {
            if existing.status == SessionStatus::Active {
                return Err(KeepError::InvalidInput(
                    "counterpart already has an active session".into(),
                ));
            }
            debug!(app_id = %existing.app_id(), "replacing pending session");
            book.sessions
                .retain(|s| !(s.pubkey == pubkey && s.status == SessionStatus::Pending));
        }

        let session = Session::from_invite(invite);
        book.sessions.push(session.clone());
        self.commit(book).await?;

        info!(app_id = %session.app_id(), "session registered");
        self.record(
            AuditEntry::new(AuditAction::SessionRegistered, pubkey),
            SessionEvent::Registered(session.redacted()),
        );
        Ok(session)
    }

    /// pending → active. A session that is already active is returned as is.
    pub async fn activate(&self, pubkey: &PublicKey) -> Result<Session> {
        let _guard = self.lock.lock().await;
        self.activate_locked(pubkey).await
    }

    async fn activate_locked(&self, pubkey: &PublicKey) -> Result<Session> {
        let mut book = self.book()?;
        let session = book
            .live_mut(pubkey)
            .ok_or_else(|| KeepError::SessionNotFound(pubkey.to_hex()))?;

        if session.status == SessionStatus::Active {
            return Ok(session.clone());
        }
        session.status = SessionStatus::Active;
        let session = session.clone();
        self.commit(book).await?;

        info!(app_id = %session.app_id(), "session activated");
        self.record(
            AuditEntry::new(AuditAction::SessionActivated, *pubkey),
            SessionEvent::Activated(session.redacted()),
        );
        Ok(session)
    }

    pub async fn update(&self, pubkey: &PublicKey, patch: SessionPatch) -> Result<Session> {
        let _guard = self.lock.lock().await;
        let mut book = self.book()?;
        let session = book
            .live_mut(pubkey)
            .ok_or_else(|| KeepError::SessionNotFound(pubkey.to_hex()))?;

        if let Some(relays) = patch.relays {
            session.relays = checked_relays(&relays)?;
        }
        if let Some(profile) = patch.profile {
            session.profile = profile;
        }
        if let Some(delta) = &patch.policy {
            session.policy.merge(delta);
        }
        let session = session.clone();
        self.commit(book).await?;

        debug!(app_id = %session.app_id(), "session updated");
        self.record(
            AuditEntry::new(AuditAction::SessionUpdated, *pubkey),
            SessionEvent::Updated(session.redacted()),
        );
        Ok(session)
    }

    /// Terminal. The record stays in storage for audit.
    pub async fn revoke(&self, pubkey: &PublicKey) -> Result<Session> {
        let _guard = self.lock.lock().await;
        let mut book = self.book()?;
        let session = book
            .live_mut(pubkey)
            .ok_or_else(|| KeepError::SessionNotFound(pubkey.to_hex()))?;

        session.status = SessionStatus::Revoked;
        session.secret = None;
        let session = session.clone();
        self.commit(book).await?;

        info!(app_id = %session.app_id(), "session revoked");
        self.record(
            AuditEntry::new(AuditAction::SessionRevoked, *pubkey),
            SessionEvent::Revoked(session.redacted()),
        );
        Ok(session)
    }

    /// Completes a counterpart's `connect`: params are `[signer_pubkey?, secret?]`.
    pub async fn handshake(
        &self,
        pubkey: &PublicKey,
        params: &[String],
        group_pubkey: &PublicKey,
    ) -> Result<Session> {
        let signer = params.first().map(|s| s.trim()).filter(|s| !s.is_empty());
        let secret = params.get(1).map(String::as_str).filter(|s| !s.is_empty());

        let _guard = self.lock.lock().await;
        let failure = |reason: &str| {
            self.audit.lock().log(
                AuditEntry::new(AuditAction::Connect, *pubkey)
                    .with_success(false)
                    .with_reason(reason),
            );
            KeepError::PermissionDenied(reason.to_string())
        };

        if let Some(signer) = signer {
            let matches = PublicKey::from_hex(signer)
                .map(|pk| &pk == group_pubkey)
                .unwrap_or(false);
            if !matches {
                return Err(failure("signer pubkey mismatch"));
            }
        }

        let session = match self.get(pubkey) {
            Some(s) if s.is_revoked() => return Err(failure("session revoked")),
            Some(s) => s,
            None => return Err(failure("unknown session")),
        };

        if session.status == SessionStatus::Active {
            debug!(app_id = %session.app_id(), "connect on active session");
            return Ok(session);
        }

        if !session.secret_matches(secret) {
            warn!(app_id = %session.app_id(), "connect with invalid secret");
            return Err(failure("invalid secret"));
        }

        let session = self.activate_locked(pubkey).await?;
        self.audit
            .lock()
            .log(AuditEntry::new(AuditAction::Connect, *pubkey));
        Ok(session)
    }

    fn book(&self) -> Result<SessionBook> {
        self.store
            .snapshot()
            .ok_or_else(|| KeepError::storage("sessions not initialized"))
    }

    async fn commit(&self, book: SessionBook) -> Result<()> {
        let mut partial = StoreMap::new();
        partial.insert("sessions".into(), serde_json::to_value(&book.sessions)?);
        self.store.update(partial).await?;

        if let Some(bus) = &self.bus {
            let view = serde_json::to_value(self.list())?;
            bus.publish_event(SESSION_DOMAIN, SESSION_UPDATED_TOPIC, view);
        }
        Ok(())
    }

    fn record(&self, entry: AuditEntry, event: SessionEvent) {
        self.audit.lock().log(entry);
        let _ = self.events.send(event);
    }
}

fn checked_relays(relays: &[String]) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(relays.len());
    for relay in relays {
        validate_relay_url(relay)
            .map_err(|e| KeepError::InvalidInput(format!("relay {relay}: {e}")))?;
        let relay = normalize_relay_url(relay);
        if !out.contains(&relay) {
            out.push(relay);
        }
    }
    if out.len() > MAX_RELAYS {
        return Err(KeepError::InvalidInput(format!(
            "at most {MAX_RELAYS} relays allowed"
        )));
    }
    Ok(out)
}

// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use keep_bridge::{envelope::new_id, MessageBus};
use keep_core::cipher::{nip04, nip44};
use keep_core::error::KeepError;
use keep_core::SharedSecret;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::capability::{RelayLink, SigningCapability};
use crate::config::AgentConfig;
use crate::error::{sanitize_error_for_client, Result};
use crate::event::EventTemplate;
use crate::policy::{self, PolicyDelta, Verdict};
use crate::session::{Session, SessionManager, SessionPatch};
use crate::types::{
    CapabilityRequest, RelayReply, METHOD_CONNECT, METHOD_GET_PUBLIC_KEY, METHOD_NIP04_DECRYPT,
    METHOD_NIP04_ENCRYPT, METHOD_NIP44_DECRYPT, METHOD_NIP44_ENCRYPT, METHOD_SIGN_EVENT,
};

pub const PROMPT_DOMAIN: &str = "prompt";
pub const PROMPT_NEW_TOPIC: &str = "prompt.new";
pub const REQUEST_DOMAIN: &str = "request";
pub const REQUEST_RESOLVED_TOPIC: &str = "request.resolved";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A queued request as the UI sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptView {
    pub id: String,
    pub request_id: String,
    pub method: String,
    pub app_pubkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_kind: Option<u16>,
    pub params: Vec<String>,
    pub created_at: i64,
}

/// The terminal outcome of one capability request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub request_id: String,
    pub method: String,
    pub app_pubkey: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArbiterEvent {
    Prompted(PromptView),
    Resolved(Resolution),
}

struct PendingPrompt {
    id: String,
    request: CapabilityRequest,
    queued_at: Instant,
    created_at: i64,
}

impl PendingPrompt {
    fn view(&self) -> PromptView {
        let event_kind = if self.request.method == METHOD_SIGN_EVENT {
            policy::event_kind(&self.request.params)
        } else {
            None
        };
        PromptView {
            id: self.id.clone(),
            request_id: self.request.id.clone(),
            method: self.request.method.clone(),
            app_pubkey: self.request.counterpart.to_hex(),
            event_kind,
            params: self.request.params.clone(),
            created_at: self.created_at,
        }
    }
}

struct Executed {
    result: String,
    event_id: Option<String>,
}

/// Turns capability requests into exactly one reply each: executed, denied,
/// or parked until the user decides.
pub struct RequestArbiter {
    sessions: Arc<SessionManager>,
    capability: Arc<dyn SigningCapability>,
    relay: Arc<dyn RelayLink>,
    bus: Option<MessageBus>,
    audit: Arc<Mutex<AuditLog>>,
    config: AgentConfig,
    prompts: Mutex<Vec<PendingPrompt>>,
    events: broadcast::Sender<ArbiterEvent>,
}

impl RequestArbiter {
    pub fn new(
        sessions: Arc<SessionManager>,
        capability: Arc<dyn SigningCapability>,
        relay: Arc<dyn RelayLink>,
        bus: Option<MessageBus>,
        audit: Arc<Mutex<AuditLog>>,
        config: AgentConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions,
            capability,
            relay,
            bus,
            audit,
            config,
            prompts: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ArbiterEvent> {
        self.events.subscribe()
    }

    /// Returns the verdict the request received. `Prompt` means it is queued.
    pub async fn handle(&self, request: CapabilityRequest) -> Verdict {
        let app_id = request.app_id();
        debug!(method = %request.method, app_id = %app_id, request_id = %request.id, "capability request");

        if request.method == METHOD_CONNECT {
            let group = self.capability.group_pubkey();
            let outcome = self
                .sessions
                .handshake(&request.counterpart, &request.params, &group)
                .await;
            let verdict = match &outcome {
                Ok(_) => Verdict::Allow,
                Err(e) => Verdict::Deny(e.to_string()),
            };
            let outcome = outcome.map(|_| Executed {
                result: "ack".into(),
                event_id: None,
            });
            self.finish(&request, outcome).await;
            return verdict;
        }

        let session = self.sessions.get(&request.counterpart);
        let supported = self.supported_for(session.as_ref()).await;
        let verdict = policy::evaluate(
            session.as_ref(),
            &request.method,
            &request.params,
            &supported,
        );

        match &verdict {
            Verdict::Allow => {
                let outcome = self.execute(&request).await;
                self.finish(&request, outcome).await;
            }
            Verdict::Deny(reason) => {
                info!(method = %request.method, app_id = %app_id, %reason, "request denied by policy");
                self.finish(&request, Err(KeepError::permission_denied(reason.clone())))
                    .await;
            }
            Verdict::Prompt => return self.enqueue(request).await,
        }
        verdict
    }

    /// Answers a request without consulting policy.
    pub async fn refuse(&self, request: CapabilityRequest, error: KeepError) -> Verdict {
        let reason = error.to_string();
        self.finish(&request, Err(error)).await;
        Verdict::Deny(reason)
    }

    /// Revoked and unknown counterparts are denied before the capability is
    /// consulted at all.
    async fn supported_for(&self, session: Option<&Session>) -> Vec<String> {
        match session {
            Some(s) if !s.is_revoked() => self.capability.supported_methods().await,
            _ => Vec::new(),
        }
    }

    async fn enqueue(&self, request: CapabilityRequest) -> Verdict {
        let view = {
            let mut prompts = self.prompts.lock();
            if prompts.len() >= self.config.max_pending_prompts {
                None
            } else {
                let prompt = PendingPrompt {
                    id: new_id(),
                    request: request.clone(),
                    queued_at: Instant::now(),
                    created_at: Utc::now().timestamp(),
                };
                let view = prompt.view();
                prompts.push(prompt);
                Some(view)
            }
        };

        let Some(view) = view else {
            warn!(app_id = %request.app_id(), "prompt queue full");
            let reason = "too many pending requests";
            self.finish(&request, Err(KeepError::permission_denied(reason)))
                .await;
            return Verdict::Deny(reason.into());
        };

        info!(method = %view.method, app_id = %request.app_id(), prompt_id = %view.id, "awaiting user decision");
        if let Some(bus) = &self.bus {
            match serde_json::to_value(&view) {
                Ok(payload) => bus.publish_event(PROMPT_DOMAIN, PROMPT_NEW_TOPIC, payload),
                Err(e) => warn!(error = %e, "could not encode prompt"),
            }
        }
        let _ = self.events.send(ArbiterEvent::Prompted(view));
        Verdict::Prompt
    }

    /// Oldest first.
    pub fn list_prompts(&self) -> Vec<PromptView> {
        self.prompts.lock().iter().map(PendingPrompt::view).collect()
    }

    pub fn pending_prompts(&self) -> usize {
        self.prompts.lock().len()
    }

    /// Applies the user's decision. A delta is merged into the session's
    /// policy first, and the counterpart's other prompts are re-evaluated
    /// against the new policy.
    pub async fn resolve_prompt(
        &self,
        prompt_id: &str,
        approve: bool,
        delta: Option<PolicyDelta>,
    ) -> Result<()> {
        let prompt = {
            let mut prompts = self.prompts.lock();
            let index = prompts
                .iter()
                .position(|p| p.id == prompt_id)
                .ok_or_else(|| KeepError::InvalidInput(format!("unknown prompt: {prompt_id}")))?;
            prompts.remove(index)
        };
        let request = prompt.request;
        let counterpart = request.counterpart;

        let delta = delta.filter(|d| !d.is_empty());
        let policy_changed = match delta {
            Some(delta) => match self
                .sessions
                .update(&counterpart, SessionPatch::policy(delta))
                .await
            {
                Ok(_) => true,
                Err(e) => {
                    warn!(app_id = %request.app_id(), error = %e, "could not apply policy delta");
                    false
                }
            },
            None => false,
        };

        let live = self
            .sessions
            .get(&counterpart)
            .filter(|s| !s.is_revoked())
            .is_some();

        let outcome = if !live {
            Err(KeepError::permission_denied("session revoked"))
        } else if approve {
            self.execute(&request).await
        } else {
            Err(KeepError::UserRejected)
        };
        self.finish(&request, outcome).await;

        if policy_changed {
            self.settle_prompts(&counterpart).await;
        }
        Ok(())
    }

    /// Re-runs policy over the counterpart's queued prompts and resolves the
    /// ones that no longer need a decision.
    pub async fn settle_prompts(&self, counterpart: &PublicKey) {
        let session = self.sessions.get(counterpart);
        let supported = self.supported_for(session.as_ref()).await;

        let decided: Vec<(CapabilityRequest, Verdict)> = {
            let mut prompts = self.prompts.lock();
            let mut decided = Vec::new();
            prompts.retain(|p| {
                if &p.request.counterpart != counterpart {
                    return true;
                }
                match policy::evaluate(
                    session.as_ref(),
                    &p.request.method,
                    &p.request.params,
                    &supported,
                ) {
                    Verdict::Prompt => true,
                    verdict => {
                        decided.push((p.request.clone(), verdict));
                        false
                    }
                }
            });
            decided
        };

        for (request, verdict) in decided {
            debug!(request_id = %request.id, "prompt settled by updated policy");
            let outcome = match verdict {
                Verdict::Allow => self.execute(&request).await,
                Verdict::Deny(reason) => Err(KeepError::permission_denied(reason)),
                Verdict::Prompt => continue,
            };
            self.finish(&request, outcome).await;
        }
    }

    /// Rejects every prompt older than the configured expiry.
    pub async fn expire_prompts(&self) -> usize {
        let expiry = self.config.prompt_expiry();
        let expired: Vec<CapabilityRequest> = {
            let mut prompts = self.prompts.lock();
            let mut expired = Vec::new();
            prompts.retain(|p| {
                if p.queued_at.elapsed() >= expiry {
                    expired.push(p.request.clone());
                    false
                } else {
                    true
                }
            });
            expired
        };

        let count = expired.len();
        for request in expired {
            debug!(request_id = %request.id, "prompt expired");
            self.finish(&request, Err(KeepError::UserRejected)).await;
        }
        count
    }

    /// Rejects everything still queued, used on shutdown.
    pub async fn reject_all(&self) {
        let drained: Vec<PendingPrompt> = std::mem::take(&mut *self.prompts.lock());
        for prompt in drained {
            self.finish(&prompt.request, Err(KeepError::UserRejected))
                .await;
        }
    }

    async fn execute(&self, request: &CapabilityRequest) -> Result<Executed> {
        let group = self.capability.group_pubkey();
        match request.method.as_str() {
            METHOD_GET_PUBLIC_KEY => Ok(Executed {
                result: group.to_hex(),
                event_id: None,
            }),
            METHOD_SIGN_EVENT => {
                let template = EventTemplate::from_params(
                    &request.params,
                    &group,
                    self.config.max_event_json_size,
                )?;
                let id = template.compute_id()?;
                let signature = self
                    .capability
                    .sign(&id)
                    .await
                    .map_err(KeepError::Capability)?;
                let signed = template.seal(&id, signature)?;
                debug!(event_kind = signed.kind, event_id = &signed.id[..8], "signed event");
                Ok(Executed {
                    result: signed.to_json()?,
                    event_id: Some(signed.id),
                })
            }
            METHOD_NIP04_ENCRYPT | METHOD_NIP04_DECRYPT | METHOD_NIP44_ENCRYPT
            | METHOD_NIP44_DECRYPT => {
                let (peer, text) = cipher_params(&request.params)?;
                let shared = self.shared_secret(&peer).await?;
                let result = match request.method.as_str() {
                    METHOD_NIP04_ENCRYPT => nip04::encrypt(&shared, text)?,
                    METHOD_NIP04_DECRYPT => nip04::decrypt(&shared, text)?,
                    METHOD_NIP44_ENCRYPT => nip44::encrypt(&shared, text)?,
                    _ => nip44::decrypt(&shared, text)?,
                };
                Ok(Executed {
                    result,
                    event_id: None,
                })
            }
            other => Err(KeepError::protocol(format!("unsupported method: {other}"))),
        }
    }

    async fn shared_secret(&self, peer: &PublicKey) -> Result<SharedSecret> {
        let hex = self
            .capability
            .ecdh(peer)
            .await
            .map_err(KeepError::Capability)?;
        Ok(SharedSecret::from_hex(&hex)?)
    }

    async fn finish(&self, request: &CapabilityRequest, outcome: Result<Executed>) {
        let app_id = request.app_id();
        let (reply, resolution, entry) = match outcome {
            Ok(executed) => {
                let mut entry = self.audit_entry(request, AuditAction::for_method(&request.method));
                if let Some(event_id) = &executed.event_id {
                    entry = entry.with_event_id(event_id.clone());
                }
                (
                    RelayReply::Result(executed.result),
                    self.resolution(request, None),
                    entry,
                )
            }
            Err(e) => {
                if matches!(e, KeepError::Integrity(_)) {
                    error!(method = %request.method, app_id = %app_id, error = %e, "signature integrity failure");
                } else {
                    warn!(method = %request.method, app_id = %app_id, error = %e, "request failed");
                }
                let action = match &e {
                    KeepError::PermissionDenied(_) => Some(AuditAction::PermissionDenied),
                    KeepError::UserRejected => Some(AuditAction::UserRejected),
                    _ => AuditAction::for_method(&request.method),
                };
                let entry = self
                    .audit_entry(request, action)
                    .with_success(false)
                    .with_reason(e.to_string());
                (
                    RelayReply::Error(sanitize_error_for_client(&e).to_string()),
                    self.resolution(request, Some(e.to_string())),
                    entry,
                )
            }
        };

        if let Err(e) = self
            .relay
            .reply(&request.id, &request.counterpart, reply)
            .await
        {
            warn!(request_id = %request.id, error = %e, "failed to send relay reply");
        }

        // connect is audited by the session manager
        if request.method != METHOD_CONNECT {
            self.audit.lock().log(entry);
        }

        if let Some(bus) = &self.bus {
            match serde_json::to_value(&resolution) {
                Ok(payload) => bus.publish_event(REQUEST_DOMAIN, REQUEST_RESOLVED_TOPIC, payload),
                Err(e) => warn!(error = %e, "could not encode resolution"),
            }
        }
        let _ = self.events.send(ArbiterEvent::Resolved(resolution));
    }

    fn audit_entry(&self, request: &CapabilityRequest, action: Option<AuditAction>) -> AuditEntry {
        let action = action.unwrap_or(AuditAction::PermissionDenied);
        let mut entry =
            AuditEntry::new(action, request.counterpart).with_request_id(request.id.clone());
        if request.method == METHOD_SIGN_EVENT {
            if let Some(kind) = policy::event_kind(&request.params) {
                entry = entry.with_event_kind(kind);
            }
        }
        entry
    }

    fn resolution(&self, request: &CapabilityRequest, error: Option<String>) -> Resolution {
        Resolution {
            request_id: request.id.clone(),
            method: request.method.clone(),
            app_pubkey: request.counterpart.to_hex(),
            ok: error.is_none(),
            error,
        }
    }
}

fn cipher_params(params: &[String]) -> Result<(PublicKey, &str)> {
    let (peer, text) = match params {
        [peer, text] => (peer, text),
        _ => {
            return Err(KeepError::InvalidInput(
                "expected [peer_pubkey, text]".into(),
            ))
        }
    };
    let peer = PublicKey::from_hex(peer)
        .map_err(|e| KeepError::InvalidInput(format!("invalid peer pubkey: {e}")))?;
    Ok((peer, text.as_str()))
}

// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use keep_bridge::{
    DurableStore, Link, MessageBus, RequestHandler, StoreController, StoreMap, StoreRecord,
};
use keep_core::error::KeepError;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditLog};
use crate::capability::{RelayLink, SigningCapability};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::handler::RequestArbiter;
use crate::host_policy::{Accept, Conditions, HostPolicyBook, HostPolicyRow, HostPolicyTable};
use crate::invite::InviteToken;
use crate::policy::{PolicyDelta, Verdict};
use crate::session::{SessionBook, SessionManager, SessionPatch};
use crate::settings::{
    keep_redacted_share, normalize_relays, reset_decision, AgentSettings, NodeReset,
};
use crate::types::CapabilityRequest;

/// Schema version passed to the durable store on open.
pub const STORE_VERSION: u32 = 1;

pub const NODE_DOMAIN: &str = "node";
pub const NODE_EVENT_TOPIC: &str = "node.event";

const DEFAULT_LOG_LIMIT: usize = 50;
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum NodeEvent {
    Ready,
    Closed,
    Error(String),
    Reset(NodeReset),
}

/// The closed set of requests the UI may send to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendTopic {
    SettingsFetch,
    SettingsUpdate,
    SettingsReset,
    SessionList,
    SessionRegister,
    SessionUpdate,
    SessionRevoke,
    PolicyList,
    PolicyAdd,
    PolicyRevoke,
    PolicyCheck,
    PromptList,
    PromptResolve,
    LogFetch,
    NodePeers,
}

impl BackendTopic {
    pub const ALL: [BackendTopic; 15] = [
        Self::SettingsFetch,
        Self::SettingsUpdate,
        Self::SettingsReset,
        Self::SessionList,
        Self::SessionRegister,
        Self::SessionUpdate,
        Self::SessionRevoke,
        Self::PolicyList,
        Self::PolicyAdd,
        Self::PolicyRevoke,
        Self::PolicyCheck,
        Self::PromptList,
        Self::PromptResolve,
        Self::LogFetch,
        Self::NodePeers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SettingsFetch => "settings.fetch",
            Self::SettingsUpdate => "settings.update",
            Self::SettingsReset => "settings.reset",
            Self::SessionList => "session.list",
            Self::SessionRegister => "session.register",
            Self::SessionUpdate => "session.update",
            Self::SessionRevoke => "session.revoke",
            Self::PolicyList => "policy.list",
            Self::PolicyAdd => "policy.add",
            Self::PolicyRevoke => "policy.revoke",
            Self::PolicyCheck => "policy.check",
            Self::PromptList => "prompt.list",
            Self::PromptResolve => "prompt.resolve",
            Self::LogFetch => "log.fetch",
            Self::NodePeers => "node.peers",
        }
    }

    /// The part of the topic before the dot.
    pub fn domain(&self) -> &'static str {
        let topic = self.as_str();
        topic.split_once('.').map(|(d, _)| d).unwrap_or(topic)
    }

    pub fn parse(domain: &str, topic: &str) -> Result<Self> {
        let found = Self::ALL
            .iter()
            .find(|t| t.as_str() == topic)
            .copied()
            .ok_or_else(|| KeepError::protocol(format!("unknown topic: {topic}")))?;
        if found.domain() != domain {
            return Err(KeepError::protocol(format!(
                "topic {topic} does not belong to domain {domain}"
            )));
        }
        Ok(found)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRegisterParams {
    pub invite: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUpdateParams {
    pub pubkey: String,
    pub patch: SessionPatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRevokeParams {
    pub pubkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyAddParams {
    pub host: String,
    #[serde(rename = "type")]
    pub policy_type: String,
    pub accept: Accept,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRevokeParams {
    pub host: String,
    #[serde(rename = "type")]
    pub policy_type: String,
    pub accept: Accept,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCheckParams {
    pub host: String,
    #[serde(rename = "type")]
    pub policy_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptResolveParams {
    pub id: String,
    pub approve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<PolicyDelta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogFetchParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_pubkey: Option<String>,
}

fn parse_params<T: DeserializeOwned>(topic: BackendTopic, params: Option<Value>) -> Result<T> {
    let params =
        params.ok_or_else(|| KeepError::protocol(format!("{} requires params", topic.as_str())))?;
    serde_json::from_value(params)
        .map_err(|e| KeepError::protocol(format!("bad params for {}: {e}", topic.as_str())))
}

fn parse_pubkey(hex: &str) -> Result<PublicKey> {
    PublicKey::from_hex(hex).map_err(|e| KeepError::InvalidInput(format!("invalid pubkey: {e}")))
}

/// Everything the backend process owns, built once by [`AgentState::start`].
pub struct AgentState {
    bus: MessageBus,
    config: AgentConfig,
    settings: Arc<StoreController<AgentSettings>>,
    sessions: Arc<SessionManager>,
    host_policy: Arc<HostPolicyTable>,
    arbiter: Arc<RequestArbiter>,
    audit: Arc<Mutex<AuditLog>>,
    capability: Arc<dyn SigningCapability>,
    node_events: broadcast::Sender<NodeEvent>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl AgentState {
    pub async fn start(
        link: Link,
        store: Arc<dyn DurableStore>,
        capability: Arc<dyn SigningCapability>,
        relay: Arc<dyn RelayLink>,
        config: AgentConfig,
    ) -> Result<Arc<Self>> {
        let found = store.open(STORE_VERSION).await?;
        debug!(version = found, "durable store opened");

        let bus = MessageBus::spawn(link, config.bus.clone());

        // settings and sessions carry secrets; their events are published redacted
        let settings = Arc::new(StoreController::<AgentSettings>::new(store.clone(), None));
        settings.use_middleware(keep_redacted_share);
        settings.use_middleware(normalize_relays);
        settings.init().await?;

        let session_store = Arc::new(StoreController::<SessionBook>::new(store.clone(), None));
        session_store.init().await?;

        let host_store = Arc::new(StoreController::<HostPolicyBook>::new(
            store,
            Some(bus.clone()),
        ));
        host_store.init().await?;

        let audit = Arc::new(Mutex::new(AuditLog::new(config.audit_log_capacity)));
        let sessions = Arc::new(SessionManager::new(
            session_store,
            Some(bus.clone()),
            audit.clone(),
        ));
        let arbiter = Arc::new(RequestArbiter::new(
            sessions.clone(),
            capability.clone(),
            relay,
            Some(bus.clone()),
            audit.clone(),
            config.clone(),
        ));
        let (node_events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let state = Arc::new(Self {
            bus: bus.clone(),
            config,
            settings,
            sessions,
            host_policy: Arc::new(HostPolicyTable::new(host_store)),
            arbiter,
            audit,
            capability,
            node_events,
            sweeper: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        bus.serve(Arc::new(BackendRouter {
            state: Arc::downgrade(&state),
        }));
        *state.sweeper.lock() = Some(state.spawn_sweeper());

        info!("agent started");
        state.emit(NodeEvent::Ready);
        Ok(state)
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let arbiter = Arc::downgrade(&self.arbiter);
        let period = self.config.prompt_sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(arbiter) = arbiter.upgrade() else {
                    break;
                };
                let expired = arbiter.expire_prompts().await;
                if expired > 0 {
                    debug!(expired, "expired prompts");
                }
            }
        })
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn arbiter(&self) -> &Arc<RequestArbiter> {
        &self.arbiter
    }

    pub fn host_policy(&self) -> &Arc<HostPolicyTable> {
        &self.host_policy
    }

    pub fn settings(&self) -> Option<AgentSettings> {
        self.settings.snapshot()
    }

    pub fn subscribe_node(&self) -> broadcast::Receiver<NodeEvent> {
        self.node_events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Entry point for requests delivered by the relay transport. Once the
    /// agent is closed every request is still answered, with an error.
    pub async fn handle_capability_request(&self, request: CapabilityRequest) -> Verdict {
        if self.is_closed() {
            debug!(request_id = %request.id, "request after shutdown");
            return self
                .arbiter
                .refuse(request, KeepError::TransportUnavailable)
                .await;
        }
        self.arbiter.handle(request).await
    }

    /// Rejects queued prompts, publishes `Closed` and releases the bus.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.arbiter.reject_all().await;
        self.emit(NodeEvent::Closed);
        self.bus.clear_handler();
        self.bus.close();
        info!("agent shut down");
    }

    fn emit(&self, event: NodeEvent) {
        match serde_json::to_value(&event) {
            Ok(payload) => self.bus.publish_event(NODE_DOMAIN, NODE_EVENT_TOPIC, payload),
            Err(e) => warn!(error = %e, "could not encode node event"),
        }
        let _ = self.node_events.send(event);
    }

    fn publish_settings(&self, settings: &AgentSettings) -> Result<Value> {
        let view = serde_json::to_value(settings.redacted())?;
        self.bus.publish_event(
            AgentSettings::STORE_KEY,
            &StoreController::<AgentSettings>::updated_topic(),
            view.clone(),
        );
        Ok(view)
    }

    fn settings_changed(&self, previous: &AgentSettings, next: &AgentSettings) -> Result<Value> {
        let decision = reset_decision(previous, next);
        if decision != NodeReset::None {
            info!(?decision, "settings change requires node reset");
            self.emit(NodeEvent::Reset(decision));
        }
        self.publish_settings(next)
    }

    pub async fn dispatch(&self, topic: BackendTopic, params: Option<Value>) -> Result<Value> {
        debug!(topic = topic.as_str(), "backend request");
        match topic {
            BackendTopic::SettingsFetch => {
                let settings = self.settings.fetch().await?;
                Ok(serde_json::to_value(settings.redacted())?)
            }
            BackendTopic::SettingsUpdate => {
                let partial: StoreMap = parse_params(topic, params)?;
                let previous = self.settings.snapshot().unwrap_or_default();
                let next = self.settings.update(partial).await?;
                self.settings_changed(&previous, &next)
            }
            BackendTopic::SettingsReset => {
                let previous = self.settings.snapshot().unwrap_or_default();
                let next = self.settings.reset().await?;
                self.settings_changed(&previous, &next)
            }
            BackendTopic::SessionList => Ok(serde_json::to_value(self.sessions.list())?),
            BackendTopic::SessionRegister => {
                let p: SessionRegisterParams = parse_params(topic, params)?;
                let invite = InviteToken::parse(&p.invite)?;
                let session = self.sessions.register(&invite).await?;
                Ok(serde_json::to_value(session.redacted())?)
            }
            BackendTopic::SessionUpdate => {
                let p: SessionUpdateParams = parse_params(topic, params)?;
                let pubkey = parse_pubkey(&p.pubkey)?;
                let session = self.sessions.update(&pubkey, p.patch).await?;
                self.arbiter.settle_prompts(&pubkey).await;
                Ok(serde_json::to_value(session.redacted())?)
            }
            BackendTopic::SessionRevoke => {
                let p: SessionRevokeParams = parse_params(topic, params)?;
                let pubkey = parse_pubkey(&p.pubkey)?;
                let session = self.sessions.revoke(&pubkey).await?;
                self.arbiter.settle_prompts(&pubkey).await;
                Ok(serde_json::to_value(session.redacted())?)
            }
            BackendTopic::PolicyList => Ok(serde_json::to_value(self.host_policy.list())?),
            BackendTopic::PolicyAdd => {
                let p: PolicyAddParams = parse_params(topic, params)?;
                let mut row = HostPolicyRow::new(p.host, p.policy_type, p.accept);
                row.conditions = p.conditions;
                Ok(serde_json::to_value(self.host_policy.add(row).await?)?)
            }
            BackendTopic::PolicyRevoke => {
                let p: PolicyRevokeParams = parse_params(topic, params)?;
                let removed = self
                    .host_policy
                    .revoke(&p.host, &p.policy_type, p.accept)
                    .await?;
                Ok(json!({ "removed": removed, "rows": self.host_policy.list() }))
            }
            BackendTopic::PolicyCheck => {
                let p: PolicyCheckParams = parse_params(topic, params)?;
                let verdict = self.host_policy.verdict(&p.host, &p.policy_type, p.kind);
                Ok(json!({ "verdict": verdict }))
            }
            BackendTopic::PromptList => Ok(serde_json::to_value(self.arbiter.list_prompts())?),
            BackendTopic::PromptResolve => {
                let p: PromptResolveParams = parse_params(topic, params)?;
                self.arbiter
                    .resolve_prompt(&p.id, p.approve, p.delta)
                    .await?;
                Ok(json!({ "resolved": p.id }))
            }
            BackendTopic::LogFetch => {
                let p: LogFetchParams = match params {
                    Some(Value::Null) | None => LogFetchParams::default(),
                    some => parse_params(topic, some)?,
                };
                let limit = p.limit.unwrap_or(DEFAULT_LOG_LIMIT);
                let entries: Vec<AuditEntry> = {
                    let audit = self.audit.lock();
                    match &p.app_pubkey {
                        Some(app) => audit
                            .recent(usize::MAX)
                            .filter(|e| &e.app_pubkey == app)
                            .take(limit)
                            .cloned()
                            .collect(),
                        None => audit.recent(limit).cloned().collect(),
                    }
                };
                Ok(serde_json::to_value(entries)?)
            }
            BackendTopic::NodePeers => Ok(serde_json::to_value(self.capability.peers().await)?),
        }
    }
}

struct BackendRouter {
    state: Weak<AgentState>,
}

#[async_trait]
impl RequestHandler for BackendRouter {
    async fn handle(&self, domain: &str, topic: &str, params: Option<Value>) -> Result<Value> {
        let state = self
            .state
            .upgrade()
            .ok_or(KeepError::TransportUnavailable)?;
        let topic = BackendTopic::parse(domain, topic)?;
        state.dispatch(topic, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_parse() {
        assert_eq!(
            BackendTopic::parse("settings", "settings.fetch").unwrap(),
            BackendTopic::SettingsFetch
        );
        assert_eq!(BackendTopic::LogFetch.domain(), "log");
        assert!(matches!(
            BackendTopic::parse("settings", "session.list"),
            Err(KeepError::Protocol(_))
        ));
        assert!(matches!(
            BackendTopic::parse("settings", "settings.explode"),
            Err(KeepError::Protocol(_))
        ));
        for topic in BackendTopic::ALL {
            assert_eq!(
                BackendTopic::parse(topic.domain(), topic.as_str()).unwrap(),
                topic
            );
        }
    }

    #[test]
    fn test_node_event_wire_format() {
        assert_eq!(
            serde_json::to_value(NodeEvent::Reset(NodeReset::Reconnect)).unwrap(),
            json!({"type": "reset", "detail": "reconnect"})
        );
        assert_eq!(
            serde_json::to_value(NodeEvent::Ready).unwrap(),
            json!({"type": "ready"})
        );
    }

    #[test]
    fn test_session_update_params() {
        let p: SessionUpdateParams = serde_json::from_value(json!({
            "pubkey": "ab",
            "patch": {"policy": {"kinds": {"1": true}}}
        }))
        .unwrap();
        assert_eq!(p.patch.policy.unwrap().kinds.get(&1), Some(&true));
        assert!(p.patch.relays.is_none());
    }

    #[test]
    fn test_missing_params_is_protocol_error() {
        let err = parse_params::<SessionRevokeParams>(BackendTopic::SessionRevoke, None)
            .unwrap_err();
        assert!(matches!(err, KeepError::Protocol(_)));
        let err = parse_params::<SessionRevokeParams>(
            BackendTopic::SessionRevoke,
            Some(json!({"nope": 1})),
        )
        .unwrap_err();
        assert!(matches!(err, KeepError::Protocol(_)));
    }
}

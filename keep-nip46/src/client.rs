// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use keep_bridge::{Filter, MessageBus, StoreMap, Subscription};
use nostr_sdk::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::agent::{
    BackendTopic, LogFetchParams, PolicyAddParams, PolicyCheckParams, PolicyRevokeParams,
    PromptResolveParams, SessionRegisterParams, SessionRevokeParams, SessionUpdateParams,
    NODE_DOMAIN,
};
use crate::audit::AuditEntry;
use crate::capability::PeerInfo;
use crate::error::Result;
use crate::handler::PromptView;
use crate::host_policy::{Accept, HostPolicyRow};
use crate::policy::PolicyDelta;
use crate::session::{Session, SessionList, SessionPatch};
use crate::settings::AgentSettings;

/// UI-side handle on the backend. Every call is one request/response round
/// trip over the bus.
#[derive(Clone)]
pub struct SignerClient {
    bus: MessageBus,
}

impl SignerClient {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    async fn call<R: DeserializeOwned>(
        &self,
        topic: BackendTopic,
        params: Option<Value>,
    ) -> Result<R> {
        let result = self
            .bus
            .send_request(topic.domain(), topic.as_str(), params)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn call_with<P: Serialize, R: DeserializeOwned>(
        &self,
        topic: BackendTopic,
        params: &P,
    ) -> Result<R> {
        self.call(topic, Some(serde_json::to_value(params)?)).await
    }

    pub async fn fetch_settings(&self) -> Result<AgentSettings> {
        self.call(BackendTopic::SettingsFetch, None).await
    }

    pub async fn update_settings(&self, partial: StoreMap) -> Result<AgentSettings> {
        self.call(BackendTopic::SettingsUpdate, Some(Value::Object(partial)))
            .await
    }

    pub async fn reset_settings(&self) -> Result<AgentSettings> {
        self.call(BackendTopic::SettingsReset, None).await
    }

    pub async fn list_sessions(&self) -> Result<SessionList> {
        self.call(BackendTopic::SessionList, None).await
    }

    pub async fn register_session(&self, invite: &str) -> Result<Session> {
        let params = SessionRegisterParams {
            invite: invite.to_string(),
        };
        self.call_with(BackendTopic::SessionRegister, &params).await
    }

    pub async fn update_session(&self, pubkey: &PublicKey, patch: SessionPatch) -> Result<Session> {
        let params = SessionUpdateParams {
            pubkey: pubkey.to_hex(),
            patch,
        };
        self.call_with(BackendTopic::SessionUpdate, &params).await
    }

    pub async fn revoke_session(&self, pubkey: &PublicKey) -> Result<Session> {
        let params = SessionRevokeParams {
            pubkey: pubkey.to_hex(),
        };
        self.call_with(BackendTopic::SessionRevoke, &params).await
    }

    pub async fn list_policies(&self) -> Result<Vec<HostPolicyRow>> {
        self.call(BackendTopic::PolicyList, None).await
    }

    pub async fn add_policy(&self, params: PolicyAddParams) -> Result<Vec<HostPolicyRow>> {
        self.call_with(BackendTopic::PolicyAdd, &params).await
    }

    /// Returns how many rows were removed.
    pub async fn revoke_policy(
        &self,
        host: &str,
        policy_type: &str,
        accept: Accept,
    ) -> Result<usize> {
        let params = PolicyRevokeParams {
            host: host.to_string(),
            policy_type: policy_type.to_string(),
            accept,
        };
        let result: Value = self.call_with(BackendTopic::PolicyRevoke, &params).await?;
        Ok(serde_json::from_value(result["removed"].clone())?)
    }

    /// The standing host/type rule for a request, `None` when no row matches.
    pub async fn check_policy(
        &self,
        host: &str,
        policy_type: &str,
        kind: Option<u16>,
    ) -> Result<Option<bool>> {
        let params = PolicyCheckParams {
            host: host.to_string(),
            policy_type: policy_type.to_string(),
            kind,
        };
        let result: Value = self.call_with(BackendTopic::PolicyCheck, &params).await?;
        Ok(serde_json::from_value(result["verdict"].clone())?)
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptView>> {
        self.call(BackendTopic::PromptList, None).await
    }

    pub async fn resolve_prompt(
        &self,
        id: &str,
        approve: bool,
        delta: Option<PolicyDelta>,
    ) -> Result<()> {
        let params = PromptResolveParams {
            id: id.to_string(),
            approve,
            delta,
        };
        let _: Value = self.call_with(BackendTopic::PromptResolve, &params).await?;
        Ok(())
    }

    pub async fn fetch_log(
        &self,
        limit: usize,
        app_pubkey: Option<&PublicKey>,
    ) -> Result<Vec<AuditEntry>> {
        let params = LogFetchParams {
            limit: Some(limit),
            app_pubkey: app_pubkey.map(|pk| pk.to_hex()),
        };
        self.call_with(BackendTopic::LogFetch, &params).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>> {
        self.call(BackendTopic::NodePeers, Some(json!({}))).await
    }

    /// Lifecycle events of the signing node.
    pub fn node_events(&self) -> Subscription {
        self.bus.subscribe(Filter::events().domain(NODE_DOMAIN))
    }

    /// Every event the backend publishes under `domain`.
    pub fn events(&self, domain: &str) -> Subscription {
        self.bus.subscribe(Filter::events().domain(domain))
    }
}

// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::session::{Session, SessionStatus};
use crate::types::METHOD_SIGN_EVENT;

/// Standing allow/deny rules for one counterpart. A missing key means
/// "no rule": the request is prompted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    #[serde(default)]
    pub methods: BTreeMap<String, bool>,
    #[serde(default)]
    pub kinds: BTreeMap<u16, bool>,
}

/// A policy fragment merged into a session's policy entry by entry.
pub type PolicyDelta = PermissionPolicy;

impl PermissionPolicy {
    pub fn allow_method(mut self, method: &str) -> Self {
        self.methods.insert(method.to_string(), true);
        self
    }

    pub fn deny_method(mut self, method: &str) -> Self {
        self.methods.insert(method.to_string(), false);
        self
    }

    pub fn allow_kind(mut self, kind: u16) -> Self {
        self.kinds.insert(kind, true);
        self
    }

    pub fn deny_kind(mut self, kind: u16) -> Self {
        self.kinds.insert(kind, false);
        self
    }

    /// Last write wins per entry; entries the delta doesn't name are kept.
    pub fn merge(&mut self, delta: &PolicyDelta) {
        for (method, allowed) in &delta.methods {
            self.methods.insert(method.clone(), *allowed);
        }
        for (kind, allowed) in &delta.kinds {
            self.kinds.insert(*kind, *allowed);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty() && self.kinds.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny(String),
    Prompt,
}

impl Verdict {
    fn deny(reason: &str) -> Self {
        Verdict::Deny(reason.to_string())
    }
}

#[derive(Deserialize)]
struct KindOnly {
    kind: u16,
}

/// Kind of the event carried as the first `sign_event` parameter.
pub fn event_kind(params: &[String]) -> Option<u16> {
    let json = params.first()?;
    serde_json::from_str::<KindOnly>(json).ok().map(|e| e.kind)
}

/// Decides whether a request runs, is refused, or waits for the user.
///
/// An explicit `false` always beats a missing entry. Outside `sign_event` the
/// method entry is final. For `sign_event` a method-level `true` allows every
/// kind not explicitly denied, and a missing method entry defers to `kinds`.
pub fn evaluate(
    session: Option<&Session>,
    method: &str,
    params: &[String],
    supported_methods: &[String],
) -> Verdict {
    let session = match session {
        Some(s) if s.status != SessionStatus::Revoked => s,
        Some(_) => return Verdict::deny("session revoked"),
        None => return Verdict::deny("unknown session"),
    };

    if !supported_methods.iter().any(|m| m == method) {
        return Verdict::deny("unsupported method");
    }

    let policy = &session.policy;
    let method_rule = policy.methods.get(method).copied();

    if method != METHOD_SIGN_EVENT {
        return match method_rule {
            Some(true) => Verdict::Allow,
            Some(false) => Verdict::deny("method denied by policy"),
            None => Verdict::Prompt,
        };
    }

    if method_rule == Some(false) {
        return Verdict::deny("method denied by policy");
    }

    let Some(kind) = event_kind(params) else {
        return Verdict::deny("invalid event");
    };

    match (policy.kinds.get(&kind).copied(), method_rule) {
        (Some(false), _) => Verdict::Deny(format!("kind {kind} denied by policy")),
        (Some(true), _) | (None, Some(true)) => Verdict::Allow,
        (None, _) => Verdict::Prompt,
    }
}

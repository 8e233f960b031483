// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use keep_core::{KeepError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A fresh 128-bit correlation id, rendered as 32 lowercase hex chars.
pub fn new_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Request,
    Response,
    Event,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Request(RequestPayload),
    Response(ResponsePayload),
    Event(EventPayload),
}

impl Envelope {
    pub fn request(domain: &str, topic: &str, params: Option<Value>) -> Self {
        Envelope::Request(RequestPayload {
            id: new_id(),
            domain: domain.to_string(),
            topic: topic.to_string(),
            params,
        })
    }

    pub fn event(domain: &str, topic: &str, payload: Value) -> Self {
        Envelope::Event(EventPayload {
            id: new_id(),
            domain: domain.to_string(),
            topic: topic.to_string(),
            payload,
        })
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Request(_) => EnvelopeKind::Request,
            Envelope::Response(_) => EnvelopeKind::Response,
            Envelope::Event(_) => EnvelopeKind::Event,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Envelope::Request(p) => &p.id,
            Envelope::Response(p) => &p.id,
            Envelope::Event(p) => &p.id,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            Envelope::Request(p) => Some(&p.domain),
            Envelope::Event(p) => Some(&p.domain),
            Envelope::Response(_) => None,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            Envelope::Request(p) => Some(&p.topic),
            Envelope::Event(p) => Some(&p.topic),
            Envelope::Response(_) => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses and structurally validates a wire message.
    pub fn from_json(json: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(json)
            .map_err(|e| KeepError::protocol(format!("malformed envelope: {e}")))?;
        if envelope.id().is_empty() {
            return Err(KeepError::protocol("empty envelope id"));
        }
        if let Envelope::Response(response) = &envelope {
            response.validate()?;
        }
        Ok(envelope)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RequestPayload {
    pub id: String,
    pub domain: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResponsePayload {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsePayload {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match (self.ok, &self.error) {
            (true, Some(_)) => Err(KeepError::protocol("ok response carries an error")),
            (false, None) => Err(KeepError::protocol("failed response without an error")),
            _ => Ok(()),
        }
    }

    pub fn into_result(self) -> Result<Value> {
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(KeepError::Remote(self.error.unwrap_or_default()))
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventPayload {
    pub id: String,
    pub domain: String,
    pub topic: String,
    pub payload: Value,
}

/// Subscription filter. Every field that is set must equal the envelope's.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    pub kind: Option<EnvelopeKind>,
    pub domain: Option<String>,
    pub topic: Option<String>,
}

impl Filter {
    /// Matches every event.
    pub fn events() -> Self {
        Self {
            kind: Some(EnvelopeKind::Event),
            ..Default::default()
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        // Responses are correlated, never broadcast.
        if envelope.kind() == EnvelopeKind::Response {
            return false;
        }
        if self.kind.is_some_and(|k| k != envelope.kind()) {
            return false;
        }
        if let Some(domain) = &self.domain {
            if envelope.domain() != Some(domain.as_str()) {
                return false;
            }
        }
        if let Some(topic) = &self.topic {
            if envelope.topic() != Some(topic.as_str()) {
                return false;
            }
        }
        true
    }
}

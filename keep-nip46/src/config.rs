// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::time::Duration;

use keep_bridge::BusConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bus: BusConfig,
    pub audit_log_capacity: usize,
    pub max_pending_prompts: usize,
    pub prompt_expiry_secs: u64,
    pub prompt_sweep_interval_secs: u64,
    pub max_event_json_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            audit_log_capacity: 1000,
            max_pending_prompts: 32,
            prompt_expiry_secs: 300,
            prompt_sweep_interval_secs: 5,
            max_event_json_size: 64 * 1024,
        }
    }
}

impl AgentConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.bus = self.bus.with_request_timeout(timeout);
        self
    }

    pub fn with_audit_log_capacity(mut self, capacity: usize) -> Self {
        self.audit_log_capacity = capacity;
        self
    }

    pub fn with_max_pending_prompts(mut self, max: usize) -> Self {
        self.max_pending_prompts = max;
        self
    }

    pub fn with_prompt_expiry(mut self, expiry: Duration) -> Self {
        self.prompt_expiry_secs = expiry.as_secs();
        self
    }

    pub fn with_max_event_json_size(mut self, size: usize) -> Self {
        self.max_event_json_size = size;
        self
    }

    pub fn prompt_expiry(&self) -> Duration {
        Duration::from_secs(self.prompt_expiry_secs)
    }

    pub fn prompt_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.prompt_sweep_interval_secs.max(1))
    }
}

// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

//! The UI-facing signer permission table, keyed by host and request type.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use keep_bridge::{StoreController, StoreMap, StoreRecord};
use keep_core::error::KeepError;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

const MAX_HOST_LENGTH: usize = 253;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Accept {
    #[serde(rename = "true")]
    Allow,
    #[serde(rename = "false")]
    Deny,
}

impl Accept {
    pub fn reverse(self) -> Self {
        match self {
            Accept::Allow => Accept::Deny,
            Accept::Deny => Accept::Allow,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    #[serde(default)]
    pub kinds: BTreeMap<u16, bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPolicyRow {
    pub host: String,
    #[serde(rename = "type")]
    pub policy_type: String,
    pub accept: Accept,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,
    pub created_at: i64,
}

impl HostPolicyRow {
    pub fn new(host: impl Into<String>, policy_type: impl Into<String>, accept: Accept) -> Self {
        Self {
            host: host.into(),
            policy_type: policy_type.into(),
            accept,
            conditions: None,
            created_at: Utc::now().timestamp(),
        }
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.conditions = Some(Conditions {
            kinds: kinds.into_iter().map(|k| (k, true)).collect(),
        });
        self
    }

    fn is_for(&self, host: &str, policy_type: &str) -> bool {
        self.host == host && self.policy_type == policy_type
    }

    fn applies_to(&self, kind: Option<u16>) -> bool {
        match (&self.conditions, kind) {
            (None, _) => true,
            (Some(c), _) if c.kinds.is_empty() => true,
            (Some(c), Some(kind)) => c.kinds.get(&kind).copied().unwrap_or(false),
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPolicyBook {
    pub rows: Vec<HostPolicyRow>,
}

impl StoreRecord for HostPolicyBook {
    const STORE_KEY: &'static str = "signer_permissions";

    fn defaults() -> Self {
        Self::default()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = HashSet::new();
        for row in &self.rows {
            if row.host.is_empty() || row.host.len() > MAX_HOST_LENGTH {
                return Err(format!("invalid host: {:?}", row.host));
            }
            if row.policy_type.is_empty() {
                return Err("empty policy type".into());
            }
            if !seen.insert((&row.host, &row.policy_type, row.accept)) {
                return Err(format!(
                    "duplicate rule for {} / {}",
                    row.host, row.policy_type
                ));
            }
        }
        Ok(())
    }
}

pub struct HostPolicyTable {
    store: Arc<StoreController<HostPolicyBook>>,
    lock: tokio::sync::Mutex<()>,
}

impl HostPolicyTable {
    pub fn new(store: Arc<StoreController<HostPolicyBook>>) -> Self {
        Self {
            store,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Newest first.
    pub fn list(&self) -> Vec<HostPolicyRow> {
        let mut rows = self.store.snapshot().unwrap_or_default().rows;
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }

    /// Adds a rule. The opposite rule for the same host and type goes away,
    /// and an identical rule is replaced.
    pub async fn add(&self, row: HostPolicyRow) -> Result<Vec<HostPolicyRow>> {
        let _guard = self.lock.lock().await;
        let mut book = self.book()?;
        let before = book.rows.len();
        book.rows
            .retain(|r| !r.is_for(&row.host, &row.policy_type));
        debug!(
            host = %row.host,
            policy_type = %row.policy_type,
            replaced = before - book.rows.len(),
            "adding host rule"
        );
        book.rows.push(row);
        self.commit(book).await?;
        Ok(self.list())
    }

    /// Removes every row matching the triple and nothing else.
    pub async fn revoke(&self, host: &str, policy_type: &str, accept: Accept) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut book = self.book()?;
        let before = book.rows.len();
        book.rows
            .retain(|r| !(r.is_for(host, policy_type) && r.accept == accept));
        let removed = before - book.rows.len();
        if removed > 0 {
            self.commit(book).await?;
        }
        Ok(removed)
    }

    /// `Some(false)` if any matching rule denies, `Some(true)` if one allows.
    pub fn verdict(&self, host: &str, policy_type: &str, kind: Option<u16>) -> Option<bool> {
        let book = self.store.snapshot()?;
        let mut allowed = None;
        for row in book
            .rows
            .iter()
            .filter(|r| r.is_for(host, policy_type) && r.applies_to(kind))
        {
            match row.accept {
                Accept::Deny => return Some(false),
                Accept::Allow => allowed = Some(true),
            }
        }
        allowed
    }

    fn book(&self) -> Result<HostPolicyBook> {
        self.store
            .snapshot()
            .ok_or_else(|| KeepError::storage("signer permissions not initialized"))
    }

    async fn commit(&self, book: HostPolicyBook) -> Result<()> {
        let mut partial = StoreMap::new();
        partial.insert("rows".into(), serde_json::to_value(&book.rows)?);
        self.store.update(partial).await?;
        Ok(())
    }
}

// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use keep_core::{KeepError, Result};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::bus::MessageBus;

pub type StoreMap = Map<String, Value>;

/// Key-value persistence addressed by `(store_key, key)`.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Opens the store at schema `version` and returns the version found.
    /// The upgrade hook runs once when the persisted version is older.
    async fn open(&self, version: u32) -> Result<u32>;

    async fn get_all(&self, store_key: &str) -> Result<StoreMap>;

    async fn put(&self, store_key: &str, key: &str, value: Value) -> Result<()>;

    /// Writes every entry or none of them.
    async fn put_all(&self, store_key: &str, entries: StoreMap) -> Result<()> {
        for (key, value) in entries {
            self.put(store_key, &key, value).await?;
        }
        Ok(())
    }

    async fn delete(&self, store_key: &str, key: &str) -> Result<()>;
}

/// `(from_version, to_version, data)`.
pub type UpgradeHook =
    Box<dyn Fn(u32, u32, &mut HashMap<String, StoreMap>) -> Result<()> + Send + Sync>;

#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, StoreMap>>,
    version: Mutex<u32>,
    upgrade: Option<UpgradeHook>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upgrade(hook: UpgradeHook) -> Self {
        Self {
            upgrade: Some(hook),
            ..Default::default()
        }
    }

    /// Replaces the contents of `store_key` without going through a controller.
    pub fn seed(&self, store_key: &str, entries: StoreMap) {
        self.data.write().insert(store_key.to_string(), entries);
    }

    pub fn version(&self) -> u32 {
        *self.version.lock()
    }

    /// Makes every subsequent write fail, for exercising error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KeepError::storage("write rejected"));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn open(&self, version: u32) -> Result<u32> {
        let mut current = self.version.lock();
        let previous = *current;
        if version < previous {
            return Err(KeepError::storage(format!(
                "store is at version {previous}, cannot open at {version}"
            )));
        }
        if version > previous {
            if let Some(hook) = &self.upgrade {
                hook(previous, version, &mut *self.data.write())?;
            }
            info!(from = previous, to = version, "Store upgraded");
            *current = version;
        }
        Ok(previous)
    }

    async fn get_all(&self, store_key: &str) -> Result<StoreMap> {
        Ok(self
            .data
            .read()
            .get(store_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn put(&self, store_key: &str, key: &str, value: Value) -> Result<()> {
        self.check_writable()?;
        self.data
            .write()
            .entry(store_key.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn put_all(&self, store_key: &str, entries: StoreMap) -> Result<()> {
        self.check_writable()?;
        let mut data = self.data.write();
        let record = data.entry(store_key.to_string()).or_default();
        for (key, value) in entries {
            record.insert(key, value);
        }
        Ok(())
    }

    async fn delete(&self, store_key: &str, key: &str) -> Result<()> {
        self.check_writable()?;
        if let Some(record) = self.data.write().get_mut(store_key) {
            record.remove(key);
        }
        Ok(())
    }
}

/// A persisted domain object whose top-level fields are store keys.
pub trait StoreRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const STORE_KEY: &'static str;

    fn defaults() -> Self;

    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// A transform applied to every update, in registration order.
pub trait Middleware<T>: Send + Sync {
    fn apply(&self, previous: &T, next: T) -> Result<T>;
}

impl<T, F> Middleware<T> for F
where
    F: Fn(&T, T) -> Result<T> + Send + Sync,
{
    fn apply(&self, previous: &T, next: T) -> Result<T> {
        self(previous, next)
    }
}

fn to_object<T: Serialize>(record: &T) -> Result<StoreMap> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        _ => Err(KeepError::validation("record must serialize to an object")),
    }
}

fn from_object<T: DeserializeOwned>(map: StoreMap) -> Result<T> {
    serde_json::from_value(Value::Object(map)).map_err(|e| KeepError::validation(e.to_string()))
}

/// Owns the in-memory mirror of one store record and keeps it in step with
/// the durable store.
pub struct StoreController<T: StoreRecord> {
    store: Arc<dyn DurableStore>,
    bus: Option<MessageBus>,
    mirror: RwLock<Option<T>>,
    middleware: RwLock<Vec<Arc<dyn Middleware<T>>>>,
}

impl<T: StoreRecord> StoreController<T> {
    pub fn new(store: Arc<dyn DurableStore>, bus: Option<MessageBus>) -> Self {
        Self {
            store,
            bus,
            mirror: RwLock::new(None),
            middleware: RwLock::new(Vec::new()),
        }
    }

    pub fn updated_topic() -> String {
        format!("{}.updated", T::STORE_KEY)
    }

    pub fn use_middleware(&self, middleware: impl Middleware<T> + 'static) {
        self.middleware.write().push(Arc::new(middleware));
    }

    /// Reconciles the persisted record against the defaults: missing keys are
    /// filled, keys the defaults don't know are deleted.
    pub async fn init(&self) -> Result<T> {
        let defaults = to_object(&T::defaults())?;
        let mut persisted = self.store.get_all(T::STORE_KEY).await?;

        let orphans: Vec<String> = persisted
            .keys()
            .filter(|k| !defaults.contains_key(*k))
            .cloned()
            .collect();
        let missing: StoreMap = defaults
            .iter()
            .filter(|(k, _)| !persisted.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if !missing.is_empty() {
            self.store.put_all(T::STORE_KEY, missing.clone()).await?;
        }
        for key in &orphans {
            self.store.delete(T::STORE_KEY, key).await?;
            persisted.remove(key);
        }
        persisted.extend(missing);

        debug!(
            store = T::STORE_KEY,
            removed = orphans.len(),
            "Store reconciled"
        );

        let record = match from_object::<T>(persisted) {
            Ok(record) if record.validate().is_ok() => record,
            Ok(_) | Err(_) => {
                warn!(
                    store = T::STORE_KEY,
                    "Persisted record unreadable, restoring defaults"
                );
                let record = T::defaults();
                self.store.put_all(T::STORE_KEY, defaults).await?;
                record
            }
        };

        *self.mirror.write() = Some(record.clone());
        Ok(record)
    }

    /// Reads the record back from the durable store.
    pub async fn fetch(&self) -> Result<T> {
        if self.mirror.read().is_none() {
            return Err(KeepError::storage("not initialized"));
        }
        let record: T = from_object(self.store.get_all(T::STORE_KEY).await?)?;
        *self.mirror.write() = Some(record.clone());
        Ok(record)
    }

    /// Shallow-merges `partial` into the current record. Nothing is written
    /// unless middleware and validation both pass.
    pub async fn update(&self, partial: StoreMap) -> Result<T> {
        let current = self.current()?;
        let mut merged = to_object(&current)?;
        for (key, value) in partial {
            if !merged.contains_key(&key) {
                return Err(KeepError::validation(format!("unknown field: {key}")));
            }
            merged.insert(key, value);
        }

        let mut next: T = from_object(merged)?;
        let chain: Vec<Arc<dyn Middleware<T>>> = self.middleware.read().clone();
        for middleware in chain {
            next = middleware.apply(&current, next)?;
        }
        next.validate().map_err(KeepError::Validation)?;

        self.store.put_all(T::STORE_KEY, to_object(&next)?).await?;
        *self.mirror.write() = Some(next.clone());
        self.broadcast(&next);
        Ok(next)
    }

    /// Overwrites the record with its defaults.
    pub async fn reset(&self) -> Result<T> {
        let defaults = T::defaults();
        self.store
            .put_all(T::STORE_KEY, to_object(&defaults)?)
            .await?;
        *self.mirror.write() = Some(defaults.clone());
        self.broadcast(&defaults);
        Ok(defaults)
    }

    /// The in-memory mirror, without touching the durable store.
    pub fn snapshot(&self) -> Option<T> {
        self.mirror.read().clone()
    }

    fn current(&self) -> Result<T> {
        self.mirror
            .read()
            .clone()
            .ok_or_else(|| KeepError::storage("not initialized"))
    }

    fn broadcast(&self, record: &T) {
        let Some(bus) = &self.bus else { return };
        match serde_json::to_value(record) {
            Ok(payload) => bus.publish_event(T::STORE_KEY, &Self::updated_topic(), payload),
            Err(e) => warn!(store = T::STORE_KEY, error = %e, "Could not encode store event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, Filter};
    use crate::link::Link;
    use crate::BusConfig;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Counters {
        a: i64,
        b: i64,
    }

    impl StoreRecord for Counters {
        const STORE_KEY: &'static str = "counters";

        fn defaults() -> Self {
            Self { a: 1, b: 2 }
        }

        fn validate(&self) -> std::result::Result<(), String> {
            if self.a < 0 {
                return Err("a must be non-negative".into());
            }
            Ok(())
        }
    }

    fn object(value: Value) -> StoreMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn controller() -> (Arc<MemoryStore>, StoreController<Counters>) {
        let store = Arc::new(MemoryStore::new());
        let ctl = StoreController::<Counters>::new(store.clone(), None);
        ctl.init().await.unwrap();
        (store, ctl)
    }

    #[tokio::test]
    async fn test_init_fills_missing_and_removes_orphans() {
        let store = Arc::new(MemoryStore::new());
        store.seed("counters", object(json!({"b": 5, "c": 9})));
        let ctl = StoreController::<Counters>::new(store.clone(), None);

        let record = ctl.init().await.unwrap();
        assert_eq!(record, Counters { a: 1, b: 5 });
        assert_eq!(
            store.get_all("counters").await.unwrap(),
            object(json!({"a": 1, "b": 5}))
        );
    }

    #[tokio::test]
    async fn test_init_restores_defaults_for_unreadable_record() {
        let store = Arc::new(MemoryStore::new());
        store.seed("counters", object(json!({"a": "one", "b": 2})));
        let ctl = StoreController::<Counters>::new(store.clone(), None);

        assert_eq!(ctl.init().await.unwrap(), Counters::defaults());
        assert_eq!(ctl.fetch().await.unwrap(), Counters::defaults());
    }

    #[tokio::test]
    async fn test_fetch_before_init_fails() {
        let ctl = StoreController::<Counters>::new(Arc::new(MemoryStore::new()), None);
        assert!(matches!(ctl.fetch().await, Err(KeepError::Storage(_))));
        assert!(matches!(
            ctl.update(StoreMap::new()).await,
            Err(KeepError::Storage(_))
        ));
        assert!(ctl.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_fetch_refreshes_from_store() {
        let (store, ctl) = controller().await;
        store.put("counters", "b", json!(40)).await.unwrap();
        assert_eq!(ctl.snapshot().unwrap().b, 2);
        assert_eq!(ctl.fetch().await.unwrap().b, 40);
        assert_eq!(ctl.snapshot().unwrap().b, 40);
    }

    #[tokio::test]
    async fn test_update_merges_and_persists() {
        let (store, ctl) = controller().await;
        let next = ctl.update(object(json!({"b": 7}))).await.unwrap();
        assert_eq!(next, Counters { a: 1, b: 7 });
        assert_eq!(
            store.get_all("counters").await.unwrap(),
            object(json!({"a": 1, "b": 7}))
        );
    }

    #[tokio::test]
    async fn test_failed_update_leaves_state_unchanged() {
        let (store, ctl) = controller().await;
        let before = store.get_all("counters").await.unwrap();

        let err = ctl.update(object(json!({"a": -1}))).await.unwrap_err();
        assert!(matches!(err, KeepError::Validation(_)));
        let err = ctl.update(object(json!({"b": "x"}))).await.unwrap_err();
        assert!(matches!(err, KeepError::Validation(_)));
        let err = ctl.update(object(json!({"z": 1}))).await.unwrap_err();
        assert!(matches!(err, KeepError::Validation(_)));

        store.set_fail_writes(true);
        assert!(ctl.update(object(json!({"b": 3}))).await.is_err());
        store.set_fail_writes(false);

        assert_eq!(ctl.snapshot().unwrap(), Counters::defaults());
        assert_eq!(store.get_all("counters").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_middleware_runs_in_order() {
        let (_store, ctl) = controller().await;
        ctl.use_middleware(|_prev: &Counters, mut next: Counters| -> Result<Counters> {
            next.b += 10;
            Ok(next)
        });
        ctl.use_middleware(|prev: &Counters, mut next: Counters| -> Result<Counters> {
            next.a = prev.a + next.b;
            Ok(next)
        });

        let next = ctl.update(object(json!({"b": 1}))).await.unwrap();
        assert_eq!(next, Counters { a: 12, b: 11 });
    }

    #[tokio::test]
    async fn test_middleware_can_abort() {
        let (_store, ctl) = controller().await;
        ctl.use_middleware(|_prev: &Counters, _next: Counters| -> Result<Counters> {
            Err(KeepError::validation("frozen"))
        });
        assert!(ctl.update(object(json!({"b": 1}))).await.is_err());
        assert_eq!(ctl.snapshot().unwrap(), Counters::defaults());
    }

    #[tokio::test]
    async fn test_update_and_reset_broadcast_snapshot() {
        let (link, _peer) = Link::pair();
        let bus = MessageBus::spawn(link, BusConfig::default());
        let mut sub = bus.subscribe(Filter::events().topic("counters.updated"));

        let ctl = StoreController::<Counters>::new(Arc::new(MemoryStore::new()), Some(bus));
        ctl.init().await.unwrap();
        ctl.update(object(json!({"a": 4}))).await.unwrap();
        ctl.reset().await.unwrap();

        let Some(Envelope::Event(first)) = sub.recv().await else {
            panic!("expected event");
        };
        assert_eq!(first.domain, "counters");
        assert_eq!(first.payload, json!({"a": 4, "b": 2}));
        let Some(Envelope::Event(second)) = sub.recv().await else {
            panic!("expected event");
        };
        assert_eq!(second.payload, json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn test_open_runs_upgrade_once() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let seen = runs.clone();
        let store = MemoryStore::with_upgrade(Box::new(move |from: u32, to: u32, data: &mut HashMap<String, StoreMap>| {
            seen.lock().push((from, to));
            data.entry("counters".into())
                .or_default()
                .insert("a".into(), json!(99));
            Ok(())
        }));

        assert_eq!(store.open(1).await.unwrap(), 0);
        assert_eq!(store.open(1).await.unwrap(), 1);
        assert_eq!(store.version(), 1);
        assert_eq!(*runs.lock(), vec![(0, 1)]);
        assert_eq!(store.get_all("counters").await.unwrap()["a"], json!(99));
        assert!(store.open(0).await.is_err());
    }
}

use super::{Backend, ChangeFeed, FeedScope, Order, Predicate, Query, SubscriptionId};
use crate::content::{ChangeEvent, Profile};
use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

#[derive(Default)]
struct Store {
    tables: HashMap<String, Vec<Value>>,
    subscribers: HashMap<u64, (FeedScope, UnboundedSender<Value>)>,
    next_subscription: u64,
    user: Option<Uuid>,
    offline: bool,
    profile_lookups: HashMap<Uuid, usize>,
    select_calls: usize,
    subscribe_calls: usize,
    unsubscribe_calls: usize,
}

/// In-process store with the same surface as the hosted backend. Writes are
/// echoed to matching subscribers as change events.
#[derive(Default)]
pub struct MemoryBackend {
    store: Mutex<Store>,
    select_gate: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sign_in_as(&self, user: Uuid) {
        self.store().user = Some(user);
    }

    pub fn set_offline(&self, offline: bool) {
        self.store().offline = offline;
    }

    /// Loads rows without emitting change events.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        self.store()
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.store().tables.get(table).cloned().unwrap_or_default()
    }

    /// Delivers an arbitrary payload to every subscriber of `table`, bypassing
    /// row filters.
    pub fn emit_raw(&self, table: &str, payload: Value) {
        let store = self.store();
        for (scope, tx) in store.subscribers.values() {
            if scope.table == table {
                let _ = tx.send(payload.clone());
            }
        }
    }

    /// Makes every `select` wait until the returned guard is dropped.
    pub fn hold_selects(&self) -> Option<OwnedMutexGuard<()>> {
        self.select_gate.clone().try_lock_owned().ok()
    }

    pub fn profile_lookups(&self, user: Uuid) -> usize {
        self.store().profile_lookups.get(&user).copied().unwrap_or(0)
    }

    pub fn total_profile_lookups(&self) -> usize {
        self.store().profile_lookups.values().sum()
    }

    pub fn select_calls(&self) -> usize {
        self.store().select_calls
    }

    pub fn subscribe_calls(&self) -> usize {
        self.store().subscribe_calls
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.store().unsubscribe_calls
    }

    pub fn active_subscriptions(&self) -> usize {
        self.store().subscribers.len()
    }

    fn check_online(store: &Store) -> Result<(), BackendError> {
        if store.offline {
            return Err(BackendError::Unavailable("offline".to_string()));
        }
        Ok(())
    }

    fn broadcast(store: &Store, table: &str, event: ChangeEvent) {
        let image = event
            .new
            .as_ref()
            .filter(|row| row.as_object().is_some_and(|o| !o.is_empty()))
            .or(event.old.as_ref())
            .cloned()
            .unwrap_or(Value::Null);
        let payload = event.to_value();
        for (scope, tx) in store.subscribers.values() {
            if scope.matches(table, &image) {
                let _ = tx.send(payload.clone());
            }
        }
    }
}

fn row_id(row: &Value) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    if let (Some(ta), Some(tb)) = (as_timestamp(a), as_timestamp(b)) {
        return ta.cmp(&tb);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn string_items(value: Option<&Value>) -> Vec<&str> {
    value
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn matches(row: &Value, predicate: &Predicate) -> bool {
    let null = Value::Null;
    match predicate {
        Predicate::Eq(column, expected) => row.get(column).unwrap_or(&null) == expected,
        Predicate::In(column, allowed) => {
            let value = row.get(column).unwrap_or(&null);
            allowed.iter().any(|a| a == value)
        }
        Predicate::Contains(column, wanted) => {
            let present = string_items(row.get(column));
            wanted.iter().all(|w| present.contains(&w.as_str()))
        }
        Predicate::Overlaps(column, wanted) => {
            let present = string_items(row.get(column));
            wanted.iter().any(|w| present.contains(&w.as_str()))
        }
        Predicate::Gte(column, bound) => row
            .get(column)
            .is_some_and(|v| compare_values(v, bound) != Ordering::Less),
        Predicate::Lte(column, bound) => row
            .get(column)
            .is_some_and(|v| compare_values(v, bound) != Ordering::Greater),
        Predicate::IsNot(column, value) => row.get(column).and_then(Value::as_bool) != Some(*value),
        Predicate::After { cursor, descending } => {
            let ord = cursor
                .iter()
                .map(|(column, bound)| compare_values(row.get(column).unwrap_or(&null), bound))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal);
            ord == if *descending { Ordering::Less } else { Ordering::Greater }
        }
    }
}

fn compare_rows(a: &Value, b: &Value, order: &[Order]) -> Ordering {
    let null = Value::Null;
    for o in order {
        let ord = compare_values(
            a.get(&o.column).unwrap_or(&null),
            b.get(&o.column).unwrap_or(&null),
        );
        let ord = if o.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, BackendError> {
        let _gate = self.select_gate.lock().await;
        let mut store = self.store();
        Self::check_online(&store)?;
        store.select_calls += 1;

        let mut rows: Vec<Value> = store
            .tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.predicates.iter().all(|p| matches(row, p)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| compare_rows(a, b, &query.order));

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(query.offset).take(limit).collect())
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError> {
        let mut store = self.store();
        Self::check_online(&store)?;

        let Value::Object(mut fields) = row else {
            return Err(BackendError::Status {
                status: 400,
                body: "row must be an object".to_string(),
            });
        };
        fields
            .entry("id")
            .or_insert_with(|| json!(Uuid::new_v4()));
        fields
            .entry("created_at")
            .or_insert_with(|| json!(Utc::now()));
        let row = Value::Object(fields);

        store
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Self::broadcast(&store, table, ChangeEvent::insert(row.clone()));
        Ok(row)
    }

    async fn update(&self, table: &str, id: Uuid, patch: Value) -> Result<Value, BackendError> {
        let mut store = self.store();
        Self::check_online(&store)?;

        let id_str = id.to_string();
        let row = store
            .tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| row_id(r) == Some(id_str.as_str())))
            .ok_or_else(|| BackendError::NotFound(format!("{table}/{id}")))?;

        if let (Some(target), Value::Object(changes)) = (row.as_object_mut(), patch) {
            for (key, value) in changes {
                target.insert(key, value);
            }
        }
        let updated = row.clone();
        Self::broadcast(&store, table, ChangeEvent::update(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, table: &str, id: Uuid) -> Result<(), BackendError> {
        let mut store = self.store();
        Self::check_online(&store)?;

        let id_str = id.to_string();
        let removed = store
            .tables
            .get_mut(table)
            .and_then(|rows| {
                let pos = rows.iter().position(|r| row_id(r) == Some(id_str.as_str()))?;
                Some(rows.remove(pos))
            })
            .ok_or_else(|| BackendError::NotFound(format!("{table}/{id}")))?;

        let mut event = ChangeEvent::delete(id);
        event.new = Some(Value::Object(Map::new()));
        if let Some(old) = event.old.as_mut().and_then(Value::as_object_mut) {
            if let Some(fields) = removed.as_object() {
                for (key, value) in fields {
                    old.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        Self::broadcast(&store, table, event);
        Ok(())
    }

    async fn fetch_profile(&self, user_id: Uuid) -> Result<Option<Profile>, BackendError> {
        let profiles = {
            let mut store = self.store();
            *store.profile_lookups.entry(user_id).or_default() += 1;
            Self::check_online(&store)?;
            store
                .tables
                .get(crate::settings::settings().tables.profiles.as_str())
                .cloned()
                .unwrap_or_default()
        };
        let id_str = user_id.to_string();
        match profiles.into_iter().find(|r| row_id(r) == Some(id_str.as_str())) {
            Some(row) => Ok(Some(serde_json::from_value(row)?)),
            None => Ok(None),
        }
    }

    async fn subscribe(&self, scope: &FeedScope) -> Result<ChangeFeed, BackendError> {
        let mut store = self.store();
        Self::check_online(&store)?;
        store.subscribe_calls += 1;
        store.next_subscription += 1;
        let id = store.next_subscription;
        let (tx, rx) = unbounded_channel();
        store.subscribers.insert(id, (scope.clone(), tx));
        Ok(ChangeFeed {
            id: SubscriptionId(id),
            events: rx,
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut store = self.store();
        store.unsubscribe_calls += 1;
        store.subscribers.remove(&id.0);
    }

    fn current_user(&self) -> Option<Uuid> {
        self.store().user
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.store().user = None;
        Ok(())
    }
}

pub mod memory;
pub mod rest;

use crate::content::Profile;
use crate::error::BackendError;
use crate::settings::settings;
use crate::utils::logs;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

pub use memory::MemoryBackend;
pub use rest::RestBackend;

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    In(String, Vec<Value>),
    /// Array column holds every listed value.
    Contains(String, Vec<String>),
    /// Array column shares at least one listed value.
    Overlaps(String, Vec<String>),
    Gte(String, Value),
    Lte(String, Value),
    /// Boolean column is anything but `value`. Null passes.
    IsNot(String, bool),
    /// Row sorts strictly after `cursor`, compared column by column.
    After {
        cursor: Vec<(String, Value)>,
        descending: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub predicates: Vec<Predicate>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicates: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.predicates
            .push(Predicate::Eq(column.to_string(), value.into()));
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn filters(mut self, predicates: impl IntoIterator<Item = Predicate>) -> Self {
        self.predicates.extend(predicates);
        self
    }

    pub fn order_by(mut self, column: &str, descending: bool) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            descending,
        });
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

/// Which rows a change-feed subscription delivers: a table, optionally
/// narrowed to rows whose `column` equals `value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedScope {
    pub table: String,
    pub row_filter: Option<(String, String)>,
}

impl FeedScope {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            row_filter: None,
        }
    }

    pub fn with_row(mut self, column: &str, value: impl ToString) -> Self {
        self.row_filter = Some((column.to_string(), value.to_string()));
        self
    }

    pub fn matches(&self, table: &str, row: &Value) -> bool {
        if self.table != table {
            return false;
        }
        match &self.row_filter {
            None => true,
            Some((column, expected)) => match row.get(column) {
                Some(Value::String(s)) => s == expected,
                Some(Value::Null) | None => false,
                Some(other) => other.to_string() == *expected,
            },
        }
    }
}

impl std::fmt::Display for FeedScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.row_filter {
            Some((column, value)) => write!(f, "{}[{}={}]", self.table, column, value),
            None => write!(f, "{}", self.table),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub struct ChangeFeed {
    pub id: SubscriptionId,
    pub events: UnboundedReceiver<Value>,
}

/// The hosted data store as seen from one client: row queries and writes,
/// change-feed subscriptions and the signed-in identity.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, BackendError>;

    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError>;

    async fn update(&self, table: &str, id: Uuid, patch: Value) -> Result<Value, BackendError>;

    async fn delete(&self, table: &str, id: Uuid) -> Result<(), BackendError>;

    async fn fetch_profile(&self, user_id: Uuid) -> Result<Option<Profile>, BackendError> {
        let query = Query::table(settings().tables.profiles.as_str())
            .eq("id", user_id.to_string())
            .page(0, 1);
        match self.select(&query).await?.into_iter().next() {
            Some(row) => Ok(Some(serde_json::from_value(row)?)),
            None => Ok(None),
        }
    }

    async fn subscribe(&self, scope: &FeedScope) -> Result<ChangeFeed, BackendError>;

    /// Stops delivery for `id`. Must be cheap and non-blocking; it runs from `Drop`.
    fn unsubscribe(&self, id: SubscriptionId);

    fn current_user(&self) -> Option<Uuid>;

    async fn sign_out(&self) -> Result<(), BackendError>;
}

/// An open change-feed subscription. Released exactly once, either through
/// [`Subscription::release`] or on drop.
pub struct Subscription {
    backend: Arc<dyn Backend>,
    id: SubscriptionId,
    scope: FeedScope,
    released: bool,
}

impl Subscription {
    pub async fn open(
        backend: Arc<dyn Backend>,
        scope: FeedScope,
    ) -> Result<(Self, UnboundedReceiver<Value>), BackendError> {
        let feed = backend.subscribe(&scope).await?;
        logs::log_subscribed(&scope);
        let subscription = Self {
            backend,
            id: feed.id,
            scope,
            released: false,
        };
        Ok((subscription, feed.events))
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn scope(&self) -> &FeedScope {
        &self.scope
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.backend.unsubscribe(self.id);
        logs::log_unsubscribed(&self.scope);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("released", &self.released)
            .finish()
    }
}

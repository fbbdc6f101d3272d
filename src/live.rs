use crate::backend::{Backend, FeedScope, Predicate, Query, Subscription};
use crate::content::{ChangeEvent, ChangeKind, ContentItem, ContentKind, RowId};
use crate::enrich::Enricher;
use crate::error::{BackendError, SyncError, SyncResult};
use crate::filter::{self, FilterSelection};
use crate::notice::Notices;
use crate::settings::settings;
use crate::utils::logs;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use strum::Display;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrder {
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewScope {
    pub kind: ContentKind,
    pub story_id: Option<Uuid>,
    pub order: ListOrder,
}

impl ViewScope {
    pub fn stories() -> Self {
        Self {
            kind: ContentKind::Story,
            story_id: None,
            order: ListOrder::NewestFirst,
        }
    }

    pub fn community_posts() -> Self {
        Self {
            kind: ContentKind::CommunityPost,
            story_id: None,
            order: ListOrder::NewestFirst,
        }
    }

    pub fn comments(story_id: Uuid) -> Self {
        Self {
            kind: ContentKind::Comment,
            story_id: Some(story_id),
            order: ListOrder::OldestFirst,
        }
    }

    pub fn table(&self) -> &'static str {
        self.kind.table()
    }

    pub fn predicates(&self) -> Vec<Predicate> {
        self.story_id
            .map(|story| Predicate::Eq("story_id".to_string(), Value::String(story.to_string())))
            .into_iter()
            .collect()
    }

    /// Published, active rows of this view that match `filter`. Paging and
    /// counting both start from here.
    pub fn query(&self, filter: &FilterSelection) -> Query {
        Query::table(self.table())
            .filter(Predicate::IsNot("is_draft".to_string(), true))
            .filter(Predicate::IsNot("is_active".to_string(), false))
            .filters(self.predicates())
            .filters(filter.predicates())
    }

    pub fn feed_scope(&self) -> FeedScope {
        let scope = FeedScope::table(self.table());
        match self.story_id {
            Some(story) => scope.with_row("story_id", story),
            None => scope,
        }
    }

    pub fn contains(&self, item: &ContentItem) -> bool {
        self.story_id.map_or(true, |story| item.story_id == Some(story))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub page_size: usize,
    pub max_backlog: usize,
}

impl SyncOptions {
    pub fn from_settings() -> Self {
        let s = &settings().live;
        Self {
            page_size: s.page_size.max(1),
            max_backlog: s.max_backlog,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_settings()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum ViewPhase {
    #[strum(serialize = "uninitialized")]
    Uninitialized,
    #[strum(serialize = "loading")]
    Loading,
    #[strum(serialize = "ready")]
    Ready,
    #[strum(serialize = "loading-more")]
    LoadingMore,
    #[strum(serialize = "error")]
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChangeOutcome {
    Inserted,
    Replaced,
    Removed,
    Ignored,
    Deferred,
    Dropped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterRefresh {
    Local(Vec<ContentItem>),
    Refetched(Vec<ContentItem>),
}

/// `created_at` and `id` of the last row a page returned.
type Cursor = (Value, Value);

struct Page {
    items: Vec<ContentItem>,
    fetched: usize,
    cursor: Option<Cursor>,
}

enum Change {
    Upsert { item: ContentItem, kind: ChangeKind },
    Remove(Uuid),
}

enum Feed {
    Idle,
    Opening,
    Open {
        subscription: Subscription,
        pump: JoinHandle<()>,
    },
    Closed,
}

struct ListState {
    phase: ViewPhase,
    items: Vec<ContentItem>,
    fetched_with: FilterSelection,
    selection: FilterSelection,
    exhausted: bool,
    cursor: Option<Cursor>,
    epoch: u64,
    unmounted: bool,
    backlog: VecDeque<Change>,
    feed: Feed,
}

impl ListState {
    fn new() -> Self {
        Self {
            phase: ViewPhase::Uninitialized,
            items: Vec::new(),
            fetched_with: FilterSelection::any(),
            selection: FilterSelection::any(),
            exhausted: false,
            cursor: None,
            epoch: 0,
            unmounted: false,
            backlog: VecDeque::new(),
            feed: Feed::Idle,
        }
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.items.iter().position(|i| i.id == id)
    }

    fn place(&mut self, order: ListOrder, item: ContentItem) {
        match order {
            ListOrder::NewestFirst => self.items.insert(0, item),
            ListOrder::OldestFirst => self.items.push(item),
        }
    }

    fn apply(&mut self, order: ListOrder, change: Change) -> ChangeOutcome {
        match change {
            Change::Remove(id) => match self.position(id) {
                Some(pos) => {
                    self.items.remove(pos);
                    ChangeOutcome::Removed
                }
                None => ChangeOutcome::Ignored,
            },
            Change::Upsert { item, kind } => {
                let member = filter::passes(&item, &self.fetched_with);
                let position = self.position(item.id);
                match (kind, member, position) {
                    (ChangeKind::Insert, true, None) => {
                        self.place(order, item);
                        ChangeOutcome::Inserted
                    }
                    (ChangeKind::Insert, _, _) => ChangeOutcome::Ignored,
                    (_, false, Some(pos)) => {
                        self.items.remove(pos);
                        ChangeOutcome::Removed
                    }
                    (_, false, None) => ChangeOutcome::Ignored,
                    (_, true, Some(pos)) => {
                        self.items[pos] = item;
                        ChangeOutcome::Replaced
                    }
                    (_, true, None) => {
                        self.place(order, item);
                        ChangeOutcome::Inserted
                    }
                }
            }
        }
    }
}

struct Shared {
    backend: Arc<dyn Backend>,
    enricher: Enricher,
    notices: Notices,
    scope: ViewScope,
    options: SyncOptions,
    state: Mutex<ListState>,
}

/// Locally held, ordered list of content for one view, kept in step with
/// the backend through paging and the change feed.
///
/// Cloning yields another handle to the same view. The subscription opened by
/// [`LiveList::mount`] is released by [`LiveList::unmount`], or when the last
/// handle is dropped.
#[derive(Clone)]
pub struct LiveList {
    shared: Arc<Shared>,
}

impl LiveList {
    pub fn new(backend: Arc<dyn Backend>, scope: ViewScope, notices: Notices) -> Self {
        Self::with_options(backend, scope, notices, SyncOptions::from_settings())
    }

    pub fn with_options(
        backend: Arc<dyn Backend>,
        scope: ViewScope,
        notices: Notices,
        options: SyncOptions,
    ) -> Self {
        let enricher = Enricher::new(backend.clone());
        Self {
            shared: Arc::new(Shared {
                backend,
                enricher,
                notices,
                scope,
                options,
                state: Mutex::new(ListState::new()),
            }),
        }
    }

    pub fn scope(&self) -> &ViewScope {
        &self.shared.scope
    }

    pub async fn phase(&self) -> ViewPhase {
        self.shared.state.lock().await.phase.clone()
    }

    pub async fn items(&self) -> Vec<ContentItem> {
        self.shared.state.lock().await.items.clone()
    }

    pub async fn visible(&self) -> Vec<ContentItem> {
        let state = self.shared.state.lock().await;
        filter::visible(&state.items, &state.selection)
    }

    pub async fn selection(&self) -> FilterSelection {
        self.shared.state.lock().await.selection.clone()
    }

    pub async fn is_exhausted(&self) -> bool {
        self.shared.state.lock().await.exhausted
    }

    pub async fn is_subscribed(&self) -> bool {
        matches!(self.shared.state.lock().await.feed, Feed::Open { .. })
    }

    /// The "nothing here" text to show once loading finished with no visible rows.
    pub async fn empty_message(&self) -> Option<&'static str> {
        let state = self.shared.state.lock().await;
        let empty = filter::visible(&state.items, &state.selection).is_empty();
        (state.phase == ViewPhase::Ready && empty).then(|| self.shared.scope.kind.empty_message())
    }

    fn page_query(&self, filter: &FilterSelection, after: Option<&Cursor>) -> Query {
        let descending = self.shared.scope.order == ListOrder::NewestFirst;
        let mut query = self.shared.scope.query(filter);
        if let Some((created_at, id)) = after {
            query = query.filter(Predicate::After {
                cursor: vec![
                    ("created_at".to_string(), created_at.clone()),
                    ("id".to_string(), id.clone()),
                ],
                descending,
            });
        }
        query
            .order_by("created_at", descending)
            .order_by("id", descending)
            .page(0, self.shared.options.page_size)
    }

    /// Fetches the page following `after`. The raw row count drives end-of-data
    /// detection and the cursor comes from the last raw row, so rows dropped
    /// locally still advance paging.
    async fn fetch_page(
        &self,
        filter: &FilterSelection,
        after: Option<&Cursor>,
    ) -> Result<Page, BackendError> {
        let rows = self
            .shared
            .backend
            .select(&self.page_query(filter, after))
            .await?;
        let fetched = rows.len();
        let cursor = rows
            .iter()
            .rev()
            .find_map(|row| Some((row.get("created_at")?.clone(), row.get("id")?.clone())));

        let mut items = Vec::with_capacity(fetched);
        for row in rows {
            match ContentItem::from_row(row) {
                Ok(item) if self.shared.scope.contains(&item) && filter::passes(&item, filter) => {
                    items.push(item)
                }
                Ok(_) => {}
                Err(e) => logs::log_event_dropped(
                    self.shared.scope.table(),
                    &format!("malformed row in page: {e}"),
                ),
            }
        }

        Ok(Page {
            items: self.shared.enricher.enrich_page(items).await,
            fetched,
            cursor,
        })
    }

    pub async fn initialize(&self, filter: FilterSelection) -> SyncResult<Vec<ContentItem>> {
        let epoch = {
            let mut state = self.shared.state.lock().await;
            if state.unmounted {
                return Err(SyncError::Detached);
            }
            state.epoch += 1;
            state.phase = ViewPhase::Loading;
            state.items.clear();
            state.backlog.clear();
            state.exhausted = false;
            state.cursor = None;
            state.fetched_with = filter.clone();
            state.selection = filter.clone();
            state.epoch
        };

        let result = self.fetch_page(&filter, None).await;

        let mut state = self.shared.state.lock().await;
        if state.unmounted || state.epoch != epoch {
            return Err(SyncError::Detached);
        }

        let kind = self.shared.scope.kind;
        match result {
            Ok(page) => {
                let mut seen = HashSet::new();
                state.items = page.items.into_iter().filter(|i| seen.insert(i.id)).collect();
                state.exhausted = page.fetched < self.shared.options.page_size;
                state.cursor = page.cursor;
                state.phase = ViewPhase::Ready;

                let backlog: Vec<Change> = state.backlog.drain(..).collect();
                let replayed = backlog.len();
                for change in backlog {
                    state.apply(self.shared.scope.order, change);
                }

                logs::log_view_ready(kind, state.items.len(), replayed, state.exhausted);
                Ok(state.items.clone())
            }
            Err(e) => {
                state.phase = ViewPhase::Error(e.to_string());
                state.items.clear();
                state.backlog.clear();
                drop(state);

                logs::log_view_error(kind, &e.to_string());
                self.shared
                    .notices
                    .error(format!("Could not load {}", plural(kind)));
                Err(SyncError::Fetch(e))
            }
        }
    }

    /// Appends the next page. A call made while a page is already loading, or
    /// after the end of data, returns an empty list without touching the store.
    pub async fn load_more(&self) -> SyncResult<Vec<ContentItem>> {
        let (epoch, filter, cursor) = {
            let mut state = self.shared.state.lock().await;
            if state.unmounted {
                return Err(SyncError::Detached);
            }
            if state.phase != ViewPhase::Ready || state.exhausted {
                return Ok(Vec::new());
            }
            state.phase = ViewPhase::LoadingMore;
            (state.epoch, state.fetched_with.clone(), state.cursor.clone())
        };

        let result = self.fetch_page(&filter, cursor.as_ref()).await;

        let mut state = self.shared.state.lock().await;
        if state.unmounted || state.epoch != epoch {
            return Err(SyncError::Detached);
        }
        state.phase = ViewPhase::Ready;

        let kind = self.shared.scope.kind;
        match result {
            Ok(page) => {
                let mut known: HashSet<Uuid> = state.items.iter().map(|i| i.id).collect();
                let appended: Vec<ContentItem> =
                    page.items.into_iter().filter(|i| known.insert(i.id)).collect();
                state.items.extend(appended.iter().cloned());
                state.exhausted = page.fetched < self.shared.options.page_size;
                if page.cursor.is_some() {
                    state.cursor = page.cursor;
                }

                logs::log_page_loaded(kind, appended.len(), state.exhausted);
                Ok(appended)
            }
            Err(e) => {
                drop(state);
                logs::log_view_error(kind, &e.to_string());
                self.shared
                    .notices
                    .error(format!("Could not load more {}", plural(kind)));
                Err(SyncError::Fetch(e))
            }
        }
    }

    /// Switches the filter selection. Recomputes locally when every row the
    /// new selection can match is already loaded; otherwise fetches afresh.
    pub async fn set_filter(&self, filter: FilterSelection) -> SyncResult<FilterRefresh> {
        {
            let mut state = self.shared.state.lock().await;
            if state.unmounted {
                return Err(SyncError::Detached);
            }
            let ready = state.phase == ViewPhase::Ready;
            let same = filter == state.fetched_with;
            let complete = state.exhausted && filter.narrows(&state.fetched_with);
            if ready && (same || complete) {
                state.selection = filter;
                let visible = filter::visible(&state.items, &state.selection);
                return Ok(FilterRefresh::Local(visible));
            }
        }

        self.initialize(filter).await.map(FilterRefresh::Refetched)
    }

    fn decode(&self, raw: Value) -> Result<Change, String> {
        let event: ChangeEvent =
            serde_json::from_value(raw).map_err(|e| format!("unreadable event: {e}"))?;

        match event.event_type {
            ChangeKind::Delete => {
                let old = event.old.ok_or("delete without old row")?;
                let row: RowId =
                    serde_json::from_value(old).map_err(|e| format!("delete without id: {e}"))?;
                Ok(Change::Remove(row.id))
            }
            kind => {
                let new = event.new.ok_or("change without new row")?;
                let item = ContentItem::from_row(new).map_err(|e| format!("malformed row: {e}"))?;
                Ok(Change::Upsert { item, kind })
            }
        }
    }

    /// Resolves the author for an incoming row, reusing the one already held
    /// for the same row when the authorship did not change.
    async fn prepare(&self, mut item: ContentItem) -> ContentItem {
        if item.is_anonymous {
            item.author = None;
            return item;
        }

        let carried = {
            let state = self.shared.state.lock().await;
            if !filter::passes(&item, &state.fetched_with) {
                return item;
            }
            state
                .items
                .iter()
                .find(|i| i.id == item.id && i.author_id == item.author_id && !i.is_anonymous)
                .and_then(|i| i.author.clone())
        };

        match carried {
            Some(author) => {
                item.author = Some(author);
                item
            }
            None => self.shared.enricher.enrich(item).await,
        }
    }

    async fn commit(&self, change: Change) -> ChangeOutcome {
        let mut state = self.shared.state.lock().await;
        if state.unmounted {
            return ChangeOutcome::Ignored;
        }

        let phase = state.phase.clone();
        match phase {
            ViewPhase::Uninitialized | ViewPhase::Error(_) => ChangeOutcome::Ignored,
            ViewPhase::Loading => {
                if state.backlog.len() >= self.shared.options.max_backlog {
                    state.backlog.pop_front();
                    logs::log_event_dropped(self.shared.scope.table(), "backlog full");
                }
                state.backlog.push_back(change);
                ChangeOutcome::Deferred
            }
            ViewPhase::Ready | ViewPhase::LoadingMore => state.apply(self.shared.scope.order, change),
        }
    }

    /// Applies one raw change-feed message. Malformed messages are logged and
    /// dropped without touching the list.
    pub async fn apply_change(&self, raw: Value) -> ChangeOutcome {
        let change = match self.decode(raw) {
            Ok(change) => change,
            Err(reason) => {
                logs::log_event_dropped(self.shared.scope.table(), &reason);
                return ChangeOutcome::Dropped;
            }
        };

        let change = match change {
            Change::Upsert { item, .. } if !self.shared.scope.contains(&item) => {
                return ChangeOutcome::Ignored;
            }
            Change::Upsert { item, kind } => Change::Upsert {
                item: self.prepare(item).await,
                kind,
            },
            remove => remove,
        };

        let id = match &change {
            Change::Upsert { item, .. } => item.id,
            Change::Remove(id) => *id,
        };
        let outcome = self.commit(change).await;
        tracing::debug!(table = self.shared.scope.table(), %id, %outcome, "change applied");
        logs::log_change_applied(self.shared.scope.table(), outcome, Some(id));
        outcome
    }

    /// Places a row the caller just wrote. The later change-feed echo for the
    /// same id is then ignored as a duplicate.
    pub async fn insert_local(&self, item: ContentItem) -> ChangeOutcome {
        if !self.shared.scope.contains(&item) {
            return ChangeOutcome::Ignored;
        }
        self.commit(Change::Upsert {
            item,
            kind: ChangeKind::Insert,
        })
        .await
    }

    /// Opens the change feed for this view. A second call while a feed is
    /// open or opening fails with [`SyncError::AlreadySubscribed`].
    pub async fn mount(&self) -> SyncResult<()> {
        {
            let mut state = self.shared.state.lock().await;
            if state.unmounted {
                return Err(SyncError::Detached);
            }
            if !matches!(state.feed, Feed::Idle) {
                return Err(SyncError::AlreadySubscribed);
            }
            state.feed = Feed::Opening;
        }

        let opened =
            Subscription::open(self.shared.backend.clone(), self.shared.scope.feed_scope()).await;

        let mut state = self.shared.state.lock().await;
        match opened {
            Err(e) => {
                if !state.unmounted {
                    state.feed = Feed::Idle;
                }
                drop(state);
                logs::log_view_error(self.shared.scope.kind, &e.to_string());
                Err(SyncError::Subscribe(e))
            }
            Ok((subscription, _)) if state.unmounted => {
                drop(state);
                subscription.release();
                Err(SyncError::Detached)
            }
            Ok((subscription, events)) => {
                let pump = tokio::spawn(pump_events(Arc::downgrade(&self.shared), events));
                state.feed = Feed::Open { subscription, pump };
                Ok(())
            }
        }
    }

    /// Tears the view down: closes the feed once and makes every pending or
    /// future result for this view a no-op.
    pub async fn unmount(&self) {
        let feed = {
            let mut state = self.shared.state.lock().await;
            if state.unmounted {
                return;
            }
            state.unmounted = true;
            state.epoch += 1;
            state.backlog.clear();
            std::mem::replace(&mut state.feed, Feed::Closed)
        };

        if let Feed::Open { subscription, pump } = feed {
            pump.abort();
            subscription.release();
        }
        logs::log_view_unmounted(self.shared.scope.kind);
    }
}

async fn pump_events(shared: Weak<Shared>, mut events: UnboundedReceiver<Value>) {
    while let Some(raw) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        LiveList { shared }.apply_change(raw).await;
    }
}

fn plural(kind: ContentKind) -> &'static str {
    match kind {
        ContentKind::Story => "stories",
        ContentKind::CommunityPost => "posts",
        ContentKind::Comment => "comments",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::notice::{Notice, NoticeLevel};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;
    use std::collections::{BTreeSet, HashMap};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn story(minutes: i64, category: &str, tags: &[&str]) -> ContentItem {
        ContentItem {
            id: Uuid::new_v4(),
            author_id: Uuid::new_v4(),
            created_at: at(minutes),
            title: Some(format!("story at {minutes}")),
            content: "It started during a maths exam".into(),
            is_draft: false,
            is_active: true,
            is_pinned: false,
            is_anonymous: false,
            category: Some(category.to_string()),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            story_id: None,
            author: None,
        }
    }

    fn comment(story_id: Uuid, minutes: i64) -> ContentItem {
        ContentItem {
            story_id: Some(story_id),
            category: None,
            title: None,
            ..story(minutes, "", &[])
        }
    }

    fn row(item: &ContentItem) -> Value {
        serde_json::to_value(item).unwrap()
    }

    fn insert_event(item: &ContentItem) -> Value {
        ChangeEvent::insert(row(item)).to_value()
    }

    fn update_event(item: &ContentItem) -> Value {
        ChangeEvent::update(row(item)).to_value()
    }

    fn delete_event(id: Uuid) -> Value {
        ChangeEvent::delete(id).to_value()
    }

    fn options(page_size: usize) -> SyncOptions {
        SyncOptions {
            page_size,
            max_backlog: 64,
        }
    }

    struct Fixture {
        backend: Arc<MemoryBackend>,
        list: LiveList,
        notices: tokio::sync::mpsc::UnboundedReceiver<Notice>,
    }

    fn fixture(scope: ViewScope, page_size: usize) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let (notices, rx) = Notices::channel();
        let list = LiveList::with_options(backend.clone(), scope, notices, options(page_size));
        Fixture {
            backend,
            list,
            notices: rx,
        }
    }

    fn seed_stories(backend: &MemoryBackend, stories: &[ContentItem]) {
        backend.seed("stories", stories.iter().map(row));
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn ids(items: &[ContentItem]) -> Vec<Uuid> {
        items.iter().map(|i| i.id).collect()
    }

    #[tokio::test]
    async fn test_initialize_empty_store() {
        let f = fixture(ViewScope::stories(), 10);

        let items = f.list.initialize(FilterSelection::any()).await.unwrap();

        assert!(items.is_empty());
        assert_eq!(f.list.phase().await, ViewPhase::Ready);
        assert!(f.list.is_exhausted().await);
        assert_eq!(f.list.empty_message().await, Some("No stories found"));
    }

    #[tokio::test]
    async fn test_initialize_orders_newest_first_with_id_tiebreak() {
        let f = fixture(ViewScope::stories(), 10);
        let older = story(0, "school", &[]);
        let mut tied_a = story(5, "school", &[]);
        let mut tied_b = story(5, "school", &[]);
        if tied_a.id < tied_b.id {
            std::mem::swap(&mut tied_a, &mut tied_b);
        }
        let mut draft = story(10, "school", &[]);
        draft.is_draft = true;
        seed_stories(&f.backend, &[older.clone(), tied_b.clone(), draft, tied_a.clone()]);

        let items = f.list.initialize(FilterSelection::any()).await.unwrap();

        assert_eq!(ids(&items), vec![tied_a.id, tied_b.id, older.id]);
    }

    #[tokio::test]
    async fn test_initialize_failure_sets_error_state() {
        let mut f = fixture(ViewScope::stories(), 10);
        seed_stories(&f.backend, &[story(0, "school", &[])]);
        f.backend.set_offline(true);

        let result = f.list.initialize(FilterSelection::any()).await;

        assert!(matches!(result, Err(SyncError::Fetch(_))));
        assert!(matches!(f.list.phase().await, ViewPhase::Error(_)));
        assert!(f.list.items().await.is_empty());
        assert_eq!(f.list.empty_message().await, None);
        let notice = f.notices.try_recv().unwrap();
        assert_eq!(notice.level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn test_load_more_pages_without_duplicates() {
        let f = fixture(ViewScope::stories(), 10);
        let stories: Vec<ContentItem> = (0..25).map(|m| story(m, "school", &[])).collect();
        seed_stories(&f.backend, &stories);

        let first = f.list.initialize(FilterSelection::any()).await.unwrap();
        let second = f.list.load_more().await.unwrap();
        let third = f.list.load_more().await.unwrap();
        let fourth = f.list.load_more().await.unwrap();

        assert_eq!((first.len(), second.len(), third.len()), (10, 10, 5));
        assert!(fourth.is_empty());
        assert!(f.list.is_exhausted().await);

        let all = f.list.items().await;
        let unique: HashSet<Uuid> = all.iter().map(|i| i.id).collect();
        assert_eq!(unique.len(), 25);
        assert_eq!(all[0].created_at, at(24));
        assert_eq!(all[24].created_at, at(0));
        assert_eq!(f.backend.select_calls(), 3);
    }

    #[tokio::test]
    async fn test_load_more_after_remote_insert_skips_known_rows() {
        let f = fixture(ViewScope::stories(), 5);
        let stories: Vec<ContentItem> = (0..10).map(|m| story(m, "school", &[])).collect();
        seed_stories(&f.backend, &stories);
        f.list.initialize(FilterSelection::any()).await.unwrap();

        let fresh = story(100, "school", &[]);
        f.backend.insert("stories", row(&fresh)).await.unwrap();
        assert_eq!(f.list.apply_change(insert_event(&fresh)).await, ChangeOutcome::Inserted);

        let appended = f.list.load_more().await.unwrap();
        assert_eq!(appended.len(), 5);
        assert!(!ids(&appended).contains(&fresh.id));

        let all = f.list.items().await;
        let unique: HashSet<Uuid> = all.iter().map(|i| i.id).collect();
        assert_eq!(unique.len(), all.len());
        assert_eq!(all.len(), 11);
    }

    #[tokio::test]
    async fn test_load_more_while_in_flight_is_noop() {
        let f = fixture(ViewScope::stories(), 10);
        let stories: Vec<ContentItem> = (0..30).map(|m| story(m, "school", &[])).collect();
        seed_stories(&f.backend, &stories);
        f.list.initialize(FilterSelection::any()).await.unwrap();

        let gate = f.backend.hold_selects().unwrap();
        let list = f.list.clone();
        let pending = tokio::spawn(async move { list.load_more().await });
        settle().await;

        assert_eq!(f.list.phase().await, ViewPhase::LoadingMore);
        assert!(f.list.load_more().await.unwrap().is_empty());

        drop(gate);
        let appended = pending.await.unwrap().unwrap();
        assert_eq!(appended.len(), 10);
        assert_eq!(f.list.items().await.len(), 20);
        assert_eq!(f.backend.select_calls(), 2);
    }

    #[tokio::test]
    async fn test_insert_event_is_idempotent() {
        let f = fixture(ViewScope::stories(), 10);
        f.list.initialize(FilterSelection::any()).await.unwrap();
        let item = story(1, "school", &[]);

        let first = f.list.apply_change(insert_event(&item)).await;
        let once = f.list.items().await;
        let second = f.list.apply_change(insert_event(&item)).await;

        assert_eq!(first, ChangeOutcome::Inserted);
        assert_eq!(second, ChangeOutcome::Ignored);
        assert_eq!(f.list.items().await, once);
        assert_eq!(once.len(), 1);
    }

    #[tokio::test]
    async fn test_draft_insert_never_visible() {
        let f = fixture(ViewScope::stories(), 10);
        f.list.initialize(FilterSelection::any()).await.unwrap();
        let mut draft = story(1, "school", &["anxious"]);
        draft.is_draft = true;

        assert_eq!(f.list.apply_change(insert_event(&draft)).await, ChangeOutcome::Ignored);
        for filter in [
            FilterSelection::any(),
            FilterSelection::any().with_category("school"),
            FilterSelection::any().with_mood("anxious"),
        ] {
            f.list.set_filter(filter).await.unwrap();
            assert!(f.list.visible().await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_update_replaces_in_place_or_removes() {
        let f = fixture(ViewScope::stories(), 10);
        let a = story(0, "school", &[]);
        let b = story(1, "school", &[]);
        let c = story(2, "school", &[]);
        seed_stories(&f.backend, &[a.clone(), b.clone(), c.clone()]);
        let school = FilterSelection::any().with_category("school");
        f.list.initialize(school).await.unwrap();

        let mut edited = b.clone();
        edited.content = "edited".into();
        edited.created_at = at(50);
        assert_eq!(f.list.apply_change(update_event(&edited)).await, ChangeOutcome::Replaced);
        let items = f.list.items().await;
        assert_eq!(ids(&items), vec![c.id, b.id, a.id]);
        assert_eq!(items[1].content, "edited");

        let mut moved = a.clone();
        moved.category = Some("work".into());
        assert_eq!(f.list.apply_change(update_event(&moved)).await, ChangeOutcome::Removed);

        let mut removed_by_moderator = c.clone();
        removed_by_moderator.is_active = false;
        assert_eq!(
            f.list.apply_change(update_event(&removed_by_moderator)).await,
            ChangeOutcome::Removed
        );

        let published = story(3, "school", &[]);
        assert_eq!(f.list.apply_change(update_event(&published)).await, ChangeOutcome::Inserted);
        assert_eq!(ids(&f.list.items().await), vec![published.id, b.id]);
    }

    #[tokio::test]
    async fn test_delete_present_and_absent() {
        let f = fixture(ViewScope::stories(), 10);
        let a = story(0, "school", &[]);
        seed_stories(&f.backend, &[a.clone()]);
        f.list.initialize(FilterSelection::any()).await.unwrap();

        assert_eq!(f.list.apply_change(delete_event(Uuid::new_v4())).await, ChangeOutcome::Ignored);
        assert_eq!(f.list.apply_change(delete_event(a.id)).await, ChangeOutcome::Removed);
        assert!(f.list.items().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_events_are_dropped() {
        let f = fixture(ViewScope::stories(), 10);
        let a = story(0, "school", &[]);
        seed_stories(&f.backend, &[a.clone()]);
        f.list.initialize(FilterSelection::any()).await.unwrap();

        let bad = [
            json!("not an event"),
            json!({ "eventType": "TRUNCATE" }),
            json!({ "eventType": "INSERT", "new": { "id": "nope" } }),
            json!({ "eventType": "UPDATE" }),
            json!({ "eventType": "DELETE", "old": {} }),
        ];
        for event in bad {
            assert_eq!(f.list.apply_change(event).await, ChangeOutcome::Dropped);
        }

        assert_eq!(ids(&f.list.items().await), vec![a.id]);
        let b = story(1, "school", &[]);
        assert_eq!(f.list.apply_change(insert_event(&b)).await, ChangeOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_anonymous_insert_skips_profile_lookup() {
        let f = fixture(ViewScope::stories(), 10);
        f.list.initialize(FilterSelection::any()).await.unwrap();
        let mut secret = story(1, "school", &[]);
        secret.is_anonymous = true;

        f.list.apply_change(insert_event(&secret)).await;
        f.list.apply_change(update_event(&secret)).await;

        assert_eq!(f.backend.profile_lookups(secret.author_id), 0);
        assert_eq!(f.backend.total_profile_lookups(), 0);
        assert_eq!(f.list.items().await[0].author_name(), "Anonymous");
    }

    #[tokio::test]
    async fn test_update_keeps_resolved_author() {
        let f = fixture(ViewScope::stories(), 10);
        let a = story(0, "school", &[]);
        f.backend.seed(
            "profiles",
            vec![json!({ "id": a.author_id, "display_name": "Maya" })],
        );
        seed_stories(&f.backend, &[a.clone()]);
        f.list.initialize(FilterSelection::any()).await.unwrap();

        let mut edited = a.clone();
        edited.content = "second draft".into();
        f.list.apply_change(update_event(&edited)).await;

        assert_eq!(f.list.items().await[0].author_name(), "Maya");
        assert_eq!(f.backend.profile_lookups(a.author_id), 1);
    }

    #[tokio::test]
    async fn test_mount_guards_double_subscribe_and_unmount_closes_once() {
        let f = fixture(ViewScope::stories(), 10);

        f.list.mount().await.unwrap();
        assert!(matches!(f.list.mount().await, Err(SyncError::AlreadySubscribed)));
        assert!(f.list.is_subscribed().await);
        assert_eq!(f.backend.subscribe_calls(), 1);

        f.list.unmount().await;
        f.list.unmount().await;
        assert_eq!(f.backend.unsubscribe_calls(), 1);
        assert_eq!(f.backend.active_subscriptions(), 0);
        assert!(matches!(f.list.mount().await, Err(SyncError::Detached)));
    }

    #[tokio::test]
    async fn test_dropping_last_handle_releases_subscription() {
        let f = fixture(ViewScope::stories(), 10);
        f.list.mount().await.unwrap();
        let backend = f.backend.clone();

        drop(f);
        settle().await;

        assert_eq!(backend.unsubscribe_calls(), 1);
        assert_eq!(backend.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_remote_writes_flow_through_feed() {
        let f = fixture(ViewScope::stories(), 10);
        f.list.mount().await.unwrap();
        f.list.initialize(FilterSelection::any()).await.unwrap();

        let fresh = story(1, "school", &[]);
        f.backend.insert("stories", row(&fresh)).await.unwrap();
        settle().await;
        assert_eq!(ids(&f.list.items().await), vec![fresh.id]);

        f.backend
            .update("stories", fresh.id, json!({ "is_active": false }))
            .await
            .unwrap();
        settle().await;
        assert!(f.list.items().await.is_empty());

        f.backend.emit_raw("stories", json!({ "garbage": true }));
        settle().await;
        assert!(f.list.items().await.is_empty());
        assert!(f.list.is_subscribed().await);
    }

    #[tokio::test]
    async fn test_unmount_during_load_more_discards_page() {
        let f = fixture(ViewScope::stories(), 10);
        let stories: Vec<ContentItem> = (0..30).map(|m| story(m, "school", &[])).collect();
        seed_stories(&f.backend, &stories);
        f.list.mount().await.unwrap();
        f.list.initialize(FilterSelection::any()).await.unwrap();
        let before = f.list.items().await;

        let gate = f.backend.hold_selects().unwrap();
        let list = f.list.clone();
        let pending = tokio::spawn(async move { list.load_more().await });
        settle().await;

        f.list.unmount().await;
        drop(gate);

        assert!(matches!(pending.await.unwrap(), Err(SyncError::Detached)));
        assert_eq!(f.list.items().await, before);
        assert_eq!(f.backend.unsubscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_unmount_during_first_load_discards_page() {
        let mut f = fixture(ViewScope::stories(), 10);
        seed_stories(&f.backend, &[story(0, "school", &[]), story(1, "school", &[])]);

        let gate = f.backend.hold_selects().unwrap();
        let list = f.list.clone();
        let pending =
            tokio::spawn(async move { list.initialize(FilterSelection::any()).await });
        settle().await;
        assert_eq!(f.list.phase().await, ViewPhase::Loading);

        f.list.unmount().await;
        drop(gate);

        assert!(matches!(pending.await.unwrap(), Err(SyncError::Detached)));
        assert!(f.list.items().await.is_empty());
        assert!(f.notices.try_recv().is_err());
        assert!(matches!(
            f.list.initialize(FilterSelection::any()).await,
            Err(SyncError::Detached)
        ));
    }

    #[tokio::test]
    async fn test_changes_during_first_load_are_replayed() {
        let f = fixture(ViewScope::stories(), 10);
        let old = story(0, "school", &[]);
        seed_stories(&f.backend, &[old.clone()]);

        let gate = f.backend.hold_selects().unwrap();
        let list = f.list.clone();
        let pending =
            tokio::spawn(async move { list.initialize(FilterSelection::any()).await });
        settle().await;
        assert_eq!(f.list.phase().await, ViewPhase::Loading);

        let fresh = story(5, "school", &[]);
        assert_eq!(f.list.apply_change(insert_event(&fresh)).await, ChangeOutcome::Deferred);
        assert_eq!(f.list.apply_change(delete_event(old.id)).await, ChangeOutcome::Deferred);
        drop(gate);

        let items = pending.await.unwrap().unwrap();
        assert_eq!(ids(&items), vec![fresh.id]);
    }

    #[tokio::test]
    async fn test_reinitialize_discards_stale_first_page() {
        let f = fixture(ViewScope::stories(), 10);
        seed_stories(
            &f.backend,
            &[story(0, "school", &[]), story(1, "work", &[])],
        );

        let gate = f.backend.hold_selects().unwrap();
        let list = f.list.clone();
        let stale = tokio::spawn(async move { list.initialize(FilterSelection::any()).await });
        settle().await;
        let list = f.list.clone();
        let current = tokio::spawn(async move {
            list.initialize(FilterSelection::any().with_category("work"))
                .await
        });
        settle().await;
        drop(gate);

        assert!(matches!(stale.await.unwrap(), Err(SyncError::Detached)));
        assert_eq!(current.await.unwrap().unwrap().len(), 1);
        assert_eq!(f.list.items().await.len(), 1);
    }

    #[tokio::test]
    async fn test_set_filter_local_when_exhausted() {
        let f = fixture(ViewScope::stories(), 10);
        seed_stories(
            &f.backend,
            &[
                story(0, "school", &["anxious"]),
                story(1, "work", &["calm"]),
                story(2, "school", &["calm"]),
            ],
        );
        f.list.initialize(FilterSelection::any()).await.unwrap();
        let original = f.list.visible().await;

        let narrowed = f
            .list
            .set_filter(FilterSelection::any().with_category("school"))
            .await
            .unwrap();
        let restored = f.list.set_filter(FilterSelection::any()).await.unwrap();

        assert!(matches!(narrowed, FilterRefresh::Local(ref v) if v.len() == 2));
        assert_eq!(restored, FilterRefresh::Local(original));
        assert_eq!(f.backend.select_calls(), 1);
    }

    #[tokio::test]
    async fn test_set_filter_refetches_when_more_data_exists() {
        let f = fixture(ViewScope::stories(), 5);
        let mut stories: Vec<ContentItem> = (0..8).map(|m| story(m, "work", &[])).collect();
        stories.extend((10..13).map(|m| story(m - 20, "school", &[])));
        seed_stories(&f.backend, &stories);
        f.list.initialize(FilterSelection::any()).await.unwrap();
        assert!(!f.list.is_exhausted().await);

        let refreshed = f
            .list
            .set_filter(FilterSelection::any().with_category("school"))
            .await
            .unwrap();

        match refreshed {
            FilterRefresh::Refetched(items) => assert_eq!(items.len(), 3),
            other => panic!("expected a refetch, got {other:?}"),
        }
        assert_eq!(f.backend.select_calls(), 2);
    }

    #[tokio::test]
    async fn test_comment_thread_is_oldest_first_and_scoped() {
        let story_id = Uuid::new_v4();
        let f = fixture(ViewScope::comments(story_id), 10);
        let first = comment(story_id, 0);
        let second = comment(story_id, 1);
        let elsewhere = comment(Uuid::new_v4(), 2);
        f.backend.seed(
            "comments",
            vec![row(&second), row(&elsewhere), row(&first)],
        );

        let items = f.list.initialize(FilterSelection::any()).await.unwrap();
        assert_eq!(ids(&items), vec![first.id, second.id]);

        let third = comment(story_id, 3);
        assert_eq!(f.list.apply_change(insert_event(&third)).await, ChangeOutcome::Inserted);
        assert_eq!(
            f.list.apply_change(insert_event(&comment(Uuid::new_v4(), 4))).await,
            ChangeOutcome::Ignored
        );
        assert_eq!(ids(&f.list.items().await), vec![first.id, second.id, third.id]);
    }

    #[tokio::test]
    async fn test_load_more_after_tail_insert_keeps_every_comment() {
        let story_id = Uuid::new_v4();
        let f = fixture(ViewScope::comments(story_id), 2);
        let seeded: Vec<ContentItem> = (0..4).map(|m| comment(story_id, m)).collect();
        f.backend.seed("comments", seeded.iter().map(row));
        f.list.initialize(FilterSelection::any()).await.unwrap();

        let fresh = comment(story_id, 10);
        f.backend.insert("comments", row(&fresh)).await.unwrap();
        assert_eq!(f.list.apply_change(insert_event(&fresh)).await, ChangeOutcome::Inserted);

        while !f.list.is_exhausted().await {
            f.list.load_more().await.unwrap();
        }

        let held: BTreeSet<Uuid> = ids(&f.list.items().await).into_iter().collect();
        let expected: BTreeSet<Uuid> = seeded.iter().chain([&fresh]).map(|c| c.id).collect();
        assert_eq!(held, expected);
        assert_eq!(f.list.items().await.len(), 5);
    }

    #[tokio::test]
    async fn test_load_more_after_publishing_unloaded_story_keeps_every_story() {
        let f = fixture(ViewScope::stories(), 2);
        let mut draft = story(0, "school", &[]);
        draft.is_draft = true;
        let published: Vec<ContentItem> = (1..4).map(|m| story(m, "school", &[])).collect();
        seed_stories(&f.backend, &published);
        seed_stories(&f.backend, &[draft.clone()]);
        f.list.initialize(FilterSelection::any()).await.unwrap();

        f.backend
            .update("stories", draft.id, json!({ "is_draft": false }))
            .await
            .unwrap();
        let now_public = ContentItem {
            is_draft: false,
            ..draft.clone()
        };
        assert_eq!(
            f.list.apply_change(update_event(&now_public)).await,
            ChangeOutcome::Inserted
        );

        while !f.list.is_exhausted().await {
            f.list.load_more().await.unwrap();
        }

        let items = f.list.items().await;
        let held: BTreeSet<Uuid> = ids(&items).into_iter().collect();
        let expected: BTreeSet<Uuid> = published.iter().chain([&draft]).map(|s| s.id).collect();
        assert_eq!(held, expected);
        assert_eq!(items.len(), 4);
    }

    #[tokio::test]
    async fn test_rows_without_flag_columns_are_public() {
        let f = fixture(ViewScope::stories(), 10);
        let paged = story(0, "school", &[]);
        let mut bare = row(&paged);
        bare.as_object_mut().unwrap().remove("is_draft");
        bare.as_object_mut().unwrap().remove("is_active");
        f.backend.seed("stories", [bare]);

        let items = f.list.initialize(FilterSelection::any()).await.unwrap();
        assert_eq!(ids(&items), vec![paged.id]);

        let pushed = story(1, "school", &[]);
        let mut bare = row(&pushed);
        bare.as_object_mut().unwrap().remove("is_draft");
        bare.as_object_mut().unwrap().remove("is_active");
        assert_eq!(
            f.list.apply_change(ChangeEvent::insert(bare).to_value()).await,
            ChangeOutcome::Inserted
        );
        assert_eq!(ids(&f.list.items().await), vec![pushed.id, paged.id]);
    }

    #[test]
    fn test_page_query_extends_view_query() {
        let story_id = Uuid::new_v4();
        let f = fixture(ViewScope::comments(story_id), 3);
        let filter = FilterSelection::any().with_mood("calm");
        let base = f.list.scope().query(&filter);

        let first = f.list.page_query(&filter, None);
        assert_eq!(first.predicates, base.predicates);
        assert_eq!(first.limit, Some(3));
        assert_eq!(first.offset, 0);
        assert!(first.order.iter().all(|o| !o.descending));

        let cursor = (json!("2024-05-01T12:00:00Z"), json!(Uuid::nil().to_string()));
        let next = f.list.page_query(&filter, Some(&cursor));
        assert_eq!(next.predicates[..base.predicates.len()], base.predicates[..]);
        assert_eq!(
            next.predicates.last(),
            Some(&Predicate::After {
                cursor: vec![
                    ("created_at".to_string(), cursor.0.clone()),
                    ("id".to_string(), cursor.1.clone()),
                ],
                descending: false,
            })
        );
    }

    #[tokio::test]
    async fn test_random_event_replay_matches_latest_images() {
        let f = fixture(ViewScope::stories(), 10);
        let filter = FilterSelection::any().with_category("school");
        f.list.initialize(filter.clone()).await.unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let pool: Vec<ContentItem> = (0..6).map(|m| story(m, "school", &[])).collect();
        let mut live: HashMap<Uuid, ContentItem> = HashMap::new();

        for step in 0..300 {
            let mut item = pool[rng.random_range(0..pool.len())].clone();
            item.is_draft = rng.random_bool(0.25);
            item.category = Some(if rng.random_bool(0.3) { "work" } else { "school" }.into());
            item.content = format!("revision {step}");

            let event = if !live.contains_key(&item.id) {
                live.insert(item.id, item.clone());
                insert_event(&item)
            } else if rng.random_bool(0.2) {
                live.remove(&item.id);
                delete_event(item.id)
            } else {
                live.insert(item.id, item.clone());
                update_event(&item)
            };
            f.list.apply_change(event).await;

            let items = f.list.items().await;
            let got: BTreeSet<Uuid> = items.iter().map(|i| i.id).collect();
            let expected: BTreeSet<Uuid> = live
                .values()
                .filter(|i| filter::passes(i, &filter))
                .map(|i| i.id)
                .collect();
            assert_eq!(got.len(), items.len(), "duplicate rows at step {step}");
            assert_eq!(got, expected, "membership diverged at step {step}");
            for held in &items {
                assert_eq!(held.content, live[&held.id].content);
            }
        }
    }
}

use crate::backend::Backend;
use crate::content::{ContentItem, Profile};
use crate::settings::settings;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Attaches author profiles to content rows. Anonymous rows are never looked
/// up, and a failed lookup degrades to "no author" instead of an error.
#[derive(Clone)]
pub struct Enricher {
    backend: Arc<dyn Backend>,
    concurrency: usize,
}

impl Enricher {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            concurrency: settings().enrich.concurrency.max(1),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn needs_lookup(item: &ContentItem) -> bool {
        !item.is_anonymous && item.author.is_none()
    }

    async fn lookup(&self, author_id: Uuid) -> Option<Profile> {
        match self.backend.fetch_profile(author_id).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::debug!(%author_id, error = %e, "profile lookup failed");
                None
            }
        }
    }

    pub async fn enrich(&self, mut item: ContentItem) -> ContentItem {
        if item.is_anonymous {
            item.author = None;
            return item;
        }
        if Self::needs_lookup(&item) {
            item.author = self.lookup(item.author_id).await;
        }
        item
    }

    /// Enriches a page, resolving each distinct author once. Lookups run
    /// concurrently and finish independently of each other.
    pub async fn enrich_page(&self, items: Vec<ContentItem>) -> Vec<ContentItem> {
        let mut seen = HashSet::new();
        let authors: Vec<Uuid> = items
            .iter()
            .filter(|item| Self::needs_lookup(item))
            .map(|item| item.author_id)
            .filter(|id| seen.insert(*id))
            .collect();

        let profiles: HashMap<Uuid, Profile> = stream::iter(authors)
            .map(|author_id| async move { (author_id, self.lookup(author_id).await) })
            .buffer_unordered(self.concurrency)
            .filter_map(|(author_id, profile)| async move { profile.map(|p| (author_id, p)) })
            .collect()
            .await;

        items
            .into_iter()
            .map(|mut item| {
                if item.is_anonymous {
                    item.author = None;
                } else if item.author.is_none() {
                    item.author = profiles.get(&item.author_id).cloned();
                }
                item
            })
            .collect()
    }
}

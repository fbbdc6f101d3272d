use crate::settings::settings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContentKind {
    Story,
    CommunityPost,
    Comment,
}

impl ContentKind {
    pub fn table(&self) -> &'static str {
        let tables = &settings().tables;
        match self {
            Self::Story => &tables.stories,
            Self::CommunityPost => &tables.community_posts,
            Self::Comment => &tables.comments,
        }
    }

    pub fn empty_message(&self) -> &'static str {
        match self {
            Self::Story => "No stories found",
            Self::CommunityPost => "No posts yet",
            Self::Comment => "No comments yet",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// A story, community post or comment as delivered by the backend.
///
/// `author` is never part of the stored row; it is filled in by the enricher
/// and stays `None` for anonymous items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: Uuid,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_draft: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Profile>,
}

fn default_active() -> bool {
    true
}

impl ContentItem {
    pub fn from_row(row: Value) -> Result<Self, serde_json::Error> {
        let mut item: ContentItem = serde_json::from_value(row)?;
        if item.is_anonymous {
            item.author = None;
        }
        Ok(item)
    }

    pub fn author_name(&self) -> &str {
        let s = &settings().enrich;
        if self.is_anonymous {
            return &s.anonymous_name;
        }
        self.author
            .as_ref()
            .and_then(|p| p.display_name.as_deref())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(s.placeholder_name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub votes: BTreeMap<usize, BTreeSet<Uuid>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

impl Poll {
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|end| end <= now)
    }

    pub fn total_votes(&self) -> usize {
        self.votes.values().map(BTreeSet::len).sum()
    }

    pub fn vote_of(&self, user_id: Uuid) -> Option<usize> {
        self.votes
            .iter()
            .find(|(_, voters)| voters.contains(&user_id))
            .map(|(option, _)| *option)
    }

    /// Drops any vote `user_id` holds on this poll and records one for `option`.
    pub fn recast(&mut self, user_id: Uuid, option: usize) {
        for voters in self.votes.values_mut() {
            voters.remove(&user_id);
        }
        self.votes.retain(|_, voters| !voters.is_empty());
        self.votes.entry(option).or_default().insert(user_id);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub content_type: ContentKind,
    pub content_id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FlagStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Removed,
}

impl FlagStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn can_transition_to(&self, next: FlagStatus) -> bool {
        !self.is_terminal() && next.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationFlag {
    pub id: Uuid,
    pub content_type: ContentKind,
    pub content_id: Uuid,
    pub reporter_id: Uuid,
    pub reason: String,
    #[serde(default)]
    pub status: FlagStatus,
    #[serde(default)]
    pub reviewed_by: Option<Uuid>,
    #[serde(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "lowercase")]
pub enum ChangeKind {
    #[serde(alias = "insert")]
    Insert,
    #[serde(alias = "update")]
    Update,
    #[serde(alias = "delete")]
    Delete,
}

/// One change-feed notification. Rows stay raw until the synchronizer decodes
/// them so that a malformed row can be dropped on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl ChangeEvent {
    pub fn insert(row: Value) -> Self {
        Self {
            event_type: ChangeKind::Insert,
            new: Some(row),
            old: None,
        }
    }

    pub fn update(row: Value) -> Self {
        Self {
            event_type: ChangeKind::Update,
            new: Some(row),
            old: None,
        }
    }

    pub fn delete(id: Uuid) -> Self {
        Self {
            event_type: ChangeKind::Delete,
            new: None,
            old: Some(serde_json::json!({ "id": id })),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RowId {
    pub id: Uuid,
}

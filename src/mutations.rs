use crate::backend::{Backend, Query};
use crate::content::{ContentItem, ContentKind, FlagStatus, ModerationFlag, Poll, RowId};
use crate::enrich::Enricher;
use crate::error::{BackendError, MutationError, MutationResult};
use crate::live::LiveList;
use crate::notice::Notices;
use crate::settings::settings;
use crate::utils::logs;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Write actions. Every write is confirmed by the backend before local state
/// changes; the confirmed row is then placed locally instead of refetching.
#[derive(Clone)]
pub struct Mutations {
    backend: Arc<dyn Backend>,
    enricher: Enricher,
    notices: Notices,
}

impl Mutations {
    pub fn new(backend: Arc<dyn Backend>, notices: Notices) -> Self {
        let enricher = Enricher::new(backend.clone());
        Self {
            backend,
            enricher,
            notices,
        }
    }

    fn require_user(&self) -> MutationResult<Uuid> {
        self.backend
            .current_user()
            .ok_or(MutationError::Unauthenticated)
    }

    fn report<T>(&self, action: &str, result: MutationResult<T>) -> MutationResult<T> {
        if let Err(e) = &result {
            logs::log_mutation_failed(action, &e.to_string());
            match e {
                MutationError::Unauthenticated => self
                    .notices
                    .sign_in_required(format!("Sign in to {action}")),
                _ => self.notices.error(format!("Could not {action}: {e}")),
            }
        }
        result
    }

    async fn fetch_one(&self, table: &str, id: Uuid) -> MutationResult<Value> {
        let query = Query::table(table).eq("id", id.to_string()).page(0, 1);
        self.backend
            .select(&query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::NotFound(format!("{table}/{id}")).into())
    }

    /// Posts a comment and places it in `thread` right away. The change-feed
    /// echo of the same row is later ignored by id.
    pub async fn submit_comment(
        &self,
        story_id: Uuid,
        body: &str,
        thread: &LiveList,
    ) -> MutationResult<ContentItem> {
        let result = self.try_submit_comment(story_id, body, thread).await;
        self.report("post comment", result)
    }

    async fn try_submit_comment(
        &self,
        story_id: Uuid,
        body: &str,
        thread: &LiveList,
    ) -> MutationResult<ContentItem> {
        let user = self.require_user()?;
        let body = body.trim();
        if body.is_empty() {
            return Err(MutationError::EmptyBody);
        }
        let max = settings().limits.comment_max_chars;
        if body.chars().count() > max {
            return Err(MutationError::BodyTooLong { max });
        }

        let row = json!({
            "story_id": story_id,
            "author_id": user,
            "content": body,
            "is_draft": false,
            "is_active": true,
            "is_anonymous": false,
        });
        let inserted = self
            .backend
            .insert(ContentKind::Comment.table(), row)
            .await?;
        let comment = self.enricher.enrich(ContentItem::from_row(inserted)?).await;

        let outcome = thread.insert_local(comment.clone()).await;
        logs::log_mutation("comment", comment.id, &outcome.to_string());
        Ok(comment)
    }

    /// Records the caller's vote, dropping any earlier vote they hold on the
    /// same poll. The whole tally is read, rebuilt and written back, so two
    /// votes racing from the same user resolve to whichever write lands last.
    pub async fn cast_vote(&self, poll_id: Uuid, option_index: usize) -> MutationResult<Poll> {
        let result = self.try_cast_vote(poll_id, option_index).await;
        self.report("vote", result)
    }

    async fn try_cast_vote(&self, poll_id: Uuid, option_index: usize) -> MutationResult<Poll> {
        let user = self.require_user()?;
        let table = settings().tables.polls.as_str();

        let mut poll: Poll = serde_json::from_value(self.fetch_one(table, poll_id).await?)?;
        if option_index >= poll.options.len() {
            return Err(MutationError::InvalidOption {
                index: option_index,
                options: poll.options.len(),
            });
        }
        if poll.is_closed(Utc::now()) {
            return Err(MutationError::PollClosed);
        }

        poll.recast(user, option_index);
        let patch = json!({ "votes": poll.votes });
        let updated: Poll = serde_json::from_value(self.backend.update(table, poll_id, patch).await?)?;

        logs::log_mutation("vote", poll_id, &format!("option {option_index}"));
        Ok(updated)
    }

    /// Files a moderation flag. Repeated flags for the same item are kept as
    /// separate records.
    pub async fn flag_content(
        &self,
        content_type: ContentKind,
        content_id: Uuid,
        reason: &str,
    ) -> MutationResult<ModerationFlag> {
        let result = self.try_flag_content(content_type, content_id, reason).await;
        let flag = self.report("flag content", result)?;
        self.notices
            .info("Thanks for the report. A moderator will take a look.");
        Ok(flag)
    }

    async fn try_flag_content(
        &self,
        content_type: ContentKind,
        content_id: Uuid,
        reason: &str,
    ) -> MutationResult<ModerationFlag> {
        let user = self.require_user()?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(MutationError::EmptyReason);
        }
        let reason: String = reason
            .chars()
            .take(settings().limits.flag_reason_max_chars)
            .collect();

        let row = json!({
            "content_type": content_type,
            "content_id": content_id,
            "reporter_id": user,
            "reason": reason,
            "status": FlagStatus::Pending,
        });
        let inserted = self
            .backend
            .insert(settings().tables.flags.as_str(), row)
            .await?;
        let flag: ModerationFlag = serde_json::from_value(inserted)?;

        logs::log_mutation("flag", flag.id, &format!("{content_type} {content_id}"));
        Ok(flag)
    }

    pub async fn pending_flags(&self) -> MutationResult<Vec<ModerationFlag>> {
        let result = self.try_pending_flags().await;
        self.report("load flags", result)
    }

    async fn try_pending_flags(&self) -> MutationResult<Vec<ModerationFlag>> {
        self.require_user()?;
        let table = settings().tables.flags.as_str();
        let query = Query::table(table)
            .eq("status", FlagStatus::Pending.to_string())
            .order_by("created_at", true)
            .order_by("id", true);

        let flags = self
            .backend
            .select(&query)
            .await?
            .into_iter()
            .filter_map(|row| match serde_json::from_value(row) {
                Ok(flag) => Some(flag),
                Err(e) => {
                    logs::log_event_dropped(table, &format!("malformed flag: {e}"));
                    None
                }
            })
            .collect();
        Ok(flags)
    }

    /// Resolves a pending flag. A `Removed` decision also takes the flagged
    /// content out of every public list.
    pub async fn review_flag(
        &self,
        flag_id: Uuid,
        decision: FlagStatus,
    ) -> MutationResult<ModerationFlag> {
        let result = self.try_review_flag(flag_id, decision).await;
        self.report("review flag", result)
    }

    async fn try_review_flag(
        &self,
        flag_id: Uuid,
        decision: FlagStatus,
    ) -> MutationResult<ModerationFlag> {
        let reviewer = self.require_user()?;
        if !decision.is_terminal() {
            return Err(MutationError::InvalidTransition);
        }

        let table = settings().tables.flags.as_str();
        let flag: ModerationFlag = serde_json::from_value(self.fetch_one(table, flag_id).await?)?;
        if !flag.status.can_transition_to(decision) {
            return Err(MutationError::FlagAlreadyResolved(flag.status));
        }

        if decision == FlagStatus::Removed {
            let deactivated = self
                .backend
                .update(
                    flag.content_type.table(),
                    flag.content_id,
                    json!({ "is_active": false }),
                )
                .await;
            match deactivated {
                Ok(_) | Err(BackendError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let patch = json!({
            "status": decision,
            "reviewed_by": reviewer,
            "reviewed_at": Utc::now(),
        });
        let reviewed: ModerationFlag =
            serde_json::from_value(self.backend.update(table, flag_id, patch).await?)?;

        logs::log_mutation("review", flag_id, &decision.to_string());
        Ok(reviewed)
    }

    /// Adds the caller's reaction, or takes it back if already present.
    /// Returns whether the reaction is active afterwards.
    pub async fn toggle_reaction(
        &self,
        content_type: ContentKind,
        content_id: Uuid,
        kind: &str,
    ) -> MutationResult<bool> {
        let result = self.try_toggle_reaction(content_type, content_id, kind).await;
        self.report("react", result)
    }

    async fn try_toggle_reaction(
        &self,
        content_type: ContentKind,
        content_id: Uuid,
        kind: &str,
    ) -> MutationResult<bool> {
        let user = self.require_user()?;
        let table = settings().tables.reactions.as_str();

        let query = Query::table(table)
            .eq("content_type", content_type.to_string())
            .eq("content_id", content_id.to_string())
            .eq("user_id", user.to_string())
            .eq("kind", kind)
            .page(0, 1);
        let existing = self.backend.select(&query).await?.into_iter().next();

        let active = match existing {
            Some(row) => {
                let RowId { id } = serde_json::from_value(row)?;
                self.backend.delete(table, id).await?;
                false
            }
            None => {
                let row = json!({
                    "content_type": content_type,
                    "content_id": content_id,
                    "user_id": user,
                    "kind": kind,
                });
                self.backend.insert(table, row).await?;
                true
            }
        };

        logs::log_mutation("reaction", content_id, if active { kind } else { "withdrawn" });
        Ok(active)
    }

    /// Reaction counts per kind for one item.
    pub async fn reaction_tally(
        &self,
        content_type: ContentKind,
        content_id: Uuid,
    ) -> MutationResult<BTreeMap<String, usize>> {
        let query = Query::table(settings().tables.reactions.as_str())
            .eq("content_type", content_type.to_string())
            .eq("content_id", content_id.to_string());

        let mut tally = BTreeMap::new();
        for row in self.backend.select(&query).await? {
            if let Some(kind) = row.get("kind").and_then(Value::as_str) {
                *tally.entry(kind.to_string()).or_default() += 1;
            }
        }
        Ok(tally)
    }
}

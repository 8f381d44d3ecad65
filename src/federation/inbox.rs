//! Inbox processing
//!
//! Each verified inbound activity is handled to completion inside the
//! request. Replies are never sent inline; they go through the outbox queues.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::activity::{Accept, CreateNote, Follow, InboundActivity, Like, UndoFollow, UndoLike};
use super::delivery::{InboxTarget, Outbox, builder};
use super::local_actor::LocalActorUrls;
use super::remote_actor::{RemoteActor, RemoteActors};
use crate::data::{
    ActivityRecord, Database, FederationHost, MAX_CLOCK_SKEW_SECONDS, NewFederatedUserActivity,
    Repository, User,
};
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_RECEIVED, INBOX_OUTCOMES};

/// Local actor whose inbox received the activity.
#[derive(Debug, Clone)]
pub enum InboxOwner {
    Person(User),
    Repository(Repository),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    /// 202, a reply was scheduled
    Accepted,
    /// 204
    NoContent,
}

#[derive(Clone)]
pub struct InboxProcessor {
    db: Arc<Database>,
    actors: RemoteActors,
    urls: LocalActorUrls,
    outbox: Outbox,
}

impl InboxProcessor {
    pub fn new(
        db: Arc<Database>,
        actors: RemoteActors,
        urls: LocalActorUrls,
        outbox: Outbox,
    ) -> Self {
        Self {
            db,
            actors,
            urls,
            outbox,
        }
    }

    pub async fn process(
        &self,
        owner: &InboxOwner,
        activity: InboundActivity,
    ) -> Result<InboxOutcome, AppError> {
        let kind = activity.kind();
        ACTIVITIES_RECEIVED.with_label_values(&[kind]).inc();

        let result = self.dispatch(owner, activity).await;
        let outcome = match &result {
            Ok(InboxOutcome::Accepted) => "accepted",
            Ok(InboxOutcome::NoContent) => "no_content",
            Err(AppError::NotAcceptable(_)) => "not_acceptable",
            Err(AppError::Validation(_)) => "invalid",
            Err(AppError::TrustViolation(_)) => "untrusted",
            Err(_) => "error",
        };
        INBOX_OUTCOMES.with_label_values(&[outcome]).inc();

        if let Err(e) = &result {
            tracing::warn!(activity = kind, error = %e, "Inbound activity rejected");
        }
        result
    }

    async fn dispatch(
        &self,
        owner: &InboxOwner,
        activity: InboundActivity,
    ) -> Result<InboxOutcome, AppError> {
        match (owner, activity) {
            (InboxOwner::Person(user), _) if user.is_remote => Err(AppError::NotFound),
            (InboxOwner::Person(user), InboundActivity::Follow(follow)) => {
                self.on_follow(user, follow).await
            }
            (InboxOwner::Person(user), InboundActivity::Undo(undo)) => {
                self.on_undo_follow(user, undo).await
            }
            (InboxOwner::Person(user), InboundActivity::Accept(accept)) => {
                self.on_accept(user, accept).await
            }
            (InboxOwner::Person(user), InboundActivity::Create(create)) => {
                self.on_create(user, create).await
            }
            (InboxOwner::Repository(repository), InboundActivity::Like(like)) => {
                self.on_like(repository, like).await
            }
            (InboxOwner::Repository(repository), InboundActivity::UndoLike(undo)) => {
                self.on_undo_like(repository, undo).await
            }
            (InboxOwner::Person(_), other) => Err(AppError::NotAcceptable(format!(
                "{} is not accepted by a person inbox",
                other.kind()
            ))),
            (InboxOwner::Repository(_), other) => Err(AppError::NotAcceptable(format!(
                "{} is not accepted by a repository inbox",
                other.kind()
            ))),
        }
    }

    fn ensure_addressed_to(&self, user: &User, object: &str) -> Result<(), AppError> {
        let expected = self.urls.person(user.id);
        if object.eq_ignore_ascii_case(&expected) {
            Ok(())
        } else {
            Err(AppError::NotAcceptable(format!(
                "object {object} does not match the inbox owner {expected}"
            )))
        }
    }

    /// Unix milliseconds of `timestamp`, rejecting timestamps in the future.
    fn ordering_ms(timestamp: Option<DateTime<Utc>>) -> Result<Option<i64>, AppError> {
        let Some(timestamp) = timestamp else {
            return Ok(None);
        };
        if timestamp > Utc::now() + Duration::seconds(MAX_CLOCK_SKEW_SECONDS) {
            return Err(AppError::NotAcceptable(format!(
                "activity timestamp {timestamp} is in the future"
            )));
        }
        Ok(Some(timestamp.timestamp_millis()))
    }

    fn not_newer(host: &FederationHost, timestamp: Option<DateTime<Utc>>) -> AppError {
        let timestamp = timestamp.map(|t| t.to_rfc3339()).unwrap_or_default();
        AppError::NotAcceptable(format!(
            "activity timestamp {timestamp} is not newer than the latest activity from {}",
            host.host_fqdn
        ))
    }

    /// Reject activities that are not strictly newer than the last one
    /// accepted from the same host, and record the new high-water mark.
    async fn claim_ordering(
        &self,
        host: &FederationHost,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        let Some(activity_ms) = Self::ordering_ms(timestamp)? else {
            return Ok(());
        };
        if self
            .db
            .claim_federation_host_activity(host.id, activity_ms)
            .await?
        {
            Ok(())
        } else {
            Err(Self::not_newer(host, timestamp))
        }
    }

    async fn on_follow(&self, user: &User, follow: Follow) -> Result<InboxOutcome, AppError> {
        self.ensure_addressed_to(user, &follow.object)?;
        let remote = self.actors.find_or_create(&follow.actor).await?;

        let Some(edge_id) = self
            .db
            .add_follower(user.id, remote.federated_user.id)
            .await?
        else {
            tracing::debug!(user = user.id, follower = %follow.actor, "Already followed");
            return Ok(InboxOutcome::Accepted);
        };

        let actor = self.urls.person(user.id);
        let accept = builder::accept(&format!("{actor}/follows/{edge_id}"), &actor, follow.raw);
        if let Err(e) = self
            .outbox
            .enqueue(
                user.id,
                InboxTarget::FederatedUser(remote.federated_user.id),
                &accept,
            )
            .await
        {
            // no Accept, no edge
            self.db
                .remove_follower(user.id, remote.federated_user.id)
                .await?;
            return Err(e);
        }

        tracing::info!(user = user.id, follower = %follow.actor, "New follower");
        Ok(InboxOutcome::Accepted)
    }

    async fn on_undo_follow(
        &self,
        user: &User,
        undo: UndoFollow,
    ) -> Result<InboxOutcome, AppError> {
        self.ensure_addressed_to(user, &undo.follow.object)?;
        let Some(remote) = self.actors.find(&undo.actor).await? else {
            tracing::debug!(actor = %undo.actor, "Undo from unknown actor");
            return Ok(InboxOutcome::NoContent);
        };

        if self
            .db
            .remove_follower(user.id, remote.federated_user.id)
            .await?
        {
            tracing::info!(user = user.id, follower = %undo.actor, "Follower removed");
        }
        Ok(InboxOutcome::NoContent)
    }

    async fn on_accept(&self, user: &User, accept: Accept) -> Result<InboxOutcome, AppError> {
        let Some(remote) = self.actors.find(&accept.actor).await? else {
            tracing::warn!(actor = %accept.actor, "Accept from unknown actor");
            return Ok(InboxOutcome::NoContent);
        };

        match self
            .db
            .mark_following_accepted(&accept.follow_id, remote.federated_user.id)
            .await?
        {
            Some(following) if following.local_user_id == user.id => {
                tracing::info!(user = user.id, target = %accept.actor, "Follow accepted");
            }
            Some(following) => {
                tracing::warn!(
                    user = user.id,
                    follower = following.local_user_id,
                    "Accept delivered to the wrong inbox"
                );
            }
            None => {
                tracing::debug!(follow = %accept.follow_id, "Accept for unknown Follow");
            }
        }
        Ok(InboxOutcome::NoContent)
    }

    async fn on_create(&self, user: &User, create: CreateNote) -> Result<InboxOutcome, AppError> {
        let remote = self.actors.find_or_create(&create.actor).await?;
        let activity_ms = Self::ordering_ms(create.published)?;

        let note_url = create
            .note
            .url
            .clone()
            .or_else(|| create.note.id.clone())
            .unwrap_or_else(|| create.id.clone());
        let activity = NewFederatedUserActivity {
            user_id: remote.user.id,
            actor_id: create.actor.clone(),
            original_activity_id: create.id.clone(),
            note_content: ammonia::clean(&create.note.content),
            note_url,
            original_note: create.raw.to_string(),
        };

        let ordering = activity_ms.map(|ms| (remote.host.id, ms));
        match self
            .db
            .record_federated_user_activity(&activity, ordering)
            .await?
        {
            ActivityRecord::Recorded => {
                tracing::info!(user = user.id, actor = %create.actor, "Recorded remote activity");
            }
            ActivityRecord::Duplicate => {
                tracing::debug!(activity = %create.id, "Duplicate Create ignored");
            }
            ActivityRecord::Stale => {
                return Err(Self::not_newer(&remote.host, create.published));
            }
        }
        Ok(InboxOutcome::NoContent)
    }

    async fn liking_actor(
        &self,
        repository: &Repository,
        actor: &str,
        object: &str,
    ) -> Result<RemoteActor, AppError> {
        let expected = self.urls.repository(repository.id);
        if !object.eq_ignore_ascii_case(&expected) {
            return Err(AppError::NotAcceptable(format!(
                "object {object} does not match the inbox owner {expected}"
            )));
        }
        self.actors.find_or_create(actor).await
    }

    async fn on_like(&self, repository: &Repository, like: Like) -> Result<InboxOutcome, AppError> {
        let remote = self
            .liking_actor(repository, &like.actor, &like.object)
            .await?;
        self.claim_ordering(&remote.host, like.start_time).await?;

        if self
            .db
            .star_repository(remote.user.id, repository.id)
            .await?
        {
            tracing::info!(repository = repository.id, actor = %like.actor, "Repository starred");
        }
        Ok(InboxOutcome::NoContent)
    }

    async fn on_undo_like(
        &self,
        repository: &Repository,
        undo: UndoLike,
    ) -> Result<InboxOutcome, AppError> {
        let remote = self
            .liking_actor(repository, &undo.actor, &undo.like.object)
            .await?;
        self.claim_ordering(&remote.host, undo.start_time).await?;

        if self
            .db
            .unstar_repository(remote.user.id, repository.id)
            .await?
        {
            tracing::info!(repository = repository.id, actor = %undo.actor, "Repository unstarred");
        }
        Ok(InboxOutcome::NoContent)
    }
}

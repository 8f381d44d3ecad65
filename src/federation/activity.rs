//! Inbound activities
//!
//! A delivered payload is read into a generic [`ActivityEnvelope`] and then
//! narrowed into exactly one [`InboundActivity`] variant. Anything outside the
//! supported set is rejected as not acceptable.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppError;
use crate::validation::{Validate, is_valid, validate_not_empty};

/// Fields shared by every activity.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEnvelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub actor: Value,
    #[serde(default)]
    pub object: Value,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub published: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<Value>,
    #[serde(default)]
    pub cc: Option<Value>,
}

impl ActivityEnvelope {
    pub fn from_value(raw: &Value) -> Result<Self, AppError> {
        Self::deserialize(raw).map_err(|e| AppError::Validation(format!("Invalid activity: {e}")))
    }

    pub fn actor_id(&self) -> String {
        link_id(&self.actor).unwrap_or_default().to_string()
    }

    pub fn object_id(&self) -> String {
        link_id(&self.object).unwrap_or_default().to_string()
    }
}

/// IRI of a link that is either a bare string or an object with an `id`.
pub fn link_id(value: &Value) -> Option<&str> {
    value
        .as_str()
        .or_else(|| value.get("id").and_then(Value::as_str))
}

#[derive(Debug, Clone)]
pub struct Follow {
    pub id: Option<String>,
    pub actor: String,
    /// Actor being followed
    pub object: String,
    pub raw: Value,
}

impl Follow {
    fn from_value(raw: Value) -> Result<Self, AppError> {
        let envelope = ActivityEnvelope::from_value(&raw)?;
        Ok(Self {
            id: envelope.id.clone(),
            actor: envelope.actor_id(),
            object: envelope.object_id(),
            raw,
        })
    }
}

impl Validate for Follow {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.actor, "actor");
        result.extend(validate_not_empty(&self.object, "object"));
        result
    }
}

#[derive(Debug, Clone)]
pub struct UndoFollow {
    pub actor: String,
    pub follow: Follow,
}

impl Validate for UndoFollow {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.actor, "actor");
        result.extend(self.follow.validate());
        if !self.follow.actor.is_empty() && self.follow.actor != self.actor {
            result.push(format!(
                "undo actor {} is not the follow actor {}",
                self.actor, self.follow.actor
            ));
        }
        result
    }
}

#[derive(Debug, Clone)]
pub struct Accept {
    pub actor: String,
    /// Id of the accepted Follow
    pub follow_id: String,
}

impl Validate for Accept {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.actor, "actor");
        result.extend(validate_not_empty(&self.follow_id, "object"));
        result
    }
}

#[derive(Debug, Clone)]
pub struct Note {
    pub id: Option<String>,
    pub attributed_to: Option<String>,
    pub content: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateNote {
    /// Activity id, falling back to the note's id or url
    pub id: String,
    pub actor: String,
    pub published: Option<DateTime<Utc>>,
    pub note: Note,
    pub raw: Value,
}

impl Validate for CreateNote {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.id, "id");
        result.extend(validate_not_empty(&self.actor, "actor"));
        result.extend(validate_not_empty(&self.note.content, "object.content"));
        if let Some(author) = &self.note.attributed_to {
            if author != &self.actor {
                result.push(format!(
                    "note is attributed to {author}, not to the actor {}",
                    self.actor
                ));
            }
        }
        result
    }
}

#[derive(Debug, Clone)]
pub struct Like {
    pub id: Option<String>,
    pub actor: String,
    /// Repository being starred
    pub object: String,
    pub start_time: Option<DateTime<Utc>>,
    pub raw: Value,
}

impl Like {
    fn from_value(raw: Value) -> Result<Self, AppError> {
        let envelope = ActivityEnvelope::from_value(&raw)?;
        Ok(Self {
            id: envelope.id.clone(),
            actor: envelope.actor_id(),
            object: envelope.object_id(),
            start_time: envelope.start_time,
            raw,
        })
    }
}

impl Validate for Like {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.actor, "actor");
        result.extend(validate_not_empty(&self.object, "object"));
        if self.start_time.is_none() {
            result.push("field startTime should not be empty".to_string());
        }
        result
    }
}

#[derive(Debug, Clone)]
pub struct UndoLike {
    pub actor: String,
    pub start_time: Option<DateTime<Utc>>,
    pub like: Like,
}

impl Validate for UndoLike {
    fn validate(&self) -> Vec<String> {
        let mut result = validate_not_empty(&self.actor, "actor");
        result.extend(validate_not_empty(&self.like.actor, "object.actor"));
        result.extend(validate_not_empty(&self.like.object, "object.object"));
        if self.start_time.is_none() {
            result.push("field startTime should not be empty".to_string());
        }
        if !self.like.actor.is_empty() && self.like.actor != self.actor {
            result.push(format!(
                "undo actor {} is not the like actor {}",
                self.actor, self.like.actor
            ));
        }
        result
    }
}

/// Activities accepted by the inboxes.
#[derive(Debug, Clone)]
pub enum InboundActivity {
    Follow(Follow),
    Undo(UndoFollow),
    Accept(Accept),
    Create(CreateNote),
    Like(Like),
    UndoLike(UndoLike),
}

impl InboundActivity {
    pub fn parse(body: &[u8]) -> Result<Self, AppError> {
        let raw: Value = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("Invalid JSON: {e}")))?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: Value) -> Result<Self, AppError> {
        let envelope = ActivityEnvelope::from_value(&raw)?;

        let activity = match envelope.kind.as_str() {
            "" => {
                return Err(AppError::Validation(
                    "field type should not be empty".to_string(),
                ));
            }
            "Follow" => InboundActivity::Follow(Follow::from_value(raw)?),
            "Accept" => Self::accept(&envelope)?,
            "Undo" => Self::undo(&envelope)?,
            "Create" => Self::create(envelope, raw)?,
            "Like" => InboundActivity::Like(Like::from_value(raw)?),
            other => {
                return Err(AppError::NotAcceptable(format!(
                    "Unsupported activity type {other}"
                )));
            }
        };

        is_valid(&activity)?;
        Ok(activity)
    }

    fn accept(envelope: &ActivityEnvelope) -> Result<Self, AppError> {
        match envelope.object.get("type").and_then(Value::as_str) {
            Some("Follow") => Ok(InboundActivity::Accept(Accept {
                actor: envelope.actor_id(),
                follow_id: envelope.object_id(),
            })),
            Some(other) => Err(AppError::NotAcceptable(format!(
                "Accept of {other} is not supported"
            ))),
            None => Err(AppError::NotAcceptable(
                "Accept must embed the Follow it answers".to_string(),
            )),
        }
    }

    fn undo(envelope: &ActivityEnvelope) -> Result<Self, AppError> {
        let inner_type = envelope
            .object
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match inner_type {
            "Follow" => Ok(InboundActivity::Undo(UndoFollow {
                actor: envelope.actor_id(),
                follow: Follow::from_value(envelope.object.clone())?,
            })),
            "Like" => {
                let like = Like::from_value(envelope.object.clone())?;
                Ok(InboundActivity::UndoLike(UndoLike {
                    actor: envelope.actor_id(),
                    start_time: envelope.start_time.or(like.start_time),
                    like,
                }))
            }
            "" => Err(AppError::NotAcceptable(
                "Undo must embed the activity it reverts".to_string(),
            )),
            other => Err(AppError::NotAcceptable(format!(
                "Cannot undo activity type {other}"
            ))),
        }
    }

    fn create(envelope: ActivityEnvelope, raw: Value) -> Result<Self, AppError> {
        let object = &envelope.object;
        let object_type = object.get("type").and_then(Value::as_str).unwrap_or_default();
        if object_type != "Note" {
            return Err(AppError::NotAcceptable(format!(
                "Create of {} is not supported",
                if object_type.is_empty() { "an untyped object" } else { object_type }
            )));
        }

        let text = |field: &str| object.get(field).and_then(Value::as_str).map(str::to_string);
        let note = Note {
            id: text("id"),
            attributed_to: object.get("attributedTo").and_then(link_id).map(str::to_string),
            content: text("content").unwrap_or_default(),
            url: text("url"),
        };
        let published = envelope.published.or_else(|| {
            text("published")
                .and_then(|value| DateTime::parse_from_rfc3339(&value).ok())
                .map(|value| value.with_timezone(&Utc))
        });

        let id = envelope
            .id
            .clone()
            .or_else(|| note.id.clone())
            .or_else(|| note.url.clone())
            .unwrap_or_default();

        Ok(InboundActivity::Create(CreateNote {
            id,
            actor: envelope.actor_id(),
            published,
            note,
            raw,
        }))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundActivity::Follow(_) => "Follow",
            InboundActivity::Undo(_) => "Undo",
            InboundActivity::Accept(_) => "Accept",
            InboundActivity::Create(_) => "Create",
            InboundActivity::Like(_) => "Like",
            InboundActivity::UndoLike(_) => "UndoLike",
        }
    }

    pub fn actor(&self) -> &str {
        match self {
            InboundActivity::Follow(follow) => &follow.actor,
            InboundActivity::Undo(undo) => &undo.actor,
            InboundActivity::Accept(accept) => &accept.actor,
            InboundActivity::Create(create) => &create.actor,
            InboundActivity::Like(like) => &like.actor,
            InboundActivity::UndoLike(undo) => &undo.actor,
        }
    }

    /// Timestamp checked against the sending host's latest activity.
    pub fn ordering_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            InboundActivity::Create(create) => create.published,
            InboundActivity::Like(like) => like.start_time,
            InboundActivity::UndoLike(undo) => undo.start_time,
            InboundActivity::Follow(_) | InboundActivity::Undo(_) | InboundActivity::Accept(_) => {
                None
            }
        }
    }
}

impl Validate for InboundActivity {
    fn validate(&self) -> Vec<String> {
        match self {
            InboundActivity::Follow(follow) => follow.validate(),
            InboundActivity::Undo(undo) => undo.validate(),
            InboundActivity::Accept(accept) => accept.validate(),
            InboundActivity::Create(create) => create.validate(),
            InboundActivity::Like(like) => like.validate(),
            InboundActivity::UndoLike(undo) => undo.validate(),
        }
    }
}

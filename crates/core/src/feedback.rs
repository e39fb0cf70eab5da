//! Feedback examples — human corrections turned into a few-shot pool.
//!
//! A reviewer approves, corrects, or rejects a past agent reply. Each action
//! becomes a `FeedbackExample` whose priority decides how prominently it is
//! shown to the inference service on future turns.
//!
//! All field overrides driven by the feedback type (a rejection forcing
//! priority 0 and exclusion from prompts, the default priorities 5/8) live in
//! one place: [`normalize`] for new records and [`apply_patch`] for updates.
//! Stores apply these functions before persisting; they carry no rules of
//! their own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CuratorError;

/// Priority ceiling; priorities live in `0..=MAX_PRIORITY`.
pub const MAX_PRIORITY: i32 = 10;

/// Default priority for approved feedback.
pub const DEFAULT_APPROVED_PRIORITY: i32 = 5;

/// Default priority for corrected feedback.
pub const DEFAULT_CORRECTED_PRIORITY: i32 = 8;

/// The reviewer's verdict on an agent reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackType {
    /// The reply was good as-is.
    Approved,
    /// The reply was wrong; a corrected version is attached.
    Corrected,
    /// The reply must never be used as an example.
    Rejected,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::Approved => "approved",
            FeedbackType::Corrected => "corrected",
            FeedbackType::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for FeedbackType {
    type Err = CuratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(FeedbackType::Approved),
            "corrected" => Ok(FeedbackType::Corrected),
            "rejected" => Ok(FeedbackType::Rejected),
            other => Err(CuratorError::InvalidInput(format!(
                "unknown feedback type: '{other}'"
            ))),
        }
    }
}

/// A stored feedback example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackExample {
    /// Unique ID for this example
    pub id: String,

    /// Owning tenant
    pub tenant_id: i64,

    /// The agent this example trains
    pub agent_id: i64,

    /// The agent's team, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<i64>,

    /// The original user message
    pub user_message: String,

    /// The agent's original reply
    pub agent_response: String,

    /// The reviewer's corrected reply (required when corrected)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_response: Option<String>,

    /// The reviewer's verdict
    pub feedback_type: FeedbackType,

    /// Optional 1–5 quality rating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,

    /// Free-form reviewer notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Ranking priority, 0..=10 (higher = shown first)
    pub priority: i32,

    /// Whether this example is eligible for few-shot assembly
    pub used_in_prompt: bool,

    /// Optional structured conversation context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,

    /// When the feedback was recorded
    pub created_at: DateTime<Utc>,
}

/// Reviewer input for a new feedback example, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackInput {
    pub tenant_id: i64,
    pub agent_id: i64,
    #[serde(default)]
    pub team_id: Option<i64>,
    pub user_message: String,
    pub agent_response: String,
    #[serde(default)]
    pub corrected_response: Option<String>,
    pub feedback_type: FeedbackType,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub used_in_prompt: Option<bool>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// A partial update to an existing example.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackPatch {
    #[serde(default)]
    pub corrected_response: Option<String>,
    #[serde(default)]
    pub feedback_type: Option<FeedbackType>,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub used_in_prompt: Option<bool>,
}

/// Tenant-scoped listing filter.
#[derive(Debug, Clone, Default)]
pub struct FeedbackFilter {
    pub agent_id: Option<i64>,
    pub team_id: Option<i64>,
    pub feedback_type: Option<FeedbackType>,
    pub used_in_prompt: Option<bool>,
    pub offset: usize,
    pub limit: usize,
}

/// One page of a filtered listing.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackPage {
    pub examples: Vec<FeedbackExample>,
    pub total: usize,
}

/// The stable, serializable export shape for offline inspection.
///
/// Deliberately timestamp-free at the top level: two exports over identical
/// stored data must be byte-identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamplesExport {
    pub agent_id: i64,
    pub total: usize,
    pub examples: Vec<ExportedExample>,
}

/// One example inside an [`ExamplesExport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedExample {
    pub user_message: String,
    pub agent_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_response: Option<String>,
    pub feedback_type: FeedbackType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl From<&FeedbackExample> for ExportedExample {
    fn from(ex: &FeedbackExample) -> Self {
        Self {
            user_message: ex.user_message.clone(),
            agent_response: ex.agent_response.clone(),
            corrected_response: ex.corrected_response.clone(),
            feedback_type: ex.feedback_type,
            notes: ex.notes.clone(),
            priority: ex.priority,
            created_at: ex.created_at,
        }
    }
}

/// Validate reviewer input and resolve priority / prompt eligibility.
///
/// The rules, in order:
/// 1. `user_message` and `agent_response` must be non-empty.
/// 2. `corrected` requires a non-empty `corrected_response`.
/// 3. `rating`, if present, must be 1–5.
/// 4. `rejected` forces `priority = 0` and `used_in_prompt = false`, whatever
///    the caller supplied.
/// 5. Otherwise the caller's priority wins (clamped to 0..=10); the defaults
///    are 5 for `approved` and 8 for `corrected`. `used_in_prompt` defaults
///    to true.
pub fn normalize(input: FeedbackInput) -> Result<FeedbackExample, CuratorError> {
    if input.user_message.trim().is_empty() {
        return Err(CuratorError::InvalidInput("userMessage is required".into()));
    }
    if input.agent_response.trim().is_empty() {
        return Err(CuratorError::InvalidInput(
            "agentResponse is required".into(),
        ));
    }
    if input.feedback_type == FeedbackType::Corrected
        && input
            .corrected_response
            .as_deref()
            .is_none_or(|s| s.trim().is_empty())
    {
        return Err(CuratorError::InvalidInput(
            "correctedResponse is required when feedbackType is 'corrected'".into(),
        ));
    }
    if let Some(rating) = input.rating {
        if !(1..=5).contains(&rating) {
            return Err(CuratorError::InvalidInput(format!(
                "rating must be 1-5, got {rating}"
            )));
        }
    }

    let (priority, used_in_prompt) = match input.feedback_type {
        FeedbackType::Rejected => (0, false),
        FeedbackType::Approved => (
            input
                .priority
                .unwrap_or(DEFAULT_APPROVED_PRIORITY)
                .clamp(0, MAX_PRIORITY),
            input.used_in_prompt.unwrap_or(true),
        ),
        FeedbackType::Corrected => (
            input
                .priority
                .unwrap_or(DEFAULT_CORRECTED_PRIORITY)
                .clamp(0, MAX_PRIORITY),
            input.used_in_prompt.unwrap_or(true),
        ),
    };

    Ok(FeedbackExample {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: input.tenant_id,
        agent_id: input.agent_id,
        team_id: input.team_id,
        user_message: input.user_message,
        agent_response: input.agent_response,
        corrected_response: input.corrected_response,
        feedback_type: input.feedback_type,
        rating: input.rating,
        notes: input.notes,
        priority,
        used_in_prompt,
        context: input.context,
        created_at: Utc::now(),
    })
}

/// Apply a partial update to an existing example, enforcing the same rules
/// as [`normalize`].
///
/// A rejected example never becomes usable again: changing `feedback_type`
/// away from `rejected` is refused (record fresh feedback instead). Setting
/// `feedback_type` *to* `rejected` applies the rejection overrides.
pub fn apply_patch(
    mut example: FeedbackExample,
    patch: FeedbackPatch,
) -> Result<FeedbackExample, CuratorError> {
    if let Some(new_type) = patch.feedback_type {
        if example.feedback_type == FeedbackType::Rejected && new_type != FeedbackType::Rejected {
            return Err(CuratorError::InvalidInput(
                "a rejected example cannot be made usable again; record new feedback".into(),
            ));
        }
        example.feedback_type = new_type;
    }
    if let Some(corrected) = patch.corrected_response {
        example.corrected_response = Some(corrected);
    }
    if let Some(rating) = patch.rating {
        if !(1..=5).contains(&rating) {
            return Err(CuratorError::InvalidInput(format!(
                "rating must be 1-5, got {rating}"
            )));
        }
        example.rating = Some(rating);
    }
    if let Some(notes) = patch.notes {
        example.notes = Some(notes);
    }
    if let Some(priority) = patch.priority {
        example.priority = priority.clamp(0, MAX_PRIORITY);
    }
    if let Some(used) = patch.used_in_prompt {
        example.used_in_prompt = used;
    }

    if example.feedback_type == FeedbackType::Corrected
        && example
            .corrected_response
            .as_deref()
            .is_none_or(|s| s.trim().is_empty())
    {
        return Err(CuratorError::InvalidInput(
            "correctedResponse is required when feedbackType is 'corrected'".into(),
        ));
    }
    // Rejection overrides apply last so nothing in the patch can undo them.
    if example.feedback_type == FeedbackType::Rejected {
        example.priority = 0;
        example.used_in_prompt = false;
    }

    Ok(example)
}

/// The core ExampleStore trait.
///
/// Every operation is tenant-scoped: an id that exists under another tenant
/// is `NotFound` to the caller, never visible.
#[async_trait]
pub trait ExampleStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Validate, normalize, and persist new reviewer feedback.
    async fn record(&self, input: FeedbackInput) -> Result<FeedbackExample, CuratorError>;

    /// Partially update an example within the caller's tenant.
    async fn update(
        &self,
        id: &str,
        tenant_id: i64,
        patch: FeedbackPatch,
    ) -> Result<FeedbackExample, CuratorError>;

    /// The top `limit` examples for few-shot assembly: `used_in_prompt` and
    /// approved/corrected only, ordered priority descending, then newest
    /// first. This ordering decides what the inference service sees first.
    async fn ranked_examples(
        &self,
        tenant_id: i64,
        agent_id: i64,
        limit: usize,
    ) -> Result<Vec<FeedbackExample>, CuratorError>;

    /// Same filter and order as `ranked_examples`, in a stable serializable
    /// shape. Deterministic for identical underlying data.
    async fn export(
        &self,
        tenant_id: i64,
        agent_id: i64,
        limit: usize,
    ) -> Result<ExamplesExport, CuratorError>;

    /// Tenant-scoped filtered listing with offset/limit pagination.
    /// A zero `limit` is `InvalidInput`.
    async fn list(
        &self,
        tenant_id: i64,
        filter: FeedbackFilter,
    ) -> Result<FeedbackPage, CuratorError>;

    /// Hard delete within the caller's tenant.
    async fn remove(&self, id: &str, tenant_id: i64) -> Result<(), CuratorError>;
}

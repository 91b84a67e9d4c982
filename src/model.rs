//! # Sync Data Model
//!
//! Entities that travel between devices, the operation log record, and the
//! bundle exchanged in a full-state sync round. All types serialize to the
//! camelCase JSON shapes other devices expect on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Anything that participates in last-writer-wins merging.
pub trait Syncable: Clone {
    fn id(&self) -> &str;
    fn updated_at(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_tasks: Option<Vec<String>>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: None,
            priority: TaskPriority::Medium,
            status: TaskStatus::Todo,
            due_date: None,
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            parent_id: None,
            sub_tasks: None,
        }
    }
}

impl Syncable for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlockType {
    Focus,
    Break,
    Meeting,
    Task,
}

/// A slot on the circular timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBlock {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Syncable for TimeBlock {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductivePeriod {
    pub day_of_week: u8,
    pub start_hour: u8,
    pub end_hour: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingPreferences {
    pub preferred_days: Vec<u8>,
    pub preferred_hours: Vec<u8>,
}

/// Learned working habits. There is at most one per store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPattern {
    pub id: String,
    pub preferred_focus_duration: u32,
    pub preferred_break_duration: u32,
    #[serde(default)]
    pub productive_periods: Vec<ProductivePeriod>,
    #[serde(default)]
    pub meeting_preferences: MeetingPreferences,
    pub updated_at: DateTime<Utc>,
}

impl Syncable for UserPattern {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// Any record carried by a [`SyncOperation`].
///
/// Untagged on the wire: the three shapes have disjoint required fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncEntity {
    Task(Task),
    TimeBlock(TimeBlock),
    UserPattern(UserPattern),
}

impl SyncEntity {
    pub fn entity_type(&self) -> EntityType {
        match self {
            SyncEntity::Task(_) => EntityType::Task,
            SyncEntity::TimeBlock(_) => EntityType::TimeBlock,
            SyncEntity::UserPattern(_) => EntityType::UserPattern,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            SyncEntity::Task(t) => &t.id,
            SyncEntity::TimeBlock(b) => &b.id,
            SyncEntity::UserPattern(p) => &p.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Task,
    TimeBlock,
    UserPattern,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    /// Milliseconds since the Unix epoch, taken when the operation was recorded.
    pub timestamp: i64,
    pub device_id: String,
    pub version: u32,
}

/// A mutation before it has been stamped with [`SyncMetadata`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDraft {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SyncEntity>,
}

impl OperationDraft {
    pub fn create(entity: SyncEntity) -> Self {
        Self::upsert(OperationType::Create, entity)
    }

    pub fn update(entity: SyncEntity) -> Self {
        Self::upsert(OperationType::Update, entity)
    }

    pub fn delete(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            op_type: OperationType::Delete,
            entity_type,
            entity_id: entity_id.into(),
            data: None,
        }
    }

    fn upsert(op_type: OperationType, entity: SyncEntity) -> Self {
        Self {
            op_type,
            entity_type: entity.entity_type(),
            entity_id: entity.id().to_string(),
            data: Some(entity),
        }
    }
}

/// One recorded mutation intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SyncEntity>,
    pub metadata: SyncMetadata,
}

impl SyncOperation {
    pub fn from_draft(draft: OperationDraft, metadata: SyncMetadata) -> Self {
        Self {
            op_type: draft.op_type,
            entity_type: draft.entity_type,
            entity_id: draft.entity_id,
            data: draft.data,
            metadata,
        }
    }
}

/// Full state transferred in one sync round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncableData {
    pub tasks: Vec<Task>,
    pub time_blocks: Vec<TimeBlock>,
    pub user_pattern: Option<UserPattern>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Local,
    Remote,
    Merge,
}

/// A manual override for a conflict the automatic merge got wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub operation: SyncOperation,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_data: Option<SyncEntity>,
}

/// Another device taking part in sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPeer {
    pub id: String,
    pub display_name: String,
    pub last_seen: DateTime<Utc>,
}

impl SyncPeer {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            last_seen: Utc::now(),
        }
    }
}

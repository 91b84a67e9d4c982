//! # Sync Manager
//!
//! Owns the merge algorithm and the pending-operation log.
//!
//! Merging is per collection, last-writer-wins on `updatedAt`: an entity present
//! on one side only is kept, an entity present on both sides keeps the copy
//! with the strictly greater timestamp, and ties keep the local copy. The merge
//! is idempotent and, for independently timestamped updates, commutative.
//!
//! Timestamps are device wall clocks. Skew between devices can make the older
//! edit win; no logical clock compensates for this.
//!
//! Entity collections are never cached here: every merge and replay reads
//! fresh state from storage, computes the result in full, then writes it back.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::crypto::{EncryptedEnvelope, EncryptionManager};
use crate::error::{Result, SyncError};
use crate::model::{
    ConflictResolution, EntityType, OperationDraft, OperationType, Resolution, SyncEntity,
    SyncMetadata, SyncOperation, Syncable, SyncableData, UserPattern,
};
use crate::storage::{ns, StorageAdapter, TypedStorage};

/// Version stamped on every recorded operation.
pub const SYNC_PROTOCOL_VERSION: u32 = 1;

/// How many remote entities replaced or extended local state in one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub tasks: usize,
    pub time_blocks: usize,
    pub user_pattern: bool,
}

impl MergeReport {
    pub fn is_empty(&self) -> bool {
        self.tasks == 0 && self.time_blocks == 0 && !self.user_pattern
    }
}

/// Union `local` and `remote` by id, keeping the newer copy of shared ids.
///
/// Local order is preserved; remote-only entities are appended in remote
/// order. Returns the merged list and the number of remote entities taken.
pub fn merge_entities<T: Syncable>(local: Vec<T>, remote: Vec<T>) -> (Vec<T>, usize) {
    let mut merged = local;
    let mut index: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, entity)| (entity.id().to_string(), i))
        .collect();
    let mut taken = 0;

    for remote_entity in remote {
        match index.get(remote_entity.id()) {
            None => {
                index.insert(remote_entity.id().to_string(), merged.len());
                merged.push(remote_entity);
                taken += 1;
            }
            Some(&i) => {
                if remote_entity.updated_at() > merged[i].updated_at() {
                    merged[i] = remote_entity;
                    taken += 1;
                }
            }
        }
    }

    (merged, taken)
}

/// Singleton variant of [`merge_entities`]. Returns whether remote won.
pub fn merge_user_pattern(
    local: Option<UserPattern>,
    remote: Option<UserPattern>,
) -> (Option<UserPattern>, bool) {
    match (local, remote) {
        (None, Some(remote)) => (Some(remote), true),
        (Some(local), Some(remote)) if remote.updated_at > local.updated_at => (Some(remote), true),
        (local, _) => (local, false),
    }
}

fn upsert_by_id<T: Syncable>(entities: &mut Vec<T>, entity: T) {
    match entities.iter().position(|e| e.id() == entity.id()) {
        Some(i) => entities[i] = entity,
        None => entities.push(entity),
    }
}

fn remove_by_id<T: Syncable>(entities: &mut Vec<T>, id: &str) -> bool {
    let before = entities.len();
    entities.retain(|e| e.id() != id);
    entities.len() != before
}

/// Reject operations that cannot be replayed as written.
pub fn validate_operation(
    op_type: OperationType,
    entity_type: EntityType,
    entity_id: &str,
    data: Option<&SyncEntity>,
) -> Result<()> {
    if entity_id.is_empty() {
        return Err(SyncError::InvalidOperation("entity id must not be empty".to_string()));
    }

    match (op_type, data) {
        (OperationType::Delete, _) => Ok(()),
        (_, None) => Err(SyncError::InvalidOperation(format!(
            "{:?} of {:?} {} is missing data",
            op_type, entity_type, entity_id
        ))),
        (_, Some(entity)) if entity.entity_type() != entity_type => {
            Err(SyncError::InvalidOperation(format!(
                "data is a {:?} but the operation targets a {:?}",
                entity.entity_type(),
                entity_type
            )))
        }
        (_, Some(entity)) if entity.id() != entity_id => Err(SyncError::InvalidOperation(format!(
            "data id {} does not match entity id {}",
            entity.id(),
            entity_id
        ))),
        _ => Ok(()),
    }
}

/// Merges remote state into local storage and keeps the operation log.
pub struct SyncManager {
    storage: TypedStorage,
    encryption: Arc<EncryptionManager>,
    device_id: String,
    version: u32,
    /// Pending log. Held for the whole of every merge or replay so those
    /// never interleave.
    pending: Mutex<Vec<SyncOperation>>,
}

impl SyncManager {
    /// Build a manager, reloading any pending operations persisted earlier.
    pub async fn new(
        storage: Arc<dyn StorageAdapter>,
        encryption: Arc<EncryptionManager>,
        device_id: impl Into<String>,
    ) -> Result<Self> {
        let storage = TypedStorage::new(storage);
        let pending = storage.load::<ns::PendingOperations>().await?;
        let device_id = device_id.into();

        if !pending.is_empty() {
            info!("Restored {} pending operations for device {}", pending.len(), device_id);
        }

        Ok(Self {
            storage,
            encryption,
            device_id,
            version: SYNC_PROTOCOL_VERSION,
            pending: Mutex::new(pending),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn encryption(&self) -> &Arc<EncryptionManager> {
        &self.encryption
    }

    pub fn storage(&self) -> &TypedStorage {
        &self.storage
    }

    /// Current contents of every synced collection.
    pub async fn snapshot(&self) -> Result<SyncableData> {
        let _guard = self.pending.lock().await;
        self.read_snapshot().await
    }

    async fn read_snapshot(&self) -> Result<SyncableData> {
        Ok(SyncableData {
            tasks: self.storage.load::<ns::Tasks>().await?,
            time_blocks: self.storage.load::<ns::TimeBlocks>().await?,
            user_pattern: self.storage.load::<ns::UserPattern>().await?,
        })
    }

    /// Full-state snapshot, sealed under the current key.
    pub async fn prepare_data_for_sync(&self) -> Result<EncryptedEnvelope> {
        let snapshot = self.snapshot().await?;
        debug!(
            "Prepared snapshot: {} tasks, {} time blocks, user pattern: {}",
            snapshot.tasks.len(),
            snapshot.time_blocks.len(),
            snapshot.user_pattern.is_some()
        );
        self.encryption.encrypt(&snapshot)
    }

    /// Open a remote snapshot and merge it into local storage.
    ///
    /// Nothing is written unless the envelope decrypts and parses.
    pub async fn process_sync_data(&self, envelope: &EncryptedEnvelope) -> Result<MergeReport> {
        let remote: SyncableData = self.encryption.decrypt(envelope)?;
        self.merge_data(remote).await
    }

    pub async fn merge_data(&self, remote: SyncableData) -> Result<MergeReport> {
        let _guard = self.pending.lock().await;

        // Read everything before writing anything
        let local = self.read_snapshot().await?;

        let (tasks, tasks_taken) = merge_entities(local.tasks, remote.tasks);
        let (blocks, blocks_taken) = merge_entities(local.time_blocks, remote.time_blocks);
        let (pattern, pattern_taken) = merge_user_pattern(local.user_pattern, remote.user_pattern);

        if tasks_taken > 0 {
            self.storage.store::<ns::Tasks>(&tasks).await?;
        }
        if blocks_taken > 0 {
            self.storage.store::<ns::TimeBlocks>(&blocks).await?;
        }
        if pattern_taken {
            self.storage.store::<ns::UserPattern>(&pattern).await?;
        }

        let report = MergeReport {
            tasks: tasks_taken,
            time_blocks: blocks_taken,
            user_pattern: pattern_taken,
        };
        if !report.is_empty() {
            info!(
                "Merged remote state: {} tasks, {} time blocks, user pattern updated: {}",
                report.tasks, report.time_blocks, report.user_pattern
            );
        }
        Ok(report)
    }

    /// Stamp a local mutation and append it to the persisted log.
    pub async fn record_operation(&self, draft: OperationDraft) -> Result<SyncOperation> {
        validate_operation(
            draft.op_type,
            draft.entity_type,
            &draft.entity_id,
            draft.data.as_ref(),
        )?;

        let operation = SyncOperation::from_draft(
            draft,
            SyncMetadata {
                timestamp: Utc::now().timestamp_millis(),
                device_id: self.device_id.clone(),
                version: self.version,
            },
        );

        let mut pending = self.pending.lock().await;
        pending.push(operation.clone());
        if let Err(e) = self.storage.store::<ns::PendingOperations>(&pending).await {
            pending.pop();
            return Err(e);
        }

        debug!(
            "Recorded {:?} {:?} {} ({} pending)",
            operation.op_type,
            operation.entity_type,
            operation.entity_id,
            pending.len()
        );
        Ok(operation)
    }

    pub async fn pending_operations(&self) -> Vec<SyncOperation> {
        self.pending.lock().await.clone()
    }

    pub async fn clear_pending_operations(&self) -> Result<()> {
        let mut pending = self.pending.lock().await;
        self.storage.store::<ns::PendingOperations>(&Vec::new()).await?;
        pending.clear();
        Ok(())
    }

    /// Drop exactly the given operations from the log, leaving anything
    /// recorded after they were read.
    pub async fn acknowledge_operations(&self, delivered: &[SyncOperation]) -> Result<usize> {
        let mut pending = self.pending.lock().await;
        let remaining: Vec<SyncOperation> = pending
            .iter()
            .filter(|op| !delivered.contains(op))
            .cloned()
            .collect();
        let removed = pending.len() - remaining.len();

        if removed > 0 {
            self.storage.store::<ns::PendingOperations>(&remaining).await?;
            *pending = remaining;
        }
        Ok(removed)
    }

    /// Replay one operation onto local storage.
    ///
    /// Create and update upsert by id, delete of a missing id is a no-op, so
    /// replaying the same operation any number of times is safe.
    pub async fn apply_operation(&self, operation: &SyncOperation) -> Result<()> {
        validate_operation(
            operation.op_type,
            operation.entity_type,
            &operation.entity_id,
            operation.data.as_ref(),
        )?;

        let _guard = self.pending.lock().await;
        let id = operation.entity_id.as_str();

        match (operation.op_type, operation.data.clone()) {
            (OperationType::Delete, _) => self.apply_delete(operation.entity_type, id).await,
            (_, Some(SyncEntity::Task(task))) => {
                let mut tasks = self.storage.load::<ns::Tasks>().await?;
                upsert_by_id(&mut tasks, task);
                self.storage.store::<ns::Tasks>(&tasks).await
            }
            (_, Some(SyncEntity::TimeBlock(block))) => {
                let mut blocks = self.storage.load::<ns::TimeBlocks>().await?;
                upsert_by_id(&mut blocks, block);
                self.storage.store::<ns::TimeBlocks>(&blocks).await
            }
            (_, Some(SyncEntity::UserPattern(pattern))) => {
                self.storage.store::<ns::UserPattern>(&Some(pattern)).await
            }
            // validate_operation rules this out
            (_, None) => Err(SyncError::InvalidOperation(format!(
                "{:?} {} is missing data",
                operation.op_type, id
            ))),
        }
    }

    async fn apply_delete(&self, entity_type: EntityType, id: &str) -> Result<()> {
        match entity_type {
            EntityType::Task => {
                let mut tasks = self.storage.load::<ns::Tasks>().await?;
                if remove_by_id(&mut tasks, id) {
                    self.storage.store::<ns::Tasks>(&tasks).await?;
                }
            }
            EntityType::TimeBlock => {
                let mut blocks = self.storage.load::<ns::TimeBlocks>().await?;
                if remove_by_id(&mut blocks, id) {
                    self.storage.store::<ns::TimeBlocks>(&blocks).await?;
                }
            }
            EntityType::UserPattern => {
                let pattern = self.storage.load::<ns::UserPattern>().await?;
                if pattern.as_ref().is_some_and(|p| p.id == id) {
                    self.storage.store::<ns::UserPattern>(&None).await?;
                }
            }
        }
        Ok(())
    }

    /// Manual override for a conflict the automatic merge got wrong.
    pub async fn resolve_conflict(&self, conflict: ConflictResolution) -> Result<()> {
        match conflict.resolution {
            Resolution::Local => {
                debug!("Keeping local copy of {}", conflict.operation.entity_id);
                Ok(())
            }
            Resolution::Remote => self.apply_operation(&conflict.operation).await,
            Resolution::Merge => {
                let merged = conflict.merged_data.ok_or_else(|| {
                    SyncError::InvalidOperation("merge resolution requires merged data".to_string())
                })?;
                let operation = SyncOperation {
                    data: Some(merged),
                    ..conflict.operation
                };
                self.apply_operation(&operation).await
            }
        }
    }
}

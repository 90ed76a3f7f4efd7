//! Persistence contract for status and operation records.

use alerter::Operation;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::record::{OperationRecord, RecordId};
use crate::status::{PairKey, Status, StatusRecord};

/// In-place modification of one operation record.
pub type RecordUpdate<'a> = Box<dyn FnOnce(&mut OperationRecord) + Send + 'a>;

/// Status and operation persistence.
///
/// Records are only ever mutated through read-then-write sequences scoped to
/// one job run; there is no cross-job locking. The two atomic primitives,
/// [`transition`](Store::transition) and
/// [`update_operation`](Store::update_operation), are what make concurrent
/// writers converge.
#[async_trait]
pub trait Store: Send + Sync {
    /// Current status of a pair, `None` if the pair was never touched.
    async fn status(&self, key: &PairKey) -> Result<Option<StatusRecord>, StoreError>;

    /// Compare-and-set the status. `from == Status::New` also matches an
    /// absent record. Returns whether the transition happened.
    async fn transition(&self, key: &PairKey, from: Status, to: Status)
        -> Result<bool, StoreError>;

    /// Bump the repetition counter and return the new value.
    async fn increment_repeats(&self, key: &PairKey) -> Result<u32, StoreError>;

    async fn operation(&self, id: &RecordId) -> Result<Option<OperationRecord>, StoreError>;

    /// Record of `operation` with the highest execution index.
    async fn latest_operation(
        &self,
        key: &PairKey,
        operation: Operation,
    ) -> Result<Option<OperationRecord>, StoreError>;

    /// Every record of a pair, ordered by operation then execution.
    async fn operations(&self, key: &PairKey) -> Result<Vec<OperationRecord>, StoreError>;

    /// Insert or replace a record by id.
    async fn put_operation(&self, record: OperationRecord) -> Result<(), StoreError>;

    /// Apply `update` atomically to an existing record and return the result,
    /// or `None` if the record does not exist.
    async fn update_operation<'a>(
        &'a self,
        id: &'a RecordId,
        update: RecordUpdate<'a>,
    ) -> Result<Option<OperationRecord>, StoreError>;

    /// Forget the status and every record of a pair.
    async fn clear(&self, key: &PairKey) -> Result<(), StoreError>;
}

/// Store backed by in-process maps.
#[derive(Default)]
pub struct MemoryStore {
    statuses: RwLock<HashMap<PairKey, StatusRecord>>,
    records: RwLock<BTreeMap<RecordId, OperationRecord>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn belongs_to(id: &RecordId, key: &PairKey) -> bool {
    id.alert_id == key.alert_id && id.alerter == key.alerter
}

#[async_trait]
impl Store for MemoryStore {
    async fn status(&self, key: &PairKey) -> Result<Option<StatusRecord>, StoreError> {
        Ok(self.statuses.read().await.get(key).cloned())
    }

    async fn transition(
        &self,
        key: &PairKey,
        from: Status,
        to: Status,
    ) -> Result<bool, StoreError> {
        let mut statuses = self.statuses.write().await;
        match statuses.get_mut(key) {
            Some(record) if record.status == from => {
                record.status = to;
                record.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None if from == Status::New => {
                statuses.insert(key.clone(), StatusRecord::new(to));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn increment_repeats(&self, key: &PairKey) -> Result<u32, StoreError> {
        let mut statuses = self.statuses.write().await;
        let record = statuses
            .entry(key.clone())
            .or_insert_with(|| StatusRecord::new(Status::New));
        record.repeat_count += 1;
        record.updated_at = Utc::now();
        Ok(record.repeat_count)
    }

    async fn operation(&self, id: &RecordId) -> Result<Option<OperationRecord>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn latest_operation(
        &self,
        key: &PairKey,
        operation: Operation,
    ) -> Result<Option<OperationRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|(id, _)| belongs_to(id, key) && id.operation == operation)
            .max_by_key(|(id, _)| id.execution)
            .map(|(_, record)| record.clone()))
    }

    async fn operations(&self, key: &PairKey) -> Result<Vec<OperationRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|(id, _)| belongs_to(id, key))
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn put_operation(&self, record: OperationRecord) -> Result<(), StoreError> {
        self.records.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_operation<'a>(
        &'a self,
        id: &'a RecordId,
        update: RecordUpdate<'a>,
    ) -> Result<Option<OperationRecord>, StoreError> {
        let mut records = self.records.write().await;
        Ok(records.get_mut(id).map(|record| {
            update(record);
            record.clone()
        }))
    }

    async fn clear(&self, key: &PairKey) -> Result<(), StoreError> {
        self.statuses.write().await.remove(key);
        self.records
            .write()
            .await
            .retain(|id, _| !belongs_to(id, key));
        Ok(())
    }
}

use std::sync::Arc;

use chrono::Utc;
use diesel::dsl::exists;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;

use pawkit_core::entities::EntityType;
use pawkit_core::sync::{
    merge_into, plan_enqueue, EnqueueRequest, FailedItem, FailureClass, MergePlan, QueueEntry,
    SyncQueue,
};
use pawkit_core::Result;

use super::model::{NewSyncFailureDB, NewSyncQueueEntryDB, SyncFailureDB, SyncQueueEntryDB};
use crate::db::{get_connection, DbPool};
use crate::errors::StorageError;
use crate::schema::{sync_failures, sync_queue};

/// Durable `SyncQueue`. The autoincrement `seq` column preserves enqueue order
/// across restarts; merge rules are shared with the in-memory queue.
pub struct SqliteSyncQueue {
    pool: Arc<DbPool>,
}

impl SqliteSyncQueue {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

fn to_entries(rows: Vec<SyncQueueEntryDB>) -> std::result::Result<Vec<QueueEntry>, StorageError> {
    rows.into_iter().map(QueueEntry::try_from).collect()
}

fn pending_for(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: &str,
) -> std::result::Result<Vec<QueueEntry>, StorageError> {
    let rows = sync_queue::table
        .filter(sync_queue::entity_type.eq(entity_type.as_str()))
        .filter(sync_queue::entity_id.eq(entity_id))
        .order(sync_queue::seq.asc())
        .select(SyncQueueEntryDB::as_select())
        .load(conn)?;
    to_entries(rows)
}

fn append(
    conn: &mut SqliteConnection,
    request: &EnqueueRequest,
) -> std::result::Result<QueueEntry, StorageError> {
    let row = NewSyncQueueEntryDB::from_request(request, Utc::now())?;
    let inserted = diesel::insert_into(sync_queue::table)
        .values(&row)
        .returning(SyncQueueEntryDB::as_returning())
        .get_result(conn)?;
    QueueEntry::try_from(inserted)
}

/// Appends or merges `request` using the open connection or transaction.
pub(crate) fn enqueue_in(
    conn: &mut SqliteConnection,
    request: EnqueueRequest,
) -> std::result::Result<QueueEntry, StorageError> {
    let pending = pending_for(conn, request.entity_type, &request.entity_id)?;
    let plan = plan_enqueue(&pending, &request);
    debug!(
        "[SyncQueue] enqueue {} {} {} -> {:?}",
        request.operation.as_str(),
        request.entity_type,
        request.entity_id,
        plan
    );

    match plan {
        MergePlan::Append => append(conn, &request),
        MergePlan::MergeInto { seq } => {
            match pending.into_iter().find(|entry| entry.seq == seq) {
                Some(mut entry) => {
                    merge_into(&mut entry, request);
                    diesel::update(sync_queue::table.find(seq))
                        .set((
                            sync_queue::payload.eq(serde_json::to_string(&entry.payload)?),
                            sync_queue::skip_conflict_check.eq(entry.skip_conflict_check),
                        ))
                        .execute(conn)?;
                    Ok(entry)
                }
                None => append(conn, &request),
            }
        }
        MergePlan::Replace {
            discard,
            coalesce_with,
        } => {
            if !discard.is_empty() {
                diesel::delete(sync_queue::table.filter(sync_queue::seq.eq_any(discard)))
                    .execute(conn)?;
            }
            match coalesce_with.and_then(|seq| pending.into_iter().find(|e| e.seq == seq)) {
                Some(existing) => Ok(existing),
                None => append(conn, &request),
            }
        }
    }
}

impl SyncQueue for SqliteSyncQueue {
    fn enqueue(&self, request: EnqueueRequest) -> Result<QueueEntry> {
        let mut conn = get_connection(&self.pool)?;
        let entry = conn
            .immediate_transaction::<_, StorageError, _>(|tx| enqueue_in(tx, request))?;
        Ok(entry)
    }

    fn dequeue_batch(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let batch = conn.immediate_transaction::<_, StorageError, _>(|tx| {
            let rows = sync_queue::table
                .filter(sync_queue::in_flight.eq(false))
                .order(sync_queue::seq.asc())
                .limit(i64::try_from(limit).unwrap_or(i64::MAX))
                .select(SyncQueueEntryDB::as_select())
                .load(tx)?;
            if rows.is_empty() {
                return Ok(Vec::new());
            }
            let seqs: Vec<i64> = rows.iter().map(|row| row.seq).collect();
            diesel::update(sync_queue::table.filter(sync_queue::seq.eq_any(seqs)))
                .set(sync_queue::in_flight.eq(true))
                .execute(tx)?;
            let mut entries = to_entries(rows)?;
            for entry in &mut entries {
                entry.in_flight = true;
            }
            Ok(entries)
        })?;
        Ok(batch)
    }

    fn drop_entry(&self, seq: i64) -> Result<()> {
        let mut conn = get_connection(&self.pool)?;
        diesel::delete(sync_queue::table.find(seq))
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn requeue(&self, seq: i64) -> Result<()> {
        let mut conn = get_connection(&self.pool)?;
        diesel::update(sync_queue::table.find(seq))
            .set((
                sync_queue::in_flight.eq(false),
                sync_queue::attempts.eq(sync_queue::attempts + 1),
            ))
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn release(&self, seq: i64) -> Result<()> {
        let mut conn = get_connection(&self.pool)?;
        diesel::update(sync_queue::table.find(seq))
            .set(sync_queue::in_flight.eq(false))
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn discard(&self, entity_type: EntityType, entity_id: &str) -> Result<usize> {
        let mut conn = get_connection(&self.pool)?;
        let removed = diesel::delete(
            sync_queue::table
                .filter(sync_queue::entity_type.eq(entity_type.as_str()))
                .filter(sync_queue::entity_id.eq(entity_id))
                .filter(sync_queue::in_flight.eq(false)),
        )
        .execute(&mut conn)
        .map_err(StorageError::from)?;
        Ok(removed)
    }

    fn has_pending(&self, entity_type: EntityType, entity_id: &str) -> Result<bool> {
        let mut conn = get_connection(&self.pool)?;
        let pending = diesel::select(exists(
            sync_queue::table
                .filter(sync_queue::entity_type.eq(entity_type.as_str()))
                .filter(sync_queue::entity_id.eq(entity_id)),
        ))
        .get_result::<bool>(&mut conn)
        .map_err(StorageError::from)?;
        Ok(pending)
    }

    fn pending_count(&self) -> Result<usize> {
        let mut conn = get_connection(&self.pool)?;
        let count = sync_queue::table
            .count()
            .get_result::<i64>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn list(&self) -> Result<Vec<QueueEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_queue::table
            .order(sync_queue::seq.asc())
            .select(SyncQueueEntryDB::as_select())
            .load(&mut conn)
            .map_err(StorageError::from)?;
        Ok(to_entries(rows)?)
    }

    fn recover_in_flight(&self) -> Result<usize> {
        let mut conn = get_connection(&self.pool)?;
        let recovered = diesel::update(sync_queue::table.filter(sync_queue::in_flight.eq(true)))
            .set(sync_queue::in_flight.eq(false))
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        if recovered > 0 {
            debug!("[SyncQueue] Recovered {} in-flight entries", recovered);
        }
        Ok(recovered)
    }

    fn record_failure(
        &self,
        mut entry: QueueEntry,
        reason: String,
        class: FailureClass,
    ) -> Result<()> {
        entry.in_flight = false;
        let row = NewSyncFailureDB {
            entry: serde_json::to_string(&entry)?,
            reason,
            class: class.as_str().to_string(),
            failed_at: Utc::now().to_rfc3339(),
        };
        let mut conn = get_connection(&self.pool)?;
        diesel::insert_into(sync_failures::table)
            .values(&row)
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn list_failed(&self) -> Result<Vec<FailedItem>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_failures::table
            .order(sync_failures::id.asc())
            .select(SyncFailureDB::as_select())
            .load(&mut conn)
            .map_err(StorageError::from)?;
        let items = rows
            .into_iter()
            .map(FailedItem::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn take_failed(&self, class: FailureClass) -> Result<Vec<FailedItem>> {
        let mut conn = get_connection(&self.pool)?;
        let taken = conn.immediate_transaction::<_, StorageError, _>(|tx| {
            let rows = sync_failures::table
                .filter(sync_failures::class.eq(class.as_str()))
                .order(sync_failures::id.asc())
                .select(SyncFailureDB::as_select())
                .load(tx)?;
            let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
            diesel::delete(sync_failures::table.filter(sync_failures::id.eq_any(ids)))
                .execute(tx)?;
            rows.into_iter().map(FailedItem::try_from).collect()
        })?;
        Ok(taken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, init, run_migrations};
    use pawkit_core::sync::SyncOperation;
    use serde_json::{json, Map, Value};
    use tempfile::{tempdir, TempDir};

    fn setup_db() -> (TempDir, String) {
        let dir = tempdir().expect("tempdir");
        let db_path = init(dir.path().to_str().expect("utf-8 path")).expect("init");
        run_migrations(&db_path).expect("migrations");
        (dir, db_path)
    }

    fn queue(db_path: &str) -> SqliteSyncQueue {
        SqliteSyncQueue::new(create_pool(db_path).expect("pool"))
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object payload")
    }

    fn request(id: &str, op: SyncOperation, value: Value) -> EnqueueRequest {
        EnqueueRequest::new(EntityType::Card, id, op, payload(value))
    }

    #[test]
    fn create_then_updates_collapse_into_one_create() {
        let (_dir, db_path) = setup_db();
        let queue = queue(&db_path);
        queue
            .enqueue(request("card-1", SyncOperation::Create, json!({"title": "a"})))
            .expect("create");
        queue
            .enqueue(request("card-1", SyncOperation::Update, json!({"title": "b"})))
            .expect("update");
        queue
            .enqueue(request("card-1", SyncOperation::Update, json!({"pinned": true})))
            .expect("update");

        let entries = queue.list().expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, SyncOperation::Create);
        assert_eq!(entries[0].payload, payload(json!({"title": "b", "pinned": true})));
    }

    #[test]
    fn delete_discards_pending_writes_and_coalesces() {
        let (_dir, db_path) = setup_db();
        let queue = queue(&db_path);
        queue
            .enqueue(request("card-1", SyncOperation::Update, json!({"title": "b"})))
            .expect("update");
        let first = queue
            .enqueue(request("card-1", SyncOperation::Delete, json!({})))
            .expect("delete");
        let second = queue
            .enqueue(request("card-1", SyncOperation::Delete, json!({})))
            .expect("delete again");

        assert_eq!(first.seq, second.seq);
        let ops: Vec<_> = queue.list().expect("list").into_iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![SyncOperation::Delete]);
    }

    #[test]
    fn dequeue_is_fifo_and_in_flight_entries_are_not_merged() {
        let (_dir, db_path) = setup_db();
        let queue = queue(&db_path);
        queue
            .enqueue(request("card-1", SyncOperation::Update, json!({"title": "a"})))
            .expect("enqueue");
        queue
            .enqueue(request("card-2", SyncOperation::Create, json!({"title": "b"})))
            .expect("enqueue");

        let batch = queue.dequeue_batch(10).expect("dequeue");
        assert_eq!(
            batch.iter().map(|e| e.entity_id.as_str()).collect::<Vec<_>>(),
            vec!["card-1", "card-2"]
        );
        assert!(batch.iter().all(|e| e.in_flight));
        assert!(queue.dequeue_batch(10).expect("dequeue").is_empty());

        let racing = queue
            .enqueue(request("card-1", SyncOperation::Update, json!({"title": "c"})))
            .expect("enqueue during drain");
        assert_ne!(racing.seq, batch[0].seq);

        queue.drop_entry(batch[0].seq).expect("drop");
        let remaining = queue.list().expect("list");
        assert!(remaining.iter().any(|e| e.seq == racing.seq && !e.in_flight));
        assert!(queue.has_pending(EntityType::Card, "card-1").expect("pending"));
    }

    #[test]
    fn requeue_counts_attempts_and_release_does_not() {
        let (_dir, db_path) = setup_db();
        let queue = queue(&db_path);
        let entry = queue
            .enqueue(request("card-1", SyncOperation::Create, json!({"title": "a"})))
            .expect("enqueue");

        queue.dequeue_batch(1).expect("dequeue");
        queue.requeue(entry.seq).expect("requeue");
        queue.dequeue_batch(1).expect("dequeue");
        queue.release(entry.seq).expect("release");

        let stored = queue.list().expect("list");
        assert_eq!(stored[0].attempts, 1);
        assert!(!stored[0].in_flight);
    }

    #[test]
    fn in_flight_entries_survive_a_restart_and_are_recovered() {
        let (_dir, db_path) = setup_db();
        queue(&db_path)
            .enqueue(request("card-1", SyncOperation::Create, json!({"title": "a"})))
            .expect("enqueue");
        queue(&db_path).dequeue_batch(10).expect("dequeue");

        let reopened = queue(&db_path);
        assert!(reopened.dequeue_batch(10).expect("dequeue").is_empty());
        assert_eq!(reopened.recover_in_flight().expect("recover"), 1);
        assert_eq!(reopened.dequeue_batch(10).expect("dequeue").len(), 1);
    }

    #[test]
    fn discard_keeps_in_flight_entries() {
        let (_dir, db_path) = setup_db();
        let queue = queue(&db_path);
        queue
            .enqueue(request("card-1", SyncOperation::Create, json!({"title": "a"})))
            .expect("enqueue");
        queue.dequeue_batch(10).expect("dequeue");
        queue
            .enqueue(request("card-1", SyncOperation::Update, json!({"title": "b"})))
            .expect("enqueue");

        assert_eq!(queue.discard(EntityType::Card, "card-1").expect("discard"), 1);
        assert_eq!(queue.pending_count().expect("count"), 1);
    }

    #[test]
    fn failed_items_are_taken_by_class() {
        let (_dir, db_path) = setup_db();
        let queue = queue(&db_path);
        let entry = queue
            .enqueue(request("card-1", SyncOperation::Create, json!({"title": "a"})))
            .expect("enqueue");
        queue
            .record_failure(entry.clone(), "offline".to_string(), FailureClass::Transient)
            .expect("record");
        queue
            .record_failure(entry, "schema".to_string(), FailureClass::Permanent)
            .expect("record");

        assert_eq!(queue.list_failed().expect("list").len(), 2);
        let transient = queue.take_failed(FailureClass::Transient).expect("take");
        assert_eq!(transient.len(), 1);
        assert_eq!(transient[0].reason, "offline");
        assert_eq!(transient[0].entry.entity_id, "card-1");

        let left = queue.list_failed().expect("list");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].class, FailureClass::Permanent);
    }
}

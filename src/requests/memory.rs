use super::{RequestStore, StatusSink};
use crate::models::{ImageRef, NewRequest, RequestRecord};
use crate::status::{Status, Transition};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
struct ResultedImage {
    name: String,
    location: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    uploaded_images: HashMap<Uuid, ImageRef>,
    resulted_images: HashMap<Uuid, ResultedImage>,
    requests: HashMap<Uuid, RequestRecord>,
}

impl Tables {
    /// Insert the three rows of a new request in table order. A failing
    /// status row leaves the image rows behind; callers stage this on a copy.
    fn insert_request(&mut self, record: &RequestRecord, fail_status_row: bool) -> Result<()> {
        self.uploaded_images
            .insert(record.id, record.source.clone());
        self.resulted_images.insert(
            record.id,
            ResultedImage {
                name: record.result_name.clone(),
                location: None,
            },
        );
        if fail_status_row {
            return Err(Error::Io(std::io::Error::other(
                "status row insert failed",
            )));
        }
        self.requests.insert(record.id, record.clone());
        Ok(())
    }
}

/// Request records kept in process memory.
///
/// Every write happens under one lock; multi-row writes are staged on a copy
/// of the tables and swapped in only when all rows succeed.
#[derive(Clone, Default)]
pub struct MemoryRequestStore {
    tables: Arc<Mutex<Tables>>,
    fail_status_writes: Arc<AtomicBool>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the status-row insert of `create_request` fail.
    pub fn with_failing_status_writes(self, fail: bool) -> Self {
        self.fail_status_writes.store(fail, Ordering::SeqCst);
        self
    }

    pub fn len(&self) -> usize {
        self.tables.lock().unwrap().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of rows held for a request across all three tables.
    pub fn row_count(&self, request_id: Uuid) -> usize {
        let tables = self.tables.lock().unwrap();
        usize::from(tables.uploaded_images.contains_key(&request_id))
            + usize::from(tables.resulted_images.contains_key(&request_id))
            + usize::from(tables.requests.contains_key(&request_id))
    }

    /// Stored location of the result row, once the request is done.
    pub fn result_location(&self, request_id: Uuid) -> Option<String> {
        self.tables
            .lock()
            .unwrap()
            .resulted_images
            .get(&request_id)
            .and_then(|row| row.location.clone())
    }
}

#[async_trait]
impl StatusSink for MemoryRequestStore {
    async fn update_status(&self, request_id: Uuid, status: Status) -> Result<Transition> {
        if status == Status::Done {
            return Err(Error::Invariant(
                "a request can only become done through complete_request".to_string(),
            ));
        }

        let mut tables = self.tables.lock().unwrap();
        let record = tables
            .requests
            .get_mut(&request_id)
            .ok_or(Error::UnknownRequest(request_id))?;

        let transition = record.status.transition(request_id, status)?;
        if transition == Transition::Applied {
            record.status = status;
            if status == Status::Processing {
                record.time_started = Some(Utc::now());
            }
        }
        Ok(transition)
    }

    async fn complete_request(
        &self,
        request_id: Uuid,
        result: &ImageRef,
        completed_at: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut guard = self.tables.lock().unwrap();
        let tables = &mut *guard;
        let record = tables
            .requests
            .get_mut(&request_id)
            .ok_or(Error::UnknownRequest(request_id))?;

        match record.status {
            Status::Done => {
                return match &record.result {
                    Some(existing) if existing == result => Ok(Transition::Unchanged),
                    _ => Err(Error::AlreadyCompleted(request_id)),
                };
            }
            Status::Queued => {
                return Err(Error::InvalidTransition {
                    request_id,
                    from: Status::Queued,
                    to: Status::Done,
                })
            }
            Status::Processing => {}
        }

        record.status = Status::Done;
        record.result = Some(result.clone());
        record.time_completed = Some(completed_at);
        tables.resulted_images.insert(
            request_id,
            ResultedImage {
                name: result.name.clone(),
                location: Some(result.location.clone()),
            },
        );
        Ok(Transition::Applied)
    }

    async fn record_failure(&self, request_id: Uuid, reason: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let record = tables
            .requests
            .get_mut(&request_id)
            .ok_or(Error::UnknownRequest(request_id))?;
        record.failure = Some(reason.to_string());
        Ok(())
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn create_request(&self, request: &NewRequest) -> Result<RequestRecord> {
        let record = request.clone().into_record(Utc::now())?;

        let mut tables = self.tables.lock().unwrap();
        if tables.requests.contains_key(&record.id) {
            return Err(Error::Invariant(format!(
                "request {} already exists",
                record.id
            )));
        }

        let mut staged = tables.clone();
        staged.insert_request(&record, self.fail_status_writes.load(Ordering::SeqCst))?;
        *tables = staged;
        Ok(record)
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Option<RequestRecord>> {
        Ok(self.tables.lock().unwrap().requests.get(&request_id).cloned())
    }

    async fn delete_request(&self, request_id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.requests.remove(&request_id);
        tables.resulted_images.remove(&request_id);
        tables.uploaded_images.remove(&request_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Operation;
    use tokio_test::{assert_err, assert_ok};

    fn new_request(operation: Operation) -> NewRequest {
        NewRequest {
            id: Uuid::new_v4(),
            user_id: Some("user-1".to_string()),
            operation,
            source: ImageRef::new("a.jpg", "uploads/a.jpg"),
            width: Some(100),
        }
    }

    #[tokio::test]
    async fn test_create_writes_all_rows() {
        let store = MemoryRequestStore::new();
        let request = new_request(Operation::Compression);

        let record = store.create_request(&request).await.unwrap();

        assert_eq!(record.status, Status::Queued);
        assert_eq!(store.row_count(request.id), 3);
        assert_eq!(store.get_request(request.id).await.unwrap(), Some(record));
    }

    #[test]
    fn test_status_row_failure_comes_after_image_rows() {
        let record = new_request(Operation::Compression)
            .into_record(Utc::now())
            .unwrap();
        let mut tables = Tables::default();

        assert_err!(tables.insert_request(&record, true));

        assert!(tables.uploaded_images.contains_key(&record.id));
        assert!(tables.resulted_images.contains_key(&record.id));
        assert!(tables.requests.is_empty());
    }

    #[tokio::test]
    async fn test_failed_status_row_rolls_back_everything() {
        let store = MemoryRequestStore::new();
        let existing = new_request(Operation::Conversion);
        store.create_request(&existing).await.unwrap();
        let before = store.get_request(existing.id).await.unwrap();

        let store = store.with_failing_status_writes(true);
        let request = new_request(Operation::Compression);
        assert_err!(store.create_request(&request).await);

        // The image rows were inserted on the staged copy only.
        assert_eq!(store.row_count(request.id), 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.row_count(existing.id), 3);
        assert_eq!(store.get_request(existing.id).await.unwrap(), before);
        let tables = store.tables.lock().unwrap();
        assert_eq!(tables.uploaded_images.len(), 1);
        assert_eq!(tables.resulted_images.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let store = MemoryRequestStore::new();
        let request = new_request(Operation::Conversion);

        assert_ok!(store.create_request(&request).await);
        assert_err!(store.create_request(&request).await);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let store = MemoryRequestStore::new();
        let request = new_request(Operation::Compression);
        store.create_request(&request).await.unwrap();

        let transition = store
            .update_status(request.id, Status::Processing)
            .await
            .unwrap();
        assert_eq!(transition, Transition::Applied);

        let result = ImageRef::new("cmp-a.jpg", "results/cmp-a.jpg");
        let completed_at = Utc::now();
        let transition = store
            .complete_request(request.id, &result, completed_at)
            .await
            .unwrap();
        assert_eq!(transition, Transition::Applied);

        let record = store.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(record.status, Status::Done);
        assert!(record.time_started.is_some());
        assert_eq!(record.time_completed, Some(completed_at));
        assert_eq!(record.result, Some(result));
        assert_eq!(
            store.result_location(request.id).as_deref(),
            Some("results/cmp-a.jpg")
        );
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let store = MemoryRequestStore::new();
        let request = new_request(Operation::Compression);
        store.create_request(&request).await.unwrap();
        store
            .update_status(request.id, Status::Processing)
            .await
            .unwrap();
        store
            .complete_request(request.id, &ImageRef::new("cmp-a.jpg", "x"), Utc::now())
            .await
            .unwrap();

        let err = store
            .update_status(request.id, Status::Queued)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(store
            .update_status(request.id, Status::Processing)
            .await
            .is_err());

        let record = store.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(record.status, Status::Done);
    }

    #[tokio::test]
    async fn test_repeat_completion_is_idempotent_or_conflict() {
        let store = MemoryRequestStore::new();
        let request = new_request(Operation::Compression);
        store.create_request(&request).await.unwrap();
        store
            .update_status(request.id, Status::Processing)
            .await
            .unwrap();

        let result = ImageRef::new("cmp-a.jpg", "x");
        let first_completed = Utc::now();
        store
            .complete_request(request.id, &result, first_completed)
            .await
            .unwrap();

        let again = store
            .complete_request(request.id, &result, Utc::now())
            .await
            .unwrap();
        assert_eq!(again, Transition::Unchanged);

        let other = ImageRef::new("cmp-a.jpg", "elsewhere");
        let err = store
            .complete_request(request.id, &other, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyCompleted(_)));

        let record = store.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(record.time_completed, Some(first_completed));
        assert_eq!(record.result, Some(result));
    }

    #[tokio::test]
    async fn test_complete_requires_processing() {
        let store = MemoryRequestStore::new();
        let request = new_request(Operation::Compression);
        store.create_request(&request).await.unwrap();

        let err = store
            .complete_request(request.id, &ImageRef::new("cmp-a.jpg", "x"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: Status::Queued,
                ..
            }
        ));
        assert!(store
            .update_status(request.id, Status::Done)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_record_failure_keeps_status() {
        let store = MemoryRequestStore::new();
        let request = new_request(Operation::Compression);
        store.create_request(&request).await.unwrap();
        store
            .update_status(request.id, Status::Processing)
            .await
            .unwrap();

        store
            .record_failure(request.id, "source missing")
            .await
            .unwrap();

        let record = store.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(record.status, Status::Processing);
        assert_eq!(record.failure.as_deref(), Some("source missing"));
    }

    #[tokio::test]
    async fn test_unknown_request() {
        let store = MemoryRequestStore::new();
        let id = Uuid::new_v4();

        assert!(matches!(
            store.update_status(id, Status::Processing).await,
            Err(Error::UnknownRequest(_))
        ));
        assert!(store.get_request(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_every_row() {
        let store = MemoryRequestStore::new();
        let request = new_request(Operation::Compression);
        store.create_request(&request).await.unwrap();

        store.delete_request(request.id).await.unwrap();
        assert_eq!(store.row_count(request.id), 0);
    }
}

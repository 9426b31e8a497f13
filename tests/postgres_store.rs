//! Runs against a live PostgreSQL; skipped unless `TEST_DATABASE_URL` is set.

use chrono::Utc;
use imgqueue::models::{ImageRef, NewRequest, Operation};
use imgqueue::requests::{PgRequestStore, RequestStore, StatusSink};
use imgqueue::status::{Status, Transition};
use imgqueue::Error;
use sqlx::PgPool;
use uuid::Uuid;

async fn store() -> Option<PgRequestStore> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };
    Some(PgRequestStore::connect(&url).await.unwrap())
}

/// The store plus a raw pool for inspecting rows behind its back.
async fn database() -> Option<(PgRequestStore, PgPool)> {
    let store = store().await?;
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    Some((store, PgPool::connect(&url).await.unwrap()))
}

async fn row_counts(pool: &PgPool, id: Uuid) -> (i64, i64, i64) {
    let count = |table: &str| {
        let column = if table == "requests" { "id" } else { "request_id" };
        format!("SELECT COUNT(*) FROM {} WHERE {} = $1", table, column)
    };
    let mut counts = Vec::new();
    for table in ["uploaded_images", "resulted_images", "requests"] {
        let n: i64 = sqlx::query_scalar(&count(table))
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap();
        counts.push(n);
    }
    (counts[0], counts[1], counts[2])
}

fn new_request() -> NewRequest {
    NewRequest {
        id: Uuid::new_v4(),
        user_id: Some("pg-user".to_string()),
        operation: Operation::Conversion,
        source: ImageRef::new("b.png", "uploads/b.png"),
        width: None,
    }
}

#[tokio::test]
async fn test_lifecycle_round_trip() {
    let Some(store) = store().await else { return };
    let request = new_request();

    let created = store.create_request(&request).await.unwrap();
    assert_eq!(created.result_name, "cnv-b.jpeg");
    let fetched = store.get_request(request.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, Status::Queued);
    assert_eq!(fetched.source, request.source);

    assert_eq!(
        store
            .update_status(request.id, Status::Processing)
            .await
            .unwrap(),
        Transition::Applied
    );
    assert_eq!(
        store
            .update_status(request.id, Status::Processing)
            .await
            .unwrap(),
        Transition::Unchanged
    );

    let result = ImageRef::new("cnv-b.jpeg", "results/cnv-b.jpeg");
    assert_eq!(
        store
            .complete_request(request.id, &result, Utc::now())
            .await
            .unwrap(),
        Transition::Applied
    );
    assert_eq!(
        store
            .complete_request(request.id, &result, Utc::now())
            .await
            .unwrap(),
        Transition::Unchanged
    );

    let done = store.get_request(request.id).await.unwrap().unwrap();
    assert_eq!(done.status, Status::Done);
    assert_eq!(done.result, Some(result));
    assert!(done.time_completed.is_some());

    assert!(matches!(
        store.update_status(request.id, Status::Processing).await,
        Err(Error::InvalidTransition {
            from: Status::Done,
            ..
        })
    ));

    store.delete_request(request.id).await.unwrap();
    assert!(store.get_request(request.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failure_note_keeps_status() {
    let Some(store) = store().await else { return };
    let request = new_request();
    store.create_request(&request).await.unwrap();

    store
        .record_failure(request.id, "fetch: not found")
        .await
        .unwrap();

    let record = store.get_request(request.id).await.unwrap().unwrap();
    assert_eq!(record.status, Status::Queued);
    assert_eq!(record.failure.as_deref(), Some("fetch: not found"));

    assert!(matches!(
        store.record_failure(Uuid::new_v4(), "x").await,
        Err(Error::UnknownRequest(_))
    ));
    store.delete_request(request.id).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_id_keeps_one_set_of_rows() {
    let Some((store, pool)) = database().await else { return };
    let request = new_request();
    store.create_request(&request).await.unwrap();

    let clash = NewRequest {
        source: ImageRef::new("other.png", "uploads/other.png"),
        ..request.clone()
    };
    assert!(store.create_request(&clash).await.is_err());

    assert_eq!(row_counts(&pool, request.id).await, (1, 1, 1));
    let record = store.get_request(request.id).await.unwrap().unwrap();
    assert_eq!(record.source, request.source);
    store.delete_request(request.id).await.unwrap();
}

#[tokio::test]
async fn test_failed_status_insert_rolls_back_image_rows() {
    let Some((store, pool)) = database().await else { return };
    let request = new_request();

    // A stray status row makes the last insert of create_request fail after
    // both image rows were written in the same transaction.
    sqlx::query("INSERT INTO requests (id, operation) VALUES ($1, 'conversion')")
        .bind(request.id)
        .execute(&pool)
        .await
        .unwrap();

    assert!(store.create_request(&request).await.is_err());
    assert_eq!(row_counts(&pool, request.id).await, (0, 0, 1));

    sqlx::query("DELETE FROM requests WHERE id = $1")
        .bind(request.id)
        .execute(&pool)
        .await
        .unwrap();
}

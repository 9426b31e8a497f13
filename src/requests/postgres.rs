use super::{RequestStore, StatusSink};
use crate::models::{ImageRef, NewRequest, Operation, RequestRecord};
use crate::status::{Status, Transition};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Row};
use tracing::debug;
use uuid::Uuid;

/// Request records in PostgreSQL.
///
/// Status moves are single `UPDATE ... WHERE status = <expected>` statements,
/// so two writers can never both apply the same transition.
#[derive(Clone)]
pub struct PgRequestStore {
    pool: PgPool,
}

impl PgRequestStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("schema.sql")).await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_status(&self, request_id: Uuid) -> Result<Status> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM requests WHERE id = $1")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;

        status
            .ok_or(Error::UnknownRequest(request_id))?
            .parse()
    }

    fn record_from_row(row: &PgRow) -> Result<RequestRecord> {
        let status: Status = row.try_get::<String, _>("status")?.parse()?;
        let operation: Operation = row.try_get::<String, _>("operation")?.parse()?;
        let width = row
            .try_get::<Option<i32>, _>("width")?
            .map(u32::try_from)
            .transpose()
            .map_err(|e| Error::Invariant(format!("negative width in request row: {}", e)))?;

        let result_name: String = row.try_get("result_name")?;
        let result_location: Option<String> = row.try_get("result_location")?;
        let result = match (status, result_location) {
            (Status::Done, Some(location)) => Some(ImageRef::new(result_name.clone(), location)),
            _ => None,
        };

        Ok(RequestRecord {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            operation,
            source: ImageRef::new(
                row.try_get::<String, _>("source_name")?,
                row.try_get::<String, _>("source_location")?,
            ),
            width,
            result_name,
            status,
            time_queued: row.try_get("time_queued")?,
            time_started: row.try_get("time_started")?,
            time_completed: row.try_get("time_completed")?,
            result,
            failure: row.try_get("failure")?,
        })
    }
}

#[async_trait]
impl StatusSink for PgRequestStore {
    async fn update_status(&self, request_id: Uuid, status: Status) -> Result<Transition> {
        if status == Status::Done {
            return Err(Error::Invariant(
                "a request can only become done through complete_request".to_string(),
            ));
        }

        let current = self.current_status(request_id).await?;
        if current.transition(request_id, status)? == Transition::Unchanged {
            return Ok(Transition::Unchanged);
        }

        let updated = sqlx::query(
            "UPDATE requests \
                SET status = $1, time_started = now() \
             WHERE id = $2 AND status = $3",
        )
        .bind(status.as_str())
        .bind(request_id)
        .bind(current.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            // Another writer moved the row first; classify against what it wrote.
            debug!(%request_id, "Status changed concurrently, re-reading");
            let now = self.current_status(request_id).await?;
            return now.transition(request_id, status);
        }

        Ok(Transition::Applied)
    }

    async fn complete_request(
        &self,
        request_id: Uuid,
        result: &ImageRef,
        completed_at: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT r.status, ri.name AS result_name, ri.location AS result_location \
             FROM requests r \
             LEFT JOIN resulted_images ri ON ri.request_id = r.id \
             WHERE r.id = $1 \
             FOR UPDATE OF r",
        )
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::UnknownRequest(request_id))?;

        let status: Status = row.try_get::<String, _>("status")?.parse()?;
        match status {
            Status::Done => {
                let name: Option<String> = row.try_get("result_name")?;
                let location: Option<String> = row.try_get("result_location")?;
                return if name.as_deref() == Some(result.name.as_str())
                    && location.as_deref() == Some(result.location.as_str())
                {
                    Ok(Transition::Unchanged)
                } else {
                    Err(Error::AlreadyCompleted(request_id))
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

        sqlx::query(
            "UPDATE requests SET status = 'done', time_completed = $2 \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(request_id)
        .bind(completed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO resulted_images (request_id, name, location) VALUES ($1, $2, $3) \
             ON CONFLICT (request_id) DO UPDATE SET name = EXCLUDED.name, location = EXCLUDED.location",
        )
        .bind(request_id)
        .bind(&result.name)
        .bind(&result.location)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Transition::Applied)
    }

    async fn record_failure(&self, request_id: Uuid, reason: &str) -> Result<()> {
        let updated = sqlx::query("UPDATE requests SET failure = $2 WHERE id = $1")
            .bind(request_id)
            .bind(reason)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(Error::UnknownRequest(request_id));
        }
        Ok(())
    }
}

#[async_trait]
impl RequestStore for PgRequestStore {
    async fn create_request(&self, request: &NewRequest) -> Result<RequestRecord> {
        let record = request.clone().into_record(Utc::now())?;
        let width = record
            .width
            .map(i32::try_from)
            .transpose()
            .map_err(|_| Error::InvalidJob("width out of range".to_string()))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO uploaded_images (request_id, name, location) VALUES ($1, $2, $3)")
            .bind(record.id)
            .bind(&record.source.name)
            .bind(&record.source.location)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO resulted_images (request_id, name, location) VALUES ($1, $2, NULL)")
            .bind(record.id)
            .bind(&record.result_name)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO requests (id, user_id, operation, width, status, time_queued) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.id)
        .bind(&record.user_id)
        .bind(record.operation.as_str())
        .bind(width)
        .bind(record.status.as_str())
        .bind(record.time_queued)
        .execute(&mut *tx)
        .await?;

        // Dropping the transaction on any error above rolls every row back.
        tx.commit().await?;
        debug!(request_id = %record.id, "Created request");
        Ok(record)
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Option<RequestRecord>> {
        let row = sqlx::query(
            "SELECT r.id, r.user_id, r.operation, r.width, r.status, r.time_queued, \
                    r.time_started, r.time_completed, r.failure, \
                    u.name AS source_name, u.location AS source_location, \
                    ri.name AS result_name, ri.location AS result_location \
             FROM requests r \
             JOIN uploaded_images u ON u.request_id = r.id \
             JOIN resulted_images ri ON ri.request_id = r.id \
             WHERE r.id = $1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn delete_request(&self, request_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["requests", "resulted_images", "uploaded_images"] {
            let column = if table == "requests" { "id" } else { "request_id" };
            sqlx::query(&format!("DELETE FROM {} WHERE {} = $1", table, column))
                .bind(request_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

//! PostgreSQL implementation of [`Storage`] and [`ProfileStorage`].
//!
//! Status changes use a conditional `UPDATE` keyed on the expected status and
//! `updated_at`, so of two concurrent transitions planned from the same
//! version exactly one lands, even when the winner leaves the status as it was.
//! Attachment records reference their request with `ON DELETE CASCADE`.

use std::str::FromStr;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::{ProfileStorage, Storage};
use crate::domain::division::Division;
use crate::domain::file::{FileId, RequestFile};
use crate::domain::principal::{PrincipalId, Profile, Role};
use crate::domain::request::{Request, RequestFilter, RequestId, RequestStatus};
use crate::error::{BrieflowError, Result};

/// Embedded schema migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const REQUEST_COLUMNS: &str = "id, requester_id, requester_name, requester_division, \
     contact_whatsapp, contact_line, target_division, request_type, project_title, \
     project_description, reference_links, usage_date, status, rejection_reason, \
     revision_notes, forwarded_to, submission_date, updated_at";

const FILE_COLUMNS: &str =
    "id, request_id, file_name, storage_path, size_bytes, mime_type, created_at";

/// PostgreSQL-backed storage.
///
/// # Example
/// ```ignore
/// use brieflow::storage::postgres::PostgresStorage;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgresql://localhost/brieflow").await?;
/// let storage = PostgresStorage::new(pool);
/// storage.migrate().await?;
/// ```
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }
}

fn parse_division(value: &str) -> Result<Division> {
    Division::from_str(value).map_err(|e| anyhow!("corrupt division column: {}", e).into())
}

fn request_from_row(row: &PgRow) -> Result<Request> {
    let status: String = row.try_get("status").context("status")?;
    let target_division: String = row.try_get("target_division").context("target_division")?;
    let forwarded_to: Option<String> = row.try_get("forwarded_to").context("forwarded_to")?;

    Ok(Request {
        id: RequestId(row.try_get("id").context("id")?),
        requester: PrincipalId(row.try_get("requester_id").context("requester_id")?),
        requester_name: row.try_get("requester_name").context("requester_name")?,
        requester_division: row
            .try_get("requester_division")
            .context("requester_division")?,
        contact_whatsapp: row.try_get("contact_whatsapp").context("contact_whatsapp")?,
        contact_line: row.try_get("contact_line").context("contact_line")?,
        target_division: parse_division(&target_division)?,
        request_type: row.try_get("request_type").context("request_type")?,
        project_title: row.try_get("project_title").context("project_title")?,
        project_description: row
            .try_get("project_description")
            .context("project_description")?,
        reference_links: row.try_get("reference_links").context("reference_links")?,
        usage_date: row.try_get("usage_date").context("usage_date")?,
        status: RequestStatus::from_str(&status).map_err(|e| anyhow!(e))?,
        rejection_reason: row.try_get("rejection_reason").context("rejection_reason")?,
        revision_notes: row.try_get("revision_notes").context("revision_notes")?,
        forwarded_to: forwarded_to.as_deref().map(parse_division).transpose()?,
        submission_date: row.try_get("submission_date").context("submission_date")?,
        updated_at: row.try_get("updated_at").context("updated_at")?,
    })
}

fn file_from_row(row: &PgRow) -> Result<RequestFile> {
    Ok(RequestFile {
        id: FileId(row.try_get("id").context("id")?),
        request_id: RequestId(row.try_get("request_id").context("request_id")?),
        file_name: row.try_get("file_name").context("file_name")?,
        storage_path: row.try_get("storage_path").context("storage_path")?,
        size_bytes: row.try_get("size_bytes").context("size_bytes")?,
        mime_type: row.try_get("mime_type").context("mime_type")?,
        created_at: row.try_get("created_at").context("created_at")?,
    })
}

fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == "23503")
}

#[async_trait]
impl Storage for PostgresStorage {
    #[tracing::instrument(skip(self, request), fields(request_id = %request.id))]
    async fn insert_request(&self, request: &Request) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO requests (
                id, requester_id, requester_name, requester_division, contact_whatsapp,
                contact_line, target_division, request_type, project_title,
                project_description, reference_links, usage_date, status,
                rejection_reason, revision_notes, forwarded_to, submission_date, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(*request.id)
        .bind(*request.requester)
        .bind(&request.requester_name)
        .bind(&request.requester_division)
        .bind(&request.contact_whatsapp)
        .bind(&request.contact_line)
        .bind(request.target_division.code())
        .bind(&request.request_type)
        .bind(&request.project_title)
        .bind(&request.project_description)
        .bind(&request.reference_links)
        .bind(request.usage_date)
        .bind(request.status.as_str())
        .bind(&request.rejection_reason)
        .bind(&request.revision_notes)
        .bind(request.forwarded_to.map(|d| d.code()))
        .bind(request.submission_date)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert request")?;
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<Request> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM requests WHERE id = $1",
            REQUEST_COLUMNS
        ))
        .bind(*id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch request")?
        .ok_or(BrieflowError::RequestNotFound(id))?;

        request_from_row(&row)
    }

    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM requests WHERE TRUE", REQUEST_COLUMNS));

        if let Some(requester) = filter.requester {
            query.push(" AND requester_id = ").push_bind(*requester);
        }
        if let Some(divisions) = &filter.divisions {
            let codes: Vec<String> = divisions.iter().map(|d| d.code().to_string()).collect();
            query
                .push(" AND (target_division = ANY(")
                .push_bind(codes.clone())
                .push(") OR forwarded_to = ANY(")
                .push_bind(codes)
                .push(")");
            if let Some(requester) = filter.or_requester {
                query.push(" OR requester_id = ").push_bind(*requester);
            }
            query.push(")");
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(search) = &filter.search {
            let needle = search.to_lowercase();
            query
                .push(" AND (position(")
                .push_bind(needle.clone())
                .push(" IN lower(project_title)) > 0 OR position(")
                .push_bind(needle.clone())
                .push(" IN lower(request_type)) > 0 OR position(")
                .push_bind(needle)
                .push(" IN lower(requester_name)) > 0)");
        }
        query.push(" ORDER BY submission_date DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to list requests")?;

        rows.iter().map(request_from_row).collect()
    }

    #[tracing::instrument(skip(self, next, expected), fields(request_id = %next.id, from = %expected.status, to = %next.status))]
    async fn transition_request(&self, next: &Request, expected: &Request) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE requests
            SET status = $3,
                rejection_reason = $4,
                revision_notes = $5,
                forwarded_to = $6,
                updated_at = $7
            WHERE id = $1 AND status = $2 AND updated_at = $8
            "#,
        )
        .bind(*next.id)
        .bind(expected.status.as_str())
        .bind(next.status.as_str())
        .bind(&next.rejection_reason)
        .bind(&next.revision_notes)
        .bind(next.forwarded_to.map(|d| d.code()))
        .bind(next.updated_at)
        .bind(expected.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to update request status")?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM requests WHERE id = $1)")
            .bind(*next.id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to check request existence")?;

        if exists {
            Ok(false)
        } else {
            Err(BrieflowError::RequestNotFound(next.id))
        }
    }

    #[tracing::instrument(skip(self), fields(request_id = %id))]
    async fn delete_request(&self, id: RequestId) -> Result<Vec<RequestFile>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM request_files WHERE request_id = $1 FOR UPDATE",
            FILE_COLUMNS
        ))
        .bind(*id)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to fetch attachments")?;
        let files = rows.iter().map(file_from_row).collect::<Result<Vec<_>>>()?;

        let deleted = sqlx::query("DELETE FROM requests WHERE id = $1")
            .bind(*id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete request")?;

        if deleted.rows_affected() == 0 {
            return Err(BrieflowError::RequestNotFound(id));
        }

        tx.commit().await.context("Failed to commit transaction")?;
        Ok(files)
    }

    async fn insert_file(&self, file: &RequestFile) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO request_files (id, request_id, file_name, storage_path, size_bytes, mime_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(*file.id)
        .bind(*file.request_id)
        .bind(&file.file_name)
        .bind(&file.storage_path)
        .bind(file.size_bytes)
        .bind(&file.mime_type)
        .bind(file.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_foreign_key_violation(&e) => {
                Err(BrieflowError::RequestNotFound(file.request_id))
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context("Failed to insert attachment")
                .into()),
        }
    }

    async fn get_file(&self, id: FileId) -> Result<RequestFile> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM request_files WHERE id = $1",
            FILE_COLUMNS
        ))
        .bind(*id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch attachment")?
        .ok_or(BrieflowError::FileNotFound(id))?;

        file_from_row(&row)
    }

    async fn list_files(&self, request_id: RequestId) -> Result<Vec<RequestFile>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM request_files WHERE request_id = $1 ORDER BY created_at ASC",
            FILE_COLUMNS
        ))
        .bind(*request_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list attachments")?;

        rows.iter().map(file_from_row).collect()
    }

    async fn delete_file(&self, id: FileId) -> Result<()> {
        let result = sqlx::query("DELETE FROM request_files WHERE id = $1")
            .bind(*id)
            .execute(&self.pool)
            .await
            .context("Failed to delete attachment")?;

        if result.rows_affected() == 0 {
            return Err(BrieflowError::FileNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStorage for PostgresStorage {
    async fn get_profile(&self, id: PrincipalId) -> Result<Profile> {
        let row = sqlx::query(
            "SELECT id, full_name, email, division, contact_whatsapp, contact_line FROM profiles WHERE id = $1",
        )
        .bind(*id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch profile")?
        .ok_or(BrieflowError::ProfileNotFound(id))?;

        Ok(Profile {
            id: PrincipalId(row.try_get::<Uuid, _>("id").context("id")?),
            full_name: row.try_get("full_name").context("full_name")?,
            email: row.try_get("email").context("email")?,
            division: row.try_get("division").context("division")?,
            contact_whatsapp: row.try_get("contact_whatsapp").context("contact_whatsapp")?,
            contact_line: row.try_get("contact_line").context("contact_line")?,
        })
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (id, full_name, email, division, contact_whatsapp, contact_line)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                full_name = EXCLUDED.full_name,
                email = EXCLUDED.email,
                division = EXCLUDED.division,
                contact_whatsapp = EXCLUDED.contact_whatsapp,
                contact_line = EXCLUDED.contact_line,
                updated_at = now()
            "#,
        )
        .bind(*profile.id)
        .bind(&profile.full_name)
        .bind(&profile.email)
        .bind(&profile.division)
        .bind(&profile.contact_whatsapp)
        .bind(&profile.contact_line)
        .execute(&self.pool)
        .await
        .context("Failed to upsert profile")?;
        Ok(())
    }

    async fn roles_for(&self, id: PrincipalId) -> Result<Vec<Role>> {
        let roles: Vec<String> =
            sqlx::query_scalar("SELECT role FROM user_roles WHERE user_id = $1 ORDER BY role")
                .bind(*id)
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch roles")?;

        roles
            .iter()
            .map(|role| Role::from_str(role).map_err(|e| BrieflowError::from(anyhow!(e))))
            .collect()
    }

    async fn grant_role(&self, id: PrincipalId, role: Role) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_roles (user_id, role) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(*id)
        .bind(role.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to grant role")?;
        Ok(())
    }
}

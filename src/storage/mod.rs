//! Storage traits for requests, attachments, profiles and blobs.
//!
//! This module defines the persistence seams the lifecycle engine consumes:
//! - [`Storage`]: request rows (with conditional status updates) and attachment metadata
//! - [`ProfileStorage`]: profiles and the principal → role table
//! - [`ObjectStore`]: blob storage for attachment bytes, addressed by path

use async_trait::async_trait;

use crate::domain::file::{FileId, RequestFile};
use crate::domain::principal::{Principal, PrincipalId, Profile, Role};
use crate::domain::request::{Request, RequestFilter, RequestId};
use crate::error::Result;

pub mod memory;
pub mod object;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStorage;
pub use object::{InMemoryObjectStore, LocalObjectStore, object_path};

/// Storage trait for persisting and querying requests and their attachments.
///
/// Status changes go exclusively through [`Storage::transition_request`], which
/// must be atomic for a single request id: the write only lands if the stored
/// version (status and `updated_at`) still equals the one it was planned from.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a newly submitted request.
    async fn insert_request(&self, request: &Request) -> Result<()>;

    /// Get a request by ID.
    async fn get_request(&self, id: RequestId) -> Result<Request>;

    /// List requests matching `filter`, most recently submitted first.
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>>;

    /// Conditionally persist a transition.
    ///
    /// Writes `status`, `rejection_reason`, `revision_notes`, `forwarded_to` and
    /// `updated_at` from `next` only if the stored `status` and `updated_at`
    /// both still equal those of `expected`, the snapshot `next` was planned
    /// from. Returns `false` when another write landed in between (a lost
    /// race), including one that left the status unchanged; errors with
    /// `RequestNotFound` if the row does not exist.
    async fn transition_request(&self, next: &Request, expected: &Request) -> Result<bool>;

    /// Delete a request and, by cascade, its attachment records.
    ///
    /// Returns the attachment records that were removed so the caller can
    /// clean up their blobs.
    async fn delete_request(&self, id: RequestId) -> Result<Vec<RequestFile>>;

    /// Record a stored attachment. Fails with `RequestNotFound` if the owning
    /// request does not exist.
    async fn insert_file(&self, file: &RequestFile) -> Result<()>;

    /// Get an attachment record by ID.
    async fn get_file(&self, id: FileId) -> Result<RequestFile>;

    /// List attachment records of a request, oldest first.
    async fn list_files(&self, request_id: RequestId) -> Result<Vec<RequestFile>>;

    /// Delete an attachment record.
    async fn delete_file(&self, id: FileId) -> Result<()>;
}

/// Profiles and role assignments.
#[async_trait]
pub trait ProfileStorage: Send + Sync {
    /// Get a profile by principal ID.
    async fn get_profile(&self, id: PrincipalId) -> Result<Profile>;

    /// Create or replace a profile.
    async fn upsert_profile(&self, profile: &Profile) -> Result<()>;

    /// All roles granted to a principal (possibly none).
    async fn roles_for(&self, id: PrincipalId) -> Result<Vec<Role>>;

    /// Grant a role. Granting a role twice is a no-op.
    async fn grant_role(&self, id: PrincipalId, role: Role) -> Result<()>;

    /// Resolve the principal for one unit of work.
    ///
    /// Calling layers do this once per call and pass the result down.
    async fn resolve_principal(&self, id: PrincipalId) -> Result<Principal> {
        let roles = self.roles_for(id).await?;
        Ok(Principal::new(id, roles))
    }
}

/// Blob storage for attachment bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path`, returning the path actually used.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String>;

    /// Fetch the bytes stored at `path`.
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete the object at `path`. Deleting a missing object is not an error.
    async fn delete(&self, path: &str) -> Result<()>;
}

//! In-process implementation of [`Storage`] and [`ProfileStorage`].
//!
//! Requests live in a [`DashMap`], whose per-entry write guard gives the
//! compare-and-set in [`Storage::transition_request`] the same single-row
//! atomicity a conditional `UPDATE ... WHERE status = $2 AND updated_at = $3`
//! has in SQL.

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{ProfileStorage, Storage};
use crate::domain::file::{FileId, RequestFile};
use crate::domain::principal::{PrincipalId, Profile, Role};
use crate::domain::request::{Request, RequestFilter, RequestId};
use crate::error::{BrieflowError, Result};

#[derive(Default)]
pub struct InMemoryStorage {
    requests: DashMap<RequestId, Request>,
    files: RwLock<HashMap<FileId, RequestFile>>,
    profiles: DashMap<PrincipalId, Profile>,
    roles: DashMap<PrincipalId, Vec<Role>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored requests.
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Number of stored attachment records, across all requests.
    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_request(&self, request: &Request) -> Result<()> {
        if self.requests.contains_key(&request.id) {
            return Err(anyhow!("duplicate request id {}", request.id).into());
        }
        self.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<Request> {
        self.requests
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(BrieflowError::RequestNotFound(id))
    }

    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>> {
        let mut requests: Vec<Request> = self
            .requests
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        requests.sort_by(|a, b| b.submission_date.cmp(&a.submission_date));
        if let Some(limit) = filter.limit {
            requests.truncate(limit);
        }
        Ok(requests)
    }

    async fn transition_request(&self, next: &Request, expected: &Request) -> Result<bool> {
        let mut entry = self
            .requests
            .get_mut(&next.id)
            .ok_or(BrieflowError::RequestNotFound(next.id))?;

        let stored = entry.value_mut();
        if stored.status != expected.status || stored.updated_at != expected.updated_at {
            return Ok(false);
        }

        stored.status = next.status;
        stored.rejection_reason = next.rejection_reason.clone();
        stored.revision_notes = next.revision_notes.clone();
        stored.forwarded_to = next.forwarded_to;
        stored.updated_at = next.updated_at;
        Ok(true)
    }

    async fn delete_request(&self, id: RequestId) -> Result<Vec<RequestFile>> {
        // Hold the file lock across both removals so no attachment can be
        // recorded against a request that is halfway deleted.
        let mut files = self.files.write();
        self.requests
            .remove(&id)
            .ok_or(BrieflowError::RequestNotFound(id))?;

        let owned: Vec<FileId> = files
            .values()
            .filter(|file| file.request_id == id)
            .map(|file| file.id)
            .collect();
        Ok(owned
            .into_iter()
            .filter_map(|file_id| files.remove(&file_id))
            .collect())
    }

    async fn insert_file(&self, file: &RequestFile) -> Result<()> {
        let mut files = self.files.write();
        if !self.requests.contains_key(&file.request_id) {
            return Err(BrieflowError::RequestNotFound(file.request_id));
        }
        files.insert(file.id, file.clone());
        Ok(())
    }

    async fn get_file(&self, id: FileId) -> Result<RequestFile> {
        self.files
            .read()
            .get(&id)
            .cloned()
            .ok_or(BrieflowError::FileNotFound(id))
    }

    async fn list_files(&self, request_id: RequestId) -> Result<Vec<RequestFile>> {
        let mut files: Vec<RequestFile> = self
            .files
            .read()
            .values()
            .filter(|file| file.request_id == request_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(files)
    }

    async fn delete_file(&self, id: FileId) -> Result<()> {
        self.files
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(BrieflowError::FileNotFound(id))
    }
}

#[async_trait]
impl ProfileStorage for InMemoryStorage {
    async fn get_profile(&self, id: PrincipalId) -> Result<Profile> {
        self.profiles
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(BrieflowError::ProfileNotFound(id))
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        self.profiles.insert(profile.id, profile.clone());
        Ok(())
    }

    async fn roles_for(&self, id: PrincipalId) -> Result<Vec<Role>> {
        Ok(self
            .roles
            .get(&id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn grant_role(&self, id: PrincipalId, role: Role) -> Result<()> {
        let mut roles = self.roles.entry(id).or_default();
        if !roles.contains(&role) {
            roles.push(role);
        }
        Ok(())
    }
}

//! The inbound command surface.
//!
//! [`RequestManager`] is what a UI or CLI layer talks to. It owns the
//! lifecycle engine, the attachment policy and the object store, and applies
//! authorization to reads as well as writes. The caller resolves the
//! [`Principal`] once per call (see [`crate::storage::ProfileStorage::resolve_principal`])
//! and passes it in.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use metrics::counter;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::domain::division::{Division, DivisionPolicy};
use crate::domain::file::{FileId, RequestFile, UploadedFile};
use crate::domain::principal::Principal;
use crate::domain::request::{
    LifecycleEvent, NewRequest, Request, RequestFilter, RequestId, TransitionPayload, Trigger,
};
use crate::error::{BrieflowError, Result};
use crate::lifecycle::RequestLifecycle;
use crate::policy::{AttachmentLimits, AttachmentPolicy};
use crate::storage::{ObjectStore, Storage, object_path};

/// Request and attachment operations on top of a [`Storage`] and an [`ObjectStore`].
///
/// # Example
/// ```ignore
/// let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
/// let manager = RequestManager::new(storage.clone(), objects)
///     .with_config(&config)
///     .with_events(events_tx);
///
/// let request = manager.create_request(&principal, new_request).await?;
/// manager.apply(request.id, &staff, Trigger::Approve, TransitionPayload::none()).await?;
/// ```
pub struct RequestManager<S: Storage, O: ObjectStore> {
    lifecycle: RequestLifecycle<S>,
    storage: Arc<S>,
    objects: Arc<O>,
    attachments: AttachmentPolicy,
}

impl<S: Storage, O: ObjectStore> RequestManager<S, O> {
    pub fn new(storage: Arc<S>, objects: Arc<O>) -> Self {
        Self {
            lifecycle: RequestLifecycle::new(storage.clone()),
            storage,
            objects,
            attachments: AttachmentPolicy::default(),
        }
    }

    /// Apply the division table and attachment limits from `config`.
    pub fn with_config(self, config: &Config) -> Self {
        self.with_divisions(config.divisions.clone())
            .with_limits(config.attachments.clone())
    }

    pub fn with_divisions(mut self, divisions: DivisionPolicy) -> Self {
        self.lifecycle = self.lifecycle.with_divisions(divisions);
        self
    }

    pub fn with_limits(mut self, limits: AttachmentLimits) -> Self {
        self.attachments = AttachmentPolicy::new(limits);
        self
    }

    /// Send lifecycle events to a notification dispatcher.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        self.lifecycle = self.lifecycle.with_events(events);
        self
    }

    pub fn lifecycle(&self) -> &RequestLifecycle<S> {
        &self.lifecycle
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn objects(&self) -> &Arc<O> {
        &self.objects
    }

    pub async fn create_request(&self, principal: &Principal, input: NewRequest) -> Result<Request> {
        self.lifecycle.create(principal, input).await
    }

    pub async fn apply(
        &self,
        id: RequestId,
        principal: &Principal,
        trigger: Trigger,
        payload: TransitionPayload,
    ) -> Result<Request> {
        self.lifecycle.apply(id, principal, trigger, payload).await
    }

    /// Fetch a request the principal is allowed to see.
    pub async fn get_request(&self, id: RequestId, principal: &Principal) -> Result<Request> {
        let request = self.storage.get_request(id).await?;
        if !self.lifecycle.authorization().may_view(principal, &request) {
            return Err(BrieflowError::Forbidden);
        }
        Ok(request)
    }

    /// List requests, narrowed to what the principal may see.
    ///
    /// Admins see everything. Staff see requests targeted at or forwarded to
    /// their divisions plus their own submissions, unless they ask for specific
    /// divisions. Everyone else sees only their own submissions.
    #[tracing::instrument(skip(self, principal, filter), fields(principal = %principal.id))]
    pub async fn list_requests(
        &self,
        principal: &Principal,
        filter: RequestFilter,
    ) -> Result<Vec<Request>> {
        let scoped = scope_filter(principal, filter);
        self.storage.list_requests(&scoped).await
    }

    /// Validate, possibly recompress, and store one attachment.
    ///
    /// Type and size are checked on the original upload before anything is
    /// written. The blob write gets one immediate retry. If the metadata record
    /// cannot be written the blob is deleted again (best-effort) and the error
    /// is returned.
    #[tracing::instrument(skip(self, principal, file), fields(request_id = %request_id, principal = %principal.id, file_name = %file.file_name, size_bytes = file.size_bytes()))]
    pub async fn admit_attachment(
        &self,
        request_id: RequestId,
        principal: &Principal,
        file: UploadedFile,
    ) -> Result<RequestFile> {
        let result = self.store_attachment(request_id, principal, file).await;
        let outcome = match &result {
            Ok(_) => "stored",
            Err(BrieflowError::Policy(_)) => "rejected",
            Err(e) if e.is_retryable() => "failed",
            Err(_) => "refused",
        };
        counter!("brieflow_attachments_total", "outcome" => outcome).increment(1);
        result
    }

    /// Admit several files independently.
    ///
    /// Files are processed concurrently and one file's failure never affects
    /// another; results are returned in input order.
    pub async fn admit_attachments(
        &self,
        request_id: RequestId,
        principal: &Principal,
        files: Vec<UploadedFile>,
    ) -> Vec<Result<RequestFile>> {
        join_all(
            files
                .into_iter()
                .map(|file| self.admit_attachment(request_id, principal, file)),
        )
        .await
    }

    async fn store_attachment(
        &self,
        request_id: RequestId,
        principal: &Principal,
        file: UploadedFile,
    ) -> Result<RequestFile> {
        let request = self.storage.get_request(request_id).await?;
        if !self.lifecycle.authorization().may_attach(principal, &request) {
            return Err(BrieflowError::Forbidden);
        }
        if request.status.is_terminal() {
            return Err(BrieflowError::validation(
                "request_id",
                format!("request is {}, attachments are closed", request.status),
            ));
        }

        // Cheap checks inline so oversized uploads never reach a worker thread
        self.attachments.check(&file)?;

        let policy = self.attachments.clone();
        let admitted = tokio::task::spawn_blocking(move || policy.admit(file))
            .await
            .map_err(|e| anyhow::anyhow!("Attachment processing task failed: {}", e))??;

        let now = Utc::now();
        let path = object_path(request_id, &admitted.extension(), now);
        let size_bytes = admitted.size_bytes() as i64;

        let stored_path = match self.objects.put(&path, admitted.bytes.clone()).await {
            Ok(stored) => stored,
            Err(e) if e.is_retryable() => {
                tracing::warn!(path = %path, error = %e, "Object store write failed, retrying once");
                self.objects.put(&path, admitted.bytes).await?
            }
            Err(e) => return Err(e),
        };

        let record = RequestFile {
            id: FileId(Uuid::new_v4()),
            request_id,
            file_name: admitted.file_name,
            storage_path: stored_path,
            size_bytes,
            mime_type: admitted.mime_type,
            created_at: now,
        };

        if let Err(e) = self.storage.insert_file(&record).await {
            tracing::warn!(path = %record.storage_path, error = %e, "Attachment metadata write failed, removing blob");
            if let Err(cleanup) = self.objects.delete(&record.storage_path).await {
                tracing::error!(
                    path = %record.storage_path,
                    error = %cleanup,
                    "Failed to remove blob after metadata failure, blob is orphaned"
                );
            }
            return Err(e);
        }

        tracing::info!(
            file_id = %record.id,
            path = %record.storage_path,
            original_size_bytes = admitted.original_size_bytes,
            size_bytes,
            recompressed = admitted.recompressed,
            "Attachment stored"
        );
        Ok(record)
    }

    /// Remove an attachment: the metadata record first, then the blob.
    ///
    /// A blob that cannot be deleted is logged and left behind.
    #[tracing::instrument(skip(self, principal), fields(request_id = %request_id, file_id = %file_id, principal = %principal.id))]
    pub async fn remove_attachment(
        &self,
        request_id: RequestId,
        file_id: FileId,
        principal: &Principal,
    ) -> Result<()> {
        let request = self.storage.get_request(request_id).await?;
        if !self
            .lifecycle
            .authorization()
            .may_remove_attachment(principal, &request)
        {
            return Err(BrieflowError::Forbidden);
        }

        let file = self.storage.get_file(file_id).await?;
        if file.request_id != request_id {
            return Err(BrieflowError::FileNotFound(file_id));
        }

        self.storage.delete_file(file_id).await?;
        if let Err(e) = self.objects.delete(&file.storage_path).await {
            tracing::warn!(path = %file.storage_path, error = %e, "Failed to delete attachment blob, blob is orphaned");
        }

        counter!("brieflow_attachments_total", "outcome" => "removed").increment(1);
        Ok(())
    }

    pub async fn list_attachments(
        &self,
        request_id: RequestId,
        principal: &Principal,
    ) -> Result<Vec<RequestFile>> {
        self.get_request(request_id, principal).await?;
        self.storage.list_files(request_id).await
    }

    /// Fetch an attachment's record and bytes.
    pub async fn download_attachment(
        &self,
        request_id: RequestId,
        file_id: FileId,
        principal: &Principal,
    ) -> Result<(RequestFile, Vec<u8>)> {
        self.get_request(request_id, principal).await?;
        let file = self.storage.get_file(file_id).await?;
        if file.request_id != request_id {
            return Err(BrieflowError::FileNotFound(file_id));
        }
        let bytes = self.objects.get(&file.storage_path).await?;
        Ok((file, bytes))
    }

    /// Delete a request with all its attachments. Admin only.
    #[tracing::instrument(skip(self, principal), fields(request_id = %id, principal = %principal.id))]
    pub async fn delete_request(&self, id: RequestId, principal: &Principal) -> Result<()> {
        if !self.lifecycle.authorization().may_delete(principal) {
            return Err(BrieflowError::Forbidden);
        }

        let files = self.storage.delete_request(id).await?;
        let cleanups = files.iter().map(|file| async move {
            if let Err(e) = self.objects.delete(&file.storage_path).await {
                tracing::warn!(path = %file.storage_path, error = %e, "Failed to delete attachment blob, blob is orphaned");
            }
        });
        join_all(cleanups).await;

        tracing::info!(attachments = files.len(), "Request deleted");
        Ok(())
    }
}

/// Narrow `filter` to the requests `principal` may see.
fn scope_filter(principal: &Principal, mut filter: RequestFilter) -> RequestFilter {
    if principal.is_admin() {
        return filter;
    }

    let staff: Vec<Division> = principal.staff_divisions().collect();
    if staff.is_empty() {
        filter.requester = Some(principal.id);
        return filter;
    }

    match filter.divisions.take() {
        Some(requested) => {
            filter.divisions = Some(
                requested
                    .into_iter()
                    .filter(|division| staff.contains(division))
                    .collect(),
            );
        }
        None => {
            // Staff who also submit still see their own requests
            filter.divisions = Some(staff);
            filter.or_requester = Some(principal.id);
        }
    }
    filter
}

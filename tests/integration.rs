use async_trait::async_trait;
use brieflow::domain::file::FileId;
use brieflow::policy::attachment::MIB;
use brieflow::{
    BrieflowError, DispatchConfig, Division, InMemoryObjectStore, InMemoryStorage,
    MockMailGateway, NewRequest, NotificationDispatcher, PolicyViolation, Principal, PrincipalId,
    Profile, ProfileStorage, Request, RequestFile, RequestFilter, RequestId, RequestManager,
    RequestStatus, Role, Storage, TransitionPayload, Trigger, UploadedFile,
};
use chrono::{Duration, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Barrier, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn principal(roles: &[Role]) -> Principal {
    Principal::new(PrincipalId(Uuid::new_v4()), roles.iter().copied())
}

fn new_request(division: &str, request_type: &str, days_ahead: i64) -> NewRequest {
    NewRequest {
        requester_name: "Rina Aulia".to_string(),
        requester_division: "Public Relations".to_string(),
        contact_whatsapp: Some("+62 812-3456-7890".to_string()),
        contact_line: None,
        target_division: division.to_string(),
        request_type: request_type.to_string(),
        project_title: "Open house 2026".to_string(),
        project_description: "Visual identity for the open house weekend".to_string(),
        reference_links: vec!["https://example.com/moodboard".to_string()],
        usage_date: Utc::now().date_naive() + Duration::days(days_ahead),
    }
}

fn manager() -> RequestManager<InMemoryStorage, InMemoryObjectStore> {
    RequestManager::new(
        Arc::new(InMemoryStorage::new()),
        Arc::new(InMemoryObjectStore::new()),
    )
}

/// Deterministic noise, which JPEG compresses poorly.
fn noisy_jpeg(width: u32, height: u32) -> Vec<u8> {
    let mut state: u32 = 0x2545_F491;
    let img = RgbImage::from_fn(width, height, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        Rgb([state as u8, (state >> 8) as u8, (state >> 16) as u8])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, 95))
        .unwrap();
    buf
}

#[test_log::test(tokio::test)]
async fn test_end_to_end_create_approve_forward_complete() {
    let manager = manager();
    let requester = principal(&[Role::Requester]);
    let staff_cd = principal(&[Role::Staff(Division::Cd)]);
    let staff_medpro = principal(&[Role::Staff(Division::Medpro)]);

    let request = manager
        .create_request(&requester, new_request("CD", "Logo", 10))
        .await
        .expect("Failed to create request");
    assert_eq!(request.status, RequestStatus::PendingApproval);
    assert_eq!(request.target_division, Division::Cd);
    assert_eq!(request.requester, requester.id);

    // MEDPRO staff have no say until the request is forwarded to them
    let err = manager
        .apply(request.id, &staff_medpro, Trigger::Approve, TransitionPayload::none())
        .await
        .unwrap_err();
    assert!(matches!(err, BrieflowError::Forbidden));

    let approved = manager
        .apply(request.id, &staff_cd, Trigger::Approve, TransitionPayload::none())
        .await
        .unwrap();
    assert_eq!(approved.status, RequestStatus::InProgress);

    let forwarded = manager
        .apply(
            request.id,
            &staff_cd,
            Trigger::Forward,
            TransitionPayload::forward_to(Division::Medpro),
        )
        .await
        .unwrap();
    assert_eq!(forwarded.status, RequestStatus::Forwarded);
    assert_eq!(forwarded.forwarded_to, Some(Division::Medpro));
    assert_eq!(forwarded.target_division, Division::Cd);

    let completed = manager
        .apply(request.id, &staff_medpro, Trigger::Complete, TransitionPayload::none())
        .await
        .unwrap();
    assert_eq!(completed.status, RequestStatus::Completed);

    let err = manager
        .apply(
            request.id,
            &staff_medpro,
            Trigger::Reject,
            TransitionPayload::rejection_reason("Too late"),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrieflowError::InvalidTransition {
            from: RequestStatus::Completed,
            trigger: Trigger::Reject
        }
    ));

    // Reads see the committed state immediately
    let stored = manager.get_request(request.id, &requester).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Completed);
    assert!(stored.updated_at >= stored.submission_date);
}

#[test_log::test(tokio::test)]
async fn test_concurrent_approvals_exactly_one_wins() {
    let manager = Arc::new(manager());
    let requester = principal(&[Role::Requester]);
    let request = manager
        .create_request(&requester, new_request("CC", "Caption Writing", 7))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let manager = manager.clone();
        let staff = principal(&[Role::Staff(Division::Cc)]);
        handles.push(tokio::spawn(async move {
            manager
                .apply(request.id, &staff, Trigger::Approve, TransitionPayload::none())
                .await
        }));
    }

    let mut wins = 0;
    let mut losses = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(updated) => {
                assert_eq!(updated.status, RequestStatus::InProgress);
                wins += 1;
            }
            Err(BrieflowError::InvalidTransition { from, trigger }) => {
                assert_eq!(from, RequestStatus::InProgress);
                assert_eq!(trigger, Trigger::Approve);
                losses += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((wins, losses), (1, 1));
}

#[test_log::test(tokio::test)]
async fn test_staff_limited_to_their_division() {
    let manager = manager();
    let requester = principal(&[Role::Requester]);
    let staff_cc = principal(&[Role::Staff(Division::Cc)]);

    let for_cd = manager
        .create_request(&requester, new_request("CD", "Poster", 14))
        .await
        .unwrap();
    let for_cc = manager
        .create_request(&requester, new_request("CC", "Content Ideas", 14))
        .await
        .unwrap();

    let err = manager
        .apply(for_cd.id, &staff_cc, Trigger::Approve, TransitionPayload::none())
        .await
        .unwrap_err();
    assert!(matches!(err, BrieflowError::Forbidden));
    assert_eq!(err.to_string(), "Operation not permitted");

    manager
        .apply(for_cc.id, &staff_cc, Trigger::Approve, TransitionPayload::none())
        .await
        .unwrap();

    // The requester can read but never change status
    let err = manager
        .apply(
            for_cd.id,
            &requester,
            Trigger::Reject,
            TransitionPayload::rejection_reason("Changed my mind"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrieflowError::Forbidden));
}

#[test_log::test(tokio::test)]
async fn test_blank_revision_notes_never_mutate() {
    let manager = manager();
    let requester = principal(&[Role::Requester]);
    let admin = principal(&[Role::Admin]);
    let request = manager
        .create_request(&requester, new_request("MS", "Campaign Planning", 20))
        .await
        .unwrap();
    manager
        .apply(request.id, &admin, Trigger::Approve, TransitionPayload::none())
        .await
        .unwrap();

    for notes in ["", "   ", "\n\t"] {
        let err = manager
            .apply(
                request.id,
                &admin,
                Trigger::RequestRevision,
                TransitionPayload::revision_notes(notes),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrieflowError::MissingPayload {
                trigger: Trigger::RequestRevision,
                field: "revision_notes"
            }
        ));
    }

    let stored = manager.get_request(request.id, &admin).await.unwrap();
    assert_eq!(stored.status, RequestStatus::InProgress);
    assert_eq!(stored.revision_notes, None);

    let revised = manager
        .apply(
            request.id,
            &admin,
            Trigger::RequestRevision,
            TransitionPayload::revision_notes("Use the new logo"),
        )
        .await
        .unwrap();
    assert_eq!(revised.status, RequestStatus::RevisionNeeded);

    // A second round overwrites the first
    let revised = manager
        .apply(
            request.id,
            &admin,
            Trigger::RequestRevision,
            TransitionPayload::revision_notes("Bigger headline"),
        )
        .await
        .unwrap();
    assert_eq!(revised.revision_notes.as_deref(), Some("Bigger headline"));
}

#[test_log::test(tokio::test)]
async fn test_submission_policy_errors_name_the_constraint() {
    let manager = manager();
    let requester = principal(&[Role::Requester]);

    let err = manager
        .create_request(&requester, new_request("CD", "Logo", 3))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrieflowError::Policy(PolicyViolation::InsufficientLeadTime { required: 7, .. })
    ));

    let err = manager
        .create_request(&requester, new_request("HR", "Logo", 30))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrieflowError::Policy(PolicyViolation::UnknownDivision(_))
    ));

    let mut bad_phone = new_request("CC", "Caption Writing", 10);
    bad_phone.contact_whatsapp = Some("call me maybe".to_string());
    let err = manager
        .create_request(&requester, bad_phone)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrieflowError::Validation {
            field: "contact_whatsapp",
            ..
        }
    ));

    assert_eq!(manager.storage().request_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_attachment_admission() {
    let manager = manager();
    let requester = principal(&[Role::Requester]);
    let request = manager
        .create_request(&requester, new_request("CD", "Feed Design", 10))
        .await
        .unwrap();

    // Oversized uploads never reach the object store
    let err = manager
        .admit_attachment(
            request.id,
            &requester,
            UploadedFile::new("huge.png", "image/png", vec![0; (12 * MIB) as usize]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrieflowError::Policy(PolicyViolation::TooLarge { .. })
    ));
    assert_eq!(manager.objects().put_attempts(), 0);

    let err = manager
        .admit_attachment(
            request.id,
            &requester,
            UploadedFile::new("clip.gif", "image/gif", vec![0; 1024]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrieflowError::Policy(PolicyViolation::UnsupportedType { .. })
    ));
    assert_eq!(manager.objects().put_attempts(), 0);

    let pdf = vec![0x25; 500 * 1024];
    let stored_pdf = manager
        .admit_attachment(
            request.id,
            &requester,
            UploadedFile::new("brief.pdf", "application/pdf", pdf.clone()),
        )
        .await
        .unwrap();
    assert_eq!(stored_pdf.size_bytes, pdf.len() as i64);
    assert!(stored_pdf.storage_path.starts_with(&format!("{}/", request.id.0)));
    assert!(stored_pdf.storage_path.ends_with(".pdf"));
    let (_, bytes) = manager
        .download_attachment(request.id, stored_pdf.id, &requester)
        .await
        .unwrap();
    assert_eq!(bytes, pdf);

    let photo = noisy_jpeg(1600, 1200);
    assert!(photo.len() as u64 > MIB, "fixture should exceed 1 MiB");
    assert!((photo.len() as u64) < 10 * MIB);
    let stored_photo = manager
        .admit_attachment(
            request.id,
            &requester,
            UploadedFile::new("photo.jpg", "image/jpeg", photo),
        )
        .await
        .unwrap();
    assert!(stored_photo.size_bytes as u64 <= MIB);
    assert_eq!(stored_photo.mime_type, "image/jpeg");
    assert_eq!(stored_photo.file_name, "photo.jpg");

    let files = manager
        .list_attachments(request.id, &requester)
        .await
        .unwrap();
    assert_eq!(
        files.iter().map(|f| f.id).collect::<Vec<_>>(),
        vec![stored_pdf.id, stored_photo.id]
    );
}

#[test_log::test(tokio::test)]
async fn test_batch_admission_is_independent_per_file() {
    let manager = manager();
    let requester = principal(&[Role::Requester]);
    let request = manager
        .create_request(&requester, new_request("MEDPRO", "Video Editing", 10))
        .await
        .unwrap();

    let results = manager
        .admit_attachments(
            request.id,
            &requester,
            vec![
                UploadedFile::new("a.pdf", "application/pdf", vec![1; 2048]),
                UploadedFile::new("b.exe", "application/x-msdownload", vec![2; 2048]),
                UploadedFile::new("c.jpg", "image/jpg", vec![3; 2048]),
            ],
        )
        .await;

    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(BrieflowError::Policy(PolicyViolation::UnsupportedType { .. }))
    ));
    let alias = results[2].as_ref().unwrap();
    assert_eq!(alias.mime_type, "image/jpg");
    assert_eq!(manager.objects().len(), 2);
}

/// Storage whose file metadata writes can be made to fail.
struct FlakyFileStorage {
    inner: InMemoryStorage,
    fail_files: AtomicBool,
}

#[async_trait]
impl Storage for FlakyFileStorage {
    async fn insert_request(&self, request: &Request) -> brieflow::Result<()> {
        self.inner.insert_request(request).await
    }

    async fn get_request(&self, id: RequestId) -> brieflow::Result<Request> {
        self.inner.get_request(id).await
    }

    async fn list_requests(&self, filter: &RequestFilter) -> brieflow::Result<Vec<Request>> {
        self.inner.list_requests(filter).await
    }

    async fn transition_request(
        &self,
        next: &Request,
        expected: &Request,
    ) -> brieflow::Result<bool> {
        self.inner.transition_request(next, expected).await
    }

    async fn delete_request(&self, id: RequestId) -> brieflow::Result<Vec<RequestFile>> {
        self.inner.delete_request(id).await
    }

    async fn insert_file(&self, file: &RequestFile) -> brieflow::Result<()> {
        if self.fail_files.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("connection reset").into());
        }
        self.inner.insert_file(file).await
    }

    async fn get_file(&self, id: FileId) -> brieflow::Result<RequestFile> {
        self.inner.get_file(id).await
    }

    async fn list_files(&self, request_id: RequestId) -> brieflow::Result<Vec<RequestFile>> {
        self.inner.list_files(request_id).await
    }

    async fn delete_file(&self, id: FileId) -> brieflow::Result<()> {
        self.inner.delete_file(id).await
    }
}

/// Storage that holds the first `gated` reads until that many readers arrive,
/// so concurrent appliers plan from the same snapshot.
struct GatedReads {
    inner: InMemoryStorage,
    gate: Barrier,
    gated: AtomicUsize,
}

impl GatedReads {
    fn new(readers: usize) -> Self {
        Self {
            inner: InMemoryStorage::new(),
            gate: Barrier::new(readers),
            gated: AtomicUsize::new(0),
        }
    }

    fn arm(&self, readers: usize) {
        self.gated.store(readers, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for GatedReads {
    async fn insert_request(&self, request: &Request) -> brieflow::Result<()> {
        self.inner.insert_request(request).await
    }

    async fn get_request(&self, id: RequestId) -> brieflow::Result<Request> {
        let request = self.inner.get_request(id).await?;
        let held = self
            .gated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if held {
            self.gate.wait().await;
        }
        Ok(request)
    }

    async fn list_requests(&self, filter: &RequestFilter) -> brieflow::Result<Vec<Request>> {
        self.inner.list_requests(filter).await
    }

    async fn transition_request(
        &self,
        next: &Request,
        expected: &Request,
    ) -> brieflow::Result<bool> {
        self.inner.transition_request(next, expected).await
    }

    async fn delete_request(&self, id: RequestId) -> brieflow::Result<Vec<RequestFile>> {
        self.inner.delete_request(id).await
    }

    async fn insert_file(&self, file: &RequestFile) -> brieflow::Result<()> {
        self.inner.insert_file(file).await
    }

    async fn get_file(&self, id: FileId) -> brieflow::Result<RequestFile> {
        self.inner.get_file(id).await
    }

    async fn list_files(&self, request_id: RequestId) -> brieflow::Result<Vec<RequestFile>> {
        self.inner.list_files(request_id).await
    }

    async fn delete_file(&self, id: FileId) -> brieflow::Result<()> {
        self.inner.delete_file(id).await
    }
}

#[test_log::test(tokio::test)]
async fn test_revision_round_and_forward_race_from_same_snapshot() {
    let storage = Arc::new(GatedReads::new(2));
    let manager = Arc::new(RequestManager::new(
        storage.clone(),
        Arc::new(InMemoryObjectStore::new()),
    ));
    let requester = principal(&[Role::Requester]);
    let staff = principal(&[Role::Staff(Division::Cd)]);

    let request = manager
        .create_request(&requester, new_request("CD", "Poster", 10))
        .await
        .unwrap();
    manager
        .apply(request.id, &staff, Trigger::Approve, TransitionPayload::none())
        .await
        .unwrap();
    manager
        .apply(
            request.id,
            &staff,
            Trigger::RequestRevision,
            TransitionPayload::revision_notes("v1"),
        )
        .await
        .unwrap();

    // Both appliers read the same revision_needed row before either writes
    storage.arm(2);
    let revise = {
        let manager = manager.clone();
        let staff = staff.clone();
        tokio::spawn(async move {
            manager
                .apply(
                    request.id,
                    &staff,
                    Trigger::RequestRevision,
                    TransitionPayload::revision_notes("v2"),
                )
                .await
        })
    };
    let forward = {
        let manager = manager.clone();
        let staff = staff.clone();
        tokio::spawn(async move {
            manager
                .apply(
                    request.id,
                    &staff,
                    Trigger::Forward,
                    TransitionPayload::forward_to(Division::Medpro),
                )
                .await
        })
    };
    let revise = revise.await.unwrap();
    let forward = forward.await.unwrap();

    let stored = manager.get_request(request.id, &staff).await;
    let stored = match (revise, forward) {
        (Ok(revised), Err(BrieflowError::InvalidTransition { from, trigger })) => {
            assert_eq!(from, RequestStatus::RevisionNeeded);
            assert_eq!(trigger, Trigger::Forward);
            let stored = stored.unwrap();
            assert_eq!(stored, revised);
            assert_eq!(stored.revision_notes.as_deref(), Some("v2"));
            assert_eq!(stored.forwarded_to, None);
            stored
        }
        (Err(BrieflowError::InvalidTransition { from, trigger }), Ok(forwarded)) => {
            assert_eq!(from, RequestStatus::Forwarded);
            assert_eq!(trigger, Trigger::RequestRevision);
            // Staff of CD keep visibility through the original target
            let stored = stored.unwrap();
            assert_eq!(stored, forwarded);
            assert_eq!(stored.revision_notes.as_deref(), Some("v1"));
            assert_eq!(stored.forwarded_to, Some(Division::Medpro));
            stored
        }
        (revise, forward) => panic!("expected exactly one winner: {revise:?} / {forward:?}"),
    };
    assert!(stored.updated_at > request.updated_at);
}

#[test_log::test(tokio::test)]
async fn test_metadata_failure_removes_blob() {
    let storage = Arc::new(FlakyFileStorage {
        inner: InMemoryStorage::new(),
        fail_files: AtomicBool::new(false),
    });
    let objects = Arc::new(InMemoryObjectStore::new());
    let manager = RequestManager::new(storage.clone(), objects.clone());
    let requester = principal(&[Role::Requester]);
    let request = manager
        .create_request(&requester, new_request("CD", "Banner", 10))
        .await
        .unwrap();

    storage.fail_files.store(true, Ordering::SeqCst);
    let err = manager
        .admit_attachment(
            request.id,
            &requester,
            UploadedFile::new("brief.pdf", "application/pdf", vec![1; 4096]),
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(objects.put_attempts(), 1);
    assert!(objects.is_empty(), "blob should be cleaned up");

    // Cleanup failure leaves an orphan but still reports the metadata failure
    objects.fail_next_deletes(1);
    let err = manager
        .admit_attachment(
            request.id,
            &requester,
            UploadedFile::new("brief.pdf", "application/pdf", vec![1; 4096]),
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(objects.len(), 1);
    assert!(
        manager
            .list_attachments(request.id, &requester)
            .await
            .unwrap()
            .is_empty()
    );
}

#[test_log::test(tokio::test)]
async fn test_delete_request_removes_files_and_blobs() {
    let manager = manager();
    let requester = principal(&[Role::Requester]);
    let admin = principal(&[Role::Admin]);
    let request = manager
        .create_request(&requester, new_request("CC", "Social Media Post", 10))
        .await
        .unwrap();
    let file = manager
        .admit_attachment(
            request.id,
            &requester,
            UploadedFile::new("copy.pdf", "application/pdf", vec![9; 100]),
        )
        .await
        .unwrap();

    assert!(matches!(
        manager.delete_request(request.id, &requester).await,
        Err(BrieflowError::Forbidden)
    ));
    manager.delete_request(request.id, &admin).await.unwrap();

    assert!(!manager.objects().contains(&file.storage_path));
    assert_eq!(manager.storage().file_count(), 0);
    assert_eq!(manager.storage().request_count(), 0);
}

async fn profile_for(storage: &InMemoryStorage, id: PrincipalId, email: Option<&str>) {
    storage
        .upsert_profile(&Profile {
            id,
            full_name: "Rina Aulia".to_string(),
            email: email.map(str::to_string),
            division: Some("Public Relations".to_string()),
            contact_whatsapp: None,
            contact_line: None,
        })
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn test_notifications_follow_transitions() {
    let storage = Arc::new(InMemoryStorage::new());
    let mail = Arc::new(MockMailGateway::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let manager = RequestManager::new(storage.clone(), Arc::new(InMemoryObjectStore::new()))
        .with_events(events_tx);
    let dispatcher = Arc::new(NotificationDispatcher::new(storage.clone(), mail.clone()));
    let handle = dispatcher.run(events_rx, CancellationToken::new());

    let requester_id = PrincipalId(Uuid::new_v4());
    storage.grant_role(requester_id, Role::Requester).await.unwrap();
    profile_for(&storage, requester_id, Some("rina@example.com")).await;
    let requester = storage.resolve_principal(requester_id).await.unwrap();
    let admin = principal(&[Role::Admin]);

    let request = manager
        .create_request(&requester, new_request("CD", "Logo", 10))
        .await
        .unwrap();
    manager
        .apply(
            request.id,
            &admin,
            Trigger::Reject,
            TransitionPayload::rejection_reason("Budget <closed>"),
        )
        .await
        .unwrap();

    // Dropping the manager closes the event channel and stops the dispatcher
    drop(manager);
    handle.await.unwrap().unwrap();

    let calls = mail.get_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.to == "rina@example.com"));
    assert!(
        calls
            .iter()
            .any(|c| c.subject == "Request Submitted Successfully")
    );
    let rejection = calls
        .iter()
        .find(|c| c.subject == "Request Rejected")
        .expect("rejection notification");
    assert!(rejection.html.contains("Budget &lt;closed&gt;"));
    assert!(rejection.html.contains("Open house 2026"));
}

#[test_log::test(tokio::test)]
async fn test_notification_failure_never_blocks_transitions() {
    let storage = Arc::new(InMemoryStorage::new());
    let mail = Arc::new(MockMailGateway::new());
    for _ in 0..3 {
        mail.add_response(Err(anyhow::anyhow!("gateway unavailable").into()));
    }
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let manager = RequestManager::new(storage.clone(), Arc::new(InMemoryObjectStore::new()))
        .with_events(events_tx);
    let dispatcher = Arc::new(
        NotificationDispatcher::new(storage.clone(), mail.clone()).with_config(DispatchConfig {
            backoff_ms: 1,
            max_backoff_ms: 5,
            // One delivery at a time so the failures land on the first event
            max_concurrent_deliveries: 1,
            ..Default::default()
        }),
    );
    let handle = dispatcher.run(events_rx, CancellationToken::new());

    let requester = principal(&[Role::Requester]);
    profile_for(&storage, requester.id, Some("rina@example.com")).await;
    let staff = principal(&[Role::Staff(Division::Cd)]);

    let request = manager
        .create_request(&requester, new_request("CD", "Story Design", 10))
        .await
        .unwrap();
    let approved = manager
        .apply(request.id, &staff, Trigger::Approve, TransitionPayload::none())
        .await
        .unwrap();
    assert_eq!(approved.status, RequestStatus::InProgress);

    drop(manager);
    handle.await.unwrap().unwrap();

    // Submission exhausted its three attempts, approval went through
    assert_eq!(mail.call_count(), 4);
    assert!(mail.get_calls()[3].subject.contains("In Progress"));
    assert_eq!(
        storage.get_request(request.id).await.unwrap().status,
        RequestStatus::InProgress
    );
}

#[test_log::test(tokio::test)]
async fn test_requester_without_email_is_skipped() {
    let storage = Arc::new(InMemoryStorage::new());
    let mail = Arc::new(MockMailGateway::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let manager = RequestManager::new(storage.clone(), Arc::new(InMemoryObjectStore::new()))
        .with_events(events_tx);
    let handle = Arc::new(NotificationDispatcher::new(storage.clone(), mail.clone()))
        .run(events_rx, CancellationToken::new());

    let with_profile = principal(&[Role::Requester]);
    profile_for(&storage, with_profile.id, None).await;
    let without_profile = principal(&[Role::Requester]);

    manager
        .create_request(&with_profile, new_request("CC", "Content Ideas", 10))
        .await
        .unwrap();
    manager
        .create_request(&without_profile, new_request("CC", "Content Ideas", 10))
        .await
        .unwrap();

    drop(manager);
    handle.await.unwrap().unwrap();
    assert_eq!(mail.call_count(), 0);
}

#[cfg(feature = "postgres")]
mod postgres {
    use super::*;
    use brieflow::PostgresStorage;

    #[sqlx::test(migrator = "brieflow::storage::postgres::MIGRATOR")]
    #[test_log::test]
    async fn test_end_to_end_on_postgres(pool: sqlx::PgPool) {
        let storage = Arc::new(PostgresStorage::new(pool));
        let manager = RequestManager::new(storage.clone(), Arc::new(InMemoryObjectStore::new()));

        let requester_id = PrincipalId(Uuid::new_v4());
        storage.grant_role(requester_id, Role::Requester).await.unwrap();
        let requester = storage.resolve_principal(requester_id).await.unwrap();
        let staff_cd = principal(&[Role::Staff(Division::Cd)]);
        let staff_medpro = principal(&[Role::Staff(Division::Medpro)]);

        let request = manager
            .create_request(&requester, new_request("CD", "Logo", 10))
            .await
            .unwrap();
        manager
            .apply(request.id, &staff_cd, Trigger::Approve, TransitionPayload::none())
            .await
            .unwrap();
        manager
            .apply(
                request.id,
                &staff_cd,
                Trigger::Forward,
                TransitionPayload::forward_to(Division::Medpro),
            )
            .await
            .unwrap();

        let visible = manager
            .list_requests(&staff_medpro, RequestFilter::default())
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);

        let file = manager
            .admit_attachment(
                request.id,
                &requester,
                UploadedFile::new("brief.pdf", "application/pdf", vec![1; 1024]),
            )
            .await
            .unwrap();
        assert_eq!(
            manager
                .list_attachments(request.id, &staff_medpro)
                .await
                .unwrap()[0]
                .id,
            file.id
        );

        let completed = manager
            .apply(request.id, &staff_medpro, Trigger::Complete, TransitionPayload::none())
            .await
            .unwrap();
        assert_eq!(completed.status, RequestStatus::Completed);

        let err = manager
            .apply(
                request.id,
                &staff_medpro,
                Trigger::Reject,
                TransitionPayload::rejection_reason("Late"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrieflowError::InvalidTransition { .. }));
    }

    #[sqlx::test(migrator = "brieflow::storage::postgres::MIGRATOR")]
    async fn test_concurrent_approvals_on_postgres(pool: sqlx::PgPool) {
        let manager = Arc::new(RequestManager::new(
            Arc::new(PostgresStorage::new(pool)),
            Arc::new(InMemoryObjectStore::new()),
        ));
        let requester = principal(&[Role::Requester]);
        let request = manager
            .create_request(&requester, new_request("MS", "Content Calendar", 12))
            .await
            .unwrap();

        let attempts = (0..4).map(|_| {
            let manager = manager.clone();
            let staff = principal(&[Role::Staff(Division::Ms)]);
            tokio::spawn(async move {
                manager
                    .apply(request.id, &staff, Trigger::Approve, TransitionPayload::none())
                    .await
            })
        });
        let results = futures::future::join_all(attempts).await;

        let wins = results
            .iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(wins, 1);
        assert!(results.iter().all(|r| matches!(
            r,
            Ok(Ok(_)) | Ok(Err(BrieflowError::InvalidTransition { .. }))
        )));
    }
}

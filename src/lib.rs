//! Request lifecycle engine for routing creative-work requests to production divisions.
//!
//! A requester submits a request to one of four divisions. Division staff move it
//! through review, revision, production and completion, and may forward it to
//! another division. Every accepted transition is emitted as a
//! [`LifecycleEvent`] which the [`NotificationDispatcher`] turns into email to the
//! requester, off the request path.
//!
//! Attachments are validated against type and size limits before anything is
//! stored, and images are recompressed on a best-effort basis.
//!
//! Storage is pluggable: [`InMemoryStorage`] for tests and embedding, and
//! `PostgresStorage` behind the `postgres` feature.

pub mod config;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod notification;
pub mod policy;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use domain::division::{Division, DivisionPolicy, DivisionRules};
pub use domain::file::{FileId, RequestFile, UploadedFile};
pub use domain::principal::{Principal, PrincipalId, Profile, Role};
pub use domain::request::{
    LifecycleEvent, NewRequest, Request, RequestFilter, RequestId, RequestStatus,
    TransitionPayload, Trigger,
};
pub use error::{BrieflowError, PolicyViolation, Result};
pub use lifecycle::RequestLifecycle;
pub use manager::RequestManager;
pub use notification::{
    DispatchConfig, DispatchOutcome, MailConfig, MailGateway, MockMailGateway,
    NotificationDispatcher, ResendMailGateway,
};
pub use policy::{AttachmentLimits, AttachmentPolicy, AuthorizationPolicy};
pub use storage::{
    InMemoryObjectStore, InMemoryStorage, LocalObjectStore, ObjectStore, ProfileStorage, Storage,
};

#[cfg(feature = "postgres")]
pub use storage::postgres::PostgresStorage;

/// Get the brieflow database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> &'static sqlx::migrate::Migrator {
    &storage::postgres::MIGRATOR
}

//! Status transitions for requests, driven by a lookup table.
//!
//! Every legal move is a row in [`TRANSITIONS`], keyed by `(from, trigger)`. A
//! trigger that has no row for the current status is an
//! [`BrieflowError::InvalidTransition`]; there is no string comparison that could
//! silently fall through.
//!
//! ```text
//! pending_approval ──approve──────────> in_progress
//!        └─────────reject───────────> rejected            (reason)
//!
//! in_progress ─────request_revision──> revision_needed    (notes)
//!      │ ├──────────complete─────────> completed
//!      │ └──────────forward──────────> forwarded          (division ≠ assigned)
//! revision_needed ─request_revision──> revision_needed    (notes, overwrite)
//!      ├──────────complete───────────> completed
//!      └──────────forward────────────> forwarded          (division)
//! forwarded ──────complete───────────> completed
//! ```
//!
//! `completed` and `rejected` are terminal.
//!
//! Planning a transition is pure: [`plan_transition`] validates the trigger and
//! payload against a request snapshot and returns the fully updated request
//! without touching storage. The planned request always carries a later
//! `updated_at` than its snapshot, so `(status, updated_at)` identifies the
//! version a transition was planned from. Persisting it, conditionally on that
//! version still being current, is the lifecycle's job.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::state::{Request, RequestId, RequestStatus};
use crate::domain::division::Division;
use crate::domain::principal::PrincipalId;
use crate::error::{BrieflowError, Result};

/// A caller-requested lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Approve,
    Reject,
    RequestRevision,
    Complete,
    Forward,
}

impl Trigger {
    pub const ALL: [Trigger; 5] = [
        Trigger::Approve,
        Trigger::Reject,
        Trigger::RequestRevision,
        Trigger::Complete,
        Trigger::Forward,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Approve => "approve",
            Trigger::Reject => "reject",
            Trigger::RequestRevision => "request_revision",
            Trigger::Complete => "complete",
            Trigger::Forward => "forward",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Trigger::ALL
            .into_iter()
            .find(|trigger| trigger.as_str() == s)
            .ok_or_else(|| format!("Invalid trigger: {}", s))
    }
}

/// What a transition needs from the caller besides the trigger itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRequirement {
    None,
    RejectionReason,
    RevisionNotes,
    /// A forward target; when `must_differ` it may not equal the assigned division
    ForwardTarget { must_differ: bool },
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: RequestStatus,
    pub trigger: Trigger,
    pub to: RequestStatus,
    pub requires: PayloadRequirement,
}

const fn rule(
    from: RequestStatus,
    trigger: Trigger,
    to: RequestStatus,
    requires: PayloadRequirement,
) -> TransitionRule {
    TransitionRule {
        from,
        trigger,
        to,
        requires,
    }
}

use PayloadRequirement as P;
use RequestStatus as S;

/// The complete set of legal transitions.
pub const TRANSITIONS: &[TransitionRule] = &[
    rule(S::PendingApproval, Trigger::Approve, S::InProgress, P::None),
    rule(S::PendingApproval, Trigger::Reject, S::Rejected, P::RejectionReason),
    rule(S::InProgress, Trigger::RequestRevision, S::RevisionNeeded, P::RevisionNotes),
    rule(S::RevisionNeeded, Trigger::RequestRevision, S::RevisionNeeded, P::RevisionNotes),
    rule(S::InProgress, Trigger::Complete, S::Completed, P::None),
    rule(S::RevisionNeeded, Trigger::Complete, S::Completed, P::None),
    rule(
        S::InProgress,
        Trigger::Forward,
        S::Forwarded,
        P::ForwardTarget { must_differ: true },
    ),
    rule(
        S::RevisionNeeded,
        Trigger::Forward,
        S::Forwarded,
        P::ForwardTarget { must_differ: false },
    ),
    rule(S::Forwarded, Trigger::Complete, S::Completed, P::None),
];

/// Look up the rule for `(from, trigger)`.
pub fn lookup(from: RequestStatus, trigger: Trigger) -> Option<&'static TransitionRule> {
    TRANSITIONS
        .iter()
        .find(|rule| rule.from == from && rule.trigger == trigger)
}

/// Triggers that have a row for `status`, in table order.
pub fn triggers_from(status: RequestStatus) -> impl Iterator<Item = Trigger> {
    TRANSITIONS
        .iter()
        .filter(move |rule| rule.from == status)
        .map(|rule| rule.trigger)
}

/// Caller-supplied data accompanying a trigger.
///
/// Only the field named by the rule's [`PayloadRequirement`] is read; others
/// are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionPayload {
    #[serde(default)]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub revision_notes: Option<String>,
    #[serde(default)]
    pub forward_to: Option<Division>,
}

impl TransitionPayload {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn rejection_reason(reason: impl Into<String>) -> Self {
        Self {
            rejection_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn revision_notes(notes: impl Into<String>) -> Self {
        Self {
            revision_notes: Some(notes.into()),
            ..Self::default()
        }
    }

    pub fn forward_to(division: Division) -> Self {
        Self {
            forward_to: Some(division),
            ..Self::default()
        }
    }
}

fn required_text(value: &Option<String>, trigger: Trigger, field: &'static str) -> Result<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .ok_or(BrieflowError::MissingPayload { trigger, field })
}

/// Validate `trigger` + `payload` against `request` and return the updated request.
///
/// Nothing is mutated on failure. The returned request has its status, the
/// note/reason/forward field for this trigger, and `updated_at` set.
pub fn plan_transition(
    request: &Request,
    trigger: Trigger,
    payload: &TransitionPayload,
    now: DateTime<Utc>,
) -> Result<Request> {
    let rule = lookup(request.status, trigger).ok_or(BrieflowError::InvalidTransition {
        from: request.status,
        trigger,
    })?;

    let mut next = request.clone();
    match rule.requires {
        PayloadRequirement::None => {}
        PayloadRequirement::RejectionReason => {
            next.rejection_reason = Some(required_text(
                &payload.rejection_reason,
                trigger,
                "rejection_reason",
            )?);
        }
        PayloadRequirement::RevisionNotes => {
            next.revision_notes = Some(required_text(
                &payload.revision_notes,
                trigger,
                "revision_notes",
            )?);
        }
        PayloadRequirement::ForwardTarget { must_differ } => {
            let target = payload.forward_to.ok_or(BrieflowError::MissingPayload {
                trigger,
                field: "forward_to",
            })?;
            if must_differ && target == request.assigned_division() {
                return Err(BrieflowError::validation(
                    "forward_to",
                    format!("request is already assigned to {}", target),
                ));
            }
            next.forwarded_to = Some(target);
        }
    }

    next.status = rule.to;
    // Never reuse the snapshot's version, even if the clock has not moved
    next.updated_at = now.max(request.updated_at + Duration::microseconds(1));
    Ok(next)
}

/// Emitted after a status change (or a fresh submission) has been committed.
///
/// Consumed by [`crate::notification::NotificationDispatcher`]; carries enough
/// of the request to render a notification without another read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub request_id: RequestId,
    pub requester: PrincipalId,
    pub project_title: String,
    /// `None` for a newly submitted request
    pub from: Option<RequestStatus>,
    pub to: RequestStatus,
    /// Revision notes or rejection reason, when the target status has one
    pub notes: Option<String>,
    pub forwarded_to: Option<Division>,
    pub occurred_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn submitted(request: &Request) -> Self {
        Self {
            request_id: request.id,
            requester: request.requester,
            project_title: request.project_title.clone(),
            from: None,
            to: request.status,
            notes: None,
            forwarded_to: None,
            occurred_at: request.submission_date,
        }
    }

    pub fn transitioned(from: RequestStatus, request: &Request) -> Self {
        let notes = match request.status {
            RequestStatus::RevisionNeeded => request.revision_notes.clone(),
            RequestStatus::Rejected => request.rejection_reason.clone(),
            _ => None,
        };
        Self {
            request_id: request.id,
            requester: request.requester,
            project_title: request.project_title.clone(),
            from: Some(from),
            to: request.status,
            notes,
            forwarded_to: request.forwarded_to,
            occurred_at: request.updated_at,
        }
    }
}

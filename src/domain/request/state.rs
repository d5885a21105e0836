//! Request aggregate: identity, status and the fields a requester submits.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::division::Division;
use crate::domain::principal::PrincipalId;
use crate::error::{BrieflowError, Result};

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Lifecycle status of a request.
///
/// `completed` and `rejected` are terminal. The string form is what the
/// database `status` column stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    PendingApproval,
    InProgress,
    RevisionNeeded,
    Forwarded,
    Completed,
    Rejected,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 6] = [
        RequestStatus::PendingApproval,
        RequestStatus::InProgress,
        RequestStatus::RevisionNeeded,
        RequestStatus::Forwarded,
        RequestStatus::Completed,
        RequestStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::PendingApproval => "pending_approval",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::RevisionNeeded => "revision_needed",
            RequestStatus::Forwarded => "forwarded",
            RequestStatus::Completed => "completed",
            RequestStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Rejected)
    }

    /// Human-readable label, e.g. "REVISION NEEDED".
    pub fn label(&self) -> String {
        self.as_str().replace('_', " ").to_uppercase()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        RequestStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid request status: {}", s))
    }
}

/// A creative-work request routed to a division.
///
/// Identity, requester, target division, request type and submission date are
/// fixed at creation. `status` and the note fields change only through
/// [`crate::lifecycle::RequestLifecycle::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub requester: PrincipalId,
    pub requester_name: String,
    pub requester_division: String,
    pub contact_whatsapp: Option<String>,
    pub contact_line: Option<String>,
    pub target_division: Division,
    pub request_type: String,
    pub project_title: String,
    pub project_description: String,
    pub reference_links: Vec<String>,
    pub usage_date: NaiveDate,
    pub status: RequestStatus,
    pub rejection_reason: Option<String>,
    pub revision_notes: Option<String>,
    pub forwarded_to: Option<Division>,
    pub submission_date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    /// Build a freshly submitted request in `pending_approval`.
    ///
    /// Callers are expected to have run [`NewRequest::validate`] and the
    /// division policy first.
    pub fn submit(
        requester: PrincipalId,
        target_division: Division,
        input: NewRequest,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RequestId(Uuid::new_v4()),
            requester,
            requester_name: input.requester_name.trim().to_string(),
            requester_division: input.requester_division.trim().to_string(),
            contact_whatsapp: non_blank(input.contact_whatsapp),
            contact_line: non_blank(input.contact_line),
            target_division,
            request_type: input.request_type.trim().to_string(),
            project_title: input.project_title.trim().to_string(),
            project_description: input.project_description.trim().to_string(),
            reference_links: input
                .reference_links
                .into_iter()
                .map(|link| link.trim().to_string())
                .collect(),
            usage_date: input.usage_date,
            status: RequestStatus::PendingApproval,
            rejection_reason: None,
            revision_notes: None,
            forwarded_to: None,
            submission_date: now,
            updated_at: now,
        }
    }

    /// The division currently responsible: `forwarded_to` once forwarded,
    /// otherwise the original target.
    pub fn assigned_division(&self) -> Division {
        self.forwarded_to.unwrap_or(self.target_division)
    }

    /// Whether `division` is the original target or the current forward target.
    pub fn involves_division(&self, division: Division) -> bool {
        self.target_division == division || self.forwarded_to == Some(division)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_TITLE_LEN: usize = 200;
pub const MIN_DESCRIPTION_LEN: usize = 10;
pub const MAX_DESCRIPTION_LEN: usize = 2000;

static WHATSAPP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\d\s\-\+\(\)]+$").expect("static regex"));

/// Fields submitted by a requester when creating a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequest {
    pub requester_name: String,
    pub requester_division: String,
    #[serde(default)]
    pub contact_whatsapp: Option<String>,
    #[serde(default)]
    pub contact_line: Option<String>,
    /// Division code ("CD", "MEDPRO", "MS", "CC")
    pub target_division: String,
    pub request_type: String,
    pub project_title: String,
    pub project_description: String,
    #[serde(default)]
    pub reference_links: Vec<String>,
    pub usage_date: NaiveDate,
}

impl NewRequest {
    /// Check field shapes and lengths. Division/type/lead-time rules are
    /// checked separately by [`crate::domain::division::DivisionPolicy`].
    pub fn validate(&self) -> Result<()> {
        check_len("requester_name", &self.requester_name, 1, MAX_NAME_LEN)?;
        check_len(
            "requester_division",
            &self.requester_division,
            1,
            MAX_NAME_LEN,
        )?;
        if let Some(wa) = self.contact_whatsapp.as_deref().map(str::trim) {
            if !wa.is_empty() && !WHATSAPP_RE.is_match(wa) {
                return Err(BrieflowError::validation(
                    "contact_whatsapp",
                    "invalid WhatsApp number format",
                ));
            }
        }
        check_len("request_type", &self.request_type, 1, MAX_NAME_LEN)?;
        check_len("project_title", &self.project_title, 1, MAX_TITLE_LEN)?;
        check_len(
            "project_description",
            &self.project_description,
            MIN_DESCRIPTION_LEN,
            MAX_DESCRIPTION_LEN,
        )?;
        for link in &self.reference_links {
            match url::Url::parse(link.trim()) {
                Ok(parsed) if parsed.has_host() => {}
                _ => {
                    return Err(BrieflowError::validation(
                        "reference_links",
                        format!("invalid URL: {}", link),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn check_len(field: &'static str, value: &str, min: usize, max: usize) -> Result<()> {
    let len = value.trim().chars().count();
    if len < min {
        let message = if min <= 1 {
            "is required".to_string()
        } else {
            format!("must be at least {} characters", min)
        };
        return Err(BrieflowError::validation(field, message));
    }
    if len > max {
        return Err(BrieflowError::validation(
            field,
            format!("must be at most {} characters", max),
        ));
    }
    Ok(())
}

/// Filter parameters for listing requests.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    /// Only requests submitted by this principal
    pub requester: Option<PrincipalId>,
    /// Only requests targeted at, or forwarded to, one of these divisions
    pub divisions: Option<Vec<Division>>,
    /// Also let this principal's own submissions through the `divisions` check
    pub or_requester: Option<PrincipalId>,
    pub status: Option<RequestStatus>,
    /// Case-insensitive substring match on title, request type or requester name
    pub search: Option<String>,
    pub limit: Option<usize>,
}

impl RequestFilter {
    /// In-process evaluation of the filter, shared by non-SQL backends.
    pub fn matches(&self, request: &Request) -> bool {
        if let Some(requester) = self.requester {
            if request.requester != requester {
                return false;
            }
        }
        if let Some(divisions) = &self.divisions {
            let own = self.or_requester == Some(request.requester);
            if !own && !divisions.iter().any(|d| request.involves_division(*d)) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if request.status != status {
                return false;
            }
        }
        if let Some(search) = self.search.as_deref().map(str::to_lowercase) {
            let hit = [
                &request.project_title,
                &request.request_type,
                &request.requester_name,
            ]
            .iter()
            .any(|field| field.to_lowercase().contains(&search));
            if !hit {
                return false;
            }
        }
        true
    }
}

//! Role-based authorization for lifecycle triggers and attachment removal.
//!
//! Rules are evaluated in order and the first match wins:
//! 1. `admin` may perform every trigger in every state.
//! 2. Staff of the request's target division, or of the division it was
//!    forwarded to, may approve, reject, request revisions, complete and forward.
//! 3. The request's own requester may not change status, but may remove its
//!    attachments while the request is still `pending_approval`.
//! 4. Anyone else may do nothing.
//!
//! Whether a permitted trigger is *valid* for the current status is a separate
//! question answered by the transition table.

use std::collections::BTreeSet;

use crate::domain::principal::Principal;
use crate::domain::request::{Request, RequestStatus, Trigger};

/// Which rule granted access, mostly useful for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Standing {
    Admin,
    DivisionStaff,
    Requester,
    Outsider,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AuthorizationPolicy;

impl AuthorizationPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Classify `principal` relative to `request`, first match wins.
    pub fn standing(&self, principal: &Principal, request: &Request) -> Standing {
        if principal.is_admin() {
            Standing::Admin
        } else if principal
            .staff_divisions()
            .any(|division| request.involves_division(division))
        {
            Standing::DivisionStaff
        } else if principal.id == request.requester {
            Standing::Requester
        } else {
            Standing::Outsider
        }
    }

    /// The set of triggers `principal` may perform on `request`.
    pub fn permitted_triggers(&self, principal: &Principal, request: &Request) -> BTreeSet<Trigger> {
        match self.standing(principal, request) {
            Standing::Admin | Standing::DivisionStaff => Trigger::ALL.into_iter().collect(),
            Standing::Requester | Standing::Outsider => BTreeSet::new(),
        }
    }

    pub fn may_apply(&self, principal: &Principal, request: &Request, trigger: Trigger) -> bool {
        self.permitted_triggers(principal, request).contains(&trigger)
    }

    /// Any authenticated principal holding at least one role may submit.
    pub fn may_create(&self, principal: &Principal) -> bool {
        !principal.roles.is_empty()
    }

    pub fn may_view(&self, principal: &Principal, request: &Request) -> bool {
        self.standing(principal, request) != Standing::Outsider
    }

    /// Attaching files is open to anyone who can see the request.
    pub fn may_attach(&self, principal: &Principal, request: &Request) -> bool {
        self.may_view(principal, request)
    }

    pub fn may_remove_attachment(&self, principal: &Principal, request: &Request) -> bool {
        match self.standing(principal, request) {
            Standing::Admin | Standing::DivisionStaff => true,
            Standing::Requester => request.status == RequestStatus::PendingApproval,
            Standing::Outsider => false,
        }
    }

    pub fn may_delete(&self, principal: &Principal) -> bool {
        principal.is_admin()
    }
}

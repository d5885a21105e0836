//! The request lifecycle engine.
//!
//! [`RequestLifecycle`] is the only place a request's status changes. Every
//! call runs the same pipeline: authorize the principal, validate the trigger
//! and its payload against the transition table, persist with a conditional
//! write, then hand a [`LifecycleEvent`] to the notification side without
//! waiting on it.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use metrics::counter;
use tokio::sync::mpsc;

use crate::domain::division::{Division, DivisionPolicy};
use crate::domain::principal::Principal;
use crate::domain::request::transitions::{plan_transition, triggers_from};
use crate::domain::request::{
    LifecycleEvent, NewRequest, Request, RequestId, TransitionPayload, Trigger,
};
use crate::error::{BrieflowError, Result};
use crate::policy::AuthorizationPolicy;
use crate::storage::Storage;

pub struct RequestLifecycle<S: Storage> {
    storage: Arc<S>,
    divisions: DivisionPolicy,
    authorization: AuthorizationPolicy,
    events: Option<mpsc::UnboundedSender<LifecycleEvent>>,
}

impl<S: Storage> RequestLifecycle<S> {
    /// Create a lifecycle engine with the default division table and no
    /// event sink.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            divisions: DivisionPolicy::default(),
            authorization: AuthorizationPolicy,
            events: None,
        }
    }

    /// Set a custom division table.
    pub fn with_divisions(mut self, divisions: DivisionPolicy) -> Self {
        self.divisions = divisions;
        self
    }

    /// Send a [`LifecycleEvent`] on `events` after every committed change.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn divisions(&self) -> &DivisionPolicy {
        &self.divisions
    }

    pub fn authorization(&self) -> &AuthorizationPolicy {
        &self.authorization
    }

    /// Submit a new request on behalf of `principal`.
    ///
    /// Field validation runs first, then the division policy (division, request
    /// type, lead time). Nothing is stored unless both pass.
    #[tracing::instrument(skip(self, principal, input), fields(principal = %principal.id, target_division = %input.target_division))]
    pub async fn create(&self, principal: &Principal, input: NewRequest) -> Result<Request> {
        if !self.authorization.may_create(principal) {
            return Err(self.rejected(BrieflowError::Forbidden));
        }

        input.validate().map_err(|e| self.rejected(e))?;

        let now = Utc::now().trunc_subsecs(6);
        self.divisions
            .validate_submission(&input.target_division, &input.request_type, input.usage_date, now)
            .map_err(|e| self.rejected(e.into()))?;

        let target_division = input
            .target_division
            .parse::<Division>()
            .map_err(|e| self.rejected(BrieflowError::from(e)))?;

        let request = Request::submit(principal.id, target_division, input, now);
        self.storage.insert_request(&request).await?;

        counter!(
            "brieflow_transitions_total",
            "from" => "none",
            "to" => request.status.as_str(),
            "trigger" => "submit"
        )
        .increment(1);
        tracing::info!(
            request_id = %request.id,
            target_division = %request.target_division,
            request_type = %request.request_type,
            "Request submitted"
        );

        self.emit(LifecycleEvent::submitted(&request));
        Ok(request)
    }

    /// Apply `trigger` to request `id` on behalf of `principal`.
    ///
    /// Returns the request as persisted. On any error the stored request is
    /// unchanged. If another writer committed between our read and our write,
    /// even one that kept the status, the call fails with `InvalidTransition`
    /// naming the status that won.
    #[tracing::instrument(skip(self, principal, payload), fields(request_id = %id, principal = %principal.id, trigger = %trigger))]
    pub async fn apply(
        &self,
        id: RequestId,
        principal: &Principal,
        trigger: Trigger,
        payload: TransitionPayload,
    ) -> Result<Request> {
        let current = self.storage.get_request(id).await?;

        if !self.authorization.may_apply(principal, &current, trigger) {
            tracing::debug!(status = %current.status, "Principal not permitted to apply trigger");
            return Err(self.rejected(BrieflowError::Forbidden));
        }

        // Timestamps double as row versions; keep them at storage precision
        let now = Utc::now().trunc_subsecs(6);
        let next = plan_transition(&current, trigger, &payload, now)
            .map_err(|e| self.rejected(e))?;

        let committed = self.storage.transition_request(&next, &current).await?;
        if !committed {
            let latest = self.storage.get_request(id).await?;
            tracing::info!(
                expected = %current.status,
                actual = %latest.status,
                "Lost transition race"
            );
            return Err(self.rejected(BrieflowError::InvalidTransition {
                from: latest.status,
                trigger,
            }));
        }

        counter!(
            "brieflow_transitions_total",
            "from" => current.status.as_str(),
            "to" => next.status.as_str(),
            "trigger" => trigger.as_str()
        )
        .increment(1);
        tracing::info!(from = %current.status, to = %next.status, "Request transitioned");

        self.emit(LifecycleEvent::transitioned(current.status, &next));
        Ok(next)
    }

    /// Triggers `principal` could apply to `request` right now.
    pub fn available_triggers(&self, principal: &Principal, request: &Request) -> BTreeSet<Trigger> {
        let permitted = self.authorization.permitted_triggers(principal, request);
        triggers_from(request.status)
            .filter(|trigger| permitted.contains(trigger))
            .collect()
    }

    fn emit(&self, event: LifecycleEvent) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(e) = events.send(event) {
            // Notifications are best-effort; the transition is already committed.
            tracing::warn!(request_id = %e.0.request_id, "Notification channel closed, event dropped");
        }
    }

    fn rejected(&self, error: BrieflowError) -> BrieflowError {
        counter!("brieflow_transitions_rejected_total", "reason" => error.kind()).increment(1);
        error
    }
}

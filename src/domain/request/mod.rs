//! Request aggregate - domain model and state transitions.
//!
//! This module contains the core domain logic for requests:
//! - Request types and the closed status enumeration
//! - The transition table and pure transition planning
//! - Lifecycle events handed to the notification dispatcher

pub mod state;
pub mod transitions;

// Re-export commonly used types
pub use state::*;
pub use transitions::{
    LifecycleEvent, PayloadRequirement, TRANSITIONS, TransitionPayload, TransitionRule, Trigger,
};

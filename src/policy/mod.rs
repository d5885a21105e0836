//! Policies consulted by the lifecycle and the command surface.
//!
//! - [`authorization`]: which principal may do what to a request
//! - [`attachment`]: which files may be attached, and how they are recompressed
//!
//! The division/lead-time policy lives with its table in
//! [`crate::domain::division`].

pub mod attachment;
pub mod authorization;

pub use attachment::{AttachmentLimits, AttachmentPolicy};
pub use authorization::{AuthorizationPolicy, Standing};

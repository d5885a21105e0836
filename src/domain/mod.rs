//! Core domain types for the request lifecycle engine.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Divisions and the submission policy table
//! - Principals, roles and profiles
//! - The request aggregate and its transition table
//! - Attachment records

pub mod division;
pub mod file;
pub mod principal;
pub mod request;

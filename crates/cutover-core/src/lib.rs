//! Cutover Core - domain model and capability ports
//!
//! This crate holds everything the rest of the service agrees on:
//! - Domain entities: user profiles, classifications, backup and sync
//!   operations, migration state, quota, escalations
//! - The service-wide error taxonomy with stable error codes
//! - Typed configuration mapped from the YAML config file
//! - Capability ports (traits) for the OS- and provider-specific
//!   collaborators the core never touches directly

pub mod config;
pub mod domain;
pub mod errors;
pub mod machine;
pub mod ports;

pub use errors::ServiceError;

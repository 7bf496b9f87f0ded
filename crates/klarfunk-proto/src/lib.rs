//! Shared types for the klarfunk appliance: configuration, the domain model
//! and the status snapshot.

pub mod config;
pub mod model;
pub mod platform;
pub mod status;

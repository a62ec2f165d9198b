//! Common types module for the order cache service.
//!
//! This module defines the data shapes shared by every component of the
//! service: the order record model, the event validator, the lookup API
//! documents and the configuration schema framework used by pluggable
//! implementations.

/// Lookup request and response documents.
pub mod api;
/// Order record model decoded from stream events.
pub mod model;
/// Registry trait for self-registering implementations.
pub mod registry;
/// Configuration schema types for validating implementation tables.
pub mod schema;
/// Stream subscription types shared by configuration and transports.
pub mod stream;
/// Utility functions for log formatting.
pub mod utils;
/// Structural validation of raw order events.
pub mod validation;

// Re-export all types for convenient access
pub use api::*;
pub use model::*;
pub use registry::ImplementationRegistry;
pub use schema::*;
pub use stream::DeliverPolicy;
pub use utils::truncate_id;
pub use validation::{validate, ValidationError};

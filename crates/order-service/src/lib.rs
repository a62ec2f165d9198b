//! Service layer for the order cache: the implementation registry, the
//! HTTP lookup API, and the two binaries built on them.

pub mod factory_registry;
pub mod server;

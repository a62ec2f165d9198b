//! Core engine for the order cache service.
//!
//! This module ties the pieces together: the in-memory cache, the
//! per-message handler that commits validated events to the store and the
//! cache, the drain tracker used for orderly shutdown, and the engine that
//! hydrates, subscribes, dispatches and shuts down. Engines are assembled
//! from configuration through [`OrderEngineBuilder`].

pub mod builder;
pub mod cache;
pub mod drain;
pub mod engine;
pub mod handlers;
pub mod lookup;

pub use builder::{BuilderError, OrderEngineBuilder, OrderFactories};
pub use cache::CacheStore;
pub use drain::{DrainGuard, DrainTracker};
pub use engine::{shutdown_signal, EngineError, LifecycleState, OrderEngine};
pub use handlers::{EventHandler, EventOutcome, HandlerError};
pub use lookup::LookupService;

//! Handlers for processing delivered stream messages.

pub mod event;

pub use event::{EventHandler, EventOutcome, HandlerError};

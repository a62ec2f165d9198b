//! Structural validation of raw order events.

use crate::OrderRecord;
use thiserror::Error;

/// Reasons an event payload is rejected.
#[derive(Debug, Error)]
pub enum ValidationError {
	/// The payload is not a JSON encoding of an order record.
	#[error("Malformed order payload: {0}")]
	Malformed(String),
	/// The payload decoded but carries no order identifier.
	#[error("Order payload has an empty order_uid")]
	MissingIdentifier,
}

/// Decodes raw event bytes into an [`OrderRecord`].
///
/// Only the shape and the presence of `order_uid` are checked; no business
/// rules are applied. The function has no side effects.
pub fn validate(raw: &[u8]) -> Result<OrderRecord, ValidationError> {
	let record: OrderRecord =
		serde_json::from_slice(raw).map_err(|e| ValidationError::Malformed(e.to_string()))?;

	if record.order_uid.is_empty() {
		return Err(ValidationError::MissingIdentifier);
	}

	Ok(record)
}

//! API types for the order lookup endpoint.
//!
//! The lookup contract is a single request document naming an order
//! identifier, answered by either the full order record or an empty object
//! when the identifier is unknown.

use crate::OrderRecord;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Body of a lookup request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRequest {
	pub order_uid: String,
}

/// Outcome of a cache lookup.
///
/// Serializes as the record itself, or as `{}` for an unknown identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResponse {
	Found(OrderRecord),
	NotFound,
}

impl LookupResponse {
	pub fn is_found(&self) -> bool {
		matches!(self, LookupResponse::Found(_))
	}

	pub fn into_record(self) -> Option<OrderRecord> {
		match self {
			LookupResponse::Found(record) => Some(record),
			LookupResponse::NotFound => None,
		}
	}
}

impl From<Option<OrderRecord>> for LookupResponse {
	fn from(record: Option<OrderRecord>) -> Self {
		record.map_or(LookupResponse::NotFound, LookupResponse::Found)
	}
}

impl Serialize for LookupResponse {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		match self {
			LookupResponse::Found(record) => record.serialize(serializer),
			LookupResponse::NotFound => serde_json::Map::new().serialize(serializer),
		}
	}
}

impl<'de> Deserialize<'de> for LookupResponse {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let record = OrderRecord::deserialize(deserializer)?;
		if record.order_uid.is_empty() {
			Ok(LookupResponse::NotFound)
		} else {
			Ok(LookupResponse::Found(record))
		}
	}
}

/// Error body returned for rejected requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
	/// Machine readable error code.
	pub error: String,
	pub message: String,
}

//! Stream subscription types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a subscription starts when its durable identity has no saved
/// position yet.
///
/// A durable identity that already has a cursor always resumes from it, so
/// the policy only matters on the first subscription under a given name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliverPolicy {
	/// Replay every event still held by the channel.
	#[default]
	All,
	/// Skip history and deliver only events appended after subscribing.
	New,
}

impl fmt::Display for DeliverPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DeliverPolicy::All => write!(f, "all"),
			DeliverPolicy::New => write!(f, "new"),
		}
	}
}

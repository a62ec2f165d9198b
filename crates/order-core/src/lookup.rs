//! Read-only point lookups against the cache.

use crate::cache::CacheStore;
use order_types::{truncate_id, LookupResponse};
use std::sync::Arc;

/// Serves lookups by order identifier.
///
/// Only the cache is consulted. A lookup never waits on the stream or the
/// store, and an unknown identifier is a normal `NotFound`.
#[derive(Clone)]
pub struct LookupService {
	cache: Arc<CacheStore>,
}

impl LookupService {
	pub fn new(cache: Arc<CacheStore>) -> Self {
		Self { cache }
	}

	pub async fn lookup(&self, id: &str) -> LookupResponse {
		match self.cache.get(id).await {
			Some(record) => LookupResponse::Found(record.as_ref().clone()),
			None => {
				tracing::debug!(order_uid = %truncate_id(id), "Lookup miss");
				LookupResponse::NotFound
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use order_types::OrderRecord;

	#[tokio::test]
	async fn test_lookup_found_and_missing() {
		let cache = Arc::new(CacheStore::new());
		cache
			.set(
				"T1".into(),
				OrderRecord {
					order_uid: "T1".into(),
					..Default::default()
				},
			)
			.await;

		let service = LookupService::new(cache);
		match service.lookup("T1").await {
			LookupResponse::Found(record) => assert_eq!(record.order_uid, "T1"),
			LookupResponse::NotFound => panic!("expected T1 to be cached"),
		}
		assert!(!service.lookup("nope").await.is_found());
	}
}

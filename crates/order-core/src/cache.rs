//! In-memory order cache.
//!
//! One map from order identifier to record, guarded by a read-write lock for
//! readers and writers alike. Records are stored behind `Arc` so a lookup
//! only holds the read guard long enough to clone a pointer.

use order_types::OrderRecord;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct CacheStore {
	entries: RwLock<HashMap<String, Arc<OrderRecord>>>,
}

impl CacheStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn get(&self, id: &str) -> Option<Arc<OrderRecord>> {
		self.entries.read().await.get(id).cloned()
	}

	/// Inserts or replaces the record for `id` and returns the previous one.
	pub async fn set(&self, id: String, record: OrderRecord) -> Option<Arc<OrderRecord>> {
		self.entries.write().await.insert(id, Arc::new(record))
	}

	/// Replaces the whole content with `records`. Returns the entry count.
	pub async fn load_all(&self, records: HashMap<String, OrderRecord>) -> usize {
		let loaded: HashMap<_, _> = records
			.into_iter()
			.map(|(id, record)| (id, Arc::new(record)))
			.collect();
		let mut entries = self.entries.write().await;
		*entries = loaded;
		entries.len()
	}

	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.entries.read().await.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(id: &str, track: &str) -> OrderRecord {
		OrderRecord {
			order_uid: id.to_string(),
			track_number: track.to_string(),
			..Default::default()
		}
	}

	#[tokio::test]
	async fn test_set_returns_previous() {
		let cache = CacheStore::new();
		assert!(cache.set("T1".into(), record("T1", "A")).await.is_none());

		let previous = cache.set("T1".into(), record("T1", "B")).await.unwrap();
		assert_eq!(previous.track_number, "A");
		assert_eq!(cache.get("T1").await.unwrap().track_number, "B");
		assert_eq!(cache.len().await, 1);
	}

	#[tokio::test]
	async fn test_load_all_replaces_content() {
		let cache = CacheStore::new();
		cache.set("stale".into(), record("stale", "X")).await;

		let records = HashMap::from([
			("T1".to_string(), record("T1", "A")),
			("T2".to_string(), record("T2", "B")),
		]);
		assert_eq!(cache.load_all(records).await, 2);
		assert!(cache.get("stale").await.is_none());
		assert_eq!(cache.get("T2").await.unwrap().track_number, "B");
	}

	#[tokio::test]
	async fn test_concurrent_readers_and_writers() {
		let cache = Arc::new(CacheStore::new());
		let mut handles = Vec::new();
		for i in 0..32 {
			let cache = cache.clone();
			handles.push(tokio::spawn(async move {
				let id = format!("order-{}", i % 8);
				cache.set(id.clone(), record(&id, &i.to_string())).await;
				assert!(cache.get(&id).await.is_some());
			}));
		}
		for handle in handles {
			handle.await.unwrap();
		}
		assert_eq!(cache.len().await, 8);
	}
}

//! End-to-end tests of the ingestion pipeline: stream → validate → store +
//! cache → ack, hydration at startup and the shutdown sequence.

mod common;

use common::{
	engine, eventually, order_json, start, ControlledStorage, CHANNEL, TABLE,
};
use futures::future::join_all;
use order_config::ConfigBuilder;
use order_core::{EngineError, LifecycleState};
use order_storage::implementations::memory::MemoryStorage;
use order_storage::StorageInterface;
use order_stream::implementations::memory::MemoryStream;
use order_stream::{StreamInterface, StreamService};
use order_types::LookupResponse;
use std::sync::atomic::Ordering;
use std::time::Duration;

const DURABLE: &str = "test-durable";

fn publisher(stream: &MemoryStream) -> StreamService {
	StreamService::new(Box::new(stream.connect()))
}

#[tokio::test]
async fn test_valid_event_round_trips_and_empty_identifier_is_discarded() {
	let tables = MemoryStorage::new();
	let stream = MemoryStream::new();
	let running = start(engine(
		ConfigBuilder::new().build(),
		Box::new(tables.connect()),
		&stream,
	))
	.await;
	let publisher = publisher(&stream);

	publisher
		.publish(CHANNEL, order_json("T1", "TRK-1"))
		.await
		.unwrap();
	publisher
		.publish(CHANNEL, order_json("", "TRK-2"))
		.await
		.unwrap();

	let lookup = running.engine.lookup_service();
	eventually(|| async { lookup.lookup("T1").await.is_found() }).await;
	// Both messages are acknowledged, the invalid one without side effects
	eventually(|| async {
		stream
			.load_cursor(CHANNEL, DURABLE)
			.await
			.unwrap()
			.is_some_and(|cursor| cursor.ack_floor == 2)
	})
	.await;

	match lookup.lookup("T1").await {
		LookupResponse::Found(record) => {
			assert_eq!(record.track_number, "TRK-1");
			assert_eq!(record.payment.amount, 1817);
		},
		LookupResponse::NotFound => panic!("T1 missing"),
	}
	assert!(!lookup.lookup("T2").await.is_found());
	assert!(!lookup.lookup("").await.is_found());
	assert_eq!(tables.count(TABLE).await.unwrap(), 1);

	running.stop().await.unwrap();
}

#[tokio::test]
async fn test_republish_replaces_single_entry() {
	let tables = MemoryStorage::new();
	let stream = MemoryStream::new();
	let running = start(engine(
		ConfigBuilder::new().build(),
		Box::new(tables.connect()),
		&stream,
	))
	.await;
	let publisher = publisher(&stream);
	let lookup = running.engine.lookup_service();

	publisher
		.publish(CHANNEL, order_json("T1", "FIRST"))
		.await
		.unwrap();
	eventually(|| async { lookup.lookup("T1").await.is_found() }).await;

	publisher
		.publish(CHANNEL, order_json("T1", "SECOND"))
		.await
		.unwrap();
	eventually(|| async {
		lookup
			.lookup("T1")
			.await
			.into_record()
			.is_some_and(|record| record.track_number == "SECOND")
	})
	.await;

	assert_eq!(running.engine.cache().len().await, 1);
	assert_eq!(tables.count(TABLE).await.unwrap(), 1);
	let stored = tables.get_bytes(TABLE, "T1").await.unwrap();
	assert_eq!(stored, order_json("T1", "SECOND"));

	running.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_event_touches_nothing() {
	let tables = MemoryStorage::new();
	let stream = MemoryStream::new();
	let running = start(engine(
		ConfigBuilder::new().build(),
		Box::new(tables.connect()),
		&stream,
	))
	.await;
	let publisher = publisher(&stream);

	publisher
		.publish(CHANNEL, b"{not json".to_vec())
		.await
		.unwrap();
	publisher
		.publish(CHANNEL, br#"{"order_uid": 42}"#.to_vec())
		.await
		.unwrap();
	publisher
		.publish(CHANNEL, order_json("T3", "TRK-3"))
		.await
		.unwrap();

	let lookup = running.engine.lookup_service();
	eventually(|| async { lookup.lookup("T3").await.is_found() }).await;
	eventually(|| async {
		stream
			.load_cursor(CHANNEL, DURABLE)
			.await
			.unwrap()
			.is_some_and(|cursor| cursor.ack_floor == 3)
	})
	.await;

	assert_eq!(running.engine.cache().len().await, 1);
	assert_eq!(tables.count(TABLE).await.unwrap(), 1);

	running.stop().await.unwrap();
}

#[tokio::test]
async fn test_hydration_loads_every_stored_order() {
	let tables = MemoryStorage::new();
	for i in 0..25 {
		let id = format!("order-{}", i);
		tables
			.upsert(TABLE, order_json(&id, "HYDRATED"), &id)
			.await
			.unwrap();
	}

	let stream = MemoryStream::new();
	let engine = engine(
		ConfigBuilder::new().build(),
		Box::new(tables.connect()),
		&stream,
	);
	assert_eq!(engine.hydrate().await.unwrap(), 25);

	let lookup = engine.lookup_service();
	for i in 0..25 {
		assert!(lookup.lookup(&format!("order-{}", i)).await.is_found());
	}

	// A second hydration is a no-op and run_until keeps the loaded cache
	let running = start(engine).await;
	assert_eq!(running.engine.cache().len().await, 25);
	running.stop().await.unwrap();
}

#[tokio::test]
async fn test_hydration_failure_is_fatal() {
	let tables = MemoryStorage::new();
	tables
		.upsert(TABLE, b"corrupt row".to_vec(), "broken")
		.await
		.unwrap();

	let stream = MemoryStream::new();
	let engine = engine(
		ConfigBuilder::new().build(),
		Box::new(tables.connect()),
		&stream,
	);

	let result = engine.run_until(std::future::pending()).await;
	assert!(matches!(result, Err(EngineError::Startup(_))));
	assert_eq!(engine.state(), LifecycleState::Closed);
	assert!(engine.storage().is_closed());
	assert!(!engine.stream().is_subscribed());
}

#[tokio::test]
async fn test_persistence_failure_keeps_previous_value_and_redelivers() {
	let tables = MemoryStorage::new();
	tables
		.upsert(TABLE, order_json("T1", "COMMITTED"), "T1")
		.await
		.unwrap();
	let stream = MemoryStream::new();

	let failing = ControlledStorage::new(tables.connect()).failing();
	let probe = failing.probe.clone();
	let running = start(engine(
		ConfigBuilder::new().build(),
		Box::new(failing),
		&stream,
	))
	.await;

	publisher(&stream)
		.publish(CHANNEL, order_json("T1", "REJECTED"))
		.await
		.unwrap();
	eventually(|| async { probe.upsert_attempts.load(Ordering::SeqCst) >= 1 }).await;
	running.engine.drain().await_zero().await;

	let lookup = running.engine.lookup_service();
	let record = lookup.lookup("T1").await.into_record().unwrap();
	assert_eq!(record.track_number, "COMMITTED");
	let cursor = stream.load_cursor(CHANNEL, DURABLE).await.unwrap().unwrap();
	assert!(!cursor.is_acked(1));
	running.stop().await.unwrap();

	// Same durable identity against a healthy store picks the message up again
	let running = start(engine(
		ConfigBuilder::new().build(),
		Box::new(tables.connect()),
		&stream,
	))
	.await;
	let lookup = running.engine.lookup_service();
	eventually(|| async {
		lookup
			.lookup("T1")
			.await
			.into_record()
			.is_some_and(|record| record.track_number == "REJECTED")
	})
	.await;
	assert_eq!(
		tables.get_bytes(TABLE, "T1").await.unwrap(),
		order_json("T1", "REJECTED")
	);
	running.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_write_is_retried_without_restart() {
	let tables = MemoryStorage::new();
	let stream = MemoryStream::new();
	let flaky = ControlledStorage::new(tables.connect()).failing_times(1);
	let probe = flaky.probe.clone();
	let running = start(engine(
		ConfigBuilder::new().build(),
		Box::new(flaky),
		&stream,
	))
	.await;
	let publisher = publisher(&stream);

	publisher
		.publish(CHANNEL, order_json("T1", "RETRIED"))
		.await
		.unwrap();
	publisher
		.publish(CHANNEL, order_json("T2", "DIRECT"))
		.await
		.unwrap();

	let lookup = running.engine.lookup_service();
	eventually(|| async { lookup.lookup("T1").await.is_found() }).await;
	eventually(|| async {
		stream
			.load_cursor(CHANNEL, DURABLE)
			.await
			.unwrap()
			.is_some_and(|cursor| cursor.ack_floor == 2 && cursor.acked.is_empty())
	})
	.await;

	assert_eq!(probe.upsert_attempts.load(Ordering::SeqCst), 3);
	assert_eq!(tables.count(TABLE).await.unwrap(), 2);
	assert!(running.engine.stream().is_subscribed());

	running.stop().await.unwrap();
}

#[tokio::test]
async fn test_in_flight_work_is_bounded() {
	const MAX_IN_FLIGHT: usize = 4;
	let tables = MemoryStorage::new();
	let stream = MemoryStream::new();
	let slow = ControlledStorage::new(tables.connect()).with_delay(Duration::from_millis(20));
	let probe = slow.probe.clone();
	let config = ConfigBuilder::new()
		.max_in_flight(MAX_IN_FLIGHT)
		.delivery_buffer(2)
		.build();
	let running = start(engine(config, Box::new(slow), &stream)).await;

	let publisher = publisher(&stream);
	for i in 0..40 {
		let id = format!("bounded-{}", i);
		publisher
			.publish(CHANNEL, order_json(&id, "BOUNDED"))
			.await
			.unwrap();
	}

	// Sampling can miss the true peak but never overshoot it
	let engine = running.engine.clone();
	let mut peak_dispatched = 0;
	let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
	while engine.cache().len().await < 40 {
		assert!(tokio::time::Instant::now() < deadline, "orders not processed in time");
		peak_dispatched = peak_dispatched.max(engine.drain().in_flight());
		tokio::time::sleep(Duration::from_millis(2)).await;
	}

	// One extra unit belongs to the message the dispatch loop holds while
	// it waits for a permit
	assert!(peak_dispatched <= MAX_IN_FLIGHT + 1, "peak {}", peak_dispatched);
	assert!(peak_dispatched >= MAX_IN_FLIGHT, "peak {}", peak_dispatched);
	assert_eq!(probe.peak_upserts_in_flight.load(Ordering::SeqCst), 1);
	assert_eq!(tables.count(TABLE).await.unwrap(), 40);

	running.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_writes() {
	let tables = MemoryStorage::new();
	let stream = MemoryStream::new();
	let slow = ControlledStorage::new(tables.connect()).with_delay(Duration::from_millis(300));
	let probe = slow.probe.clone();

	let running = start(engine(
		ConfigBuilder::new().build(),
		Box::new(slow),
		&stream,
	))
	.await;
	let publisher = publisher(&stream);
	for i in 0..5 {
		let id = format!("slow-{}", i);
		publisher
			.publish(CHANNEL, order_json(&id, "SLOW"))
			.await
			.unwrap();
	}

	let engine = running.engine.clone();
	eventually(|| async { engine.drain().in_flight() == 5 }).await;
	running.stop().await.unwrap();

	assert_eq!(engine.state(), LifecycleState::Closed);
	assert!(probe.closed.load(Ordering::SeqCst));
	assert!(!probe.closed_during_upsert.load(Ordering::SeqCst));
	assert_eq!(engine.drain().in_flight(), 0);
	assert_eq!(tables.count(TABLE).await.unwrap(), 5);
	assert_eq!(engine.cache().len().await, 5);

	let cursor = stream.load_cursor(CHANNEL, DURABLE).await.unwrap().unwrap();
	assert_eq!(cursor.ack_floor, 5);
}

#[tokio::test]
async fn test_queued_messages_return_after_restart() {
	let tables = MemoryStorage::new();
	let stream = MemoryStream::new();
	let slow = ControlledStorage::new(tables.connect()).with_delay(Duration::from_millis(300));
	let config = ConfigBuilder::new()
		.max_in_flight(1)
		.delivery_buffer(4)
		.build();
	let running = start(engine(config, Box::new(slow), &stream)).await;

	let publisher = publisher(&stream);
	for i in 0..6 {
		let id = format!("queued-{}", i);
		publisher
			.publish(CHANNEL, order_json(&id, "QUEUED"))
			.await
			.unwrap();
	}

	let first = running.engine.clone();
	eventually(|| async { first.drain().in_flight() >= 1 }).await;
	running.stop().await.unwrap();

	// Only dispatched work was drained, the rest stayed pending
	let committed = tables.count(TABLE).await.unwrap();
	assert!(committed < 6, "{} committed", committed);
	let cursor = stream.load_cursor(CHANNEL, DURABLE).await.unwrap().unwrap();
	assert_eq!(cursor.ack_floor as usize, committed);

	let running = start(engine(
		ConfigBuilder::new().build(),
		Box::new(tables.connect()),
		&stream,
	))
	.await;
	let second = running.engine.clone();
	eventually(|| async { second.cache().len().await == 6 }).await;
	assert_eq!(tables.count(TABLE).await.unwrap(), 6);
	running.stop().await.unwrap();
}

#[tokio::test]
async fn test_drain_timeout_does_not_block_shutdown() {
	let tables = MemoryStorage::new();
	let stream = MemoryStream::new();
	let stuck = ControlledStorage::new(tables.connect()).with_delay(Duration::from_secs(30));

	let config = ConfigBuilder::new().drain_timeout_seconds(Some(1)).build();
	let running = start(engine(config, Box::new(stuck), &stream)).await;
	publisher(&stream)
		.publish(CHANNEL, order_json("T1", "STUCK"))
		.await
		.unwrap();

	let engine = running.engine.clone();
	eventually(|| async { engine.drain().in_flight() == 1 }).await;
	running.stop().await.unwrap();

	assert_eq!(engine.state(), LifecycleState::Closed);
	assert!(engine.storage().is_closed());
}

#[tokio::test]
async fn test_concurrent_distinct_keys() {
	let tables = MemoryStorage::new();
	let stream = MemoryStream::new();
	let config = ConfigBuilder::new().max_in_flight(8).delivery_buffer(4).build();
	let running = start(engine(config, Box::new(tables.connect()), &stream)).await;

	let publisher = publisher(&stream);
	let publishes = (0..50).map(|i| {
		let publisher = &publisher;
		async move {
			let id = format!("order-{}", i);
			publisher
				.publish(CHANNEL, order_json(&id, &format!("TRK-{}", i)))
				.await
				.unwrap();
		}
	});
	join_all(publishes).await;

	let engine = running.engine.clone();
	eventually(|| async { engine.cache().len().await == 50 }).await;

	let lookup = engine.lookup_service();
	for i in 0..50 {
		let record = lookup
			.lookup(&format!("order-{}", i))
			.await
			.into_record()
			.unwrap();
		assert_eq!(record.track_number, format!("TRK-{}", i));
	}
	assert_eq!(tables.count(TABLE).await.unwrap(), 50);

	running.stop().await.unwrap();
}

#[tokio::test]
async fn test_deliver_policy_new_skips_history() {
	let tables = MemoryStorage::new();
	let stream = MemoryStream::new();
	let publisher = publisher(&stream);
	publisher
		.publish(CHANNEL, order_json("OLD", "HISTORY"))
		.await
		.unwrap();

	let config = ConfigBuilder::new()
		.deliver_policy(order_config::DeliverPolicy::New)
		.durable_name("latest-only")
		.build();
	let running = start(engine(config, Box::new(tables.connect()), &stream)).await;
	publisher
		.publish(CHANNEL, order_json("NEW", "LIVE"))
		.await
		.unwrap();

	let lookup = running.engine.lookup_service();
	eventually(|| async { lookup.lookup("NEW").await.is_found() }).await;
	assert!(!lookup.lookup("OLD").await.is_found());

	running.stop().await.unwrap();
}

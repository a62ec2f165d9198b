//! Order record model.
//!
//! These types mirror the JSON documents published on the order stream. Field
//! names follow the producer's snake_case keys. Every field except
//! `order_uid` falls back to its zero value when absent, so decoding stays
//! structural; identifier presence is enforced by [`crate::validate`].

use serde::{Deserialize, Serialize};

/// A complete order as carried by one stream event.
///
/// Records are never mutated after decoding. A newer event for the same
/// `order_uid` produces a new value that replaces the old one wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderRecord {
	/// Unique order identifier, the cache and storage key.
	pub order_uid: String,
	pub track_number: String,
	pub entry: String,
	pub delivery: Delivery,
	pub payment: Payment,
	/// Line items in the order they were published.
	pub items: Vec<Item>,
	pub locale: String,
	pub internal_signature: String,
	pub customer_id: String,
	pub delivery_service: String,
	pub shardkey: String,
	pub sm_id: i64,
	/// Creation time exactly as the producer wrote it. Not parsed.
	pub date_created: String,
	pub oof_shard: String,
}

/// Recipient block of an order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delivery {
	pub name: String,
	pub phone: String,
	pub zip: String,
	pub city: String,
	pub address: String,
	pub region: String,
	pub email: String,
}

/// Payment block of an order. Amounts are in minor currency units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Payment {
	pub transaction: String,
	pub request_id: String,
	pub currency: String,
	pub provider: String,
	pub amount: i64,
	/// Unix seconds.
	pub payment_dt: i64,
	pub bank: String,
	pub delivery_cost: i64,
	pub goods_total: i64,
	pub custom_fee: i64,
}

/// One line item of an order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Item {
	pub chrt_id: i64,
	pub track_number: String,
	pub price: i64,
	pub rid: String,
	pub name: String,
	/// Discount percentage.
	pub sale: i64,
	pub size: String,
	pub total_price: i64,
	pub nm_id: i64,
	pub brand: String,
	pub status: i64,
}

//! File-backed stream transport.
//!
//! Each channel is a directory under `stream_path` (hex-encoded name) that
//! holds an append-only `log.jsonl` plus one cursor file per durable name.
//! Log lines carry the sequence number and the hex-encoded payload. Appends
//! take an exclusive lock on the log, so separate processes can publish to
//! the same channel. Readers poll for new entries.
//!
//! Readers keep an index of the byte offset of every complete line. A poll
//! only reads what was appended since the previous one, and a read seeks
//! straight to the first requested entry.

use crate::{
	DurableCursor, StoredMessage, StreamError, StreamFactory, StreamInterface, StreamRegistry,
};
use async_trait::async_trait;
use fs2::FileExt;
use order_types::{ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, SchemaError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

const LOG_FILE: &str = "log.jsonl";
const CURSOR_DIR: &str = "durables";
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Chunk size used when scanning the log backwards for its last entry.
const TAIL_CHUNK: u64 = 8 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
	sequence: u64,
	/// Hex-encoded payload bytes.
	payload: String,
}

#[derive(Deserialize)]
struct LogPosition {
	sequence: u64,
}

fn backend_error(e: impl std::fmt::Display) -> StreamError {
	StreamError::Backend(e.to_string())
}

fn corrupt(e: impl std::fmt::Display) -> StreamError {
	StreamError::Serialization(format!("Corrupt log entry: {}", e))
}

/// Parses the complete lines of a log. A trailing line without a newline
/// is an append still in progress and is ignored.
fn parse_log(content: &str) -> Result<Vec<LogEntry>, StreamError> {
	let complete = match content.rfind('\n') {
		Some(end) => &content[..end],
		None => return Ok(Vec::new()),
	};

	complete
		.lines()
		.filter(|line| !line.trim().is_empty())
		.map(|line| serde_json::from_str(line).map_err(corrupt))
		.collect()
}

/// Finds the last complete entry of an open log without reading all of it.
///
/// Returns its sequence (0 for an empty log) and the length of the log up
/// to and including its newline.
fn last_complete_entry(file: &mut std::fs::File) -> Result<(u64, u64), StreamError> {
	let len = file.metadata().map_err(backend_error)?.len();
	let mut start = len;
	let mut tail: Vec<u8> = Vec::new();

	loop {
		let chunk_start = start.saturating_sub(TAIL_CHUNK);
		let mut chunk = vec![0; (start - chunk_start) as usize];
		file.seek(SeekFrom::Start(chunk_start)).map_err(backend_error)?;
		file.read_exact(&mut chunk).map_err(backend_error)?;
		chunk.extend_from_slice(&tail);
		tail = chunk;
		start = chunk_start;

		let Some(end) = tail.iter().rposition(|b| *b == b'\n') else {
			if start == 0 {
				return Ok((0, 0));
			}
			continue;
		};
		let line_start = match tail[..end].iter().rposition(|b| *b == b'\n') {
			Some(newline) => newline + 1,
			None if start == 0 => 0,
			None => continue,
		};

		let entry: LogPosition = serde_json::from_slice(&tail[line_start..end]).map_err(corrupt)?;
		return Ok((entry.sequence, start + end as u64 + 1));
	}
}

/// Appends one entry while holding an exclusive lock on the log.
fn append_locked(path: &Path, payload: &[u8]) -> Result<u64, StreamError> {
	let mut file = std::fs::OpenOptions::new()
		.create(true)
		.read(true)
		.append(true)
		.open(path)
		.map_err(backend_error)?;
	file.lock_exclusive().map_err(backend_error)?;

	let result = (|| -> Result<u64, StreamError> {
		let (last, complete_len) = last_complete_entry(&mut file)?;
		// A writer that died mid-append leaves a partial line behind
		if file.metadata().map_err(backend_error)?.len() > complete_len {
			file.set_len(complete_len).map_err(backend_error)?;
		}

		let entry = LogEntry {
			sequence: last + 1,
			payload: hex::encode(payload),
		};
		let mut line = serde_json::to_vec(&entry)
			.map_err(|e| StreamError::Serialization(e.to_string()))?;
		line.push(b'\n');
		file.write_all(&line).map_err(backend_error)?;
		file.sync_data().map_err(backend_error)?;
		Ok(entry.sequence)
	})();

	let _ = FileExt::unlock(&file);
	result
}

/// Offsets of the complete lines of one channel log.
#[derive(Debug, Default)]
struct LogIndex {
	/// Length of the log prefix covered by `lines`.
	indexed_len: u64,
	/// Sequence and byte offset of each complete line, in log order.
	lines: Vec<(u64, u64)>,
}

impl LogIndex {
	/// Indexes whatever was appended since the last refresh.
	async fn refresh(&mut self, path: &Path) -> Result<(), StreamError> {
		let mut file = match fs::File::open(path).await {
			Ok(file) => file,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				*self = LogIndex::default();
				return Ok(());
			},
			Err(e) => return Err(backend_error(e)),
		};

		let len = file.metadata().await.map_err(backend_error)?.len();
		if len < self.indexed_len {
			// The log was replaced underneath us
			*self = LogIndex::default();
		}
		if len == self.indexed_len {
			return Ok(());
		}

		file.seek(SeekFrom::Start(self.indexed_len))
			.await
			.map_err(backend_error)?;
		let mut appended = Vec::new();
		file.read_to_end(&mut appended)
			.await
			.map_err(backend_error)?;

		let mut offset = self.indexed_len;
		for line in appended.split_inclusive(|b| *b == b'\n') {
			if line.last() != Some(&b'\n') {
				break;
			}
			if !line.iter().all(u8::is_ascii_whitespace) {
				let entry: LogPosition = serde_json::from_slice(line).map_err(corrupt)?;
				self.lines.push((entry.sequence, offset));
			}
			offset += line.len() as u64;
		}
		self.indexed_len = offset;
		Ok(())
	}

	fn last_sequence(&self) -> u64 {
		self.lines.last().map_or(0, |(sequence, _)| *sequence)
	}

	/// Byte range holding at most `limit` entries after `after`.
	fn range_after(&self, after: u64, limit: usize) -> Option<(u64, u64)> {
		let first = self.lines.partition_point(|(sequence, _)| *sequence <= after);
		let (_, start) = *self.lines.get(first)?;
		let end = self
			.lines
			.get(first.saturating_add(limit))
			.map_or(self.indexed_len, |(_, offset)| *offset);
		Some((start, end))
	}
}

/// File-based stream implementation.
pub struct FileStream {
	base_path: PathBuf,
	poll_interval: Duration,
	indexes: Mutex<HashMap<String, LogIndex>>,
	closed: AtomicBool,
}

impl FileStream {
	pub fn new(base_path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
		Self {
			base_path: base_path.into(),
			poll_interval,
			indexes: Mutex::new(HashMap::new()),
			closed: AtomicBool::new(false),
		}
	}

	fn ensure_open(&self) -> Result<(), StreamError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(StreamError::Closed);
		}
		Ok(())
	}

	fn channel_path(&self, channel: &str) -> PathBuf {
		self.base_path.join(hex::encode(channel.as_bytes()))
	}

	fn log_path(&self, channel: &str) -> PathBuf {
		self.channel_path(channel).join(LOG_FILE)
	}

	fn cursor_path(&self, channel: &str, durable: &str) -> PathBuf {
		self.channel_path(channel)
			.join(CURSOR_DIR)
			.join(format!("{}.json", hex::encode(durable.as_bytes())))
	}

	/// Reads the bytes `[start, end)` of a channel log.
	async fn read_range(&self, channel: &str, start: u64, end: u64) -> Result<String, StreamError> {
		let mut file = fs::File::open(self.log_path(channel))
			.await
			.map_err(backend_error)?;
		file.seek(SeekFrom::Start(start))
			.await
			.map_err(backend_error)?;
		let mut buffer = vec![0; (end - start) as usize];
		file.read_exact(&mut buffer).await.map_err(backend_error)?;
		String::from_utf8(buffer).map_err(corrupt)
	}
}

#[async_trait]
impl StreamInterface for FileStream {
	async fn append(&self, channel: &str, payload: Vec<u8>) -> Result<u64, StreamError> {
		self.ensure_open()?;
		let channel_path = self.channel_path(channel);
		fs::create_dir_all(&channel_path)
			.await
			.map_err(backend_error)?;

		let log_path = channel_path.join(LOG_FILE);
		tokio::task::spawn_blocking(move || append_locked(&log_path, &payload))
			.await
			.map_err(backend_error)?
	}

	async fn read_after(
		&self,
		channel: &str,
		after: u64,
		limit: usize,
	) -> Result<Vec<StoredMessage>, StreamError> {
		self.ensure_open()?;
		let range = {
			let mut indexes = self.indexes.lock().await;
			let index = indexes.entry(channel.to_string()).or_default();
			index.refresh(&self.log_path(channel)).await?;
			index.range_after(after, limit)
		};
		let Some((start, end)) = range else {
			return Ok(Vec::new());
		};

		parse_log(&self.read_range(channel, start, end).await?)?
			.into_iter()
			.map(|entry| {
				let payload = hex::decode(&entry.payload).map_err(|e| {
					StreamError::Serialization(format!(
						"Bad payload at sequence {}: {}",
						entry.sequence, e
					))
				})?;
				Ok(StoredMessage {
					sequence: entry.sequence,
					payload,
				})
			})
			.collect()
	}

	async fn last_sequence(&self, channel: &str) -> Result<u64, StreamError> {
		self.ensure_open()?;
		let mut indexes = self.indexes.lock().await;
		let index = indexes.entry(channel.to_string()).or_default();
		index.refresh(&self.log_path(channel)).await?;
		Ok(index.last_sequence())
	}

	async fn load_cursor(
		&self,
		channel: &str,
		durable: &str,
	) -> Result<Option<DurableCursor>, StreamError> {
		self.ensure_open()?;
		let data = match fs::read(self.cursor_path(channel, durable)).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(backend_error(e)),
		};
		serde_json::from_slice(&data)
			.map(Some)
			.map_err(|e| StreamError::Serialization(format!("Corrupt cursor: {}", e)))
	}

	async fn store_cursor(
		&self,
		channel: &str,
		durable: &str,
		cursor: &DurableCursor,
	) -> Result<(), StreamError> {
		self.ensure_open()?;
		let path = self.cursor_path(channel, durable);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).await.map_err(backend_error)?;
		}

		let data =
			serde_json::to_vec(cursor).map_err(|e| StreamError::Serialization(e.to_string()))?;
		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, data).await.map_err(backend_error)?;
		fs::rename(&temp_path, &path).await.map_err(backend_error)
	}

	async fn wait_for_append(&self, _channel: &str, _after: u64) {
		tokio::time::sleep(self.poll_interval).await;
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStreamSchema)
	}

	async fn close(&self) -> Result<(), StreamError> {
		self.closed.store(true, Ordering::SeqCst);
		Ok(())
	}
}

/// Configuration schema for FileStream.
pub struct FileStreamSchema;

impl ConfigSchema for FileStreamSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), SchemaError> {
		let schema = Schema::new(
			vec![],
			vec![
				Field::new("stream_path", FieldType::String),
				Field::new(
					"poll_interval_ms",
					FieldType::Integer {
						min: Some(1),
						max: Some(60_000),
					},
				),
			],
		);
		schema.validate(config)
	}
}

/// Factory function to create a file stream transport from configuration.
///
/// Configuration parameters:
/// - `stream_path`: Directory holding channel logs (default: "./data/stream")
/// - `poll_interval_ms`: Delay between polls for new entries (default: 100)
pub fn create_stream(config: &toml::Value) -> Result<Box<dyn StreamInterface>, StreamError> {
	FileStreamSchema
		.validate(config)
		.map_err(|e| StreamError::Configuration(e.to_string()))?;

	let stream_path = config
		.get("stream_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/stream");
	let poll_interval_ms = config
		.get("poll_interval_ms")
		.and_then(|v| v.as_integer())
		.map_or(DEFAULT_POLL_INTERVAL_MS, |v| v as u64);

	Ok(Box::new(FileStream::new(
		stream_path,
		Duration::from_millis(poll_interval_ms),
	)))
}

/// Registry for the file stream implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
	type Factory = StreamFactory;

	fn factory() -> Self::Factory {
		create_stream
	}
}

impl StreamRegistry for Registry {}

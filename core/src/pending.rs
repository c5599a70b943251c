//! Durable pending-change queues.
//!
//! When a peer is unreachable its writes land in one of two FIFO lists in
//! the shared KV, `pending:to-remote` and `pending:to-store`, and survive
//! process restarts there. Replay pops the head; a failed replay pushes the
//! element back to the head and aborts the drain, so order is preserved
//! across attempts.

use std::sync::Arc;

use cb_cell::{CellAddress, Origin};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::kv::{KvError, KvStore};

pub const TO_REMOTE: &str = "pending:to-remote";
pub const TO_STORE: &str = "pending:to-store";

/// One queued write; an empty value is a deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
	pub address: CellAddress,
	pub value: String,
	pub origin: Origin,
	pub timestamp: DateTime<Utc>,
}

impl PendingChange {
	pub fn new(address: CellAddress, value: String, origin: Origin) -> Self {
		Self {
			address,
			value,
			origin,
			timestamp: Utc::now(),
		}
	}
}

#[derive(Clone)]
pub struct PendingQueue {
	kv: Arc<dyn KvStore>,
}

impl PendingQueue {
	pub fn new(kv: Arc<dyn KvStore>) -> Self {
		Self { kv }
	}

	pub async fn push(&self, list: &str, change: &PendingChange) -> Result<(), KvError> {
		let encoded = serde_json::to_string(change)
			.map_err(|e| KvError::Protocol(format!("pending change encode: {e}")))?;
		self.kv.rpush(list, &encoded).await
	}

	/// Pop the head; undecodable entries are dropped with a warning since
	/// replaying them can never succeed.
	pub async fn pop(&self, list: &str) -> Result<Option<PendingChange>, KvError> {
		loop {
			let Some(raw) = self.kv.lpop(list).await? else {
				return Ok(None);
			};
			match serde_json::from_str(&raw) {
				Ok(change) => return Ok(Some(change)),
				Err(err) => {
					warn!(list, %err, "dropping undecodable pending entry");
				}
			}
		}
	}

	/// Put a popped element back at the head after a failed replay.
	pub async fn requeue_head(&self, list: &str, change: &PendingChange) -> Result<(), KvError> {
		let encoded = serde_json::to_string(change)
			.map_err(|e| KvError::Protocol(format!("pending change encode: {e}")))?;
		self.kv.lpush(list, &encoded).await
	}

	pub async fn len(&self, list: &str) -> Result<u64, KvError> {
		self.kv.llen(list).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::MemoryKv;
	use cb_cell::Column;

	fn change(row: u32, value: &str) -> PendingChange {
		PendingChange::new(
			CellAddress::new(row, Column::from_letter('A').unwrap()).unwrap(),
			value.to_string(),
			Origin::LocalTerminal,
		)
	}

	#[tokio::test]
	async fn fifo_order_survives_requeue() {
		let queue = PendingQueue::new(Arc::new(MemoryKv::default()));
		queue.push(TO_REMOTE, &change(1, "X")).await.unwrap();
		queue.push(TO_REMOTE, &change(2, "Y")).await.unwrap();
		assert_eq!(queue.len(TO_REMOTE).await.unwrap(), 2);

		let first = queue.pop(TO_REMOTE).await.unwrap().unwrap();
		assert_eq!(first.value, "X");

		// Replay failed: back to the head, order unchanged.
		queue.requeue_head(TO_REMOTE, &first).await.unwrap();
		assert_eq!(queue.pop(TO_REMOTE).await.unwrap().unwrap().value, "X");
		assert_eq!(queue.pop(TO_REMOTE).await.unwrap().unwrap().value, "Y");
		assert_eq!(queue.pop(TO_REMOTE).await.unwrap(), None);
	}

	#[tokio::test]
	async fn undecodable_entries_are_skipped() {
		let kv = Arc::new(MemoryKv::default());
		kv.rpush(TO_STORE, "not json").await.unwrap();
		let queue = PendingQueue::new(kv.clone());
		queue.push(TO_STORE, &change(3, "Z")).await.unwrap();

		assert_eq!(queue.pop(TO_STORE).await.unwrap().unwrap().value, "Z");
	}
}

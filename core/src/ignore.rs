//! Ignore marks, the first echo-suppression layer.
//!
//! Before the inbound reconciler applies a remote edit to the store it sets
//! `ignore:<row>:<col>` with a short TTL. The ingress worker treats a marked
//! cell as already settled, and the mark outlives one poll period plus one
//! debounce window so the write can't be re-detected as local. Marks are
//! write-once and expire on their own.

use std::sync::Arc;
use std::time::Duration;

use cb_cell::CellAddress;

use crate::kv::{KvError, KvStore};

#[derive(Clone)]
pub struct IgnoreMarks {
	kv: Arc<dyn KvStore>,
	ttl: Duration,
}

fn mark_key(address: &CellAddress) -> String {
	format!("ignore:{address}")
}

impl IgnoreMarks {
	pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
		Self { kv, ttl }
	}

	pub async fn mark(&self, address: &CellAddress) -> Result<(), KvError> {
		self.kv.set_ex(&mark_key(address), "1", self.ttl).await
	}

	pub async fn is_marked(&self, address: &CellAddress) -> Result<bool, KvError> {
		self.kv.exists(&mark_key(address)).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::MemoryKv;
	use cb_cell::Column;

	#[tokio::test]
	async fn marks_expire() {
		tokio::time::pause();
		let kv = Arc::new(MemoryKv::default());
		let marks = IgnoreMarks::new(kv, Duration::from_secs(10));
		let addr = CellAddress::new(1, Column::from_letter('A').unwrap()).unwrap();

		assert!(!marks.is_marked(&addr).await.unwrap());
		marks.mark(&addr).await.unwrap();
		assert!(marks.is_marked(&addr).await.unwrap());

		tokio::time::advance(Duration::from_secs(11)).await;
		assert!(!marks.is_marked(&addr).await.unwrap());
	}
}

//! Per-cell leases.
//!
//! A lease is a KV key `lock:<row>:<col>` holding its owner with a TTL, so a
//! crashed writer can never block a cell for longer than the lease lifetime.
//! Contention is an answer, not an error: `acquire` reports it as `false`
//! after the retry schedule is exhausted.

use std::sync::Arc;
use std::time::Duration;

use cb_cell::CellAddress;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::kv::{KvError, KvStore};

pub struct LockService {
	kv: Arc<dyn KvStore>,
	lease_ttl: Duration,
	retry_delay: Duration,
	max_attempts: u32,
}

fn lease_key(address: &CellAddress) -> String {
	format!("lock:{address}")
}

impl LockService {
	pub fn new(
		kv: Arc<dyn KvStore>,
		lease_ttl: Duration,
		retry_delay: Duration,
		max_attempts: u32,
	) -> Self {
		Self {
			kv,
			lease_ttl,
			retry_delay,
			max_attempts,
		}
	}

	/// Try to take the lease on `address` for `owner`.
	///
	/// Retries with cooperative sleeps up to the configured attempt count;
	/// cancellation is honoured between attempts. Returns `false` when the
	/// cell stayed locked for the whole schedule.
	pub async fn acquire(
		&self,
		address: &CellAddress,
		owner: &str,
		cancel: &CancellationToken,
	) -> Result<bool, KvError> {
		let key = lease_key(address);
		for attempt in 0..self.max_attempts {
			if self.kv.set_nx_ex(&key, owner, self.lease_ttl).await? {
				trace!(%address, owner, attempt, "lease acquired");
				return Ok(true);
			}
			if attempt + 1 == self.max_attempts {
				break;
			}
			tokio::select! {
				() = cancel.cancelled() => return Ok(false),
				() = tokio::time::sleep(self.retry_delay) => {}
			}
		}
		trace!(%address, owner, "lease denied after retry schedule");
		Ok(false)
	}

	/// Release the lease, but only while `owner` still holds it. A mismatch
	/// means the lease expired and was reassigned; releasing it then would
	/// steal it from the new holder, so the call is a silent no-op.
	pub async fn release(&self, address: &CellAddress, owner: &str) -> Result<(), KvError> {
		self.kv.del_if_equals(&lease_key(address), owner).await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::MemoryKv;
	use cb_cell::Column;

	fn addr() -> CellAddress {
		CellAddress::new(3, Column::from_letter('B').unwrap()).unwrap()
	}

	fn service(kv: Arc<MemoryKv>) -> LockService {
		LockService::new(kv, Duration::from_secs(5), Duration::from_millis(10), 15)
	}

	#[tokio::test]
	async fn acquire_is_exclusive_until_release() {
		let kv = Arc::new(MemoryKv::default());
		let locks = service(kv.clone());
		let cancel = CancellationToken::new();

		assert!(locks.acquire(&addr(), "alice", &cancel).await.unwrap());
		assert!(!locks.acquire(&addr(), "bob", &cancel).await.unwrap());

		locks.release(&addr(), "alice").await.unwrap();
		assert!(locks.acquire(&addr(), "bob", &cancel).await.unwrap());
	}

	#[tokio::test]
	async fn release_with_wrong_owner_is_a_no_op() {
		let kv = Arc::new(MemoryKv::default());
		let locks = service(kv.clone());
		let cancel = CancellationToken::new();

		assert!(locks.acquire(&addr(), "alice", &cancel).await.unwrap());
		locks.release(&addr(), "bob").await.unwrap();
		// Alice still holds it.
		assert!(!locks.acquire(&addr(), "carol", &cancel).await.unwrap());
	}

	#[tokio::test]
	async fn fifteen_contenders_yield_one_winner() {
		let kv = Arc::new(MemoryKv::default());
		let locks = Arc::new(LockService::new(
			kv,
			Duration::from_secs(60),
			Duration::from_millis(1),
			3,
		));
		let cancel = CancellationToken::new();

		let mut handles = Vec::new();
		for i in 0..15 {
			let locks = locks.clone();
			let cancel = cancel.clone();
			handles.push(tokio::spawn(async move {
				locks
					.acquire(&addr(), &format!("contender-{i}"), &cancel)
					.await
					.unwrap()
			}));
		}

		let mut winners = 0;
		for handle in handles {
			if handle.await.unwrap() {
				winners += 1;
			}
		}
		assert_eq!(winners, 1);
	}

	#[tokio::test]
	async fn unavailable_kv_surfaces_as_an_error() {
		let kv = Arc::new(MemoryKv::default());
		kv.set_unavailable(true);
		let locks = service(kv.clone());
		let cancel = CancellationToken::new();

		assert!(locks.acquire(&addr(), "alice", &cancel).await.is_err());
	}

	#[tokio::test]
	async fn expired_lease_can_be_retaken() {
		tokio::time::pause();
		let kv = Arc::new(MemoryKv::default());
		let locks = LockService::new(kv, Duration::from_secs(5), Duration::from_millis(10), 1);
		let cancel = CancellationToken::new();

		assert!(locks.acquire(&addr(), "alice", &cancel).await.unwrap());
		tokio::time::advance(Duration::from_secs(6)).await;
		assert!(locks.acquire(&addr(), "bob", &cancel).await.unwrap());
	}
}

//! Job-queue ingress worker.
//!
//! Point edits arriving over the control surface are serialized through a
//! KV-backed job list and applied by a bounded worker pool. Consumption is
//! paced under the remote write quota, each job runs under the cell lease,
//! and a completed apply nudges the outbound synchronizer so the sheet
//! converges.

use std::sync::Arc;
use std::time::Duration;

use cb_cell::{CellAddress, Origin};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::ignore::IgnoreMarks;
use crate::kv::{KvError, KvStore};
use crate::lock::LockService;
use crate::outbound::OutboundSync;
use crate::store::CellStore;

pub const JOBS_KEY: &str = "jobs:edits";

const MAX_ATTEMPTS: u32 = 3;
const IDLE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditJob {
	pub id: Uuid,
	pub address: CellAddress,
	pub value: String,
	pub origin: Origin,
	#[serde(default)]
	pub attempt: u32,
}

impl EditJob {
	pub fn new(address: CellAddress, value: String, origin: Origin) -> Self {
		Self {
			id: Uuid::new_v4(),
			address,
			value,
			origin,
			attempt: 0,
		}
	}
}

struct Shared {
	kv: Arc<dyn KvStore>,
	store: Arc<dyn CellStore>,
	locks: Arc<LockService>,
	marks: IgnoreMarks,
	outbound: OutboundSync,
	concurrency: usize,
	/// Minimum gap between job dispatches, derived from the per-minute quota.
	dispatch_gap: Duration,
}

#[derive(Clone)]
pub struct WorkerPool {
	shared: Arc<Shared>,
}

impl WorkerPool {
	pub fn new(
		kv: Arc<dyn KvStore>,
		store: Arc<dyn CellStore>,
		locks: Arc<LockService>,
		marks: IgnoreMarks,
		outbound: OutboundSync,
		concurrency: usize,
		rate_per_min: u32,
	) -> Self {
		Self {
			shared: Arc::new(Shared {
				kv,
				store,
				locks,
				marks,
				outbound,
				concurrency: concurrency.max(1),
				dispatch_gap: Duration::from_secs_f64(60.0 / f64::from(rate_per_min.max(1))),
			}),
		}
	}

	pub async fn enqueue(&self, job: &EditJob) -> Result<(), KvError> {
		let encoded = serde_json::to_string(job)
			.map_err(|e| KvError::Protocol(format!("edit job encode: {e}")))?;
		self.shared.kv.rpush(JOBS_KEY, &encoded).await
	}

	/// One paced dispatcher plus the worker fan-out.
	pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
		let mut handles = Vec::new();
		let (tx, rx) = mpsc::channel::<EditJob>(self.shared.concurrency);
		let rx = Arc::new(Mutex::new(rx));

		{
			let this = self.clone();
			let cancel = cancel.clone();
			handles.push(tokio::spawn(async move {
				this.dispatch_loop(tx, cancel).await;
			}));
		}

		for _ in 0..self.shared.concurrency {
			let this = self.clone();
			let rx = rx.clone();
			let cancel = cancel.clone();
			handles.push(tokio::spawn(async move {
				loop {
					let job = {
						let mut rx = rx.lock().await;
						tokio::select! {
							() = cancel.cancelled() => return,
							job = rx.recv() => job,
						}
					};
					let Some(job) = job else { return };
					this.process(job, &cancel).await;
				}
			}));
		}

		handles
	}

	async fn dispatch_loop(&self, tx: mpsc::Sender<EditJob>, cancel: CancellationToken) {
		loop {
			let popped = tokio::select! {
				() = cancel.cancelled() => return,
				popped = self.shared.kv.lpop(JOBS_KEY) => popped,
			};
			match popped {
				Ok(Some(raw)) => {
					let job: EditJob = match serde_json::from_str(&raw) {
						Ok(job) => job,
						Err(err) => {
							warn!(%err, "dropping undecodable edit job");
							continue;
						}
					};
					if tx.send(job).await.is_err() {
						return;
					}
					// Quota pacing between dispatches.
					tokio::select! {
						() = cancel.cancelled() => return,
						() = tokio::time::sleep(self.shared.dispatch_gap) => {}
					}
				}
				Ok(None) => {
					tokio::select! {
						() = cancel.cancelled() => return,
						() = tokio::time::sleep(IDLE_POLL) => {}
					}
				}
				Err(err) => {
					warn!(%err, "edit job pop failed");
					tokio::select! {
						() = cancel.cancelled() => return,
						() = tokio::time::sleep(Duration::from_secs(1)) => {}
					}
				}
			}
		}
	}

	async fn process(&self, mut job: EditJob, cancel: &CancellationToken) {
		match self.apply(&job, cancel).await {
			Ok(applied) => {
				if applied {
					self.shared.outbound.request_sync();
				}
			}
			Err(err) => {
				job.attempt += 1;
				if job.attempt >= MAX_ATTEMPTS {
					warn!(id = %job.id, address = %job.address, %err, "edit job dropped after retries");
					return;
				}
				let delay = Duration::from_secs(1 << (job.attempt - 1));
				debug!(id = %job.id, attempt = job.attempt, delay_ms = delay.as_millis() as u64, %err, "edit job retry scheduled");
				tokio::select! {
					() = cancel.cancelled() => return,
					() = tokio::time::sleep(delay) => {}
				}
				if let Err(err) = self.enqueue(&job).await {
					warn!(id = %job.id, %err, "failed to requeue edit job");
				}
			}
		}
	}

	/// Apply one edit under the cell lease. Returns whether a write
	/// happened; an ignore-marked cell is a clean no-op.
	async fn apply(&self, job: &EditJob, cancel: &CancellationToken) -> Result<bool, Error> {
		if self.shared.marks.is_marked(&job.address).await? {
			debug!(id = %job.id, address = %job.address, "edit suppressed by ignore mark");
			return Ok(false);
		}

		let owner = format!("worker:{}", job.id);
		if !self.shared.locks.acquire(&job.address, &owner, cancel).await? {
			return Err(Error::Contention(job.address));
		}

		let result = if job.value.is_empty() {
			self.shared.store.delete(job.address).await
		} else {
			self.shared
				.store
				.upsert(job.address, &job.value, job.origin.clone())
				.await
		};

		if let Err(err) = self.shared.locks.release(&job.address, &owner).await {
			warn!(address = %job.address, %err, "lease release failed, lease will expire");
		}

		result.map(|()| true).map_err(Error::from)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::peer::{PeerHealth, PeerStatus};
	use crate::pending::PendingQueue;
	use crate::sheet::SheetClient;
	use crate::snapshot::SnapshotCache;
	use crate::testing::{FakeSheetApi, MemoryKv, MemoryStore};
	use cb_cell::Column;

	fn addr(row: u32, col: char) -> CellAddress {
		CellAddress::new(row, Column::from_letter(col).unwrap()).unwrap()
	}

	fn pool(kv: Arc<MemoryKv>, store: Arc<MemoryStore>) -> WorkerPool {
		let kv: Arc<dyn KvStore> = kv;
		let store: Arc<dyn CellStore> = store;
		let remote = Arc::new(PeerHealth::new("remote", PeerStatus::Online));
		let store_health = Arc::new(PeerHealth::new("store", PeerStatus::Online));
		let sheet = Arc::new(SheetClient::new(
			Arc::new(FakeSheetApi::default()),
			remote,
			"Sheet1!A1:H20".into(),
			"Sheet1".into(),
			Duration::from_secs(5),
			Duration::from_secs(60),
		));
		let snapshot = Arc::new(SnapshotCache::new(kv.clone(), Duration::from_secs(60)));
		let outbound = OutboundSync::new(
			store.clone(),
			sheet,
			snapshot,
			PendingQueue::new(kv.clone()),
			store_health,
			Duration::from_millis(500),
		);
		WorkerPool::new(
			kv.clone(),
			store,
			Arc::new(LockService::new(
				kv.clone(),
				Duration::from_secs(5),
				Duration::from_millis(10),
				3,
			)),
			IgnoreMarks::new(kv, Duration::from_secs(10)),
			outbound,
			2,
			55,
		)
	}

	#[tokio::test]
	async fn apply_writes_through_the_lease() {
		let kv = Arc::new(MemoryKv::default());
		let store = Arc::new(MemoryStore::default());
		let pool = pool(kv.clone(), store.clone());
		let cancel = CancellationToken::new();

		let job = EditJob::new(addr(3, 'B'), "Hello".into(), Origin::Worker);
		assert!(pool.apply(&job, &cancel).await.unwrap());

		let cell = store.cell(&addr(3, 'B')).unwrap();
		assert_eq!(cell.value, "Hello");
		assert_eq!(cell.origin, Origin::Worker);
		// The lease was released again.
		assert_eq!(kv.get("lock:3:B").await.unwrap(), None);
	}

	#[tokio::test]
	async fn ignore_marked_cells_are_skipped() {
		let kv = Arc::new(MemoryKv::default());
		let store = Arc::new(MemoryStore::default());
		let pool = pool(kv.clone(), store.clone());
		let cancel = CancellationToken::new();

		let marks = IgnoreMarks::new(kv.clone(), Duration::from_secs(10));
		marks.mark(&addr(3, 'B')).await.unwrap();

		let job = EditJob::new(addr(3, 'B'), "late echo".into(), Origin::Worker);
		assert!(!pool.apply(&job, &cancel).await.unwrap());
		assert!(store.cell(&addr(3, 'B')).is_none());
	}

	#[tokio::test]
	async fn held_lease_reports_contention() {
		let kv = Arc::new(MemoryKv::default());
		let store = Arc::new(MemoryStore::default());
		let pool = pool(kv.clone(), store.clone());
		let cancel = CancellationToken::new();

		let locks = LockService::new(
			kv.clone(),
			Duration::from_secs(60),
			Duration::from_millis(10),
			1,
		);
		assert!(locks.acquire(&addr(3, 'B'), "someone-else", &cancel).await.unwrap());

		let job = EditJob::new(addr(3, 'B'), "blocked".into(), Origin::Worker);
		assert!(matches!(
			pool.apply(&job, &cancel).await,
			Err(Error::Contention(_))
		));
		assert!(store.cell(&addr(3, 'B')).is_none());
	}

	#[tokio::test]
	async fn empty_values_delete() {
		let kv = Arc::new(MemoryKv::default());
		let store = Arc::new(MemoryStore::default());
		let pool = pool(kv.clone(), store.clone());
		let cancel = CancellationToken::new();

		store.seed(addr(4, 'D'), "old", Origin::LocalTerminal);
		let job = EditJob::new(addr(4, 'D'), String::new(), Origin::Worker);
		assert!(pool.apply(&job, &cancel).await.unwrap());
		assert!(store.cell(&addr(4, 'D')).is_none());
	}
}

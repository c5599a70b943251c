//! Outbound synchronizer.
//!
//! Every local write path calls [`OutboundSync::request_sync`]; requests
//! within the debounce window collapse into a single batch pass. A pass
//! reads the whole table, compares it against the live remote state, pushes
//! the difference, and then repairs the echo-suppression state (origin
//! rewrite + snapshot write-through) so the next poll stays quiet.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cb_cell::{CellAddress, Origin};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pending::{PendingChange, PendingQueue, TO_REMOTE};
use crate::peer::PeerHealth;
use crate::sheet::{ReadOutcome, SheetClient, WriteOutcome};
use crate::snapshot::SnapshotCache;
use crate::store::{CellStore, StoreError};

struct Shared {
	dirty: AtomicBool,
	kick: Notify,
	// At most one batch push in flight; also serializes forced passes
	// against the debounce task.
	pass_lock: Mutex<()>,
	// Cancels armed quota-retry timers; tripped when the debounce task
	// shuts down so no stray sleep outlives the engine.
	retry_cancel: CancellationToken,
	store: Arc<dyn CellStore>,
	sheet: Arc<SheetClient>,
	snapshot: Arc<SnapshotCache>,
	pending: PendingQueue,
	store_health: Arc<PeerHealth>,
	debounce: Duration,
}

#[derive(Clone)]
pub struct OutboundSync {
	shared: Arc<Shared>,
}

impl OutboundSync {
	pub fn new(
		store: Arc<dyn CellStore>,
		sheet: Arc<SheetClient>,
		snapshot: Arc<SnapshotCache>,
		pending: PendingQueue,
		store_health: Arc<PeerHealth>,
		debounce: Duration,
	) -> Self {
		Self {
			shared: Arc::new(Shared {
				dirty: AtomicBool::new(false),
				kick: Notify::new(),
				pass_lock: Mutex::new(()),
				retry_cancel: CancellationToken::new(),
				store,
				sheet,
				snapshot,
				pending,
				store_health,
				debounce,
			}),
		}
	}

	/// Mark the table dirty and (re)arm the debounce timer. Calls inside an
	/// open window reset the timer rather than stacking passes.
	pub fn request_sync(&self) {
		self.shared.dirty.store(true, Ordering::SeqCst);
		self.shared.kick.notify_one();
	}

	/// Run one pass right now, regardless of the debounce state.
	pub async fn force_sync(&self) {
		self.shared.dirty.store(false, Ordering::SeqCst);
		self.run_pass().await;
	}

	/// The debounce task. On cancellation an in-flight dirty flag is
	/// flushed with one final bounded pass before the task exits.
	pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
		let this = self.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					() = cancel.cancelled() => {
						this.flush_on_shutdown().await;
						return;
					}
					() = this.shared.kick.notified() => {}
				}
				// Debounce window: every new request restarts the wait.
				loop {
					tokio::select! {
						() = cancel.cancelled() => {
							this.flush_on_shutdown().await;
							return;
						}
						() = this.shared.kick.notified() => continue,
						() = tokio::time::sleep(this.shared.debounce) => break,
					}
				}
				if this.shared.dirty.swap(false, Ordering::SeqCst) {
					this.run_pass().await;
				}
			}
		})
	}

	async fn flush_on_shutdown(&self) {
		self.shared.retry_cancel.cancel();
		if !self.shared.dirty.swap(false, Ordering::SeqCst) {
			return;
		}
		debug!("flushing pending outbound pass before shutdown");
		if tokio::time::timeout(Duration::from_secs(10), self.run_pass())
			.await
			.is_err()
		{
			warn!("outbound flush did not finish before the shutdown deadline");
		}
	}

	/// Schedule another pass once the quota window has lapsed. The timer
	/// dies quietly when the engine shuts down first.
	fn retry_after_backoff(&self, backoff_ms: u64) {
		self.shared.dirty.store(true, Ordering::SeqCst);
		let this = self.clone();
		let delay = Duration::from_millis(backoff_ms).max(this.shared.debounce);
		tokio::spawn(async move {
			tokio::select! {
				() = this.shared.retry_cancel.cancelled() => {}
				() = tokio::time::sleep(delay) => this.shared.kick.notify_one(),
			}
		});
	}

	async fn run_pass(&self) {
		let shared = &self.shared;
		let _guard = shared.pass_lock.lock().await;

		// Authoritative table read, falling back to the cached view when the
		// store is unreachable.
		let cells = match shared.store.read_all().await {
			Ok(cells) => {
				shared.store_health.set_online();
				shared.snapshot.persist_db_view(&cells).await;
				cells
			}
			Err(StoreError::Offline(reason)) => {
				shared.store_health.set_offline();
				match shared.snapshot.load_db_view().await {
					Some(cells) => {
						debug!(%reason, "outbound pass using cached store view");
						cells
					}
					None => {
						warn!(%reason, "store offline and no cached view, skipping outbound pass");
						return;
					}
				}
			}
			Err(StoreError::Data(err)) => {
				warn!(%err, "outbound table read failed");
				return;
			}
		};

		// Live remote view for the comparison.
		let remote = match shared.sheet.read_range().await {
			ReadOutcome::Snapshot(snapshot) => snapshot,
			ReadOutcome::RateLimited => {
				self.retry_after_backoff(shared.sheet.backoff_remaining_ms().await);
				return;
			}
			ReadOutcome::Unreachable => {
				// Queue everything the sheet is missing for replay on recovery.
				for cell in cells.iter().filter(|cell| !cell.origin.is_remote()) {
					let change = PendingChange::new(
						cell.address,
						cell.value.clone(),
						cell.origin.clone(),
					);
					if let Err(err) = shared.pending.push(TO_REMOTE, &change).await {
						warn!(address = %cell.address, %err, "failed to queue pending remote write");
					}
				}
				return;
			}
		};

		// Cells the sheet is behind on; remote-originated cells never go back.
		let mut batch: Vec<(CellAddress, String)> = Vec::new();
		let mut origins: Vec<Origin> = Vec::new();
		let mut locally_present = BTreeSet::new();
		for cell in &cells {
			if !cell.value.is_empty() {
				locally_present.insert(cell.address);
			}
		}
		for cell in &cells {
			if cell.origin.is_remote() {
				continue;
			}
			if cell.value != remote.get(&cell.address).unwrap_or("") {
				batch.push((cell.address, cell.value.clone()));
				origins.push(cell.origin.clone());
			}
		}
		// Local deletions: non-empty remotely, gone from the table.
		for (address, value) in &remote {
			if value.is_empty() || locally_present.contains(address) {
				continue;
			}
			if batch.iter().any(|(queued, _)| queued == address) {
				continue;
			}
			batch.push((*address, String::new()));
			origins.push(Origin::LocalTerminal);
		}

		if batch.is_empty() {
			debug!("outbound pass found nothing to push");
			return;
		}

		match shared.sheet.write_batch(&batch).await {
			WriteOutcome::Ok => {
				info!(pushed = batch.len(), "outbound batch pushed");
				for (address, _) in &batch {
					if let Err(err) = shared.store.update_origin_if_not_remote(*address).await {
						warn!(%address, %err, "origin rewrite after push failed");
					}
				}
				shared.snapshot.apply_pushed_many(&batch).await;
			}
			WriteOutcome::RateLimited => {
				self.retry_after_backoff(shared.sheet.backoff_remaining_ms().await);
			}
			WriteOutcome::Unreachable => {
				for ((address, value), origin) in batch.into_iter().zip(origins) {
					let change = PendingChange::new(address, value, origin);
					if let Err(err) = shared.pending.push(TO_REMOTE, &change).await {
						warn!(%address, %err, "failed to queue pending remote write");
					}
				}
			}
		}
	}
}

//! Inbound CDC reconciler.
//!
//! Polls the remote range, diffs it against the last-observed snapshot and
//! applies the difference to the store under ignore marks. The same
//! structure owns the pending-queue drains, wired to the recovery edges of
//! both peers: whenever a peer comes back online its queue is replayed
//! before normal work resumes.

use std::sync::Arc;
use std::time::Duration;

use cb_cell::{diff, CellChange, Origin};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::ignore::IgnoreMarks;
use crate::pending::{PendingChange, PendingQueue, TO_REMOTE, TO_STORE};
use crate::peer::{PeerHealth, PeerStatus};
use crate::sheet::{ReadOutcome, SheetClient, WriteOutcome};
use crate::snapshot::SnapshotCache;
use crate::store::{CellStore, StoreError};

struct Shared {
	sheet: Arc<SheetClient>,
	store: Arc<dyn CellStore>,
	marks: IgnoreMarks,
	pending: PendingQueue,
	snapshot: Arc<SnapshotCache>,
	remote_health: Arc<PeerHealth>,
	store_health: Arc<PeerHealth>,
	poll_interval: Duration,
}

#[derive(Clone)]
pub struct Reconciler {
	shared: Arc<Shared>,
}

impl Reconciler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		sheet: Arc<SheetClient>,
		store: Arc<dyn CellStore>,
		marks: IgnoreMarks,
		pending: PendingQueue,
		snapshot: Arc<SnapshotCache>,
		remote_health: Arc<PeerHealth>,
		store_health: Arc<PeerHealth>,
		poll_interval: Duration,
	) -> Self {
		Self {
			shared: Arc::new(Shared {
				sheet,
				store,
				marks,
				pending,
				snapshot,
				remote_health,
				store_health,
				poll_interval,
			}),
		}
	}

	/// Warm start, initial one-shot sync, then queue replay.
	///
	/// A failed initial read is not fatal: the engine continues in degraded
	/// mode from whatever snapshot survived in the KV.
	pub async fn bootstrap(&self) -> Result<(), Error> {
		let warm = self.shared.snapshot.load_warm().await;

		match self.shared.sheet.read_range().await {
			ReadOutcome::Snapshot(current) => {
				info!(cells = current.len(), "initial remote read complete");
				for (address, value) in &current {
					if value.is_empty() {
						continue;
					}
					self.apply_remote_change(&CellChange {
						address: *address,
						value: value.clone(),
					})
					.await;
				}
				self.shared.snapshot.replace(current).await;
			}
			outcome => {
				if warm {
					warn!(
						?outcome,
						"remote unavailable at bootstrap, continuing from warm snapshot"
					);
				} else {
					warn!(?outcome, "remote unavailable and no warm snapshot, starting cold");
				}
			}
		}

		// Replay order on startup: store-side first, so the first outbound
		// pass already sees a complete table.
		self.drain_to_store().await;
		self.drain_to_remote().await;
		Ok(())
	}

	/// One inbound poll. Serialized by the caller; the loop never lets two
	/// of these overlap.
	pub async fn poll_once(&self) {
		// Store liveness first: a recovery edge replays pending writes via
		// the watcher task before the diff below needs the store.
		match self.shared.store.ping().await {
			Ok(()) => {
				self.shared.store_health.set_online();
			}
			Err(StoreError::Offline(_)) => {
				self.shared.store_health.set_offline();
			}
			Err(StoreError::Data(err)) => warn!(%err, "store probe failed"),
		}

		let current = match self.shared.sheet.read_range().await {
			ReadOutcome::Snapshot(snapshot) => snapshot,
			// Backoff window or transport failure: skip this poll entirely.
			ReadOutcome::RateLimited | ReadOutcome::Unreachable => return,
		};

		let previous = self.shared.snapshot.current().await;
		let changes = diff(&previous, &current);
		if !changes.is_empty() {
			debug!(changes = changes.len(), "inbound changes detected");
		}
		for change in &changes {
			self.apply_remote_change(change).await;
		}

		self.shared.snapshot.replace(current).await;

		// A drain aborted by a quota window leaves no recovery edge behind,
		// so retry leftovers on the poll cadence.
		if self.shared.pending.len(TO_REMOTE).await.unwrap_or(0) > 0
			&& self.shared.remote_health.is_online()
		{
			self.drain_to_remote().await;
		}
	}

	/// Apply one remote-originated change to the store, ignore mark first.
	async fn apply_remote_change(&self, change: &CellChange) {
		if let Err(err) = self.shared.marks.mark(&change.address).await {
			// The origin tag still suppresses the echo if the mark is lost.
			warn!(address = %change.address, %err, "ignore mark failed");
		}

		let result = if change.is_deletion() {
			self.shared.store.delete(change.address).await
		} else {
			self.shared
				.store
				.upsert(change.address, &change.value, Origin::Remote)
				.await
		};

		match result {
			Ok(()) => {}
			Err(StoreError::Offline(_)) => {
				self.shared.store_health.set_offline();
				let pending = PendingChange::new(
					change.address,
					change.value.clone(),
					Origin::Remote,
				);
				if let Err(err) = self.shared.pending.push(TO_STORE, &pending).await {
					warn!(address = %change.address, %err, "failed to queue pending store write");
				}
			}
			Err(StoreError::Data(err)) => {
				// Retrying cannot help; drop the write and keep reconciling.
				warn!(address = %change.address, %err, "store rejected inbound write");
			}
		}
	}

	/// Replay `pending:to-store` head-first; abort on the first offline
	/// failure, requeueing the element at the head.
	pub async fn drain_to_store(&self) {
		let mut replayed = 0usize;
		loop {
			let change = match self.shared.pending.pop(TO_STORE).await {
				Ok(Some(change)) => change,
				Ok(None) => break,
				Err(err) => {
					warn!(%err, "pending store drain interrupted");
					break;
				}
			};
			if change.origin.is_remote() {
				if let Err(err) = self.shared.marks.mark(&change.address).await {
					warn!(address = %change.address, %err, "ignore mark failed during replay");
				}
			}
			let result = if change.value.is_empty() {
				self.shared.store.delete(change.address).await
			} else {
				self.shared
					.store
					.upsert(change.address, &change.value, change.origin.clone())
					.await
			};
			match result {
				Ok(()) => replayed += 1,
				Err(StoreError::Offline(_)) => {
					self.shared.store_health.set_offline();
					if let Err(err) = self.shared.pending.requeue_head(TO_STORE, &change).await {
						warn!(%err, "failed to requeue pending store write");
					}
					break;
				}
				Err(StoreError::Data(err)) => {
					warn!(address = %change.address, %err, "dropping unreplayable store write");
				}
			}
		}
		if replayed > 0 {
			info!(replayed, "pending store writes replayed");
		}
	}

	/// Replay `pending:to-remote` head-first. Idempotent single writes make
	/// duplicate replays safe; successful replays repair echo suppression
	/// the same way an outbound push does.
	pub async fn drain_to_remote(&self) {
		let mut replayed = 0usize;
		loop {
			let change = match self.shared.pending.pop(TO_REMOTE).await {
				Ok(Some(change)) => change,
				Ok(None) => break,
				Err(err) => {
					warn!(%err, "pending remote drain interrupted");
					break;
				}
			};
			match self
				.shared
				.sheet
				.write_single(change.address, change.value.clone())
				.await
			{
				WriteOutcome::Ok => {
					replayed += 1;
					if let Err(err) = self
						.shared
						.store
						.update_origin_if_not_remote(change.address)
						.await
					{
						warn!(address = %change.address, %err, "origin rewrite after replay failed");
					}
					self.shared
						.snapshot
						.apply_pushed(change.address, &change.value)
						.await;
				}
				WriteOutcome::RateLimited | WriteOutcome::Unreachable => {
					if let Err(err) = self.shared.pending.requeue_head(TO_REMOTE, &change).await {
						warn!(%err, "failed to requeue pending remote write");
					}
					break;
				}
			}
		}
		if replayed > 0 {
			info!(replayed, "pending remote writes replayed");
		}
	}

	/// Poll loop plus one recovery watcher per peer.
	pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
		let mut handles = Vec::new();

		// Poller. The first tick fires one full period after bootstrap.
		{
			let this = self.clone();
			let cancel = cancel.clone();
			handles.push(tokio::spawn(async move {
				let start = tokio::time::Instant::now() + this.shared.poll_interval;
				let mut ticks = tokio::time::interval_at(start, this.shared.poll_interval);
				ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
				loop {
					tokio::select! {
						() = cancel.cancelled() => return,
						_ = ticks.tick() => {}
					}
					this.poll_once().await;
				}
			}));
		}

		// Remote recovery → replay pending:to-remote.
		{
			let this = self.clone();
			let cancel = cancel.clone();
			let mut rx = self.shared.remote_health.subscribe();
			handles.push(tokio::spawn(async move {
				loop {
					tokio::select! {
						() = cancel.cancelled() => return,
						changed = rx.changed() => {
							if changed.is_err() {
								return;
							}
						}
					}
					if *rx.borrow_and_update() == PeerStatus::Online {
						this.drain_to_remote().await;
					}
				}
			}));
		}

		// Store recovery → replay pending:to-store.
		{
			let this = self.clone();
			let mut rx = self.shared.store_health.subscribe();
			handles.push(tokio::spawn(async move {
				loop {
					tokio::select! {
						() = cancel.cancelled() => return,
						changed = rx.changed() => {
							if changed.is_err() {
								return;
							}
						}
					}
					if *rx.borrow_and_update() == PeerStatus::Online {
						this.drain_to_store().await;
					}
				}
			}));
		}

		handles
	}
}

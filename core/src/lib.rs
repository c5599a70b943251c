//! Cellbridge core.
//!
//! A continuously reconciled, bidirectional mirror between a remote
//! cell-addressed spreadsheet and a relational cells table. The inbound
//! reconciler polls and diffs remote snapshots into the store; the outbound
//! synchronizer debounces local writes into batch pushes; a shared KV
//! carries the coordination state (per-cell leases, echo-suppression marks,
//! durable pending queues). Resolution is last-writer-wins at cell
//! granularity, with a single active reconciler per mirror.

pub mod config;
pub mod error;
pub mod ignore;
pub mod kv;
pub mod lock;
pub mod outbound;
pub mod peer;
pub mod pending;
pub mod reconciler;
pub mod sheet;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod testing;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use cb_cell::Snapshot;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use cb_cell::{CellAddress, CellValue, Column, Origin, StoredCell};
pub use config::SyncConfig;
pub use error::Error;
pub use status::SyncStatus;
pub use worker::EditJob;

use ignore::IgnoreMarks;
use kv::{KvStore, RedisKv};
use lock::LockService;
use outbound::OutboundSync;
use peer::{PeerHealth, PeerStatus};
use pending::{PendingQueue, TO_REMOTE, TO_STORE};
use reconciler::Reconciler;
use sheet::{HttpSheetApi, SheetApi, SheetClient};
use snapshot::SnapshotCache;
use store::{CellStore, SeaOrmStore};
use worker::WorkerPool;

/// The assembled engine: every component wired to the shared KV, plus the
/// lifecycle state that starts and stops them as one unit.
pub struct Core {
	pub config: SyncConfig,
	sheet: Arc<SheetClient>,
	snapshot: Arc<SnapshotCache>,
	pending: PendingQueue,
	marks: IgnoreMarks,
	remote_health: Arc<PeerHealth>,
	store_health: Arc<PeerHealth>,
	reconciler: Reconciler,
	outbound: OutboundSync,
	workers: WorkerPool,
	/// Raw store handle for the terminal surface; absent when the engine
	/// was assembled over fakes.
	sql: Option<Arc<SeaOrmStore>>,
	cancel: CancellationToken,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
	/// Connect the real backends and assemble the engine.
	///
	/// Bootstrap order: store, KV, remote client, lock service; the
	/// reconciler and worker pool start in [`Core::start`]. Backend
	/// connection failures here are fatal (exit 1 territory) since nothing
	/// can reconcile without the store and the KV.
	pub async fn bootstrap(config: SyncConfig) -> Result<Self, Error> {
		let config = config.normalized();
		config.validate()?;

		let sql = Arc::new(
			SeaOrmStore::connect(&config.store_dsn)
				.await
				.map_err(|err| Error::Fatal(format!("store bootstrap failed: {err}")))?,
		);

		let kv: Arc<dyn KvStore> = Arc::new(
			RedisKv::connect(&config.kv_address)
				.await
				.map_err(|err| Error::Fatal(format!("kv bootstrap failed: {err}")))?,
		);

		if config.remote_api_token.is_empty() {
			// A degraded start still needs a cached snapshot to serve from.
			let cached = kv.get(snapshot::SHEET_KEY).await.ok().flatten().is_some();
			if !cached {
				return Err(Error::Fatal(
					"remote credentials missing and no cached snapshot".into(),
				));
			}
			warn!("remote credentials missing, starting degraded from cached snapshot");
		}

		let api = Arc::new(
			HttpSheetApi::new(
				&config.remote_api_base,
				&config.remote_id,
				&config.remote_api_token,
			)
			.map_err(|err| Error::Fatal(format!("sheet client bootstrap failed: {err}")))?,
		);

		let mut core = Self::assemble(config, kv, api, sql.clone());
		core.sql = Some(sql);
		Ok(core)
	}

	/// Wire the engine over arbitrary backends. Scenario tests assemble
	/// over the in-memory fakes from [`testing`]; production goes through
	/// [`Core::bootstrap`].
	pub fn assemble(
		config: SyncConfig,
		kv: Arc<dyn KvStore>,
		api: Arc<dyn SheetApi>,
		store: Arc<dyn CellStore>,
	) -> Self {
		let remote_health = Arc::new(PeerHealth::new("remote", PeerStatus::Online));
		let store_health = Arc::new(PeerHealth::new("store", PeerStatus::Online));

		let sheet = Arc::new(SheetClient::new(
			api,
			remote_health.clone(),
			config.remote_range.clone(),
			config.sheet_name().to_owned(),
			config.rate_limit_initial_backoff(),
			config.rate_limit_max_backoff(),
		));

		let snapshot = Arc::new(SnapshotCache::new(kv.clone(), config.snapshot_ttl()));
		let pending = PendingQueue::new(kv.clone());
		let marks = IgnoreMarks::new(kv.clone(), config.ignore_mark_ttl());
		let locks = Arc::new(LockService::new(
			kv.clone(),
			config.lease_ttl(),
			config.lock_retry_delay(),
			config.lock_max_attempts,
		));

		let reconciler = Reconciler::new(
			sheet.clone(),
			store.clone(),
			marks.clone(),
			pending.clone(),
			snapshot.clone(),
			remote_health.clone(),
			store_health.clone(),
			config.poll_interval(),
		);

		let outbound = OutboundSync::new(
			store.clone(),
			sheet.clone(),
			snapshot.clone(),
			pending.clone(),
			store_health.clone(),
			config.outbound_debounce(),
		);

		let workers = WorkerPool::new(
			kv.clone(),
			store,
			locks,
			marks.clone(),
			outbound.clone(),
			config.worker_concurrency,
			config.worker_rate_per_min,
		);

		Self {
			config,
			sheet,
			snapshot,
			pending,
			marks,
			remote_health,
			store_health,
			reconciler,
			outbound,
			workers,
			sql: None,
			cancel: CancellationToken::new(),
			tasks: Mutex::new(Vec::new()),
		}
	}

	/// Run the reconciler bootstrap, then start the poller, the outbound
	/// debounce task and the ingress workers.
	pub async fn start(&self) -> Result<(), Error> {
		self.reconciler.bootstrap().await?;

		let mut tasks = self.tasks.lock().await;
		tasks.extend(self.reconciler.spawn(self.cancel.clone()));
		tasks.push(self.outbound.spawn(self.cancel.clone()));
		tasks.extend(self.workers.spawn(self.cancel.clone()));
		info!(
			poll_interval_ms = self.config.poll_interval_ms,
			workers = self.config.worker_concurrency,
			"engine running"
		);
		Ok(())
	}

	/// Mark the table dirty; the outbound synchronizer batches from here.
	pub fn request_sync(&self) {
		self.outbound.request_sync();
	}

	/// Force one outbound pass right now (`POST /force-sync`).
	pub async fn force_sync(&self) {
		self.outbound.force_sync().await;
	}

	/// Validate and enqueue a point edit for the worker pool. Returns
	/// whether the job was queued: an ignore-marked address is skipped
	/// before it ever enters the queue, so a freshly applied remote edit
	/// cannot re-enter through the ingress. The worker consults the mark
	/// again at apply time.
	pub async fn enqueue_edit(&self, job: EditJob) -> Result<bool, Error> {
		CellValue::new(job.value.clone())?;
		if self.marks.is_marked(&job.address).await? {
			debug!(address = %job.address, "ingress edit suppressed by ignore mark");
			return Ok(false);
		}
		self.workers.enqueue(&job).await?;
		Ok(true)
	}

	/// The last-observed remote state, served even while peers are down.
	pub async fn cached_snapshot(&self) -> Snapshot {
		self.snapshot.current().await
	}

	/// Raw store access for the terminal surface, if this engine owns a
	/// real store connection.
	pub fn terminal(&self) -> Option<&Arc<SeaOrmStore>> {
		self.sql.as_ref()
	}

	pub async fn status(&self) -> SyncStatus {
		SyncStatus {
			remote_online: self.remote_health.is_online(),
			store_online: self.store_health.is_online(),
			snapshot_size: self.snapshot.len().await,
			rate_limited: self.sheet.rate_limited().await,
			backoff_ms: self.sheet.backoff_remaining_ms().await,
			pending_to_remote: self.pending.len(TO_REMOTE).await.unwrap_or(0),
			pending_to_store: self.pending.len(TO_STORE).await.unwrap_or(0),
		}
	}

	/// Stop everything: the poller exits within one in-flight call, the
	/// debounce task flushes a dirty table, workers finish their current
	/// job. Each join is bounded so a wedged task cannot hang the process.
	pub async fn shutdown(&self) {
		info!("engine shutting down");
		self.cancel.cancel();

		let tasks = std::mem::take(&mut *self.tasks.lock().await);
		for task in tasks {
			match tokio::time::timeout(Duration::from_secs(15), task).await {
				Ok(Ok(())) => {}
				Ok(Err(err)) if err.is_panic() => warn!("engine task panicked during shutdown"),
				Ok(Err(_)) => {}
				Err(_) => warn!("engine task ignored shutdown deadline, abandoning it"),
			}
		}
		info!("engine stopped");
	}
}

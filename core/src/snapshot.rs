//! The reconciler's shared snapshot state.
//!
//! One structure owns the last-observed remote state and writes it through
//! to the KV (`snapshot:sheet`) so restarts warm-start from it. A second KV
//! key (`snapshot:db`) caches the last good store read for degraded
//! outbound passes. Nothing else holds the underlying map.

use std::sync::Arc;
use std::time::Duration;

use cb_cell::{CellAddress, Snapshot, StoredCell};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::kv::KvStore;

pub const SHEET_KEY: &str = "snapshot:sheet";
pub const DB_KEY: &str = "snapshot:db";

pub struct SnapshotCache {
	kv: Arc<dyn KvStore>,
	ttl: Duration,
	inner: Mutex<Snapshot>,
}

impl SnapshotCache {
	pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
		Self {
			kv,
			ttl,
			inner: Mutex::new(Snapshot::new()),
		}
	}

	pub async fn current(&self) -> Snapshot {
		self.inner.lock().await.clone()
	}

	pub async fn len(&self) -> usize {
		self.inner.lock().await.len()
	}

	/// Warm-start from the persisted snapshot, if one survived.
	pub async fn load_warm(&self) -> bool {
		match self.kv.get(SHEET_KEY).await {
			Ok(Some(raw)) => match serde_json::from_str::<Snapshot>(&raw) {
				Ok(snapshot) => {
					debug!(cells = snapshot.len(), "warm snapshot loaded");
					*self.inner.lock().await = snapshot;
					true
				}
				Err(err) => {
					warn!(%err, "persisted snapshot is unreadable, starting cold");
					false
				}
			},
			Ok(None) => false,
			Err(err) => {
				warn!(%err, "could not load warm snapshot");
				false
			}
		}
	}

	/// Adopt a freshly observed remote state and persist it.
	pub async fn replace(&self, next: Snapshot) {
		self.persist(&next).await;
		*self.inner.lock().await = next;
	}

	/// Echo-suppression write-through: after a successful outbound push the
	/// snapshot must already agree with the sheet, so the next poll cannot
	/// mistake our own push for an incoming edit.
	pub async fn apply_pushed(&self, address: CellAddress, value: &str) {
		let mut inner = self.inner.lock().await;
		if value.is_empty() {
			inner.remove(&address);
		} else {
			inner.insert(address, value.to_owned());
		}
		let snapshot = inner.clone();
		drop(inner);
		self.persist(&snapshot).await;
	}

	/// Batch form of [`Self::apply_pushed`]; one persist for the whole push.
	pub async fn apply_pushed_many(&self, pushes: &[(CellAddress, String)]) {
		let mut inner = self.inner.lock().await;
		for (address, value) in pushes {
			if value.is_empty() {
				inner.remove(address);
			} else {
				inner.insert(*address, value.clone());
			}
		}
		let snapshot = inner.clone();
		drop(inner);
		self.persist(&snapshot).await;
	}

	async fn persist(&self, snapshot: &Snapshot) {
		match serde_json::to_string(snapshot) {
			Ok(encoded) => {
				if let Err(err) = self.kv.set_ex(SHEET_KEY, &encoded, self.ttl).await {
					warn!(%err, "snapshot persist failed, continuing in memory");
				}
			}
			Err(err) => warn!(%err, "snapshot encode failed"),
		}
	}

	/// Cache the last good store read for degraded outbound passes.
	pub async fn persist_db_view(&self, cells: &[StoredCell]) {
		match serde_json::to_string(cells) {
			Ok(encoded) => {
				if let Err(err) = self.kv.set_ex(DB_KEY, &encoded, self.ttl).await {
					warn!(%err, "store-side snapshot persist failed");
				}
			}
			Err(err) => warn!(%err, "store-side snapshot encode failed"),
		}
	}

	/// Degraded read of the store-side cache.
	pub async fn load_db_view(&self) -> Option<Vec<StoredCell>> {
		match self.kv.get(DB_KEY).await {
			Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
			_ => None,
		}
	}
}

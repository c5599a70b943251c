//! Engine status, as exposed over the control surface.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
	pub remote_online: bool,
	pub store_online: bool,
	pub snapshot_size: usize,
	pub rate_limited: bool,
	pub backoff_ms: u64,
	pub pending_to_remote: u64,
	pub pending_to_store: u64,
}

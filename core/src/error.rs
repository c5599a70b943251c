//! Engine-level error kinds.
//!
//! The I/O clients translate their native failures into these kinds at the
//! boundary; nothing above a client ever sees a wire-level error. The
//! reconciler only distinguishes rate-limit and offline kinds from the rest.

use cb_cell::{CellAddress, CellError};
use thiserror::Error;

use crate::kv::KvError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum Error {
	/// Remote quota exceeded; handled by silent backoff, never user-facing.
	#[error("remote peer is rate limited")]
	RateLimited,

	/// Connectivity to the remote sheet lost.
	#[error("remote peer is offline")]
	OfflineRemote,

	/// Connectivity to the relational store lost.
	#[error("store peer is offline")]
	OfflineStore,

	/// Lease denied after the full retry schedule.
	#[error("cell {0} is locked by another writer")]
	Contention(CellAddress),

	/// Malformed input at an ingress; never reaches the core loops.
	#[error("validation failed: {0}")]
	Validation(String),

	/// Constraint or integrity failure; the offending write is dropped.
	#[error("data error: {0}")]
	Data(String),

	#[error("shared KV error: {0}")]
	Kv(#[from] KvError),

	/// Unrecoverable; the process exits with code 1.
	#[error("fatal: {0}")]
	Fatal(String),
}

impl From<CellError> for Error {
	fn from(err: CellError) -> Self {
		Self::Validation(err.to_string())
	}
}

impl From<StoreError> for Error {
	fn from(err: StoreError) -> Self {
		match err {
			StoreError::Offline(_) => Self::OfflineStore,
			StoreError::Data(message) => Self::Data(message),
		}
	}
}

impl Error {
	pub fn is_offline_store(&self) -> bool {
		matches!(self, Self::OfflineStore)
	}

	pub fn is_offline_remote(&self) -> bool {
		matches!(self, Self::OfflineRemote)
	}
}

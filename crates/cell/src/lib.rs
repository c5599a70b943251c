//! Cell-level vocabulary shared by the sheet and store sides of the bridge.
//!
//! Everything that both peers have to agree on lives here: validated cell
//! addresses, origin tags, the snapshot map and its diff. The crate is
//! deliberately free of I/O so the engine and its tests share one source of
//! truth for addressing rules.

pub mod address;
pub mod origin;
pub mod snapshot;

pub use address::{CellAddress, CellError, CellValue, Column, MAX_COL, MAX_ROW};
pub use origin::Origin;
pub use snapshot::{diff, CellChange, Snapshot};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single row of the relational cells table.
///
/// The store enforces at most one `StoredCell` per address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCell {
	pub address: CellAddress,
	pub value: String,
	pub origin: Origin,
	pub updated_at: DateTime<Utc>,
}

impl StoredCell {
	/// Absent and empty collapse at the store layer.
	pub fn is_empty(&self) -> bool {
		self.value.is_empty()
	}
}

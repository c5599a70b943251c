//! Snapshots and the change-detection diff.
//!
//! A [`Snapshot`] is the reconciler's last-observed remote state: a map from
//! cell address to value. Diffing two snapshots yields the changes that
//! turned the first into the second, where an empty value means deletion.

use std::collections::btree_map;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::address::CellAddress;

/// One detected change; `value.is_empty()` signals a deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellChange {
	pub address: CellAddress,
	pub value: String,
}

impl CellChange {
	pub fn is_deletion(&self) -> bool {
		self.value.is_empty()
	}
}

/// Address → value map with deterministic iteration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<CellAddress, String>);

impl Snapshot {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, address: &CellAddress) -> Option<&str> {
		self.0.get(address).map(String::as_str)
	}

	pub fn insert(&mut self, address: CellAddress, value: String) {
		self.0.insert(address, value);
	}

	pub fn remove(&mut self, address: &CellAddress) {
		self.0.remove(address);
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> btree_map::Iter<'_, CellAddress, String> {
		self.0.iter()
	}
}

impl FromIterator<(CellAddress, String)> for Snapshot {
	fn from_iter<I: IntoIterator<Item = (CellAddress, String)>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl<'a> IntoIterator for &'a Snapshot {
	type Item = (&'a CellAddress, &'a String);
	type IntoIter = btree_map::Iter<'a, CellAddress, String>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.iter()
	}
}

/// Changes that turn `prev` into `next`.
///
/// A value present in `next` but equal to the empty string is treated the
/// same as an absent one, so trailing cells a range read dropped never show
/// up as phantom edits. The result depends only on map contents, not on
/// iteration order, and is itself ordered by address.
pub fn diff(prev: &Snapshot, next: &Snapshot) -> Vec<CellChange> {
	let mut changes = Vec::new();

	for (address, value) in next {
		if value.is_empty() {
			continue; // handled by the deletion pass
		}
		if prev.get(address).unwrap_or("") != value {
			changes.push(CellChange {
				address: *address,
				value: value.clone(),
			});
		}
	}

	for (address, value) in prev {
		if value.is_empty() {
			continue;
		}
		if next.get(address).map_or(true, str::is_empty) {
			changes.push(CellChange {
				address: *address,
				value: String::new(),
			});
		}
	}

	changes.sort_by_key(|change| change.address);
	changes
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::address::Column;

	fn addr(row: u32, col: char) -> CellAddress {
		CellAddress::new(row, Column::from_letter(col).unwrap()).unwrap()
	}

	fn snapshot(cells: &[(u32, char, &str)]) -> Snapshot {
		cells
			.iter()
			.map(|&(row, col, value)| (addr(row, col), value.to_string()))
			.collect()
	}

	#[test]
	fn identical_snapshots_diff_empty() {
		let s = snapshot(&[(1, 'A', "x"), (3, 'B', "Hello")]);
		assert_eq!(diff(&s, &s), vec![]);
	}

	#[test]
	fn detects_updates_and_inserts() {
		let prev = snapshot(&[(1, 'A', "x")]);
		let next = snapshot(&[(1, 'A', "y"), (3, 'B', "Hello")]);
		assert_eq!(
			diff(&prev, &next),
			vec![
				CellChange {
					address: addr(1, 'A'),
					value: "y".into()
				},
				CellChange {
					address: addr(3, 'B'),
					value: "Hello".into()
				},
			]
		);
	}

	#[test]
	fn absent_and_explicit_empty_both_delete() {
		let prev = snapshot(&[(1, 'A', "x"), (2, 'B', "y")]);
		let next = snapshot(&[(2, 'B', "")]);
		let changes = diff(&prev, &next);
		assert_eq!(changes.len(), 2);
		assert!(changes.iter().all(CellChange::is_deletion));
	}

	#[test]
	fn empty_cells_never_produce_phantom_edits() {
		let prev = snapshot(&[(1, 'A', "")]);
		let next = snapshot(&[]);
		assert_eq!(diff(&prev, &next), vec![]);
		assert_eq!(diff(&next, &prev), vec![]);
	}

	#[test]
	fn depends_only_on_contents() {
		// Build the same logical snapshot by inserting in opposite orders.
		let mut forward = Snapshot::new();
		let mut backward = Snapshot::new();
		let cells = [(1, 'A', "1"), (5, 'C', "2"), (9, 'Z', "3")];
		for &(row, col, value) in &cells {
			forward.insert(addr(row, col), value.into());
		}
		for &(row, col, value) in cells.iter().rev() {
			backward.insert(addr(row, col), value.into());
		}
		let target = snapshot(&[(1, 'A', "1"), (9, 'Z', "4")]);
		assert_eq!(diff(&forward, &target), diff(&backward, &target));
	}
}

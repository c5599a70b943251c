//! In-memory fakes for the three capability seams.
//!
//! Unit and scenario tests run the real engine against these: a KV with
//! real TTL semantics (driven by the tokio clock, so paused-time tests
//! work), a sheet that stores a dense grid behind toggleable failure modes,
//! and a cells table in a map. Production code never constructs them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cb_cell::{CellAddress, Column, Origin, StoredCell};
use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;

use crate::kv::{KvError, KvStore};
use crate::sheet::{SheetApi, SheetError};
use crate::store::{CellStore, StoreError};

// ---- KV ----

struct Entry {
	value: String,
	expires_at: Option<Instant>,
}

impl Entry {
	fn live(&self) -> bool {
		self.expires_at.map_or(true, |at| Instant::now() < at)
	}
}

#[derive(Default)]
pub struct MemoryKv {
	entries: Mutex<HashMap<String, Entry>>,
	lists: Mutex<HashMap<String, VecDeque<String>>>,
	unavailable: AtomicBool,
}

impl MemoryKv {
	pub fn set_unavailable(&self, unavailable: bool) {
		self.unavailable.store(unavailable, Ordering::SeqCst);
	}

	fn check(&self) -> Result<(), KvError> {
		if self.unavailable.load(Ordering::SeqCst) {
			Err(KvError::Unavailable("fake kv is down".into()))
		} else {
			Ok(())
		}
	}
}

#[async_trait]
impl KvStore for MemoryKv {
	async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
		self.check()?;
		let mut entries = self.entries.lock().unwrap();
		if entries.get(key).is_some_and(Entry::live) {
			return Ok(false);
		}
		entries.insert(
			key.to_owned(),
			Entry {
				value: value.to_owned(),
				expires_at: Some(Instant::now() + ttl),
			},
		);
		Ok(true)
	}

	async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
		self.check()?;
		self.entries.lock().unwrap().insert(
			key.to_owned(),
			Entry {
				value: value.to_owned(),
				expires_at: Some(Instant::now() + ttl),
			},
		);
		Ok(())
	}

	async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
		self.check()?;
		Ok(self
			.entries
			.lock()
			.unwrap()
			.get(key)
			.filter(|entry| entry.live())
			.map(|entry| entry.value.clone()))
	}

	async fn exists(&self, key: &str) -> Result<bool, KvError> {
		Ok(self.get(key).await?.is_some())
	}

	async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError> {
		self.check()?;
		let mut entries = self.entries.lock().unwrap();
		let matches = entries
			.get(key)
			.is_some_and(|entry| entry.live() && entry.value == expected);
		if matches {
			entries.remove(key);
		}
		Ok(matches)
	}

	async fn rpush(&self, key: &str, value: &str) -> Result<(), KvError> {
		self.check()?;
		self.lists
			.lock()
			.unwrap()
			.entry(key.to_owned())
			.or_default()
			.push_back(value.to_owned());
		Ok(())
	}

	async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError> {
		self.check()?;
		self.lists
			.lock()
			.unwrap()
			.entry(key.to_owned())
			.or_default()
			.push_front(value.to_owned());
		Ok(())
	}

	async fn lpop(&self, key: &str) -> Result<Option<String>, KvError> {
		self.check()?;
		Ok(self
			.lists
			.lock()
			.unwrap()
			.get_mut(key)
			.and_then(VecDeque::pop_front))
	}

	async fn llen(&self, key: &str) -> Result<u64, KvError> {
		self.check()?;
		Ok(self
			.lists
			.lock()
			.unwrap()
			.get(key)
			.map_or(0, |list| list.len() as u64))
	}
}

// ---- Sheet ----

#[derive(Default)]
pub struct FakeSheetApi {
	cells: Mutex<BTreeMap<(u32, usize), String>>,
	rate_limited: AtomicBool,
	unreachable: AtomicBool,
	fetch_calls: AtomicUsize,
	update_calls: AtomicUsize,
}

impl FakeSheetApi {
	pub fn set_rate_limited(&self, on: bool) {
		self.rate_limited.store(on, Ordering::SeqCst);
	}

	pub fn set_unreachable(&self, on: bool) {
		self.unreachable.store(on, Ordering::SeqCst);
	}

	pub fn fetch_calls(&self) -> usize {
		self.fetch_calls.load(Ordering::SeqCst)
	}

	pub fn update_calls(&self) -> usize {
		self.update_calls.load(Ordering::SeqCst)
	}

	/// Edit a cell directly, as a remote user would.
	pub fn set_cell(&self, address: &CellAddress, value: &str) {
		let key = (address.row(), address.col().index());
		let mut cells = self.cells.lock().unwrap();
		if value.is_empty() {
			cells.remove(&key);
		} else {
			cells.insert(key, value.to_owned());
		}
	}

	/// Read back a cell by its A1 form, e.g. `cell("Sheet1", "B3")`.
	pub fn cell(&self, _sheet: &str, a1: &str) -> Option<String> {
		let (row, col) = parse_a1(a1)?;
		self.cells
			.lock()
			.unwrap()
			.get(&(row, col.index()))
			.cloned()
	}

	fn gate(&self) -> Result<(), SheetError> {
		if self.unreachable.load(Ordering::SeqCst) {
			return Err(SheetError::Unreachable("fake transport down".into()));
		}
		if self.rate_limited.load(Ordering::SeqCst) {
			return Err(SheetError::RateLimited);
		}
		Ok(())
	}
}

fn parse_a1(a1: &str) -> Option<(u32, Column)> {
	let mut chars = a1.chars();
	let col = Column::from_letter(chars.next()?).ok()?;
	let row = chars.as_str().parse().ok()?;
	Some((row, col))
}

#[async_trait]
impl SheetApi for FakeSheetApi {
	async fn fetch_range(&self, _range: &str) -> Result<Vec<Vec<Value>>, SheetError> {
		self.fetch_calls.fetch_add(1, Ordering::SeqCst);
		self.gate()?;

		let cells = self.cells.lock().unwrap();
		let max_row = cells.keys().map(|&(row, _)| row).max().unwrap_or(0);
		let mut rows: Vec<Vec<Value>> = Vec::with_capacity(max_row as usize);
		for row in 1..=max_row {
			let max_col = cells
				.range((row, 0)..(row + 1, 0))
				.map(|(&(_, col), _)| col)
				.max();
			let mut dense = Vec::new();
			if let Some(max_col) = max_col {
				for col in 0..=max_col {
					let value = cells.get(&(row, col)).cloned().unwrap_or_default();
					dense.push(Value::String(value));
				}
			}
			rows.push(dense);
		}
		Ok(rows)
	}

	async fn update_cells(&self, updates: &[(String, String)]) -> Result<(), SheetError> {
		self.update_calls.fetch_add(1, Ordering::SeqCst);
		self.gate()?;

		let mut cells = self.cells.lock().unwrap();
		for (range, value) in updates {
			let a1 = range.rsplit_once('!').map_or(range.as_str(), |(_, a1)| a1);
			let Some((row, col)) = parse_a1(a1) else {
				return Err(SheetError::Api {
					status: 400,
					message: format!("bad range {range:?}"),
				});
			};
			if value.is_empty() {
				cells.remove(&(row, col.index()));
			} else {
				cells.insert((row, col.index()), value.clone());
			}
		}
		Ok(())
	}
}

// ---- Store ----

#[derive(Default)]
pub struct MemoryStore {
	cells: Mutex<BTreeMap<CellAddress, StoredCell>>,
	offline: AtomicBool,
}

impl MemoryStore {
	pub fn set_offline(&self, offline: bool) {
		self.offline.store(offline, Ordering::SeqCst);
	}

	pub fn cell(&self, address: &CellAddress) -> Option<StoredCell> {
		self.cells.lock().unwrap().get(address).cloned()
	}

	pub fn len(&self) -> usize {
		self.cells.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn seed(&self, address: CellAddress, value: &str, origin: Origin) {
		self.cells.lock().unwrap().insert(
			address,
			StoredCell {
				address,
				value: value.to_owned(),
				origin,
				updated_at: Utc::now(),
			},
		);
	}

	fn check(&self) -> Result<(), StoreError> {
		if self.offline.load(Ordering::SeqCst) {
			Err(StoreError::Offline("fake store is down".into()))
		} else {
			Ok(())
		}
	}
}

#[async_trait]
impl CellStore for MemoryStore {
	async fn read_all(&self) -> Result<Vec<StoredCell>, StoreError> {
		self.check()?;
		Ok(self.cells.lock().unwrap().values().cloned().collect())
	}

	async fn upsert(
		&self,
		address: CellAddress,
		value: &str,
		origin: Origin,
	) -> Result<(), StoreError> {
		self.check()?;
		self.cells.lock().unwrap().insert(
			address,
			StoredCell {
				address,
				value: value.to_owned(),
				origin,
				updated_at: Utc::now(),
			},
		);
		Ok(())
	}

	async fn delete(&self, address: CellAddress) -> Result<(), StoreError> {
		self.check()?;
		self.cells.lock().unwrap().remove(&address);
		Ok(())
	}

	async fn update_origin_if_not_remote(&self, address: CellAddress) -> Result<(), StoreError> {
		self.check()?;
		if let Some(cell) = self.cells.lock().unwrap().get_mut(&address) {
			if !cell.origin.is_remote() {
				cell.origin = Origin::Remote;
				cell.updated_at = Utc::now();
			}
		}
		Ok(())
	}

	async fn ping(&self) -> Result<(), StoreError> {
		self.check()
	}
}

//! Remote sheet client.
//!
//! [`SheetApi`] is the thin transport seam (range read + batch update);
//! [`SheetClient`] owns everything stateful on top of it: quota backoff,
//! offline detection, and the flattening of dense 2-D value arrays into a
//! [`Snapshot`]. No other component talks to the sheet, so the rate-limit
//! schedule kept here cannot be bypassed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cb_cell::{CellAddress, Column, Snapshot};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::peer::PeerHealth;

#[derive(Error, Debug)]
pub enum SheetError {
	/// Quota exceeded; the caller backs off, nobody above sees a failure.
	#[error("sheet quota exceeded")]
	RateLimited,
	#[error("sheet unreachable: {0}")]
	Unreachable(String),
	#[error("sheet api error {status}: {message}")]
	Api { status: u16, message: String },
}

#[async_trait]
pub trait SheetApi: Send + Sync {
	/// Dense row-major values for an A1 range.
	async fn fetch_range(&self, range: &str) -> Result<Vec<Vec<Value>>, SheetError>;

	/// Batch update of `(A1 range, value)` pairs. All-or-nothing.
	async fn update_cells(&self, updates: &[(String, String)]) -> Result<(), SheetError>;
}

pub struct HttpSheetApi {
	http: reqwest::Client,
	base: String,
	spreadsheet_id: String,
	token: String,
}

impl HttpSheetApi {
	pub fn new(base: &str, spreadsheet_id: &str, token: &str) -> Result<Self, SheetError> {
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(10))
			.build()
			.map_err(|e| SheetError::Unreachable(e.to_string()))?;
		Ok(Self {
			http,
			base: base.trim_end_matches('/').to_string(),
			spreadsheet_id: spreadsheet_id.to_string(),
			token: token.to_string(),
		})
	}
}

fn classify(err: reqwest::Error) -> SheetError {
	if err.is_timeout() || err.is_connect() {
		SheetError::Unreachable(err.to_string())
	} else {
		SheetError::Api {
			status: err.status().map_or(0, |s| s.as_u16()),
			message: err.to_string(),
		}
	}
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SheetError> {
	let status = response.status();
	if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
		return Err(SheetError::RateLimited);
	}
	if !status.is_success() {
		let message = response.text().await.unwrap_or_default();
		return Err(SheetError::Api {
			status: status.as_u16(),
			message,
		});
	}
	Ok(response)
}

#[async_trait]
impl SheetApi for HttpSheetApi {
	async fn fetch_range(&self, range: &str) -> Result<Vec<Vec<Value>>, SheetError> {
		let url = format!("{}/{}/values/{range}", self.base, self.spreadsheet_id);
		let response = self
			.http
			.get(url)
			.bearer_auth(&self.token)
			.send()
			.await
			.map_err(classify)?;
		let body: Value = check_status(response)
			.await?
			.json()
			.await
			.map_err(classify)?;

		let rows = body
			.get("values")
			.and_then(Value::as_array)
			.cloned()
			.unwrap_or_default();
		rows.into_iter()
			.map(|row| {
				row.as_array().cloned().ok_or(SheetError::Api {
					status: 200,
					message: "range response row is not an array".into(),
				})
			})
			.collect()
	}

	async fn update_cells(&self, updates: &[(String, String)]) -> Result<(), SheetError> {
		let url = format!("{}/{}/values:batchUpdate", self.base, self.spreadsheet_id);
		let data: Vec<Value> = updates
			.iter()
			.map(|(range, value)| json!({ "range": range, "values": [[value]] }))
			.collect();
		let response = self
			.http
			.post(url)
			.bearer_auth(&self.token)
			.json(&json!({ "valueInputOption": "RAW", "data": data }))
			.send()
			.await
			.map_err(classify)?;
		check_status(response).await?;
		Ok(())
	}
}

#[derive(Debug)]
pub enum ReadOutcome {
	Snapshot(Snapshot),
	RateLimited,
	Unreachable,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
	Ok,
	RateLimited,
	Unreachable,
}

struct Backoff {
	current: Duration,
	until: Option<Instant>,
	in_episode: bool,
}

pub struct SheetClient {
	api: Arc<dyn SheetApi>,
	remote: Arc<PeerHealth>,
	range: String,
	sheet_name: String,
	initial_backoff: Duration,
	max_backoff: Duration,
	backoff: Mutex<Backoff>,
}

impl SheetClient {
	pub fn new(
		api: Arc<dyn SheetApi>,
		remote: Arc<PeerHealth>,
		range: String,
		sheet_name: String,
		initial_backoff: Duration,
		max_backoff: Duration,
	) -> Self {
		Self {
			api,
			remote,
			range,
			sheet_name,
			initial_backoff,
			max_backoff,
			backoff: Mutex::new(Backoff {
				current: initial_backoff,
				until: None,
				in_episode: false,
			}),
		}
	}

	/// Whether a backoff window is currently active.
	pub async fn rate_limited(&self) -> bool {
		self.backoff
			.lock()
			.await
			.until
			.is_some_and(|until| Instant::now() < until)
	}

	/// Milliseconds left in the active backoff window, if any.
	pub async fn backoff_remaining_ms(&self) -> u64 {
		self.backoff
			.lock()
			.await
			.until
			.map_or(0, |until| {
				until.saturating_duration_since(Instant::now()).as_millis() as u64
			})
	}

	pub async fn read_range(&self) -> ReadOutcome {
		if self.rate_limited().await {
			// Inside the window: no I/O, no logging.
			return ReadOutcome::RateLimited;
		}
		match self.api.fetch_range(&self.range).await {
			Ok(rows) => {
				self.note_success().await;
				ReadOutcome::Snapshot(snapshot_from_rows(&rows))
			}
			Err(SheetError::RateLimited) => {
				self.note_rate_limited().await;
				ReadOutcome::RateLimited
			}
			Err(SheetError::Unreachable(reason)) => {
				self.note_unreachable(&reason);
				ReadOutcome::Unreachable
			}
			Err(SheetError::Api { status, message }) => {
				warn!(status, %message, "sheet range read rejected");
				self.remote.set_offline();
				ReadOutcome::Unreachable
			}
		}
	}

	pub async fn write_batch(&self, batch: &[(CellAddress, String)]) -> WriteOutcome {
		if batch.is_empty() {
			return WriteOutcome::Ok;
		}
		if self.rate_limited().await {
			return WriteOutcome::RateLimited;
		}
		let updates: Vec<(String, String)> = batch
			.iter()
			.map(|(address, value)| {
				(
					format!("{}!{}", self.sheet_name, address.a1()),
					value.clone(),
				)
			})
			.collect();
		match self.api.update_cells(&updates).await {
			Ok(()) => {
				self.note_success().await;
				WriteOutcome::Ok
			}
			Err(SheetError::RateLimited) => {
				self.note_rate_limited().await;
				WriteOutcome::RateLimited
			}
			Err(SheetError::Unreachable(reason)) => {
				self.note_unreachable(&reason);
				WriteOutcome::Unreachable
			}
			Err(SheetError::Api { status, message }) => {
				warn!(status, %message, "sheet batch update rejected");
				self.remote.set_offline();
				WriteOutcome::Unreachable
			}
		}
	}

	pub async fn write_single(&self, address: CellAddress, value: String) -> WriteOutcome {
		self.write_batch(&[(address, value)]).await
	}

	async fn note_success(&self) {
		let mut backoff = self.backoff.lock().await;
		if backoff.in_episode {
			info!("rate-limit backoff over, resuming normal traffic");
		}
		backoff.current = self.initial_backoff;
		backoff.until = None;
		backoff.in_episode = false;
		drop(backoff);
		self.remote.set_online();
	}

	async fn note_rate_limited(&self) {
		let mut backoff = self.backoff.lock().await;
		backoff.current = (backoff.current * 2).min(self.max_backoff);
		backoff.until = Some(Instant::now() + backoff.current);
		if !backoff.in_episode {
			backoff.in_episode = true;
			info!(
				backoff_ms = backoff.current.as_millis() as u64,
				"sheet quota exceeded, entering backoff"
			);
		}
	}

	fn note_unreachable(&self, reason: &str) {
		if self.remote.set_offline() {
			debug!(%reason, "sheet transport failure");
		}
	}
}

/// Flatten a dense row-major values array into a snapshot.
///
/// Cell `(r, c)` of the array maps to row `r + 1` and column letter `c`.
/// Empty strings and trailing gaps both end up absent, so a shrunken read
/// never manufactures edits. Scalars that are not strings are stringified
/// with their JSON rendering; nulls and nested values are skipped.
fn snapshot_from_rows(rows: &[Vec<Value>]) -> Snapshot {
	let mut snapshot = Snapshot::new();
	for (row_index, row) in rows.iter().enumerate() {
		for (col_index, value) in row.iter().enumerate() {
			let Some(col) = Column::from_index(col_index) else {
				break;
			};
			let Ok(address) = CellAddress::new(row_index as u32 + 1, col) else {
				break;
			};
			let text = match value {
				Value::String(s) => s.clone(),
				Value::Number(n) => n.to_string(),
				Value::Bool(b) => b.to_string(),
				Value::Null | Value::Array(_) | Value::Object(_) => continue,
			};
			if text.is_empty() {
				continue;
			}
			snapshot.insert(address, text);
		}
	}
	snapshot
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::peer::PeerStatus;
	use crate::testing::FakeSheetApi;

	fn client(api: Arc<FakeSheetApi>) -> SheetClient {
		SheetClient::new(
			api,
			Arc::new(PeerHealth::new("remote", PeerStatus::Online)),
			"Sheet1!A1:H20".into(),
			"Sheet1".into(),
			Duration::from_secs(5),
			Duration::from_secs(60),
		)
	}

	fn addr(row: u32, col: char) -> CellAddress {
		CellAddress::new(row, Column::from_letter(col).unwrap()).unwrap()
	}

	#[test]
	fn flattening_maps_indices_to_addresses() {
		let rows = vec![
			vec![json!("a"), json!(""), json!("c")],
			vec![],
			vec![json!(42), json!(true), json!(null), json!({"x": 1})],
		];
		let snapshot = snapshot_from_rows(&rows);
		assert_eq!(snapshot.get(&addr(1, 'A')), Some("a"));
		assert_eq!(snapshot.get(&addr(1, 'B')), None);
		assert_eq!(snapshot.get(&addr(1, 'C')), Some("c"));
		assert_eq!(snapshot.get(&addr(3, 'A')), Some("42"));
		assert_eq!(snapshot.get(&addr(3, 'B')), Some("true"));
		assert_eq!(snapshot.get(&addr(3, 'C')), None);
		assert_eq!(snapshot.len(), 4);
	}

	#[tokio::test]
	async fn backoff_window_short_circuits_io() {
		tokio::time::pause();
		let api = Arc::new(FakeSheetApi::default());
		let client = client(api.clone());

		api.set_rate_limited(true);
		assert!(matches!(client.read_range().await, ReadOutcome::RateLimited));
		let calls_after_entry = api.fetch_calls();

		// Every read inside the window answers without touching the API.
		for _ in 0..5 {
			assert!(matches!(client.read_range().await, ReadOutcome::RateLimited));
		}
		assert_eq!(api.fetch_calls(), calls_after_entry);

		// Window expires, quota recovered: traffic resumes.
		api.set_rate_limited(false);
		tokio::time::advance(Duration::from_secs(11)).await;
		assert!(matches!(client.read_range().await, ReadOutcome::Snapshot(_)));
		assert!(!client.rate_limited().await);
	}

	#[tokio::test]
	async fn backoff_doubles_and_caps() {
		tokio::time::pause();
		let api = Arc::new(FakeSheetApi::default());
		let client = client(api.clone());
		api.set_rate_limited(true);

		let mut expected = Duration::from_secs(5);
		for _ in 0..6 {
			client.read_range().await;
			expected = (expected * 2).min(Duration::from_secs(60));
			assert_eq!(client.backoff.lock().await.current, expected);
			tokio::time::advance(expected + Duration::from_millis(1)).await;
		}
		// Capped at the maximum from here on.
		client.read_range().await;
		assert_eq!(client.backoff.lock().await.current, Duration::from_secs(60));
	}

	#[tokio::test]
	async fn unreachable_flips_the_peer_offline_and_back() {
		let api = Arc::new(FakeSheetApi::default());
		let remote = Arc::new(PeerHealth::new("remote", PeerStatus::Online));
		let client = SheetClient::new(
			api.clone(),
			remote.clone(),
			"Sheet1!A1:H20".into(),
			"Sheet1".into(),
			Duration::from_secs(5),
			Duration::from_secs(60),
		);

		api.set_unreachable(true);
		assert!(matches!(client.read_range().await, ReadOutcome::Unreachable));
		assert!(!remote.is_online());

		api.set_unreachable(false);
		assert!(matches!(client.read_range().await, ReadOutcome::Snapshot(_)));
		assert!(remote.is_online());
	}

	#[tokio::test]
	async fn writes_use_a1_ranges() {
		let api = Arc::new(FakeSheetApi::default());
		let client = client(api.clone());
		let outcome = client
			.write_batch(&[(addr(3, 'B'), "Hello".into()), (addr(4, 'D'), String::new())])
			.await;
		assert_eq!(outcome, WriteOutcome::Ok);
		assert_eq!(api.cell("Sheet1", "B3"), Some("Hello".into()));
		// Pushing the empty string blanks the cell.
		assert_eq!(api.cell("Sheet1", "D4"), None);
	}
}

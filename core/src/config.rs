//! Engine configuration.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;

/// Polls faster than this would hammer the remote quota; lower configured
/// values are clamped up silently.
pub const MIN_POLL_INTERVAL_MS: u64 = 3_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
	/// Inbound poll period in milliseconds, clamped to at least 3000.
	#[serde(default = "default_poll_interval_ms", alias = "pollIntervalMs")]
	pub poll_interval_ms: u64,

	/// A1 range the reconciler mirrors.
	#[serde(default = "default_remote_range", alias = "remoteRange")]
	pub remote_range: String,

	#[serde(default = "default_lease_ttl_sec", alias = "leaseTtlSec")]
	pub lease_ttl_sec: u64,

	#[serde(default = "default_lock_retry_delay_ms", alias = "lockRetryDelayMs")]
	pub lock_retry_delay_ms: u64,

	#[serde(default = "default_lock_max_attempts", alias = "lockMaxAttempts")]
	pub lock_max_attempts: u32,

	#[serde(default = "default_ignore_mark_ttl_sec", alias = "ignoreMarkTtlSec")]
	pub ignore_mark_ttl_sec: u64,

	#[serde(default = "default_snapshot_ttl_sec", alias = "snapshotTtlSec")]
	pub snapshot_ttl_sec: u64,

	#[serde(default = "default_outbound_debounce_ms", alias = "outboundDebounceMs")]
	pub outbound_debounce_ms: u64,

	#[serde(
		default = "default_rate_limit_initial_backoff_ms",
		alias = "rateLimitInitialBackoffMs"
	)]
	pub rate_limit_initial_backoff_ms: u64,

	#[serde(
		default = "default_rate_limit_max_backoff_ms",
		alias = "rateLimitMaxBackoffMs"
	)]
	pub rate_limit_max_backoff_ms: u64,

	/// Identifier of the remote spreadsheet.
	#[serde(default, alias = "remoteId")]
	pub remote_id: String,

	/// Base URL of the remote sheet API.
	#[serde(default = "default_remote_api_base", alias = "remoteApiBase")]
	pub remote_api_base: String,

	/// Bearer token for the remote sheet API.
	#[serde(default, alias = "remoteApiToken")]
	pub remote_api_token: String,

	/// Relational store DSN, e.g. `postgres://` or `sqlite://`.
	#[serde(default, alias = "storeDsn")]
	pub store_dsn: String,

	/// Shared KV address, e.g. `redis://127.0.0.1:6379`.
	#[serde(default = "default_kv_address", alias = "kvAddress")]
	pub kv_address: String,

	/// Ingress worker fan-out.
	#[serde(default = "default_worker_concurrency", alias = "workerConcurrency")]
	pub worker_concurrency: usize,

	/// Ingress consumption ceiling, jobs per minute.
	#[serde(default = "default_worker_rate_per_min", alias = "workerRatePerMin")]
	pub worker_rate_per_min: u32,

	/// Bind address of the HTTP control surface.
	#[serde(default = "default_http_addr", alias = "httpAddr")]
	pub http_addr: String,
}

fn default_poll_interval_ms() -> u64 {
	MIN_POLL_INTERVAL_MS
}

fn default_remote_range() -> String {
	"Sheet1!A1:H20".to_string()
}

fn default_lease_ttl_sec() -> u64 {
	5
}

fn default_lock_retry_delay_ms() -> u64 {
	200
}

fn default_lock_max_attempts() -> u32 {
	15
}

fn default_ignore_mark_ttl_sec() -> u64 {
	10
}

fn default_snapshot_ttl_sec() -> u64 {
	86_400
}

fn default_outbound_debounce_ms() -> u64 {
	500
}

fn default_rate_limit_initial_backoff_ms() -> u64 {
	5_000
}

fn default_rate_limit_max_backoff_ms() -> u64 {
	60_000
}

fn default_remote_api_base() -> String {
	"https://sheets.googleapis.com/v4/spreadsheets".to_string()
}

fn default_kv_address() -> String {
	"redis://127.0.0.1:6379".to_string()
}

fn default_worker_concurrency() -> usize {
	5
}

fn default_worker_rate_per_min() -> u32 {
	55
}

fn default_http_addr() -> String {
	"0.0.0.0:8080".to_string()
}

impl Default for SyncConfig {
	fn default() -> Self {
		serde_json::from_str("{}").expect("defaults are total")
	}
}

impl SyncConfig {
	/// Load the optional JSON config file (`CELLBRIDGE_CONFIG`), then apply
	/// `CELLBRIDGE_*` environment overrides on top.
	pub fn from_env() -> Result<Self, Error> {
		let mut config = match env::var("CELLBRIDGE_CONFIG") {
			Ok(path) => Self::load(&path)?,
			Err(_) => Self::default(),
		};

		if let Some(ms) = env_u64("CELLBRIDGE_POLL_INTERVAL_MS")? {
			config.poll_interval_ms = ms;
		}
		if let Ok(range) = env::var("CELLBRIDGE_REMOTE_RANGE") {
			config.remote_range = range;
		}
		if let Some(sec) = env_u64("CELLBRIDGE_LEASE_TTL_SEC")? {
			config.lease_ttl_sec = sec;
		}
		if let Some(ms) = env_u64("CELLBRIDGE_LOCK_RETRY_DELAY_MS")? {
			config.lock_retry_delay_ms = ms;
		}
		if let Some(n) = env_u64("CELLBRIDGE_LOCK_MAX_ATTEMPTS")? {
			config.lock_max_attempts = n as u32;
		}
		if let Some(sec) = env_u64("CELLBRIDGE_IGNORE_MARK_TTL_SEC")? {
			config.ignore_mark_ttl_sec = sec;
		}
		if let Some(sec) = env_u64("CELLBRIDGE_SNAPSHOT_TTL_SEC")? {
			config.snapshot_ttl_sec = sec;
		}
		if let Some(ms) = env_u64("CELLBRIDGE_OUTBOUND_DEBOUNCE_MS")? {
			config.outbound_debounce_ms = ms;
		}
		if let Some(ms) = env_u64("CELLBRIDGE_RATE_LIMIT_INITIAL_BACKOFF_MS")? {
			config.rate_limit_initial_backoff_ms = ms;
		}
		if let Some(ms) = env_u64("CELLBRIDGE_RATE_LIMIT_MAX_BACKOFF_MS")? {
			config.rate_limit_max_backoff_ms = ms;
		}
		if let Ok(id) = env::var("CELLBRIDGE_REMOTE_ID") {
			config.remote_id = id;
		}
		if let Ok(base) = env::var("CELLBRIDGE_REMOTE_API_BASE") {
			config.remote_api_base = base;
		}
		if let Ok(token) = env::var("CELLBRIDGE_API_TOKEN") {
			config.remote_api_token = token;
		}
		if let Ok(dsn) = env::var("CELLBRIDGE_STORE_DSN") {
			config.store_dsn = dsn;
		}
		if let Ok(addr) = env::var("CELLBRIDGE_KV_ADDRESS") {
			config.kv_address = addr;
		}
		if let Some(n) = env_u64("CELLBRIDGE_WORKER_CONCURRENCY")? {
			config.worker_concurrency = n as usize;
		}
		if let Some(n) = env_u64("CELLBRIDGE_WORKER_RATE_PER_MIN")? {
			config.worker_rate_per_min = n as u32;
		}
		if let Ok(addr) = env::var("CELLBRIDGE_HTTP_ADDR") {
			config.http_addr = addr;
		}

		Ok(config.normalized())
	}

	/// Parse a JSON config file; unknown values are a configuration error.
	pub fn load(path: &str) -> Result<Self, Error> {
		let raw = std::fs::read_to_string(path)
			.map_err(|err| Error::Validation(format!("config file {path:?}: {err}")))?;
		serde_json::from_str(&raw)
			.map_err(|err| Error::Validation(format!("config file {path:?}: {err}")))
	}

	/// Apply bounds the rest of the engine relies on.
	pub fn normalized(mut self) -> Self {
		if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
			debug!(
				configured = self.poll_interval_ms,
				clamped = MIN_POLL_INTERVAL_MS,
				"poll interval below the floor, clamping"
			);
			self.poll_interval_ms = MIN_POLL_INTERVAL_MS;
		}
		self
	}

	/// Reject configurations the engine cannot start from.
	pub fn validate(&self) -> Result<(), Error> {
		if self.store_dsn.is_empty() {
			return Err(Error::Validation("store_dsn is required".into()));
		}
		if self.kv_address.is_empty() {
			return Err(Error::Validation("kv_address is required".into()));
		}
		if !self.remote_range.contains('!') {
			return Err(Error::Validation(format!(
				"remote_range {:?} is missing its sheet prefix",
				self.remote_range
			)));
		}
		if self.worker_concurrency == 0 {
			return Err(Error::Validation("worker_concurrency must be at least 1".into()));
		}
		if self.http_addr.is_empty() {
			return Err(Error::Validation("http_addr is required".into()));
		}
		Ok(())
	}

	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
	}

	pub fn lease_ttl(&self) -> Duration {
		Duration::from_secs(self.lease_ttl_sec)
	}

	pub fn lock_retry_delay(&self) -> Duration {
		Duration::from_millis(self.lock_retry_delay_ms)
	}

	pub fn ignore_mark_ttl(&self) -> Duration {
		Duration::from_secs(self.ignore_mark_ttl_sec)
	}

	pub fn snapshot_ttl(&self) -> Duration {
		Duration::from_secs(self.snapshot_ttl_sec)
	}

	pub fn outbound_debounce(&self) -> Duration {
		Duration::from_millis(self.outbound_debounce_ms)
	}

	pub fn rate_limit_initial_backoff(&self) -> Duration {
		Duration::from_millis(self.rate_limit_initial_backoff_ms)
	}

	pub fn rate_limit_max_backoff(&self) -> Duration {
		Duration::from_millis(self.rate_limit_max_backoff_ms)
	}

	/// Sheet name prefix of the configured range, e.g. `Sheet1`.
	pub fn sheet_name(&self) -> &str {
		self.remote_range
			.split_once('!')
			.map(|(sheet, _)| sheet)
			.unwrap_or("Sheet1")
	}
}

fn env_u64(name: &str) -> Result<Option<u64>, Error> {
	match env::var(name) {
		Ok(raw) => raw
			.parse()
			.map(Some)
			.map_err(|_| Error::Validation(format!("{name} must be an integer, got {raw:?}"))),
		Err(_) => Ok(None),
	}
}

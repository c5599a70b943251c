//! Shared KV access.
//!
//! All cross-component coordination state (leases, ignore marks, snapshots,
//! pending queues, the edit-job list) lives behind the [`KvStore`] trait so
//! the engine and its tests run against the same surface. The production
//! implementation is Redis via an auto-reconnecting connection manager.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
	/// The KV peer cannot be reached; callers fall back to degraded paths.
	#[error("kv unavailable: {0}")]
	Unavailable(String),
	#[error("kv protocol error: {0}")]
	Protocol(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
	/// Atomic set-if-absent with expiry; returns whether the key was set.
	async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

	async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

	async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

	async fn exists(&self, key: &str) -> Result<bool, KvError>;

	/// Delete `key` only while it still holds `expected`; returns whether a
	/// delete happened. Mismatches are not errors.
	async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError>;

	/// Append to the tail of a FIFO list.
	async fn rpush(&self, key: &str, value: &str) -> Result<(), KvError>;

	/// Requeue at the head of a FIFO list.
	async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError>;

	/// Pop the head of a FIFO list.
	async fn lpop(&self, key: &str) -> Result<Option<String>, KvError>;

	async fn llen(&self, key: &str) -> Result<u64, KvError>;
}

/// Compare-and-delete, run server side so lease release stays atomic.
const DEL_IF_EQUALS: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end";

pub struct RedisKv {
	conn: redis::aio::ConnectionManager,
	del_if_equals: redis::Script,
}

impl RedisKv {
	/// Connect to the shared KV. The connection manager reconnects with
	/// exponential backoff on its own, so a dropped link surfaces as
	/// [`KvError::Unavailable`] on individual calls rather than a dead client.
	pub async fn connect(address: &str) -> Result<Self, KvError> {
		let client = redis::Client::open(address).map_err(classify)?;
		let conn = client.get_connection_manager().await.map_err(classify)?;
		Ok(Self {
			conn,
			del_if_equals: redis::Script::new(DEL_IF_EQUALS),
		})
	}
}

fn classify(err: redis::RedisError) -> KvError {
	if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout()
	{
		KvError::Unavailable(err.to_string())
	} else {
		KvError::Protocol(err.to_string())
	}
}

fn ttl_secs(ttl: Duration) -> u64 {
	ttl.as_secs().max(1)
}

#[async_trait]
impl KvStore for RedisKv {
	async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
		let mut conn = self.conn.clone();
		let reply: Option<String> = redis::cmd("SET")
			.arg(key)
			.arg(value)
			.arg("NX")
			.arg("EX")
			.arg(ttl_secs(ttl))
			.query_async(&mut conn)
			.await
			.map_err(classify)?;
		Ok(reply.is_some())
	}

	async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
		let mut conn = self.conn.clone();
		let () = redis::cmd("SET")
			.arg(key)
			.arg(value)
			.arg("EX")
			.arg(ttl_secs(ttl))
			.query_async(&mut conn)
			.await
			.map_err(classify)?;
		Ok(())
	}

	async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
		let mut conn = self.conn.clone();
		redis::cmd("GET")
			.arg(key)
			.query_async(&mut conn)
			.await
			.map_err(classify)
	}

	async fn exists(&self, key: &str) -> Result<bool, KvError> {
		let mut conn = self.conn.clone();
		let n: u64 = redis::cmd("EXISTS")
			.arg(key)
			.query_async(&mut conn)
			.await
			.map_err(classify)?;
		Ok(n > 0)
	}

	async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError> {
		let mut conn = self.conn.clone();
		let deleted: i64 = self
			.del_if_equals
			.key(key)
			.arg(expected)
			.invoke_async(&mut conn)
			.await
			.map_err(classify)?;
		Ok(deleted > 0)
	}

	async fn rpush(&self, key: &str, value: &str) -> Result<(), KvError> {
		let mut conn = self.conn.clone();
		let _: u64 = redis::cmd("RPUSH")
			.arg(key)
			.arg(value)
			.query_async(&mut conn)
			.await
			.map_err(classify)?;
		Ok(())
	}

	async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError> {
		let mut conn = self.conn.clone();
		let _: u64 = redis::cmd("LPUSH")
			.arg(key)
			.arg(value)
			.query_async(&mut conn)
			.await
			.map_err(classify)?;
		Ok(())
	}

	async fn lpop(&self, key: &str) -> Result<Option<String>, KvError> {
		let mut conn = self.conn.clone();
		redis::cmd("LPOP")
			.arg(key)
			.query_async(&mut conn)
			.await
			.map_err(classify)
	}

	async fn llen(&self, key: &str) -> Result<u64, KvError> {
		let mut conn = self.conn.clone();
		redis::cmd("LLEN")
			.arg(key)
			.query_async(&mut conn)
			.await
			.map_err(classify)
	}
}

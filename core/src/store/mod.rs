//! Relational store client.
//!
//! Wraps the one mirrored table behind the [`CellStore`] capability trait.
//! Failures are classified at this boundary: connectivity loss becomes
//! [`StoreError::Offline`] and drives the degraded paths, everything else is
//! a data error whose write can never succeed by retrying.

pub mod entity;
pub mod migration;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use cb_cell::{CellAddress, Column as CellColumn, Origin, StoredCell};
use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
	ActiveValue::Set, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
	DbErr, EntityTrait, FromQueryResult, JsonValue, QueryFilter, QueryOrder, RuntimeErr,
	Statement,
};
use sea_orm_migration::MigratorTrait;
use thiserror::Error;
use tracing::{info, warn};

use entity::{ActiveModel, Column, Entity};

#[derive(Error, Debug)]
pub enum StoreError {
	/// Connection refused, lost, reset, or timed out.
	#[error("store offline: {0}")]
	Offline(String),
	/// Constraint violation, integrity error, programmer error.
	#[error("store data error: {0}")]
	Data(String),
}

#[async_trait]
pub trait CellStore: Send + Sync {
	/// Full table, ordered by `(row_num, col_name)`.
	async fn read_all(&self) -> Result<Vec<StoredCell>, StoreError>;

	/// Insert-or-update keyed by address. Safe to replay.
	async fn upsert(
		&self,
		address: CellAddress,
		value: &str,
		origin: Origin,
	) -> Result<(), StoreError>;

	async fn delete(&self, address: CellAddress) -> Result<(), StoreError>;

	/// After an outbound push the cell matches the sheet; rewrite its origin
	/// unless a remote write already owns it.
	async fn update_origin_if_not_remote(&self, address: CellAddress) -> Result<(), StoreError>;

	/// Cheap liveness probe.
	async fn ping(&self) -> Result<(), StoreError>;
}

fn classify(err: DbErr) -> StoreError {
	match &err {
		DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => StoreError::Offline(err.to_string()),
		DbErr::Exec(RuntimeErr::Internal(message))
		| DbErr::Query(RuntimeErr::Internal(message)) => classify_message(message, &err),
		DbErr::Exec(RuntimeErr::SqlxError(source))
		| DbErr::Query(RuntimeErr::SqlxError(source)) => {
			classify_message(&source.to_string(), &err)
		}
		_ => StoreError::Data(err.to_string()),
	}
}

fn classify_message(message: &str, err: &DbErr) -> StoreError {
	let lowered = message.to_ascii_lowercase();
	const OFFLINE_MARKERS: &[&str] = &[
		"connection refused",
		"connection reset",
		"connection closed",
		"broken pipe",
		"timed out",
		"pool timed out",
		"network",
	];
	if OFFLINE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
		StoreError::Offline(err.to_string())
	} else {
		StoreError::Data(err.to_string())
	}
}

pub struct SeaOrmStore {
	conn: DatabaseConnection,
}

impl SeaOrmStore {
	/// Connect with a bounded pool and run pending migrations.
	pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
		let mut options = ConnectOptions::new(dsn.to_owned());
		options
			.max_connections(10)
			.connect_timeout(Duration::from_secs(10))
			.sqlx_logging(false);

		let conn = Database::connect(options).await.map_err(classify)?;
		migration::Migrator::up(&conn, None)
			.await
			.map_err(classify)?;
		info!("store connected and migrated");

		Ok(Self { conn })
	}

	/// Run a read statement from the terminal surface, rows as JSON objects.
	pub async fn query_json(&self, sql: &str) -> Result<Vec<JsonValue>, StoreError> {
		let statement = Statement::from_string(self.conn.get_database_backend(), sql.to_owned());
		JsonValue::find_by_statement(statement)
			.all(&self.conn)
			.await
			.map_err(classify)
	}

	/// Run a write statement from the terminal surface.
	pub async fn execute_sql(&self, sql: &str) -> Result<u64, StoreError> {
		let statement = Statement::from_string(self.conn.get_database_backend(), sql.to_owned());
		let result = self.conn.execute(statement).await.map_err(classify)?;
		Ok(result.rows_affected())
	}

	fn filter_address(address: CellAddress) -> sea_orm::Condition {
		sea_orm::Condition::all()
			.add(Column::RowNum.eq(address.row() as i32))
			.add(Column::ColName.eq(address.col().letter().to_string()))
	}
}

#[async_trait]
impl CellStore for SeaOrmStore {
	async fn read_all(&self) -> Result<Vec<StoredCell>, StoreError> {
		let models = Entity::find()
			.order_by_asc(Column::RowNum)
			.order_by_asc(Column::ColName)
			.all(&self.conn)
			.await
			.map_err(classify)?;

		let mut cells = Vec::with_capacity(models.len());
		for model in models {
			let col = match CellColumn::from_str(&model.col_name) {
				Ok(col) => col,
				Err(err) => {
					warn!(row = model.row_num, col = %model.col_name, %err, "skipping unreadable row");
					continue;
				}
			};
			let address = match CellAddress::new(model.row_num as u32, col) {
				Ok(address) => address,
				Err(err) => {
					warn!(row = model.row_num, %err, "skipping unreadable row");
					continue;
				}
			};
			let origin = match Origin::try_from(model.origin.clone()) {
				Ok(origin) => origin,
				Err(err) => {
					warn!(%address, %err, "skipping row with unknown origin");
					continue;
				}
			};
			cells.push(StoredCell {
				address,
				value: model.cell_value.unwrap_or_default(),
				origin,
				updated_at: model.updated_at,
			});
		}
		Ok(cells)
	}

	async fn upsert(
		&self,
		address: CellAddress,
		value: &str,
		origin: Origin,
	) -> Result<(), StoreError> {
		let now = Utc::now();
		let model = ActiveModel {
			row_num: Set(address.row() as i32),
			col_name: Set(address.col().letter().to_string()),
			cell_value: Set(Some(value.to_owned())),
			origin: Set(origin.to_string()),
			created_at: Set(now),
			updated_at: Set(now),
			..Default::default()
		};
		Entity::insert(model)
			.on_conflict(
				OnConflict::columns([Column::RowNum, Column::ColName])
					.update_columns([Column::CellValue, Column::Origin, Column::UpdatedAt])
					.to_owned(),
			)
			.exec(&self.conn)
			.await
			.map_err(classify)?;
		Ok(())
	}

	async fn delete(&self, address: CellAddress) -> Result<(), StoreError> {
		let condition = Self::filter_address(address);
		Entity::delete_many()
			.filter(condition)
			.exec(&self.conn)
			.await
			.map_err(classify)?;
		Ok(())
	}

	async fn update_origin_if_not_remote(&self, address: CellAddress) -> Result<(), StoreError> {
		let condition = Self::filter_address(address);
		Entity::update_many()
			.col_expr(Column::Origin, Expr::value(Origin::Remote.to_string()))
			.col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
			.filter(condition.add(Column::Origin.ne(Origin::Remote.to_string())))
			.exec(&self.conn)
			.await
			.map_err(classify)?;
		Ok(())
	}

	async fn ping(&self) -> Result<(), StoreError> {
		self.conn.ping().await.map_err(classify)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn connectivity_failures_classify_offline() {
		let err = DbErr::Conn(RuntimeErr::Internal("connection refused".into()));
		assert!(matches!(classify(err), StoreError::Offline(_)));

		let err = DbErr::Query(RuntimeErr::Internal("connection reset by peer".into()));
		assert!(matches!(classify(err), StoreError::Offline(_)));
	}

	#[test]
	fn integrity_failures_classify_data() {
		let err = DbErr::Exec(RuntimeErr::Internal(
			"UNIQUE constraint failed: cells.row_num, cells.col_name".into(),
		));
		assert!(matches!(classify(err), StoreError::Data(_)));

		assert!(matches!(
			classify(DbErr::RecordNotFound("cells".into())),
			StoreError::Data(_)
		));
	}
}

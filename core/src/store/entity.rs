//! The mirrored cells table.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One stored cell. Uniqueness on `(row_num, col_name)` is enforced by the
/// migration's index, which is also what makes upserts idempotent.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cells")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,
	pub row_num: i32,
	pub col_name: String,
	pub cell_value: Option<String>,
	pub origin: String,
	pub created_at: DateTimeUtc,
	pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

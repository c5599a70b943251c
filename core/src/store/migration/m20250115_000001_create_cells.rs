//! Create the cells table mirrored against the remote sheet.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
	async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.create_table(
				Table::create()
					.table(Cells::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(Cells::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(Cells::RowNum).integer().not_null())
					.col(ColumnDef::new(Cells::ColName).string_len(1).not_null())
					.col(ColumnDef::new(Cells::CellValue).text())
					.col(ColumnDef::new(Cells::Origin).string().not_null())
					.col(ColumnDef::new(Cells::CreatedAt).timestamp().not_null())
					.col(ColumnDef::new(Cells::UpdatedAt).timestamp().not_null())
					.to_owned(),
			)
			.await?;

		// At most one stored cell per address.
		manager
			.create_index(
				Index::create()
					.name("idx_cells_address_unique")
					.table(Cells::Table)
					.col(Cells::RowNum)
					.col(Cells::ColName)
					.unique()
					.to_owned(),
			)
			.await
	}

	async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.drop_table(Table::drop().table(Cells::Table).to_owned())
			.await
	}
}

#[derive(DeriveIden)]
enum Cells {
	Table,
	Id,
	RowNum,
	ColName,
	CellValue,
	Origin,
	CreatedAt,
	UpdatedAt,
}

//! Thin HTTP control surface over the engine.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cb_core::{CellAddress, CellValue, Column, Core, EditJob, Error, Origin};
use serde::Deserialize;
use serde_json::json;

pub fn router(core: Arc<Core>) -> Router {
	Router::new()
		.route("/health", get(|| async { "OK" }))
		.route("/status", get(status))
		.route("/cached-snapshot", get(cached_snapshot))
		.route("/edit", post(edit))
		.route("/sql", post(sql))
		.route("/force-sync", post(force_sync))
		.with_state(core)
}

fn bad_request(message: impl Into<String>) -> Response {
	(StatusCode::BAD_REQUEST, message.into()).into_response()
}

async fn status(State(core): State<Arc<Core>>) -> Response {
	Json(core.status().await).into_response()
}

async fn cached_snapshot(State(core): State<Arc<Core>>) -> Response {
	Json(core.cached_snapshot().await).into_response()
}

async fn force_sync(State(core): State<Arc<Core>>) -> Response {
	core.force_sync().await;
	Json(json!({ "synced": true })).into_response()
}

#[derive(Deserialize)]
struct EditRequest {
	row: u32,
	col: String,
	#[serde(default)]
	value: String,
	#[serde(default, rename = "sheetId")]
	sheet_id: Option<String>,
}

async fn edit(State(core): State<Arc<Core>>, Json(request): Json<EditRequest>) -> Response {
	if let Some(sheet_id) = &request.sheet_id {
		if !core.config.remote_id.is_empty() && sheet_id != &core.config.remote_id {
			return bad_request(format!("unknown sheet {sheet_id:?}"));
		}
	}
	let col = match request.col.parse::<Column>() {
		Ok(col) => col,
		Err(err) => return bad_request(err.to_string()),
	};
	let address = match CellAddress::new(request.row, col) {
		Ok(address) => address,
		Err(err) => return bad_request(err.to_string()),
	};
	let value = match CellValue::new(request.value) {
		Ok(value) => value,
		Err(err) => return bad_request(err.to_string()),
	};

	let job = EditJob::new(address, value.into_string(), Origin::Worker);
	let id = job.id;
	match core.enqueue_edit(job).await {
		Ok(true) => Json(json!({ "queued": true, "id": id })).into_response(),
		// The cell was just written by the reconciler; nothing to do.
		Ok(false) => Json(json!({ "queued": false, "suppressed": true })).into_response(),
		Err(Error::Validation(message)) => bad_request(message),
		Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
	}
}

#[derive(Deserialize)]
struct SqlRequest {
	query: String,
}

/// Keyword allowlist for the terminal surface: one statement, against the
/// cells table only.
fn validate_sql(query: &str) -> Result<&'static str, String> {
	let trimmed = query.trim().trim_end_matches(';');
	if trimmed.contains(';') {
		return Err("multiple statements are not allowed".into());
	}
	let lowered = trimmed.to_ascii_lowercase();
	if !lowered.contains("cells") {
		return Err("only the cells table is reachable from here".into());
	}
	let verb = lowered.split_whitespace().next().unwrap_or_default();
	match verb {
		"select" => Ok("read"),
		"insert" | "update" | "delete" => Ok("write"),
		_ => Err(format!("statement kind {verb:?} is not allowed")),
	}
}

async fn sql(State(core): State<Arc<Core>>, Json(request): Json<SqlRequest>) -> Response {
	let kind = match validate_sql(&request.query) {
		Ok(kind) => kind,
		Err(message) => return bad_request(message),
	};
	let Some(store) = core.terminal() else {
		return (
			StatusCode::SERVICE_UNAVAILABLE,
			"no raw store connection".to_string(),
		)
			.into_response();
	};

	let query = request.query.trim().trim_end_matches(';');
	if kind == "read" {
		match store.query_json(query).await {
			Ok(rows) => Json(json!({ "rows": rows })).into_response(),
			Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
		}
	} else {
		match store.execute_sql(query).await {
			Ok(affected) => {
				// Terminal writes flow outbound like any other local write.
				core.request_sync();
				Json(json!({ "rowsAffected": affected })).into_response()
			}
			Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sql_guard_allows_single_cells_statements() {
		assert_eq!(validate_sql("SELECT * FROM cells"), Ok("read"));
		assert_eq!(
			validate_sql("update cells set cell_value = 'x' where row_num = 1;"),
			Ok("write")
		);
		assert!(validate_sql("DROP TABLE cells").is_err());
		assert!(validate_sql("SELECT 1; SELECT 2").is_err());
		assert!(validate_sql("SELECT * FROM users").is_err());
	}
}

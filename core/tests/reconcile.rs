//! End-to-end reconciliation scenarios over the in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use cb_core::ignore::IgnoreMarks;
use cb_core::kv::KvStore;
use cb_core::outbound::OutboundSync;
use cb_core::peer::{PeerHealth, PeerStatus};
use cb_core::pending::{PendingQueue, TO_REMOTE, TO_STORE};
use cb_core::reconciler::Reconciler;
use cb_core::sheet::SheetClient;
use cb_core::snapshot::SnapshotCache;
use cb_core::store::CellStore;
use cb_core::testing::{FakeSheetApi, MemoryKv, MemoryStore};
use cb_core::{CellAddress, Column, Origin};
use tokio_util::sync::CancellationToken;

struct Rig {
	kv: Arc<MemoryKv>,
	api: Arc<FakeSheetApi>,
	store: Arc<MemoryStore>,
	snapshot: Arc<SnapshotCache>,
	pending: PendingQueue,
	marks: IgnoreMarks,
	reconciler: Reconciler,
	outbound: OutboundSync,
}

fn rig() -> Rig {
	let kv = Arc::new(MemoryKv::default());
	let api = Arc::new(FakeSheetApi::default());
	let store = Arc::new(MemoryStore::default());

	let remote = Arc::new(PeerHealth::new("remote", PeerStatus::Online));
	let store_health = Arc::new(PeerHealth::new("store", PeerStatus::Online));

	let sheet = Arc::new(SheetClient::new(
		api.clone(),
		remote.clone(),
		"Sheet1!A1:H20".into(),
		"Sheet1".into(),
		Duration::from_secs(5),
		Duration::from_secs(60),
	));
	let snapshot = Arc::new(SnapshotCache::new(kv.clone(), Duration::from_secs(86_400)));
	let pending = PendingQueue::new(kv.clone());
	let marks = IgnoreMarks::new(kv.clone(), Duration::from_secs(10));

	let reconciler = Reconciler::new(
		sheet.clone(),
		store.clone(),
		marks.clone(),
		pending.clone(),
		snapshot.clone(),
		remote,
		store_health.clone(),
		Duration::from_secs(3),
	);
	let outbound = OutboundSync::new(
		store.clone(),
		sheet,
		snapshot.clone(),
		pending.clone(),
		store_health,
		Duration::from_millis(500),
	);

	Rig {
		kv,
		api,
		store,
		snapshot,
		pending,
		marks,
		reconciler,
		outbound,
	}
}

fn addr(row: u32, col: char) -> CellAddress {
	CellAddress::new(row, Column::from_letter(col).unwrap()).unwrap()
}

#[tokio::test]
async fn remote_edit_lands_in_store_without_echo() {
	let rig = rig();
	rig.api.set_cell(&addr(3, 'B'), "Hello");

	rig.reconciler.poll_once().await;

	let cell = rig.store.cell(&addr(3, 'B')).expect("cell mirrored");
	assert_eq!(cell.value, "Hello");
	assert_eq!(cell.origin, Origin::Remote);
	assert_eq!(rig.snapshot.current().await.get(&addr(3, 'B')), Some("Hello"));
	// The write was flagged so no other path re-propagates it.
	assert!(rig.marks.is_marked(&addr(3, 'B')).await.unwrap());

	// An outbound pass finds nothing to push: the origin filter holds.
	rig.outbound.force_sync().await;
	assert_eq!(rig.api.update_calls(), 0);
}

#[tokio::test]
async fn local_write_reaches_the_sheet_and_origin_flips() {
	let rig = rig();
	rig.store.seed(addr(5, 'C'), "World", Origin::LocalTerminal);

	rig.outbound.force_sync().await;

	assert_eq!(rig.api.cell("Sheet1", "C5"), Some("World".into()));
	let cell = rig.store.cell(&addr(5, 'C')).unwrap();
	assert_eq!(cell.origin, Origin::Remote);
	// Snapshot write-through: the push is already the observed state.
	assert_eq!(rig.snapshot.current().await.get(&addr(5, 'C')), Some("World"));

	// The next poll must not see our own push as an incoming change, and
	// the next outbound pass must find nothing left to do.
	rig.reconciler.poll_once().await;
	rig.outbound.force_sync().await;
	assert_eq!(rig.api.update_calls(), 1);
	assert_eq!(rig.store.cell(&addr(5, 'C')).unwrap().value, "World");
}

#[tokio::test]
async fn offline_remote_queues_and_replays_in_order() {
	let rig = rig();
	rig.store.seed(addr(1, 'A'), "X", Origin::LocalTerminal);
	rig.store.seed(addr(2, 'B'), "Y", Origin::LocalTerminal);

	rig.api.set_unreachable(true);
	rig.outbound.force_sync().await;

	// Durability: both writes wait in the queue while the peer is down.
	assert_eq!(rig.pending.len(TO_REMOTE).await.unwrap(), 2);
	assert_eq!(rig.api.cell("Sheet1", "A1"), None);

	rig.api.set_unreachable(false);
	rig.reconciler.drain_to_remote().await;

	assert_eq!(rig.api.cell("Sheet1", "A1"), Some("X".into()));
	assert_eq!(rig.api.cell("Sheet1", "B2"), Some("Y".into()));
	assert_eq!(rig.pending.len(TO_REMOTE).await.unwrap(), 0);
	assert_eq!(rig.store.cell(&addr(1, 'A')).unwrap().origin, Origin::Remote);

	// Replays are idempotent: a second drain changes nothing.
	rig.reconciler.drain_to_remote().await;
	assert_eq!(rig.api.cell("Sheet1", "A1"), Some("X".into()));
}

#[tokio::test]
async fn offline_store_queues_inbound_changes() {
	let rig = rig();
	rig.api.set_cell(&addr(7, 'E'), "queued");
	rig.store.set_offline(true);

	rig.reconciler.poll_once().await;
	assert_eq!(rig.pending.len(TO_STORE).await.unwrap(), 1);
	assert!(rig.store.cell(&addr(7, 'E')).is_none());

	rig.store.set_offline(false);
	rig.reconciler.drain_to_store().await;

	let cell = rig.store.cell(&addr(7, 'E')).expect("replayed");
	assert_eq!(cell.value, "queued");
	assert_eq!(cell.origin, Origin::Remote);
	assert_eq!(rig.pending.len(TO_STORE).await.unwrap(), 0);
	// Replay still carried the echo-suppression mark.
	assert!(rig.marks.is_marked(&addr(7, 'E')).await.unwrap());
}

#[tokio::test]
async fn two_edits_within_one_poll_collapse() {
	let rig = rig();
	rig.api.set_cell(&addr(1, 'A'), "E0");
	rig.api.set_cell(&addr(1, 'A'), "E1");

	rig.reconciler.poll_once().await;

	assert_eq!(rig.store.len(), 1);
	assert_eq!(rig.store.cell(&addr(1, 'A')).unwrap().value, "E1");
}

#[tokio::test]
async fn local_delete_propagates_to_the_sheet() {
	let rig = rig();
	rig.api.set_cell(&addr(4, 'D'), "stale");
	rig.reconciler.poll_once().await;
	assert!(rig.store.cell(&addr(4, 'D')).is_some());

	// Terminal-side delete, then the debounced push.
	rig.store.delete(addr(4, 'D')).await.unwrap();
	rig.outbound.force_sync().await;

	assert_eq!(rig.api.cell("Sheet1", "D4"), None);
	assert_eq!(rig.snapshot.current().await.get(&addr(4, 'D')), None);
}

#[tokio::test]
async fn quiescence_means_convergence() {
	let rig = rig();
	// Mixed starting state on both sides.
	rig.api.set_cell(&addr(1, 'A'), "from-remote");
	rig.store.seed(addr(2, 'B'), "from-local", Origin::LocalTerminal);
	rig.store.seed(addr(3, 'C'), "also-local", Origin::Worker);

	rig.reconciler.bootstrap().await.unwrap();
	rig.outbound.force_sync().await;
	rig.reconciler.poll_once().await;
	rig.outbound.force_sync().await;

	// Every non-empty cell agrees on both sides.
	let cells = rig.store.read_all().await.unwrap();
	assert_eq!(cells.len(), 3);
	for cell in cells {
		assert_eq!(
			rig.api.cell("Sheet1", &cell.address.a1()),
			Some(cell.value.clone()),
			"cell {} diverged",
			cell.address
		);
	}
	// And nothing keeps flowing once converged.
	let updates_before = rig.api.update_calls();
	rig.reconciler.poll_once().await;
	rig.outbound.force_sync().await;
	assert_eq!(rig.api.update_calls(), updates_before);
}

#[tokio::test]
async fn warm_snapshot_survives_restart() {
	let rig = rig();
	rig.api.set_cell(&addr(9, 'H'), "persisted");
	rig.reconciler.poll_once().await;

	// A new engine over the same KV warm-starts from the persisted state.
	let snapshot = SnapshotCache::new(rig.kv.clone() as Arc<dyn KvStore>, Duration::from_secs(60));
	assert!(snapshot.load_warm().await);
	assert_eq!(snapshot.current().await.get(&addr(9, 'H')), Some("persisted"));
}

#[tokio::test(start_paused = true)]
async fn rapid_sync_requests_collapse_into_one_batch() {
	let rig = rig();
	rig.store.seed(addr(6, 'F'), "debounced", Origin::LocalTerminal);

	let cancel = CancellationToken::new();
	let task = rig.outbound.spawn(cancel.clone());

	// Three requests in the same window become a single pass.
	rig.outbound.request_sync();
	rig.outbound.request_sync();
	rig.outbound.request_sync();

	tokio::time::sleep(Duration::from_secs(2)).await;
	assert_eq!(rig.api.update_calls(), 1);
	assert_eq!(rig.api.cell("Sheet1", "F6"), Some("debounced".into()));

	cancel.cancel();
	task.await.unwrap();
}

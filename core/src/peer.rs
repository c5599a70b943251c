//! Peer connectivity state.
//!
//! Each peer (the remote sheet, the relational store) is either online or
//! offline. State lives in a watch channel so the drain tasks can react to
//! recovery edges without polling, and only actual transitions are logged.

use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
	Online,
	Offline,
}

pub struct PeerHealth {
	name: &'static str,
	tx: watch::Sender<PeerStatus>,
}

impl PeerHealth {
	pub fn new(name: &'static str, initial: PeerStatus) -> Self {
		let (tx, _) = watch::channel(initial);
		Self { name, tx }
	}

	pub fn is_online(&self) -> bool {
		*self.tx.borrow() == PeerStatus::Online
	}

	pub fn subscribe(&self) -> watch::Receiver<PeerStatus> {
		self.tx.subscribe()
	}

	/// Returns `true` only on an offline → online edge.
	pub fn set_online(&self) -> bool {
		let changed = self.tx.send_if_modified(|status| {
			if *status == PeerStatus::Online {
				false
			} else {
				*status = PeerStatus::Online;
				true
			}
		});
		if changed {
			info!(peer = self.name, "peer is back online");
		}
		changed
	}

	/// Returns `true` only on an online → offline edge.
	pub fn set_offline(&self) -> bool {
		let changed = self.tx.send_if_modified(|status| {
			if *status == PeerStatus::Offline {
				false
			} else {
				*status = PeerStatus::Offline;
				true
			}
		});
		if changed {
			warn!(peer = self.name, "peer went offline, queueing writes");
		}
		changed
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn transitions_fire_once() {
		let peer = PeerHealth::new("remote", PeerStatus::Online);
		assert!(!peer.set_online());
		assert!(peer.set_offline());
		assert!(!peer.set_offline());
		assert!(peer.set_online());
		assert!(peer.is_online());
	}

	#[tokio::test]
	async fn subscribers_see_recovery_edges() {
		let peer = PeerHealth::new("store", PeerStatus::Offline);
		let mut rx = peer.subscribe();
		peer.set_online();
		rx.changed().await.unwrap();
		assert_eq!(*rx.borrow(), PeerStatus::Online);
	}
}

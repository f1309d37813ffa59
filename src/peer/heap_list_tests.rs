use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as PlMutex;

use super::*;
use crate::peer::{ConnectionStatus, Peer, PeerStatus};

struct FakePeer {
	id: PeerIdentifier,
	connection_status: PlMutex<ConnectionStatus>,
	pending: AtomicU32,
}

impl Peer for FakePeer {
	fn id(&self) -> &PeerIdentifier {
		&self.id
	}
	fn status(&self) -> PeerStatus {
		PeerStatus {
			connection_status: *self.connection_status.lock(),
			pending_request_count: self.pending.load(Ordering::SeqCst),
		}
	}
	fn start_request(&self) {
		self.pending.fetch_add(1, Ordering::SeqCst);
	}
	fn end_request(&self) {
		self.pending.fetch_sub(1, Ordering::SeqCst);
	}
}

#[derive(Default)]
struct FakeTransport {
	peers: PlMutex<HashMap<PeerIdentifier, Arc<FakePeer>>>,
}

impl FakeTransport {
	fn with_peers(ids: &[&str]) -> Arc<Self> {
		let transport = Self::default();
		for id in ids {
			transport.peers.lock().insert(
				PeerIdentifier::new(*id),
				Arc::new(FakePeer {
					id: PeerIdentifier::new(*id),
					connection_status: PlMutex::new(ConnectionStatus::Available),
					pending: AtomicU32::new(0),
				}),
			);
		}
		Arc::new(transport)
	}
}

#[async_trait]
impl Transport for FakeTransport {
	async fn retain(
		&self,
		id: &PeerIdentifier,
		_subscriber: Arc<dyn Subscriber>,
	) -> Result<Arc<dyn Peer>, Box<dyn std::error::Error + Send + Sync>> {
		let peer = self.peers.lock().get(id).cloned().expect("test peer must be preconfigured");
		Ok(peer)
	}

	async fn release(
		&self,
		_id: &PeerIdentifier,
		_subscriber: Arc<dyn Subscriber>,
	) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
		Ok(())
	}
}

async fn running_list(ids: &[&str]) -> (Arc<PeerHeapList>, Arc<FakeTransport>) {
	let transport = FakeTransport::with_peers(ids);
	let list = PeerHeapList::new(transport.clone());
	list.start().await.unwrap();
	list.update(ListUpdate {
		additions: ids.iter().map(|id| PeerIdentifier::new(*id)).collect(),
		removals: vec![],
	})
	.await
	.unwrap();
	(list, transport)
}

#[tokio::test]
async fn round_robins_equally_loaded_peers() {
	let (list, _transport) = running_list(&["p1", "p2", "p3"]).await;
	let ctx = CallContext::with_timeout(Duration::from_secs(1));

	let mut order = Vec::new();
	for _ in 0..6 {
		let chosen = list.choose(&ctx).await.unwrap();
		order.push(chosen.peer.id().as_str().to_string());
		chosen.finish(None);
	}
	assert_eq!(order, vec!["p1", "p2", "p3", "p1", "p2", "p3"]);
}

#[tokio::test]
async fn least_pending_peer_wins_regardless_of_rotation() {
	let (list, transport) = running_list(&["p1", "p2"]).await;
	let ctx = CallContext::with_timeout(Duration::from_secs(1));

	// Load p1 up so p2 always has the lower score.
	transport.peers.lock().get(&PeerIdentifier::new("p1")).unwrap().pending.store(5, Ordering::SeqCst);

	for _ in 0..4 {
		let chosen = list.choose(&ctx).await.unwrap();
		assert_eq!(chosen.peer.id().as_str(), "p2");
		chosen.finish(None);
	}
}

#[tokio::test]
async fn choose_without_deadline_on_empty_list_is_rejected() {
	let (list, _transport) = running_list(&[]).await;
	let ctx = CallContext::new();
	let err = list.choose(&ctx).await.unwrap_err();
	assert!(matches!(err, Error::NoDeadline));
}

#[tokio::test]
async fn notify_for_unknown_id_is_a_noop() {
	let (list, _transport) = running_list(&["p1"]).await;
	// Must not panic, and must not perturb subsequent behavior.
	list.notify_status_changed(&PeerIdentifier::new("ghost"));

	let ctx = CallContext::with_timeout(Duration::from_secs(1));
	let chosen = list.choose(&ctx).await.unwrap();
	assert_eq!(chosen.peer.id().as_str(), "p1");
	chosen.finish(None);
}

#[tokio::test]
async fn unavailable_peer_becomes_choosable_again_after_status_notification() {
	let (list, transport) = running_list(&["p1"]).await;
	*transport.peers.lock().get(&PeerIdentifier::new("p1")).unwrap().connection_status.lock() = ConnectionStatus::Unavailable;
	list.notify_status_changed(&PeerIdentifier::new("p1"));

	let short_ctx = CallContext::with_timeout(Duration::from_millis(20));
	assert!(matches!(list.choose(&short_ctx).await, Err(Error::Unavailable)));

	*transport.peers.lock().get(&PeerIdentifier::new("p1")).unwrap().connection_status.lock() = ConnectionStatus::Available;
	list.notify_status_changed(&PeerIdentifier::new("p1"));

	let ctx = CallContext::with_timeout(Duration::from_secs(1));
	let chosen = list.choose(&ctx).await.unwrap();
	assert_eq!(chosen.peer.id().as_str(), "p1");
	chosen.finish(None);
}

#[tokio::test]
async fn duplicate_addition_is_rejected() {
	let (list, _transport) = running_list(&["p1"]).await;
	let err = list
		.update(ListUpdate {
			additions: vec![PeerIdentifier::new("p1")],
			removals: vec![],
		})
		.await
		.unwrap_err();
	assert!(matches!(err, Error::PeerAddAlreadyInList { .. }));
}

#[tokio::test]
async fn removing_unknown_peer_is_rejected() {
	let (list, _transport) = running_list(&["p1"]).await;
	let err = list
		.update(ListUpdate {
			additions: vec![],
			removals: vec![PeerIdentifier::new("ghost")],
		})
		.await
		.unwrap_err();
	assert!(matches!(err, Error::PeerRemoveNotInList { .. }));
}

#[derive(Default)]
struct SlowReleaseTransport {
	inner: FakeTransport,
}

#[async_trait]
impl Transport for SlowReleaseTransport {
	async fn retain(&self, id: &PeerIdentifier, subscriber: Arc<dyn Subscriber>) -> Result<Arc<dyn Peer>, Box<dyn std::error::Error + Send + Sync>> {
		self.inner.retain(id, subscriber).await
	}

	async fn release(&self, id: &PeerIdentifier, subscriber: Arc<dyn Subscriber>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
		// Widens the window between capturing a heap key and actually deleting
		// it, so a concurrent `choose` on another peer gets a chance to pop and
		// re-push its own entry (reusing freed heap slots) while this release
		// is still in flight.
		tokio::time::sleep(Duration::from_millis(5)).await;
		self.inner.release(id, subscriber).await
	}
}

#[tokio::test]
async fn concurrent_choose_does_not_corrupt_the_heap_during_a_slow_release() {
	let transport = Arc::new(SlowReleaseTransport { inner: FakeTransport::default() });
	for id in ["p1", "p2"] {
		transport.inner.peers.lock().insert(
			PeerIdentifier::new(id),
			Arc::new(FakePeer {
				id: PeerIdentifier::new(id),
				connection_status: PlMutex::new(ConnectionStatus::Available),
				pending: AtomicU32::new(0),
			}),
		);
	}
	let list = PeerHeapList::new(transport.clone());
	list.start().await.unwrap();
	list.update(ListUpdate {
		additions: vec![PeerIdentifier::new("p1"), PeerIdentifier::new("p2")],
		removals: vec![],
	})
	.await
	.unwrap();

	let chooser = {
		let list = list.clone();
		tokio::spawn(async move {
			let ctx = CallContext::with_timeout(Duration::from_secs(2));
			for _ in 0..50 {
				if let Ok(chosen) = list.choose(&ctx).await {
					chosen.finish(None);
				}
				tokio::task::yield_now().await;
			}
		})
	};

	list.update(ListUpdate {
		additions: vec![],
		removals: vec![PeerIdentifier::new("p2")],
	})
	.await
	.unwrap();

	chooser.await.unwrap();

	assert_eq!(list.len(), 1);
	assert_eq!(list.peer_ids(), vec![PeerIdentifier::new("p1")]);

	let ctx = CallContext::with_timeout(Duration::from_secs(1));
	let chosen = list.choose(&ctx).await.unwrap();
	assert_eq!(chosen.peer.id().as_str(), "p1");
	chosen.finish(None);
}

#[tokio::test]
async fn stop_releases_every_retained_peer() {
	let (list, _transport) = running_list(&["p1", "p2"]).await;
	list.stop().await.unwrap();
	assert!(!list.is_running());

	let ctx = CallContext::with_timeout(Duration::from_millis(20));
	let err = list.choose(&ctx).await.unwrap_err();
	assert!(matches!(err, Error::ListNotRunning { .. }));
}

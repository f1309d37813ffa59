//! A [`Chooser`]/[`List`] built on the least-pending [`PeerHeap`], with
//! round-robin tie-breaking between equally loaded peers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, trace};

use super::heap::{EntryKey, PeerHeap};
use super::{Chooser, Chosen, ConnectionStatus, List, ListUpdate, Lifecycle, PeerIdentifier, Subscriber, Transport};
use crate::context::CallContext;
use crate::error::{Error, combine};
use crate::lifecycle::LifecycleOnce;

#[derive(Default)]
struct Inner {
	heap: PeerHeap,
	by_identifier: HashMap<PeerIdentifier, EntryKey>,
}

/// A peer list choosing the least-loaded peer on every call, breaking ties
/// between equally loaded peers in round-robin order.
pub struct PeerHeapList {
	transport: Arc<dyn Transport>,
	lifecycle: LifecycleOnce,
	inner: Mutex<Inner>,
	/// Capacity-one wake-up signal: `notify_one` stores at most one permit, so
	/// a burst of availability changes collapses to "there is work", not a
	/// queue of individual wake-ups.
	peer_available: Notify,
	startup_wait: Duration,
	self_weak: Weak<PeerHeapList>,
}

impl PeerHeapList {
	pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
		Self::with_startup_wait(transport, crate::lifecycle::DEFAULT_STARTUP_WAIT)
	}

	pub fn with_startup_wait(transport: Arc<dyn Transport>, startup_wait: Duration) -> Arc<Self> {
		Arc::new_cyclic(|weak| Self {
			transport,
			lifecycle: LifecycleOnce::new(),
			inner: Mutex::new(Inner::default()),
			peer_available: Notify::new(),
			startup_wait,
			self_weak: weak.clone(),
		})
	}

	fn self_subscriber(&self) -> Arc<dyn Subscriber> {
		self.self_weak.upgrade().expect("PeerHeapList dropped while still in use") as Arc<dyn Subscriber>
	}

	async fn wait_running(&self, ctx: &CallContext) -> Result<(), Error> {
		let bounded = match ctx.deadline() {
			Some(_) => ctx.clone(),
			None => CallContext::with_timeout(self.startup_wait),
		};
		self.lifecycle
			.wait_until_running(&bounded)
			.await
			.map_err(|e| Error::ListNotRunning { cause: Box::new(e) })
	}

	async fn retain_one(&self, id: &PeerIdentifier, subscriber: &Arc<dyn Subscriber>) -> Result<(), Error> {
		if self.inner.lock().by_identifier.contains_key(id) {
			return Err(Error::PeerAddAlreadyInList { id: id.clone() });
		}
		let peer = self
			.transport
			.retain(id, subscriber.clone())
			.await
			.map_err(|source| Error::TransportRetain { id: id.clone(), source })?;
		let status = peer.status();
		{
			let mut inner = self.inner.lock();
			let key = inner.heap.push(id.clone(), peer, status);
			inner.by_identifier.insert(id.clone(), key);
		}
		if status.connection_status == ConnectionStatus::Available {
			self.peer_available.notify_one();
		}
		debug!(%id, "peer retained");
		Ok(())
	}

	async fn release_one(&self, id: &PeerIdentifier, subscriber: &Arc<dyn Subscriber>) -> Result<(), Error> {
		{
			let inner = self.inner.lock();
			let Some(&key) = inner.by_identifier.get(id) else {
				return Err(Error::PeerRemoveNotInList { id: id.clone() });
			};
			inner.heap.validate(key)?;
		}
		self.transport
			.release(id, subscriber.clone())
			.await
			.map_err(|source| Error::TransportRelease { id: id.clone(), source })?;
		// Re-resolve the key after the await instead of reusing the one captured
		// above: a concurrent `choose` can pop/re-push this id's entry while we
		// were suspended, freeing and reusing heap slots, so the earlier key may
		// no longer name this id's (or any) live entry.
		let mut inner = self.inner.lock();
		if let Some(key) = inner.by_identifier.remove(id) {
			inner.heap.delete(key);
		}
		debug!(%id, "peer released");
		Ok(())
	}

	/// The number of peers currently retained, available or not.
	pub fn len(&self) -> usize {
		self.inner.lock().by_identifier.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// A snapshot of every retained peer id, for observability and tests.
	pub fn peer_ids(&self) -> Vec<PeerIdentifier> {
		self.inner.lock().by_identifier.keys().cloned().collect()
	}
}

#[async_trait]
impl Lifecycle for PeerHeapList {
	async fn start(&self) -> Result<(), Error> {
		let result = self.lifecycle.start(async { Ok(()) }).await;
		info!("peer heap list started");
		result
	}

	async fn stop(&self) -> Result<(), Error> {
		let result = self
			.lifecycle
			.stop(async {
				let subscriber = self.self_subscriber();
				let ids: Vec<PeerIdentifier> = self.inner.lock().by_identifier.keys().cloned().collect();
				let mut errs = Vec::new();
				for id in ids {
					if let Err(e) = self.release_one(&id, &subscriber).await {
						errs.push(e);
					}
				}
				combine(errs.into_iter().map(Some)).map_or(Ok(()), Err)
			})
			.await;
		info!("peer heap list stopped");
		result
	}

	fn is_running(&self) -> bool {
		self.lifecycle.is_running()
	}
}

#[async_trait]
impl List for PeerHeapList {
	async fn update(&self, update: ListUpdate) -> Result<(), Error> {
		self.wait_running(&CallContext::new()).await?;

		let subscriber = self.self_subscriber();
		let mut errs = Vec::new();
		for id in &update.removals {
			if let Err(e) = self.release_one(id, &subscriber).await {
				errs.push(e);
			}
		}
		for id in &update.additions {
			if let Err(e) = self.retain_one(id, &subscriber).await {
				errs.push(e);
			}
		}
		combine(errs.into_iter().map(Some)).map_or(Ok(()), Err)
	}
}

#[async_trait]
impl Chooser for PeerHeapList {
	async fn choose(&self, ctx: &CallContext) -> Result<Chosen, Error> {
		self.wait_running(ctx).await?;

		loop {
			let found = {
				let mut inner = self.inner.lock();
				match inner.heap.pop() {
					Some((_, id, peer, status)) => {
						// Immediately re-pushing assigns a fresh insertion
						// rank, which is what rotates equally-scored peers.
						let key = inner.heap.push(id.clone(), peer.clone(), status);
						inner.by_identifier.insert(id, key);
						Some((peer, status))
					}
					None => None,
				}
			};

			if let Some((peer, status)) = found {
				if status.connection_status == ConnectionStatus::Available {
					peer.start_request();
					self.peer_available.notify_one();
					return Ok(Chosen::new(peer));
				}
			}

			let Some(remaining) = ctx.remaining() else {
				return Err(Error::NoDeadline);
			};

			tokio::select! {
				_ = self.peer_available.notified() => {}
				_ = ctx.cancellation().cancelled() => return Err(Error::Unavailable),
				_ = tokio::time::sleep(remaining) => return Err(Error::Unavailable),
			}
		}
	}
}

impl Subscriber for PeerHeapList {
	fn notify_status_changed(&self, id: &PeerIdentifier) {
		trace!(%id, "status change notification");
		let mut inner = self.inner.lock();
		let Some(&key) = inner.by_identifier.get(id) else {
			return;
		};
		let peer = inner.heap.peer(key);
		let new_status = peer.status();
		if new_status == inner.heap.status(key) {
			return;
		}
		inner.heap.update_status(key, new_status);
		drop(inner);
		if new_status.connection_status == ConnectionStatus::Available {
			self.peer_available.notify_one();
		}
	}
}

#[cfg(test)]
#[path = "heap_list_tests.rs"]
mod tests;

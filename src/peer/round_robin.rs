//! A [`Chooser`]/[`List`] that rotates strictly through available peers,
//! ignoring pending-request counts entirely — the alternative to
//! [`super::heap_list::PeerHeapList`] for callers who want even distribution
//! over least-loaded selection.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, trace};

use super::{Chooser, Chosen, ConnectionStatus, List, ListUpdate, Lifecycle, Peer, PeerIdentifier, Subscriber, Transport};
use crate::context::CallContext;
use crate::error::{Error, combine};
use crate::lifecycle::LifecycleOnce;

#[derive(Default)]
struct Inner {
	peers: HashMap<PeerIdentifier, Arc<dyn Peer>>,
	/// The ring: only ever holds ids currently believed `Available`.
	available: Vec<PeerIdentifier>,
	available_index: HashMap<PeerIdentifier, usize>,
	cursor: usize,
}

impl Inner {
	fn ring_add(&mut self, id: PeerIdentifier) {
		if self.available_index.contains_key(&id) {
			return;
		}
		self.available_index.insert(id.clone(), self.available.len());
		self.available.push(id);
	}

	fn ring_remove(&mut self, id: &PeerIdentifier) {
		let Some(idx) = self.available_index.remove(id) else {
			return;
		};
		let last = self.available.len() - 1;
		self.available.swap(idx, last);
		if idx != last {
			let moved = self.available[idx].clone();
			self.available_index.insert(moved, idx);
		}
		self.available.pop();
	}

	fn next(&mut self) -> Option<PeerIdentifier> {
		if self.available.is_empty() {
			return None;
		}
		let idx = self.cursor % self.available.len();
		self.cursor = self.cursor.wrapping_add(1);
		Some(self.available[idx].clone())
	}
}

pub struct RoundRobinList {
	transport: Arc<dyn Transport>,
	lifecycle: LifecycleOnce,
	inner: Mutex<Inner>,
	peer_available: Notify,
	startup_wait: Duration,
	self_weak: Weak<RoundRobinList>,
}

impl RoundRobinList {
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
		self.self_weak.upgrade().expect("RoundRobinList dropped while still in use") as Arc<dyn Subscriber>
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
		if self.inner.lock().peers.contains_key(id) {
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
			inner.peers.insert(id.clone(), peer);
			if status.connection_status == ConnectionStatus::Available {
				inner.ring_add(id.clone());
			}
		}
		if status.connection_status == ConnectionStatus::Available {
			self.peer_available.notify_one();
		}
		debug!(%id, "peer retained");
		Ok(())
	}

	async fn release_one(&self, id: &PeerIdentifier, subscriber: &Arc<dyn Subscriber>) -> Result<(), Error> {
		if !self.inner.lock().peers.contains_key(id) {
			return Err(Error::PeerRemoveNotInList { id: id.clone() });
		}
		self.transport
			.release(id, subscriber.clone())
			.await
			.map_err(|source| Error::TransportRelease { id: id.clone(), source })?;
		let mut inner = self.inner.lock();
		inner.peers.remove(id);
		inner.ring_remove(id);
		debug!(%id, "peer released");
		Ok(())
	}

	/// The number of peers currently retained, available or not.
	pub fn len(&self) -> usize {
		self.inner.lock().peers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// A snapshot of every retained peer id, for observability and tests.
	pub fn peer_ids(&self) -> Vec<PeerIdentifier> {
		self.inner.lock().peers.keys().cloned().collect()
	}
}

#[async_trait]
impl Lifecycle for RoundRobinList {
	async fn start(&self) -> Result<(), Error> {
		let result = self.lifecycle.start(async { Ok(()) }).await;
		info!("round-robin list started");
		result
	}

	async fn stop(&self) -> Result<(), Error> {
		let result = self
			.lifecycle
			.stop(async {
				let subscriber = self.self_subscriber();
				let ids: Vec<PeerIdentifier> = self.inner.lock().peers.keys().cloned().collect();
				let mut errs = Vec::new();
				for id in ids {
					if let Err(e) = self.release_one(&id, &subscriber).await {
						errs.push(e);
					}
				}
				combine(errs.into_iter().map(Some)).map_or(Ok(()), Err)
			})
			.await;
		info!("round-robin list stopped");
		result
	}

	fn is_running(&self) -> bool {
		self.lifecycle.is_running()
	}
}

#[async_trait]
impl List for RoundRobinList {
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
impl Chooser for RoundRobinList {
	async fn choose(&self, ctx: &CallContext) -> Result<Chosen, Error> {
		self.wait_running(ctx).await?;

		loop {
			let candidate = {
				let mut inner = self.inner.lock();
				inner.next().map(|id| inner.peers.get(&id).cloned().expect("ring id always has a peer"))
			};

			if let Some(peer) = candidate {
				peer.start_request();
				self.peer_available.notify_one();
				return Ok(Chosen::new(peer));
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

impl Subscriber for RoundRobinList {
	fn notify_status_changed(&self, id: &PeerIdentifier) {
		trace!(%id, "status change notification");
		let mut inner = self.inner.lock();
		let Some(peer) = inner.peers.get(id).cloned() else {
			return;
		};
		let available_now = peer.status().connection_status == ConnectionStatus::Available;
		let was_available = inner.available_index.contains_key(id);
		if available_now == was_available {
			return;
		}
		if available_now {
			inner.ring_add(id.clone());
		} else {
			inner.ring_remove(id);
		}
		drop(inner);
		if available_now {
			self.peer_available.notify_one();
		}
	}
}

#[cfg(test)]
#[path = "round_robin_tests.rs"]
mod tests;

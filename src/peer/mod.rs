//! Peer selection: the traits a transport and a chooser agree on, plus two
//! interchangeable chooser implementations ([`heap`] and [`round_robin`]).

pub mod heap;
pub mod heap_list;
pub mod round_robin;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::CallContext;
use crate::error::Error;

/// A stable string identifier for a peer, cheap to clone and hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentifier(Arc<str>);

impl PeerIdentifier {
	pub fn new(id: impl Into<Arc<str>>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for PeerIdentifier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl<T: Into<Arc<str>>> From<T> for PeerIdentifier {
	fn from(value: T) -> Self {
		Self::new(value)
	}
}

/// The transport-reported connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
	Available,
	Connecting,
	Unavailable,
}

/// A peer's observable state: its connection status and how many requests are
/// currently in flight against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStatus {
	pub connection_status: ConnectionStatus,
	pub pending_request_count: u32,
}

/// Any unavailable peer must outrank (score worse than) every available peer,
/// no matter how many requests are pending on the available ones.
pub const UNAVAILABLE_PENALTY: i64 = i32::MAX as i64;

impl PeerStatus {
	/// `score = pending + (unavailable ? UNAVAILABLE_PENALTY : 0)`.
	pub fn score(&self) -> i64 {
		let penalty = if self.connection_status == ConnectionStatus::Available {
			0
		} else {
			UNAVAILABLE_PENALTY
		};
		self.pending_request_count as i64 + penalty
	}
}

/// A handle to a remote endpoint, retained from a [`Transport`].
#[async_trait]
pub trait Peer: Send + Sync {
	fn id(&self) -> &PeerIdentifier;
	fn status(&self) -> PeerStatus;
	/// Bumps the pending-request count; called by a [`Chooser`] right before
	/// handing the peer to a caller.
	fn start_request(&self);
	/// Reverses [`Peer::start_request`]; called exactly once by the `finish`
	/// closure a [`Chooser`] returns from `choose`.
	fn end_request(&self);
}

/// Notified by the transport whenever a retained peer's status changes.
/// Implemented internally by both chooser types; consumers never implement
/// this themselves.
pub trait Subscriber: Send + Sync {
	fn notify_status_changed(&self, id: &PeerIdentifier);
}

/// The capability a chooser needs from the outside world: obtain and release
/// peer handles. Transport errors are opaque to this crate — they are boxed
/// into [`Error::TransportRetain`] / [`Error::TransportRelease`].
#[async_trait]
pub trait Transport: Send + Sync {
	async fn retain(
		&self,
		id: &PeerIdentifier,
		subscriber: Arc<dyn Subscriber>,
	) -> Result<Arc<dyn Peer>, Box<dyn std::error::Error + Send + Sync>>;

	async fn release(
		&self,
		id: &PeerIdentifier,
		subscriber: Arc<dyn Subscriber>,
	) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// A membership change applied to a [`List`] in one call.
#[derive(Debug, Clone, Default)]
pub struct ListUpdate {
	pub additions: Vec<PeerIdentifier>,
	pub removals: Vec<PeerIdentifier>,
}

/// A peer handle paired with the closure a chooser's caller must invoke
/// exactly once to release the pending-request accounting.
pub struct Chosen {
	pub peer: Arc<dyn Peer>,
	finished: bool,
}

impl Chosen {
	pub(crate) fn new(peer: Arc<dyn Peer>) -> Self {
		Self { peer, finished: false }
	}

	/// Releases the pending-request accounting for this call. Must be called
	/// exactly once; the error is informational only (no implementation in
	/// this crate currently varies behavior on it, but callers may use it to
	/// drive circuit breaking in their own outbound layer).
	pub fn finish(mut self, _err: Option<&Error>) {
		self.finished = true;
		self.peer.end_request();
	}
}

impl Drop for Chosen {
	fn drop(&mut self) {
		debug_assert!(self.finished, "Chosen::finish was not called before drop, this is a caller bug");
	}
}

/// Picks a single peer for one request.
#[async_trait]
pub trait Chooser: Send + Sync {
	/// `ctx` must carry a deadline — a chooser cannot distinguish "wait
	/// longer" from "wait forever" and rejects the ambiguity with
	/// [`Error::NoDeadline`].
	async fn choose(&self, ctx: &CallContext) -> Result<Chosen, Error>;
}

/// A chooser that also accepts membership updates.
#[async_trait]
pub trait List: Chooser {
	async fn update(&self, update: ListUpdate) -> Result<(), Error>;
}

/// The shared start/stop/running state machine both chooser implementations
/// are built on; see [`crate::lifecycle`].
#[async_trait]
pub trait Lifecycle: Send + Sync {
	async fn start(&self) -> Result<(), Error>;
	async fn stop(&self) -> Result<(), Error>;
	fn is_running(&self) -> bool;
}

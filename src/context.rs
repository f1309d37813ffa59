//! A minimal stand-in for the cancellation-and-deadline "context" threaded
//! through every blocking operation in this crate: a cancellation signal plus
//! an optional absolute deadline, mirroring how the rest of the ambient stack
//! this crate is grounded on propagates request deadlines with
//! `tokio_util::sync::CancellationToken` rather than inventing its own.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Carries the two things every suspension point in this crate needs to
/// respect: "how much longer can I wait" and "has the caller given up".
#[derive(Clone)]
pub struct CallContext {
	deadline: Option<Instant>,
	cancellation: CancellationToken,
}

impl Default for CallContext {
	fn default() -> Self {
		Self::new()
	}
}

impl CallContext {
	/// A context with no deadline and no cancellation in effect.
	pub fn new() -> Self {
		Self {
			deadline: None,
			cancellation: CancellationToken::new(),
		}
	}

	pub fn with_deadline(deadline: Instant) -> Self {
		Self {
			deadline: Some(deadline),
			cancellation: CancellationToken::new(),
		}
	}

	pub fn with_timeout(timeout: Duration) -> Self {
		Self::with_deadline(Instant::now() + timeout)
	}

	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}

	/// Time left until the deadline, or `None` if there is no deadline.
	/// Never negative: an already-elapsed deadline reports `Duration::ZERO`.
	pub fn remaining(&self) -> Option<Duration> {
		self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
	}

	pub fn cancellation(&self) -> &CancellationToken {
		&self.cancellation
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancellation.is_cancelled()
	}

	/// Derives a child context whose deadline is `min(self.deadline, now +
	/// timeout)`, sharing this context's cancellation — the standard shape of
	/// a per-attempt timeout nested inside an overall call deadline.
	pub fn child_with_timeout(&self, timeout: Duration) -> (Self, CancellationGuard) {
		let candidate = Instant::now() + timeout;
		let deadline = match self.deadline {
			Some(parent) => parent.min(candidate),
			None => candidate,
		};
		let child_token = self.cancellation.child_token();
		let child = Self {
			deadline: Some(deadline),
			cancellation: child_token.clone(),
		};
		(child, CancellationGuard(child_token))
	}

	/// Waits until either `duration` has elapsed or this context is
	/// cancelled, whichever comes first. Returns `true` if the sleep ran to
	/// completion, `false` if cancelled early.
	pub async fn sleep(&self, duration: Duration) -> bool {
		tokio::select! {
			_ = tokio::time::sleep(duration) => true,
			_ = self.cancellation.cancelled() => false,
		}
	}
}

/// Cancels its child token on drop, so a per-attempt context is always torn
/// down promptly once the attempt returns, win or lose — the Rust analogue of
/// "cancel the child context immediately upon return".
pub struct CancellationGuard(CancellationToken);

impl Drop for CancellationGuard {
	fn drop(&mut self) {
		self.0.cancel();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn child_timeout_is_capped_by_parent_deadline() {
		let parent = CallContext::with_timeout(Duration::from_millis(30));
		let (child, _guard) = parent.child_with_timeout(Duration::from_secs(5));
		let remaining = child.remaining().unwrap();
		assert!(remaining <= Duration::from_millis(30));
	}

	#[tokio::test]
	async fn child_guard_cancels_on_drop() {
		let parent = CallContext::new();
		let (child, guard) = parent.child_with_timeout(Duration::from_secs(5));
		assert!(!child.is_cancelled());
		drop(guard);
		assert!(child.is_cancelled());
		// The parent's own token must be unaffected.
		assert!(!parent.is_cancelled());
	}

	#[tokio::test]
	async fn no_deadline_reports_none() {
		let ctx = CallContext::new();
		assert!(ctx.remaining().is_none());
	}
}

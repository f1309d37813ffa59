//! A reusable `Idle -> Starting -> Running -> Stopping -> Stopped` state
//! machine, shared by both peer-list implementations.
//!
//! Modeled on the `tokio::sync::watch`-based readiness signaling this crate's
//! ambient stack favors over a bespoke condvar: the current state is always
//! cheaply observable, and waiting for a transition is just `wait_for` on a
//! receiver rather than a parked thread.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::context::CallContext;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
	Idle,
	Starting,
	Running,
	Stopping,
	Stopped,
}

/// The default bound on how long [`LifecycleOnce::wait_until_running`] will
/// wait when the caller's context carries no deadline of its own.
pub const DEFAULT_STARTUP_WAIT: Duration = Duration::from_secs(5);

pub struct LifecycleOnce {
	state: watch::Sender<LifecycleState>,
}

impl Default for LifecycleOnce {
	fn default() -> Self {
		Self::new()
	}
}

impl LifecycleOnce {
	pub fn new() -> Self {
		Self {
			state: watch::Sender::new(LifecycleState::Idle),
		}
	}

	pub fn current(&self) -> LifecycleState {
		*self.state.borrow()
	}

	pub fn is_running(&self) -> bool {
		self.current() == LifecycleState::Running
	}

	/// Runs `init` exactly once across however many callers race into
	/// `start`; concurrent and repeated calls all observe the same outcome.
	pub async fn start(&self, init: impl Future<Output = Result<(), Error>>) -> Result<(), Error> {
		let mut claimed = false;
		let _ = self.state.send_if_modified(|s| {
			if *s == LifecycleState::Idle {
				*s = LifecycleState::Starting;
				claimed = true;
				true
			} else {
				false
			}
		});

		if !claimed {
			// Another caller owns the transition (or it already happened);
			// just observe its result.
			let mut rx = self.state.subscribe();
			let _ = rx.wait_for(|s| *s != LifecycleState::Starting).await;
			return match *rx.borrow() {
				LifecycleState::Running => Ok(()),
				other => {
					debug!(?other, "start observed a non-running terminal state");
					Ok(())
				}
			};
		}

		match init.await {
			Ok(()) => {
				let _ = self.state.send(LifecycleState::Running);
				Ok(())
			}
			Err(err) => {
				warn!(error = %err, "initialization failed, marking stopped");
				let _ = self.state.send(LifecycleState::Stopped);
				Err(err)
			}
		}
	}

	/// Runs `teardown` exactly once. Idempotent: calling `stop` before
	/// `start`, or more than once, is a harmless no-op after the first call
	/// actually tears anything down.
	pub async fn stop(&self, teardown: impl Future<Output = Result<(), Error>>) -> Result<(), Error> {
		let mut claimed = false;
		let _ = self.state.send_if_modified(|s| match *s {
			LifecycleState::Running | LifecycleState::Starting | LifecycleState::Idle => {
				*s = LifecycleState::Stopping;
				claimed = true;
				true
			}
			LifecycleState::Stopping | LifecycleState::Stopped => false,
		});

		if !claimed {
			let mut rx = self.state.subscribe();
			let _ = rx.wait_for(|s| *s == LifecycleState::Stopped).await;
			return Ok(());
		}

		let result = teardown.await;
		let _ = self.state.send(LifecycleState::Stopped);
		result
	}

	/// Waits until the state reaches `Running`, bounded by `ctx`'s deadline
	/// (or [`DEFAULT_STARTUP_WAIT`] if `ctx` carries none) and its
	/// cancellation.
	pub async fn wait_until_running(&self, ctx: &CallContext) -> Result<(), Error> {
		if self.is_running() {
			return Ok(());
		}
		let mut rx = self.state.subscribe();
		let wait = rx.wait_for(|s| matches!(s, LifecycleState::Running | LifecycleState::Stopped));
		let timeout = ctx.remaining().unwrap_or(DEFAULT_STARTUP_WAIT);

		tokio::select! {
			biased;
			_ = ctx.cancellation().cancelled() => Err(Error::Timeout),
			res = wait => {
				match res {
					Ok(guard) if *guard == LifecycleState::Running => Ok(()),
					_ => Err(Error::StartupTimeout(timeout)),
				}
			}
			_ = tokio::time::sleep(timeout) => Err(Error::StartupTimeout(timeout)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn start_then_running() {
		let lc = LifecycleOnce::new();
		lc.start(async { Ok(()) }).await.unwrap();
		assert!(lc.is_running());
	}

	#[tokio::test]
	async fn repeated_start_runs_init_once() {
		let lc = LifecycleOnce::new();
		let calls = std::sync::atomic::AtomicU32::new(0);
		lc.start(async {
			calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			Ok(())
		})
		.await
		.unwrap();
		lc.start(async {
			calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			Ok(())
		})
		.await
		.unwrap();
		assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn failed_start_leaves_stopped() {
		let lc = LifecycleOnce::new();
		let err = lc.start(async { Err(Error::Timeout) }).await.unwrap_err();
		assert!(matches!(err, Error::Timeout));
		assert_eq!(lc.current(), LifecycleState::Stopped);
	}

	#[tokio::test]
	async fn stop_before_start_is_a_harmless_noop() {
		let lc = LifecycleOnce::new();
		lc.stop(async { Ok(()) }).await.unwrap();
		assert_eq!(lc.current(), LifecycleState::Stopped);
	}

	#[tokio::test]
	async fn repeated_stop_runs_teardown_once() {
		let lc = LifecycleOnce::new();
		lc.start(async { Ok(()) }).await.unwrap();
		let calls = std::sync::atomic::AtomicU32::new(0);
		lc.stop(async {
			calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			Ok(())
		})
		.await
		.unwrap();
		lc.stop(async {
			calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			Ok(())
		})
		.await
		.unwrap();
		assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn wait_until_running_returns_immediately_once_running() {
		let lc = LifecycleOnce::new();
		lc.start(async { Ok(()) }).await.unwrap();
		let ctx = CallContext::with_timeout(Duration::from_millis(10));
		lc.wait_until_running(&ctx).await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn wait_until_running_times_out_if_never_started() {
		let lc = LifecycleOnce::new();
		let ctx = CallContext::with_timeout(Duration::from_millis(50));
		let result = lc.wait_until_running(&ctx).await;
		assert!(matches!(result, Err(Error::StartupTimeout(_))));
	}
}

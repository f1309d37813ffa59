//! The retry middleware: per-attempt deadlines, replayable request bodies,
//! and backoff between attempts over a caller-supplied [`Outbound`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::backoff::{BackoffFactory, NoBackoff};
use crate::buffer::{self, BufferPool};
use crate::context::CallContext;
use crate::error::{Error, combine};
use crate::replay::{Body, ReplayableReader, new_replayable};

/// The default per-attempt timeout a [`Policy`] falls back to when none is
/// supplied: one second.
pub const DEFAULT_MAX_PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// The request attributes this core observes: everything else about the
/// request is opaque to it.
#[derive(Debug, Clone)]
pub struct RequestMeta {
	pub service: String,
	pub procedure: String,
}

impl RequestMeta {
	pub fn new(service: impl Into<String>, procedure: impl Into<String>) -> Self {
		Self {
			service: service.into(),
			procedure: procedure.into(),
		}
	}
}

/// A single unary attempt against a peer the outbound has itself chosen,
/// typically by consulting one of the peer lists in [`crate::peer`].
#[async_trait]
pub trait Outbound: Send + Sync {
	type Response: Send;

	async fn call(&self, ctx: CallContext, meta: &RequestMeta, body: &mut ReplayableReader) -> Result<Self::Response, Error>;
}

/// An immutable retry policy: how many extra attempts, how long each may
/// take, and what to wait between them.
#[derive(Clone)]
#[cfg_attr(feature = "serde", serde_with::serde_as)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Policy {
	pub retries: u32,
	#[cfg_attr(feature = "serde", serde_as(as = "serde_with::DurationMilliSeconds<u64>"))]
	pub max_per_attempt_timeout: Duration,
	#[cfg_attr(feature = "serde", serde(skip))]
	pub backoff_factory: Arc<dyn BackoffFactory>,
}

impl std::fmt::Debug for Policy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Policy")
			.field("retries", &self.retries)
			.field("max_per_attempt_timeout", &self.max_per_attempt_timeout)
			.finish_non_exhaustive()
	}
}

impl Default for Policy {
	fn default() -> Self {
		Self {
			retries: 0,
			max_per_attempt_timeout: DEFAULT_MAX_PER_ATTEMPT_TIMEOUT,
			backoff_factory: Arc::new(NoBackoff),
		}
	}
}

impl Policy {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_retries(mut self, retries: u32) -> Self {
		self.retries = retries;
		self
	}

	pub fn with_max_per_attempt_timeout(mut self, timeout: Duration) -> Self {
		self.max_per_attempt_timeout = timeout;
		self
	}

	pub fn with_backoff(mut self, factory: Arc<dyn BackoffFactory>) -> Self {
		self.backoff_factory = factory;
		self
	}
}

/// Resolves a [`Policy`] for a request. Implemented by [`ProcedurePolicyProvider`];
/// kept as a trait so callers needing something simpler (e.g. "always this one
/// policy") can implement it directly.
pub trait PolicyProvider: Send + Sync {
	fn policy_for(&self, meta: &RequestMeta) -> Policy;
}

/// Looks up a policy by `(service, procedure)`, falling back to `(service,
/// "")`, then to a provider-wide default, then to [`Policy::default`].
///
/// Mutated only during registration (via the `with_*` builders); read-only
/// thereafter.
#[derive(Default, Clone)]
pub struct ProcedurePolicyProvider {
	by_procedure: HashMap<(String, String), Policy>,
	by_service: HashMap<String, Policy>,
	default: Option<Policy>,
}

impl ProcedurePolicyProvider {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_procedure_policy(mut self, service: impl Into<String>, procedure: impl Into<String>, policy: Policy) -> Self {
		self.by_procedure.insert((service.into(), procedure.into()), policy);
		self
	}

	pub fn with_service_policy(mut self, service: impl Into<String>, policy: Policy) -> Self {
		self.by_service.insert(service.into(), policy);
		self
	}

	pub fn with_default_policy(mut self, policy: Policy) -> Self {
		self.default = Some(policy);
		self
	}
}

impl PolicyProvider for ProcedurePolicyProvider {
	fn policy_for(&self, meta: &RequestMeta) -> Policy {
		self.by_procedure
			.get(&(meta.service.clone(), meta.procedure.clone()))
			.or_else(|| self.by_service.get(&meta.service))
			.cloned()
			.or_else(|| self.default.clone())
			.unwrap_or_default()
	}
}

/// Runs `outbound.call` under `policy`, retrying retriable failures up to
/// `policy.retries` additional times, replaying `body` on each attempt and
/// backing off between them.
///
/// Draws a pooled buffer from the process-wide [`buffer::shared`] pool to tee
/// `body` into if it isn't already fully in memory.
pub async fn call<O: Outbound>(ctx: &CallContext, meta: RequestMeta, body: impl Into<Body>, provider: &dyn PolicyProvider, outbound: &O) -> Result<O::Response, Error> {
	call_with_pool(ctx, meta, body, provider, outbound, buffer::shared()).await
}

/// As [`call`], but drawing from a caller-supplied [`BufferPool`] instead of
/// the process-wide default — useful for tests and for hosts that want
/// isolated pools per tenant.
pub async fn call_with_pool<O: Outbound>(
	ctx: &CallContext,
	meta: RequestMeta,
	body: impl Into<Body>,
	provider: &dyn PolicyProvider,
	outbound: &O,
	pool: Arc<BufferPool>,
) -> Result<O::Response, Error> {
	let policy = provider.policy_for(&meta);
	let mut reader = new_replayable(body.into(), pool);
	let mut backoff = policy.backoff_factory.new_backoff();

	for attempt in 0..=policy.retries {
		let per_attempt = match ctx.remaining() {
			Some(remaining) => policy.max_per_attempt_timeout.min(remaining),
			None => policy.max_per_attempt_timeout,
		};
		debug!(service = %meta.service, procedure = %meta.procedure, attempt, ?per_attempt, "attempting outbound call");
		let (child_ctx, _guard) = ctx.child_with_timeout(per_attempt);
		let result = match tokio::time::timeout(per_attempt, outbound.call(child_ctx, &meta, &mut reader)).await {
			Ok(result) => result,
			Err(_) => Err(Error::Timeout),
		};
		// `_guard` drops here, cancelling the per-attempt context immediately
		// whether the attempt succeeded, failed, or timed out.

		let err = match result {
			Ok(response) => return Ok(response),
			Err(err) if !err.is_retriable() => return Err(err),
			Err(err) => err,
		};

		if let Err(reset_err) = reader.reset().await {
			return Err(combine([Some(err), Some(reset_err)]).expect("two Some inputs always combine to Some"));
		}

		if attempt == policy.retries {
			return Err(err);
		}

		let delay = backoff.delay(attempt);
		if let Some(remaining) = ctx.remaining() {
			if remaining <= delay {
				return Err(err);
			}
		}

		warn!(service = %meta.service, procedure = %meta.procedure, attempt, ?delay, error = %err, "retriable failure, backing off before next attempt");
		if !ctx.sleep(delay).await {
			return Err(err);
		}
	}

	unreachable!("the loop above always returns by the final attempt")
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

//! Backoff strategies: factories that produce a per-call closure mapping an
//! attempt number to a delay.

use std::time::Duration;

use rand::{Rng, SeedableRng};

/// Maps an attempt number (0-based) to the delay to sleep before the next
/// attempt. A new `Backoff` is instantiated once per outer retry `call`
/// invocation — stateful strategies (like [`Exponential`]) must not be shared
/// across parallel calls.
pub trait Backoff: Send {
	fn delay(&mut self, attempt: u32) -> Duration;
}

/// A factory that produces one [`Backoff`] per call.
pub trait BackoffFactory: Send + Sync {
	fn new_backoff(&self) -> Box<dyn Backoff>;
}

/// Never backs off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
	fn delay(&mut self, _attempt: u32) -> Duration {
		Duration::ZERO
	}
}

impl BackoffFactory for NoBackoff {
	fn new_backoff(&self) -> Box<dyn Backoff> {
		Box::new(NoBackoff)
	}
}

/// Always waits the same fixed delay.
#[derive(Debug, Clone, Copy)]
pub struct Fixed(pub Duration);

impl Backoff for Fixed {
	fn delay(&mut self, _attempt: u32) -> Duration {
		self.0
	}
}

impl BackoffFactory for Fixed {
	fn new_backoff(&self) -> Box<dyn Backoff> {
		Box::new(*self)
	}
}

/// Exponential backoff with full jitter: for attempt `n`, picks a uniform
/// random duration in `[0, min(max, base * 2^n))` and adds `min`, capping the
/// result at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Exponential {
	pub min: Duration,
	pub base: Duration,
	pub max: Duration,
}

impl BackoffFactory for Exponential {
	fn new_backoff(&self) -> Box<dyn Backoff> {
		Box::new(ExponentialBackoff {
			spec: *self,
			rng: rand::rngs::StdRng::from_os_rng(),
		})
	}
}

struct ExponentialBackoff {
	spec: Exponential,
	// A per-closure seeded RNG avoids contention with a shared global
	// generator across concurrently-retrying calls.
	rng: rand::rngs::StdRng,
}

impl Backoff for ExponentialBackoff {
	fn delay(&mut self, attempt: u32) -> Duration {
		let upper = self.spec.base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
		let upper = upper.min(self.spec.max);
		// `Duration` has no `SampleUniform` impl in `rand`, so jitter is drawn
		// over the nanosecond count instead and converted back.
		let upper_nanos = upper.as_nanos().min(u64::MAX as u128) as u64;
		let jitter_nanos = if upper_nanos == 0 {
			0
		} else {
			self.rng.random_range(0..=upper_nanos)
		};
		(self.spec.min + Duration::from_nanos(jitter_nanos)).min(self.spec.max)
	}
}

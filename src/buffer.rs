//! A process-wide pool of recyclable byte buffers, used by [`crate::replay`] to
//! tee request bodies without allocating fresh heap buffers on every attempt.

use std::sync::Arc;

use bytes::BytesMut;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Buffers larger than this are dropped instead of returned to the pool, so a
/// handful of oversized requests cannot pin an unbounded amount of memory.
pub const DEFAULT_MAX_POOL_CAPACITY: usize = 64 * 1024;

/// A concurrent pool of `BytesMut` buffers.
///
/// `get`/`put` are safe to call from any number of threads concurrently; there
/// is no ordering or fairness guarantee about which buffer a given `get` gets
/// back.
pub struct BufferPool {
	max_capacity: usize,
	free: Mutex<Vec<BytesMut>>,
}

impl Default for BufferPool {
	fn default() -> Self {
		Self::with_capacity_cap(DEFAULT_MAX_POOL_CAPACITY)
	}
}

impl BufferPool {
	/// Builds a pool that drops buffers whose capacity exceeds `max_capacity`
	/// rather than retaining them.
	pub fn with_capacity_cap(max_capacity: usize) -> Self {
		Self {
			max_capacity,
			free: Mutex::new(Vec::new()),
		}
	}

	/// Returns an empty buffer, reusing a pooled one if one is available.
	pub fn get(&self) -> BytesMut {
		let mut buf = self.free.lock().pop().unwrap_or_default();
		buf.clear();
		buf
	}

	/// Returns a buffer to the pool. Buffers whose capacity exceeds the pool's
	/// cap are dropped instead, to bound retained memory.
	pub fn put(&self, buf: BytesMut) {
		if buf.capacity() > self.max_capacity {
			return;
		}
		self.free.lock().push(buf);
	}
}

static SHARED: Lazy<Arc<BufferPool>> = Lazy::new(|| Arc::new(BufferPool::default()));

/// The process-wide pool the retry middleware draws from unless a caller
/// supplies its own.
pub fn shared() -> Arc<BufferPool> {
	SHARED.clone()
}

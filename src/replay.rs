//! Turns a one-shot byte stream into a replayable one by teeing consumed bytes
//! into a pooled buffer, so the retry middleware can retransmit a request body
//! without re-reading (or re-producing) the original source.
//!
//! ## Reset policy
//!
//! Two reset policies are described upstream: a strict one that rejects a
//! `reset` before the source has signalled end-of-stream, and a permissive
//! one that drains the remainder of the source into the buffer first. This
//! implementation chooses the **permissive** policy. `tokio::io::AsyncRead`
//! never bundles a final data chunk together with EOF in the same poll (EOF
//! is always its own, separate zero-length read) the way some other
//! ecosystems' readers do, so under the strict policy a caller who read
//! exactly to the end of a source — without an extra read call to observe the
//! trailing EOF — would be unable to reset at all. The permissive policy
//! avoids that trap at the cost of an extra drain read on the rare reset that
//! happens mid-stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::buffer::BufferPool;
use crate::error::Error;

/// The request body handed to [`new_replayable`].
///
/// The three variants correspond to the three aliasing cases worth
/// special-casing: a source that is already replayable is reused as-is, an
/// in-memory source is used directly with no pooled buffer at all, and
/// anything else is read through a pooled buffer.
pub enum Body {
	/// Already-buffered bytes, used directly without allocating a pool buffer.
	Bytes(Bytes),
	/// An already-replayable reader, reused as-is.
	Replayable(ReplayableReader),
	/// Any other one-shot byte stream.
	Stream(Box<dyn AsyncRead + Unpin + Send>),
}

impl From<Bytes> for Body {
	fn from(b: Bytes) -> Self {
		Body::Bytes(b)
	}
}

impl From<ReplayableReader> for Body {
	fn from(r: ReplayableReader) -> Self {
		Body::Replayable(r)
	}
}

enum State {
	Streaming {
		src: Box<dyn AsyncRead + Unpin + Send>,
		buf: BytesMut,
		/// Set on the first read; distinguishes "nothing consumed yet" (reset
		/// is a no-op) from "partially consumed" (reset must drain first).
		started: bool,
	},
	Buffered {
		data: Bytes,
		pos: usize,
	},
}

/// A byte stream that can be replayed from the beginning after being fully
/// (or partially) consumed once.
///
/// Not safe for concurrent consumers: driving two reads (or a read and a
/// reset) on the same instance at once is a caller bug, matching the
/// single-consumer contract every retry attempt relies on.
pub struct ReplayableReader {
	state: State,
	pool: std::sync::Arc<BufferPool>,
}

impl std::fmt::Debug for ReplayableReader {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let variant = match &self.state {
			State::Streaming { started, .. } => format!("Streaming {{ started: {started} }}"),
			State::Buffered { data, pos } => format!("Buffered {{ len: {}, pos: {pos} }}", data.len()),
		};
		f.debug_struct("ReplayableReader").field("state", &variant).finish()
	}
}

/// Wraps `src` so it can be replayed, drawing a pooled buffer from `pool` if
/// the source isn't already fully in memory.
///
/// There is no separate close callback to invoke on scope exit: the pooled
/// buffer is returned automatically when the reader is dropped.
pub fn new_replayable(src: Body, pool: std::sync::Arc<BufferPool>) -> ReplayableReader {
	match src {
		Body::Replayable(reader) => reader,
		Body::Bytes(data) => ReplayableReader {
			state: State::Buffered { data, pos: 0 },
			pool,
		},
		Body::Stream(src) => ReplayableReader {
			state: State::Streaming {
				src,
				buf: pool.get(),
				started: false,
			},
			pool,
		},
	}
}

impl ReplayableReader {
	/// Returns the reader to position zero. See the module docs for the
	/// chosen reset policy.
	pub async fn reset(&mut self) -> Result<(), Error> {
		match &mut self.state {
			State::Buffered { pos, .. } => {
				*pos = 0;
				Ok(())
			},
			State::Streaming { started, .. } if !*started => Ok(()),
			State::Streaming { src, buf, .. } => {
				let mut tmp = [0u8; 8 * 1024];
				loop {
					let n = src.read(&mut tmp).await.map_err(Error::ResetFailure)?;
					if n == 0 {
						break;
					}
					buf.extend_from_slice(&tmp[..n]);
				}
				let data = std::mem::take(buf).freeze();
				self.state = State::Buffered { data, pos: 0 };
				Ok(())
			},
		}
	}
}

impl AsyncRead for ReplayableReader {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		out: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		// Every field is `Unpin` (a `Box<dyn AsyncRead>`, `BytesMut`, `Bytes`),
		// so projecting through `Pin` is just a reborrow.
		let this = self.get_mut();
		match &mut this.state {
			State::Streaming { src, buf, started } => {
				*started = true;
				let before = out.filled().len();
				match Pin::new(&mut **src).poll_read(cx, out) {
					Poll::Pending => Poll::Pending,
					Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
					Poll::Ready(Ok(())) => {
						let n = out.filled().len() - before;
						if n == 0 {
							let data = std::mem::take(buf).freeze();
							let len = data.len();
							this.state = State::Buffered { data, pos: len };
						} else {
							buf.extend_from_slice(&out.filled()[before..before + n]);
						}
						Poll::Ready(Ok(()))
					},
				}
			},
			State::Buffered { data, pos } => {
				let remaining = &data[*pos..];
				let n = remaining.len().min(out.remaining());
				out.put_slice(&remaining[..n]);
				*pos += n;
				Poll::Ready(Ok(()))
			},
		}
	}
}

impl Drop for ReplayableReader {
	fn drop(&mut self) {
		if let State::Streaming { buf, .. } = &mut self.state {
			let buf = std::mem::take(buf);
			self.pool.put(buf);
		}
	}
}

#[cfg(test)]
#[path = "replay_tests.rs"]
mod tests;

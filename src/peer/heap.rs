//! An intrusive binary min-heap over peer scores, with a secondary
//! round-robin ordering for equally-scored peers.
//!
//! Each entry lives in a stable slot (an [`EntryKey`]) independent of its
//! current position in the heap array, so a caller can hold onto a key across
//! heap reorderings and still `update`/`delete`/`validate` it in O(log n)
//! without chasing raw pointers — the slot table the design notes recommend
//! in place of a back-reference.

use std::sync::Arc;

use super::{Peer, PeerIdentifier, PeerStatus};
use crate::error::Error;

/// A stable handle to a heap entry, valid until that entry is [`PeerHeap::delete`]d.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey(usize);

struct Entry {
	id: PeerIdentifier,
	peer: Arc<dyn Peer>,
	status: PeerStatus,
	score: i64,
	/// Current position of this entry's slot within `PeerHeap::order`.
	heap_index: usize,
	insertion_rank: u64,
}

/// The min-heap itself. `order[i]` is the slot index stored at heap position
/// `i`; `slab[slot].heap_index == i` is the invariant kept on every swap.
#[derive(Default)]
pub struct PeerHeap {
	slab: Vec<Option<Entry>>,
	free: Vec<usize>,
	order: Vec<usize>,
	next_rank: u64,
}

fn less(a: &Entry, b: &Entry) -> bool {
	(a.score, a.insertion_rank) < (b.score, b.insertion_rank)
}

impl PeerHeap {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.order.len()
	}

	pub fn is_empty(&self) -> bool {
		self.order.is_empty()
	}

	fn entry(&self, key: EntryKey) -> &Entry {
		self.slab[key.0].as_ref().expect("dangling EntryKey")
	}

	fn entry_mut(&mut self, key: EntryKey) -> &mut Entry {
		self.slab[key.0].as_mut().expect("dangling EntryKey")
	}

	fn slot_at(&self, heap_index: usize) -> usize {
		self.order[heap_index]
	}

	fn key_at(&self, heap_index: usize) -> EntryKey {
		EntryKey(self.slot_at(heap_index))
	}

	fn swap(&mut self, i: usize, j: usize) {
		self.order.swap(i, j);
		let si = self.order[i];
		let sj = self.order[j];
		self.slab[si].as_mut().unwrap().heap_index = i;
		self.slab[sj].as_mut().unwrap().heap_index = j;
	}

	fn sift_up(&mut self, mut i: usize) {
		while i > 0 {
			let parent = (i - 1) / 2;
			if less(self.entry(self.key_at(i)), self.entry(self.key_at(parent))) {
				self.swap(i, parent);
				i = parent;
			} else {
				break;
			}
		}
	}

	fn sift_down(&mut self, mut i: usize) {
		let len = self.order.len();
		loop {
			let left = 2 * i + 1;
			let right = 2 * i + 2;
			let mut smallest = i;
			if left < len && less(self.entry(self.key_at(left)), self.entry(self.key_at(smallest))) {
				smallest = left;
			}
			if right < len && less(self.entry(self.key_at(right)), self.entry(self.key_at(smallest))) {
				smallest = right;
			}
			if smallest == i {
				break;
			}
			self.swap(i, smallest);
			i = smallest;
		}
	}

	/// Inserts a new entry, assigning it the next insertion rank, and returns
	/// a stable key for it.
	pub fn push(&mut self, id: PeerIdentifier, peer: Arc<dyn Peer>, status: PeerStatus) -> EntryKey {
		self.next_rank += 1;
		let entry = Entry {
			id,
			peer,
			score: status.score(),
			status,
			heap_index: self.order.len(),
			insertion_rank: self.next_rank,
		};
		let slot = if let Some(slot) = self.free.pop() {
			self.slab[slot] = Some(entry);
			slot
		} else {
			self.slab.push(Some(entry));
			self.slab.len() - 1
		};
		self.order.push(slot);
		let i = self.order.len() - 1;
		self.sift_up(i);
		EntryKey(slot)
	}

	/// Removes and returns the root (lowest score, then lowest insertion
	/// rank).
	pub fn pop(&mut self) -> Option<(EntryKey, PeerIdentifier, Arc<dyn Peer>, PeerStatus)> {
		if self.order.is_empty() {
			return None;
		}
		let key = self.key_at(0);
		let info = {
			let e = self.entry(key);
			(e.id.clone(), e.peer.clone(), e.status)
		};
		self.delete(key).expect("root key is always valid");
		Some((key, info.0, info.1, info.2))
	}

	/// The current root, without removing it.
	pub fn peek(&self) -> Option<EntryKey> {
		if self.order.is_empty() {
			None
		} else {
			Some(self.key_at(0))
		}
	}

	pub fn id(&self, key: EntryKey) -> &PeerIdentifier {
		&self.entry(key).id
	}

	pub fn peer(&self, key: EntryKey) -> Arc<dyn Peer> {
		self.entry(key).peer.clone()
	}

	pub fn status(&self, key: EntryKey) -> PeerStatus {
		self.entry(key).status
	}

	/// Rotates `key` to the end of its score band by assigning it a fresh
	/// insertion rank and re-heapifying — this is the operation that
	/// implements round-robin across equally-scored peers.
	pub fn bump_insertion_rank(&mut self, key: EntryKey) {
		self.next_rank += 1;
		let rank = self.next_rank;
		let i = {
			let e = self.entry_mut(key);
			e.insertion_rank = rank;
			e.heap_index
		};
		// A later insertion rank can only ever make this entry's band later,
		// i.e. it can only need to move further from the root.
		self.sift_down(i);
	}

	/// Recomputes `key`'s score from `status` and re-heapifies at its current
	/// position, sifting up or down as needed.
	pub fn update_status(&mut self, key: EntryKey, status: PeerStatus) {
		let i = {
			let e = self.entry_mut(key);
			e.status = status;
			e.score = status.score();
			e.heap_index
		};
		self.update(i);
	}

	/// Re-heapifies the entry currently at heap position `i`.
	fn update(&mut self, i: usize) {
		let parent_ok = i == 0 || !less(self.entry(self.key_at(i)), self.entry(self.key_at((i - 1) / 2)));
		if parent_ok {
			self.sift_down(i);
		} else {
			self.sift_up(i);
		}
	}

	/// Removes `key` from the heap entirely, freeing its slot.
	pub fn delete(&mut self, key: EntryKey) -> Option<(PeerIdentifier, Arc<dyn Peer>, PeerStatus)> {
		if self.slab.get(key.0).and_then(|s| s.as_ref()).is_none() {
			return None;
		}
		let i = self.entry(key).heap_index;
		let last = self.order.len() - 1;
		if i != last {
			self.swap(i, last);
		}
		self.order.pop();
		if i < self.order.len() {
			self.update(i);
		}
		let entry = self.slab[key.0].take().expect("checked above");
		self.free.push(key.0);
		Some((entry.id, entry.peer, entry.status))
	}

	/// Defensive check that `key`'s bookkeeping is self-consistent: used to
	/// detect double-release bugs before they corrupt the heap.
	pub fn validate(&self, key: EntryKey) -> Result<(), Error> {
		let Some(Some(entry)) = self.slab.get(key.0) else {
			return Err(Error::HeapCorruption {
				id: PeerIdentifier::new(format!("<freed slot {}>", key.0)),
			});
		};
		let consistent = self.order.get(entry.heap_index) == Some(&key.0);
		if !consistent {
			return Err(Error::HeapCorruption { id: entry.id.clone() });
		}
		Ok(())
	}
}

#[cfg(test)]
#[path = "heap_tests.rs"]
mod tests;

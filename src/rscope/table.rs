//! The per-thread token table backing request-local scopes.
//!
//! Tokens are small integers indexing into the thread's table. The table distinguishes
//! *cached* slots — used before, sitting on a free list — from the *unused* tail that has
//! never been handed out. Allocation prefers the cache, then grows the table by doubling up
//! to a hard cap, beyond which allocation fails rather than letting one request starve the
//! thread.

use {
	super::Entity,
	crate::{Error, Result},
	std::sync::{Arc, Mutex, MutexGuard},
};

pub(super) const NIL: u32 = u32::MAX;

const INIT_CAPACITY: usize = 32;
const CAPACITY_LIMIT: usize = 65536;

pub(super) struct Entry {
	pub(super) next: u32,
	pub(super) scope_id: u64,
	pub(super) data: Option<Entity>,
}

pub(super) struct Entries {
	pub(super) slots: Vec<Entry>,
	pub(super) cached: u32,
	capacity: usize,
}

impl Entries {
	fn new() -> Self {
		Self { slots: Vec::new(), cached: NIL, capacity: INIT_CAPACITY }
	}

	/// Grows the capacity bound so at least `want` tokens fit. Idempotent: asking for the
	/// same bound twice changes nothing.
	pub(super) fn ensure_capacity(&mut self, want: usize) -> Result<()> {
		if want > CAPACITY_LIMIT {
			return Err(Error::Resource("scope token table capacity limit exceeded"));
		}
		while self.capacity < want {
			self.capacity *= 2;
		}
		Ok(())
	}

	pub(super) fn alloc(&mut self, scope_id: u64, data: Entity) -> Result<u32> {
		if self.cached != NIL {
			let tok = self.cached;
			let entry = self
				.slots
				.get_mut(tok as usize)
				.ok_or(Error::State("corrupted token free list"))?;
			self.cached = entry.next;
			entry.next = NIL;
			entry.scope_id = scope_id;
			entry.data = Some(data);
			return Ok(tok);
		}

		if self.slots.len() >= self.capacity {
			if self.capacity * 2 > CAPACITY_LIMIT {
				tracing::error!(limit = CAPACITY_LIMIT, "scope token table reached its size limit");
				return Err(Error::Resource("scope token table exhausted"));
			}
			tracing::debug!(capacity = self.capacity * 2, "scope token table resized");
			self.capacity *= 2;
		}

		#[allow(clippy::cast_possible_truncation)] // bounded by CAPACITY_LIMIT
		let tok = self.slots.len() as u32;
		self.slots.push(Entry { next: NIL, scope_id, data: Some(data) });
		Ok(tok)
	}

	/// Releases a slot back to the cached list, dropping its entity reference.
	pub(super) fn release(&mut self, tok: u32) {
		if let Some(entry) = self.slots.get_mut(tok as usize) {
			entry.data = None;
			entry.next = self.cached;
			self.cached = tok;
		}
	}
}

/// The table shared between a thread and the scopes it issued. Scopes hold an `Arc` so a
/// request parked across threads can still release its tokens into the right table.
pub(super) struct ThreadTable {
	inner: Mutex<Entries>,
}

impl ThreadTable {
	fn new() -> Self {
		Self { inner: Mutex::new(Entries::new()) }
	}

	pub(super) fn lock(&self) -> MutexGuard<'_, Entries> {
		self.inner.lock().unwrap_or_else(|p| p.into_inner())
	}
}

thread_local! {
	static TABLE: Arc<ThreadTable> = Arc::new(ThreadTable::new());
}

pub(super) fn current_table() -> Arc<ThreadTable> {
	TABLE.with(Arc::clone)
}

/// Pre-grows the calling thread's token table so at least `want` live tokens fit without a
/// resize. Calling it again with the same bound is a no-op.
pub fn ensure_capacity(want: usize) -> Result<()> {
	current_table().lock().ensure_capacity(want)
}

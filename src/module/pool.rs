//! Object pools with per-thread-class caching.
//!
//! Pipe handles originate on event-loop threads and die on worker or async threads, so a
//! single free list would be drained from one side and refilled from the other through the
//! global lock on every operation. Instead each pool keeps a global free list plus a
//! per-thread cache whose size is governed by the class of the thread: event-loop threads may
//! cache a lot (they allocate at a high rate), worker/async/io threads only a little (they
//! mostly return objects, and those objects should flow back to the global list quickly).

use {
	crate::thread::{self, ThreadKind},
	std::{
		any::Any,
		cell::RefCell,
		collections::HashMap,
		sync::{
			atomic::{AtomicIsize, AtomicUsize, Ordering::*},
			Mutex,
		},
	},
};

/// Per-thread-class caching policy of an [`ObjPool`].
#[derive(Copy, Clone, Debug)]
pub struct TlpPolicy {
	/// Most objects a thread of this class keeps in its local cache.
	pub cache_limit: usize,
	/// How many objects a cache miss pulls from the global list at once.
	pub alloc_unit: usize,
}

impl TlpPolicy {
	/// The producer policy: large cache, bulk refill.
	pub const PRODUCER: Self = Self { cache_limit: 1024, alloc_unit: 128 };
	/// The consumer policy: objects drain back to the global list quickly.
	pub const CONSUMER: Self = Self { cache_limit: 32, alloc_unit: 32 };
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
	// pool id -> Vec<T> behind Any, one slot per pool that ever hit this thread
	static CACHES: RefCell<HashMap<usize, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// A recycling pool of `T` objects.
///
/// The pool never constructs objects unless given a constructor; [`ObjPool::take`] simply
/// reports a miss and the caller builds a fresh object, which may later be [`put`] back.
///
/// [`put`]: ObjPool::put
pub struct ObjPool<T> {
	id: usize,
	global: Mutex<Vec<T>>,
	policies: [TlpPolicy; ThreadKind::COUNT],
	ctor: Option<Box<dyn Fn() -> T + Send + Sync>>,
	// may dip below zero when objects constructed outside the pool are put into it
	outstanding: AtomicIsize,
}

impl<T: Send + 'static> ObjPool<T> {
	/// Creates a pool without a constructor.
	pub fn new() -> Self {
		Self {
			id: NEXT_POOL_ID.fetch_add(1, Relaxed),
			global: Mutex::new(Vec::new()),
			policies: [TlpPolicy::CONSUMER; ThreadKind::COUNT],
			ctor: None,
			outstanding: AtomicIsize::new(0),
		}
	}

	/// Creates a pool that builds fresh objects with `ctor` on a miss, enabling
	/// [`ObjPool::alloc`].
	pub fn with_ctor(ctor: impl Fn() -> T + Send + Sync + 'static) -> Self {
		let mut ret = Self::new();
		ret.ctor = Some(Box::new(ctor));
		ret
	}

	/// Sets the caching policy for one thread class. Only meaningful before the pool is
	/// shared.
	pub fn set_thread_policy(&mut self, kind: ThreadKind, policy: TlpPolicy) {
		self.policies[kind.index()] = policy;
	}

	fn policy(&self) -> TlpPolicy {
		self.policies[thread::current_kind().index()]
	}

	fn with_cache<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
		CACHES.with(|caches| {
			let mut caches = caches.borrow_mut();
			let slot = caches.entry(self.id).or_insert_with(|| Box::new(Vec::<T>::new()));
			let vec = slot
				.downcast_mut::<Vec<T>>()
				.expect("pool id collision in the thread-local cache");
			f(vec)
		})
	}

	/// Takes a recycled object, refilling the local cache from the global list on a miss.
	/// `None` means the pool has nothing to offer and the caller should construct.
	pub fn take(&self) -> Option<T> {
		let refill = self.policy().alloc_unit;
		let got = self.with_cache(|cache| {
			if cache.is_empty() {
				let mut global = self.global.lock().unwrap_or_else(|p| p.into_inner());
				let n = refill.min(global.len());
				let at = global.len().saturating_sub(n);
				cache.extend(global.drain(at..));
			}
			cache.pop()
		});
		if got.is_some() {
			self.outstanding.fetch_add(1, Relaxed);
		}
		got
	}

	/// Takes or constructs an object. Requires a constructor.
	pub fn alloc(&self) -> T {
		match self.take() {
			Some(obj) => obj,
			None => {
				self.outstanding.fetch_add(1, Relaxed);
				let ctor = self.ctor.as_ref().expect("pool has no constructor");
				ctor()
			}
		}
	}

	/// Returns an object to the pool. Overflow beyond the thread-class cache limit spills to
	/// the global list.
	pub fn put(&self, obj: T) {
		let limit = self.policy().cache_limit;
		self.outstanding.fetch_sub(1, Relaxed);
		self.with_cache(|cache| {
			cache.push(obj);
			if cache.len() > limit {
				let keep = limit / 2;
				let mut global = self.global.lock().unwrap_or_else(|p| p.into_inner());
				global.extend(cache.drain(keep..));
			}
		});
	}

	/// How many objects are currently out of the pool (taken or constructed and not yet
	/// returned).
	pub fn outstanding(&self) -> usize {
		self.outstanding.load(Relaxed).max(0).unsigned_abs()
	}
}

impl<T: Send + 'static> Default for ObjPool<T> {
	fn default() -> Self {
		Self::new()
	}
}

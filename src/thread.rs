//! Thread classes and the named-thread spawn helper.
//!
//! Every runtime thread carries a class. The class feeds the per-module handle pools, which
//! cache aggressively on event-loop threads (they allocate pipe handles at a high rate and
//! hand them off) and sparingly on worker and async threads (they mostly return handles, and
//! the global pool should stay hot for the producers).

use std::{cell::Cell, io, thread};

/// The class of the current thread, as seen by pool policies and diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadKind {
	/// An I/O-module event loop thread; the usual producer of pipe handles.
	Event,
	/// A scheduler worker thread walking graph traversals.
	Worker,
	/// An async-task-processor thread.
	Async,
	/// A module-internal I/O helper thread.
	Io,
}

impl ThreadKind {
	pub(crate) const COUNT: usize = 4;

	#[inline]
	pub(crate) fn index(self) -> usize {
		match self {
			Self::Event => 0,
			Self::Worker => 1,
			Self::Async => 2,
			Self::Io => 3,
		}
	}
}

thread_local! {
	static CURRENT: Cell<ThreadKind> = const { Cell::new(ThreadKind::Worker) };
}

/// The class of the calling thread. Threads not created through [`spawn_kind`] count as
/// workers, which gets them the conservative pool policy.
pub fn current_kind() -> ThreadKind {
	CURRENT.with(Cell::get)
}

/// Spawns a named thread of the given class.
pub fn spawn_kind<F, T>(kind: ThreadKind, name: &str, f: F) -> io::Result<thread::JoinHandle<T>>
where
	F: FnOnce() -> T + Send + 'static,
	T: Send + 'static,
{
	thread::Builder::new().name(name.to_owned()).spawn(move || {
		CURRENT.with(|c| c.set(kind));
		f()
	})
}

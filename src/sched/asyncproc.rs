//! The async task processor (ATP).
//!
//! Workers must never block on slow work, so an asynchronous servlet splits its execution:
//! `async_setup` runs inline on the worker (it must be cheap), the posted `async_exec` runs
//! here on a dedicated thread pool, and `async_cleanup` runs back on a worker once the
//! completion event makes it through the event queue.
//!
//! The queue is a plain mutex-and-condvar FIFO on purpose: posting is rare and tiny next to
//! the work being posted, so a lock-free design would buy nothing but subtlety. One condvar
//! serves both sides — the queue is never simultaneously full and empty, so a writer and a
//! reader never wait at the same time.

use {
	super::request::RequestRun,
	crate::{
		equeue::{AsyncEvent, Equeue, Event, EventMask, ProducerToken},
		task::Task,
		thread, Result, ShutdownToken,
	},
	std::{
		collections::VecDeque,
		io,
		sync::{
			atomic::{AtomicBool, Ordering::*},
			Arc, Condvar, Mutex,
		},
	},
};

/// The rendezvous object between the three phases of one asynchronous execution and the
/// scheduler.
///
/// `async_exec` signals its completion through the handle; `async_cleanup` can ask the
/// handle whether the exec phase failed.
pub struct AsyncHandle {
	failed: AtomicBool,
	completed: AtomicBool,
	parked: Mutex<Option<Parked>>,
}

impl AsyncHandle {
	pub(crate) fn new() -> Self {
		Self {
			failed: AtomicBool::new(false),
			completed: AtomicBool::new(false),
			parked: Mutex::new(None),
		}
	}

	/// Whether the exec phase has finished.
	pub fn completed(&self) -> bool {
		self.completed.load(Acquire)
	}

	/// Whether the exec phase (or the posting path) reported an error. Meaningful to the
	/// cleanup phase.
	pub fn failed(&self) -> bool {
		self.failed.load(Acquire)
	}

	pub(crate) fn set_failed(&self) {
		self.failed.store(true, Release);
	}

	pub(crate) fn mark_completed(&self) {
		self.completed.store(true, Release);
	}

	pub(crate) fn park(&self, parked: Parked) {
		let mut slot = self.parked.lock().unwrap_or_else(|p| p.into_inner());
		*slot = Some(parked);
	}

	pub(crate) fn take_parked(&self) -> Option<Parked> {
		self.parked.lock().unwrap_or_else(|p| p.into_inner()).take()
	}
}

impl std::fmt::Debug for AsyncHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AsyncHandle")
			.field("completed", &self.completed())
			.field("failed", &self.failed())
			.finish_non_exhaustive()
	}
}

/// A request waiting for its async node to complete: the traversal state plus the cleanup
/// task that owns the node's pipes.
pub(crate) struct Parked {
	pub(crate) run: RequestRun,
	pub(crate) cleanup: Task,
}

struct AsyncJob {
	task: Task,
}

/// The processor: the bounded FIFO plus the completion route back into the event queue.
pub(crate) struct AsyncProc {
	queue: Mutex<VecDeque<AsyncJob>>,
	cap: usize,
	cond: Condvar,
	equeue: Arc<Equeue>,
	token: ProducerToken,
	shutdown: ShutdownToken,
}

impl AsyncProc {
	pub(crate) fn new(capacity: u32, equeue: Arc<Equeue>, shutdown: ShutdownToken) -> Result<Self> {
		let token = equeue.producer_token(EventMask::ASYNC)?;
		Ok(Self {
			queue: Mutex::new(VecDeque::new()),
			cap: crate::next_pow2(capacity) as usize,
			cond: Condvar::new(),
			equeue,
			token,
			shutdown,
		})
	}

	pub(crate) fn spawn_threads(
		self: &Arc<Self>,
		nthreads: u32,
	) -> io::Result<Vec<std::thread::JoinHandle<()>>> {
		(0..nthreads)
			.map(|i| {
				let this = Arc::clone(self);
				thread::spawn_kind(thread::ThreadKind::Async, &format!("PbAsync-{i}"), move || {
					this.main();
				})
			})
			.collect()
	}

	pub(crate) fn wake(&self) {
		self.cond.notify_all();
	}

	fn main(&self) {
		tracing::debug!("async processor thread started");
		loop {
			let job = {
				let guard = self.queue.lock().unwrap_or_else(|p| p.into_inner());
				let (mut guard, killed) =
					self.shutdown.wait_or_stop(guard, &self.cond, VecDeque::is_empty);
				if killed {
					break;
				}
				let was_full = guard.len() >= self.cap;
				let job = guard.pop_front();
				if was_full {
					// taking one element may unblock a posting worker
					self.cond.notify_one();
				}
				job
			};
			let Some(mut job) = job else { continue };

			let handle = match job.task.async_handle().cloned() {
				Some(h) => h,
				None => {
					tracing::error!("async exec task carries no handle; dropping it");
					continue;
				}
			};

			if let Err(e) = job.task.start() {
				tracing::debug!(error = %e, "async exec phase failed");
				handle.set_failed();
			}
			drop(job);

			handle.mark_completed();
			if let Err(e) = self
				.equeue
				.put(&self.token, Event::Async(AsyncEvent { handle }))
			{
				// dropping the handle releases the parked request and its scope
				tracing::warn!(error = %e, "cannot deliver async completion");
			}
		}
		tracing::debug!("async processor thread exiting");
	}

	/// Posts an async-init task: runs `async_setup` inline, carves out the companions,
	/// parks the request on the handle and enqueues the exec task.
	///
	/// On a setup failure the request is disposed and the error propagates. When the
	/// processor is killed while the queue is full, the cleanup phase runs locally with the
	/// failure visible on the handle.
	pub(crate) fn post(&self, mut init_task: Task, run: RequestRun) -> Result<()> {
		let handle = Arc::new(AsyncHandle::new());
		init_task.set_async_handle(Arc::clone(&handle));

		// phase one, on this worker thread
		init_task.start()?;

		let (exec, cleanup) = init_task.async_companions()?;
		drop(init_task);
		handle.park(Parked { run, cleanup });

		let guard = self.queue.lock().unwrap_or_else(|p| p.into_inner());
		let (mut guard, killed) =
			self.shutdown.wait_or_stop(guard, &self.cond, |q| q.len() >= self.cap);
		if killed {
			drop(guard);
			drop(exec);
			handle.set_failed();
			if let Some(Parked { run, mut cleanup }) = handle.take_parked() {
				if let Err(e) = cleanup.start() {
					tracing::warn!(error = %e, "local async cleanup failed");
				}
				drop(cleanup);
				drop(run);
			}
			bad_state!("async processor killed while posting");
		}
		let was_empty = guard.is_empty();
		guard.push_back(AsyncJob { task: exec });
		if was_empty {
			self.cond.notify_one();
		}
		Ok(())
	}
}

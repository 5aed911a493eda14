//! The dispatcher and the worker threads.
//!
//! The dispatcher is the only consumer of the event queue. It moves one event at a time
//! into a per-worker ring, rotating through the workers and skipping full rings; when every
//! ring is full it parks on its own condvar until some worker signals space. Workers drain
//! their ring and turn each event into a graph traversal — or, for async completions, into
//! the resumption of a parked one.

use {
	super::{
		asyncproc::{AsyncProc, Parked},
		request::{NextTask, RequestRun},
	},
	crate::{
		equeue::{ConsumerToken, Equeue, Event, EventMask},
		module::ModuleInstance,
		service::Service,
		ShutdownToken,
	},
	std::{
		collections::VecDeque,
		sync::{
			atomic::{AtomicBool, Ordering::*},
			Arc, Condvar, Mutex,
		},
	},
};

/// Where the dispatcher parks when every worker ring is full.
#[derive(Default)]
pub(crate) struct DispatcherGate {
	waiting: AtomicBool,
	lock: Mutex<()>,
	cond: Condvar,
}

impl DispatcherGate {
	pub(crate) fn wake(&self) {
		self.cond.notify_all();
	}
}

/// A per-worker event ring: single producer (the dispatcher), single consumer (the worker).
pub(crate) struct WorkerRing {
	buf: Mutex<VecDeque<Event>>,
	cap: usize,
	cond: Condvar,
	gate: Arc<DispatcherGate>,
	shutdown: ShutdownToken,
}

impl WorkerRing {
	pub(crate) fn new(cap: u32, gate: Arc<DispatcherGate>, shutdown: ShutdownToken) -> Self {
		Self {
			buf: Mutex::new(VecDeque::new()),
			cap: crate::next_pow2(cap) as usize,
			cond: Condvar::new(),
			gate,
			shutdown,
		}
	}

	pub(crate) fn wake(&self) {
		self.cond.notify_all();
	}

	/// Appends an event unless the ring is full, in which case the event is given back.
	fn try_push(&self, event: Event) -> Result<(), Event> {
		let mut buf = self.buf.lock().unwrap_or_else(|p| p.into_inner());
		if buf.len() >= self.cap {
			return Err(event);
		}
		let was_empty = buf.is_empty();
		buf.push_back(event);
		if was_empty {
			self.cond.notify_one();
		}
		Ok(())
	}

	/// Blocks until an event arrives or the runtime is killed.
	fn pop_or_stop(&self) -> Option<Event> {
		let guard = self.buf.lock().unwrap_or_else(|p| p.into_inner());
		let (mut guard, killed) = self.shutdown.wait_or_stop(guard, &self.cond, VecDeque::is_empty);
		if killed {
			return None;
		}
		let event = guard.pop_front();
		drop(guard);
		if self.gate.waiting.load(Acquire) {
			let _held = self.gate.lock.lock().unwrap_or_else(|p| p.into_inner());
			self.gate.cond.notify_one();
		}
		event
	}
}

/// The dispatcher loop: event queue to worker rings, round-robin.
pub(crate) fn dispatcher_main(
	equeue: Arc<Equeue>,
	consumer: ConsumerToken,
	rings: Vec<Arc<WorkerRing>>,
	gate: Arc<DispatcherGate>,
	shutdown: ShutdownToken,
) {
	tracing::debug!("dispatcher started");
	let mask = EventMask::IO | EventMask::ASYNC;
	let mut cursor = 0usize;

	'outer: while !shutdown.killed() {
		if !equeue.wait(&consumer, mask) {
			break;
		}
		let mut event = match equeue.take(&consumer, mask) {
			Ok(Some(ev)) => ev,
			Ok(None) => continue,
			Err(e) => {
				tracing::warn!(error = %e, "cannot take the next event from the event queue");
				continue;
			}
		};

		loop {
			// one full rotation, starting after the worker served last
			for i in 0..rings.len() {
				let idx = (cursor + i) % rings.len();
				let Some(ring) = rings.get(idx) else { continue };
				match ring.try_push(event) {
					Ok(()) => {
						tracing::trace!(worker = idx, "event dispatched");
						cursor = (idx + 1) % rings.len();
						continue 'outer;
					}
					Err(ev) => event = ev,
				}
			}

			// every ring is full; park until a worker signals space, then rescan
			gate.waiting.store(true, Release);
			let held = gate.lock.lock().unwrap_or_else(|p| p.into_inner());
			let _unused = gate
				.cond
				.wait_timeout(held, std::time::Duration::from_secs(1))
				.unwrap_or_else(|p| p.into_inner());
			gate.waiting.store(false, Release);
			if shutdown.killed() {
				break 'outer;
			}
		}
	}
	tracing::info!("dispatcher exiting");
}

/// One worker loop: drain the ring, run traversals.
pub(crate) fn worker_main(
	ring: Arc<WorkerRing>,
	service: Arc<Service>,
	itc: Arc<ModuleInstance>,
	asyncproc: Arc<AsyncProc>,
	shutdown: ShutdownToken,
) {
	tracing::debug!("worker started");
	while !shutdown.killed() {
		let Some(event) = ring.pop_or_stop() else { break };
		match event {
			Event::Io(ev) => {
				match RequestRun::new(Arc::clone(&service), Arc::clone(&itc), ev) {
					Ok(run) => drive(run, &asyncproc, &shutdown),
					Err(e) => tracing::error!(error = %e, "cannot admit the incoming request"),
				}
			}
			Event::Async(ev) => {
				let Some(Parked { run, mut cleanup }) = ev.handle.take_parked() else {
					tracing::warn!("async completion without a parked request");
					continue;
				};
				if let Err(e) = cleanup.start() {
					tracing::error!(error = %e, scope = run.scope_id(), "async cleanup failed; disposing the request");
					continue; // dropping run and cleanup disposes the request
				}
				drop(cleanup);
				drive(run, &asyncproc, &shutdown);
			}
		}
	}
	tracing::info!("worker exiting");
}

/// Steps a traversal until it finishes, fails, or parks on an async node.
fn drive(mut run: RequestRun, asyncproc: &Arc<AsyncProc>, shutdown: &ShutdownToken) {
	while !shutdown.killed() {
		match run.next_task() {
			Ok(NextTask::Finished) => return,
			Ok(NextTask::Sync(mut task)) => {
				if let Err(e) = task.start() {
					tracing::error!(error = %e, scope = run.scope_id(), "node execution failed; disposing the request");
					return; // dropping run disposes the scope and pending pipes
				}
			}
			Ok(NextTask::Async(task)) => {
				if let Err(e) = asyncproc.post(task, run) {
					tracing::error!(error = %e, "cannot post the async task");
				}
				return; // parked (or disposed on error); either way this worker is done
			}
			Err(e) => {
				tracing::error!(error = %e, scope = run.scope_id(), "traversal step failed; disposing the request");
				return;
			}
		}
	}
}

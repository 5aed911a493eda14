//! The scheduler: one dispatcher, N workers, M async threads.
//!
//! Events flow from I/O modules into the event queue; the dispatcher moves them into
//! per-worker rings; workers turn them into service-graph traversals, posting the slow
//! phase of asynchronous nodes to the async task processor and resuming when its completion
//! event comes back through the same queue. Shutdown is cooperative: one kill flag, polled
//! at every blocking boundary.

use {
	crate::{
		eloop::EventLoop,
		equeue::Equeue,
		module::{PipeParam, Registry},
		prop::{PropCallback, PropRegistry, PropValue},
		service::Service,
		thread, Error, Result, ShutdownToken,
	},
	std::sync::{
		atomic::{AtomicBool, Ordering::*},
		Arc, Mutex,
	},
};

mod asyncproc;
mod request;
mod runloop;

pub use asyncproc::AsyncHandle;

use {
	asyncproc::AsyncProc,
	runloop::{DispatcherGate, WorkerRing},
};

struct Knobs {
	worker_nthreads: u32,
	worker_queue_size: u32,
	default_itc_pipe: String,
	async_nthreads: u32,
	async_queue_size: u32,
}

/// The scheduler's tunables, surfaced through the property system as
/// `scheduler.worker.*` and `scheduler.async.*`. All of them are frozen once the loop
/// starts.
pub struct SchedConfig {
	knobs: Mutex<Knobs>,
	started: AtomicBool,
}

impl Default for SchedConfig {
	fn default() -> Self {
		Self {
			knobs: Mutex::new(Knobs {
				worker_nthreads: 1,
				worker_queue_size: 1024,
				default_itc_pipe: "pipe.mem".to_owned(),
				async_nthreads: 32,
				async_queue_size: 65536,
			}),
			started: AtomicBool::new(false),
		}
	}
}

impl SchedConfig {
	/// Creates the default configuration: one worker, `pipe.mem` inter-node pipes.
	pub fn new() -> Self {
		Self::default()
	}

	fn knobs(&self) -> std::sync::MutexGuard<'_, Knobs> {
		self.knobs.lock().unwrap_or_else(|p| p.into_inner())
	}

	fn guard_started(&self) -> Result<()> {
		if self.started.load(Acquire) {
			bad_state!("cannot reconfigure the scheduler after the loop started");
		}
		Ok(())
	}

	fn mark_started(&self) -> Result<()> {
		if self.started.swap(true, AcqRel) {
			bad_state!("the scheduler loop has already been started");
		}
		Ok(())
	}

	/// Sets the number of worker threads.
	pub fn set_worker_nthreads(&self, n: u32) -> Result<()> {
		self.guard_started()?;
		chk_arg!(n > 0, "the scheduler needs at least one worker");
		self.knobs().worker_nthreads = n;
		Ok(())
	}

	/// Sets the per-worker ring size; rounded up to the next power of two.
	pub fn set_worker_queue_size(&self, n: u32) -> Result<()> {
		self.guard_started()?;
		let rounded = crate::next_pow2(n);
		if rounded != n {
			tracing::warn!(requested = n, actual = rounded, "worker queue size rounded up");
		}
		self.knobs().worker_queue_size = rounded;
		Ok(())
	}

	/// Sets the module path used for inter-node pipes.
	pub fn set_default_itc_pipe(&self, path: &str) -> Result<()> {
		self.guard_started()?;
		chk_arg!(!path.is_empty(), "empty module path");
		self.knobs().default_itc_pipe = path.to_owned();
		Ok(())
	}

	/// Sets the number of async processor threads.
	pub fn set_async_nthreads(&self, n: u32) -> Result<()> {
		self.guard_started()?;
		chk_arg!(n > 0, "the async processor needs at least one thread");
		self.knobs().async_nthreads = n;
		Ok(())
	}

	/// Sets the async processor queue size; rounded up to the next power of two.
	pub fn set_async_queue_size(&self, n: u32) -> Result<()> {
		self.guard_started()?;
		let rounded = crate::next_pow2(n);
		if rounded != n {
			tracing::warn!(requested = n, actual = rounded, "async queue size rounded up");
		}
		self.knobs().async_queue_size = rounded;
		Ok(())
	}

	/// The number of worker threads.
	pub fn worker_nthreads(&self) -> u32 {
		self.knobs().worker_nthreads
	}

	/// The per-worker ring size (always a power of two).
	pub fn worker_queue_size(&self) -> u32 {
		self.knobs().worker_queue_size
	}

	/// The module path used for inter-node pipes.
	pub fn default_itc_pipe(&self) -> String {
		self.knobs().default_itc_pipe.clone()
	}

	/// The number of async processor threads.
	pub fn async_nthreads(&self) -> u32 {
		self.knobs().async_nthreads
	}

	/// The async processor queue size (always a power of two).
	pub fn async_queue_size(&self) -> u32 {
		self.knobs().async_queue_size
	}

	/// Registers the `scheduler.worker` and `scheduler.async` property callbacks.
	pub fn register_props(self: &Arc<Self>, props: &PropRegistry) -> Result<()> {
		props.register("scheduler.worker", Arc::new(WorkerProps(Arc::clone(self))))?;
		props.register("scheduler.async", Arc::new(AsyncProps(Arc::clone(self))))?;
		Ok(())
	}
}

fn int_value(value: PropValue) -> Result<u32> {
	match value {
		PropValue::Integer(n) if n >= 0 => u32::try_from(n).map_err(|_| Error::Argument("property value out of range")),
		PropValue::Integer(_) => Err(Error::Argument("property value must not be negative")),
		_ => Err(Error::Argument("property type mismatch, expected an integer")),
	}
}

struct WorkerProps(Arc<SchedConfig>);

impl PropCallback for WorkerProps {
	fn set(&self, symbol: &str, value: PropValue) -> Result<bool> {
		match symbol {
			"nthreads" => self.0.set_worker_nthreads(int_value(value)?)?,
			"queue_size" => self.0.set_worker_queue_size(int_value(value)?)?,
			"default_itc_pipe" => match value {
				PropValue::String(s) => self.0.set_default_itc_pipe(&s)?,
				_ => return Err(Error::Argument("property type mismatch, expected a string")),
			},
			_ => {
				tracing::warn!(symbol, "unrecognized scheduler.worker property");
				return Ok(false);
			}
		}
		Ok(true)
	}

	fn get(&self, symbol: &str) -> PropValue {
		match symbol {
			"nthreads" => PropValue::Integer(i64::from(self.0.worker_nthreads())),
			"queue_size" => PropValue::Integer(i64::from(self.0.worker_queue_size())),
			"default_itc_pipe" => PropValue::String(self.0.default_itc_pipe()),
			_ => PropValue::None,
		}
	}
}

struct AsyncProps(Arc<SchedConfig>);

impl PropCallback for AsyncProps {
	fn set(&self, symbol: &str, value: PropValue) -> Result<bool> {
		match symbol {
			"nthreads" => self.0.set_async_nthreads(int_value(value)?)?,
			"queue_size" => self.0.set_async_queue_size(int_value(value)?)?,
			_ => {
				tracing::warn!(symbol, "unrecognized scheduler.async property");
				return Ok(false);
			}
		}
		Ok(true)
	}

	fn get(&self, symbol: &str) -> PropValue {
		match symbol {
			"nthreads" => PropValue::Integer(i64::from(self.0.async_nthreads())),
			"queue_size" => PropValue::Integer(i64::from(self.0.async_queue_size())),
			_ => PropValue::None,
		}
	}
}

/// The running scheduler loop.
pub struct Scheduler {
	shutdown: ShutdownToken,
	equeue: Arc<Equeue>,
	rings: Vec<Arc<WorkerRing>>,
	gate: Arc<DispatcherGate>,
	asyncproc: Arc<AsyncProc>,
	eloop: Option<EventLoop>,
	threads: Vec<std::thread::JoinHandle<()>>,
}

impl Scheduler {
	/// Starts the loop for one service: spawns the dispatcher, the workers and the async
	/// processor threads, and freezes the configuration.
	pub fn start(
		service: Arc<Service>,
		registry: &Registry,
		equeue: Arc<Equeue>,
		config: &SchedConfig,
	) -> Result<Self> {
		config.mark_started()?;
		let shutdown = equeue.shutdown_token().clone();

		let itc_path = config.default_itc_pipe();
		let itc = registry
			.get_from_path(&itc_path)
			.cloned()
			.ok_or(Error::Argument("the default inter-node pipe module is not loaded"))?;

		let consumer = equeue.scheduler_token()?;
		let gate = Arc::new(DispatcherGate::default());
		let nworkers = config.worker_nthreads();
		let ring_size = config.worker_queue_size();

		let rings: Vec<Arc<WorkerRing>> = (0..nworkers)
			.map(|_| Arc::new(WorkerRing::new(ring_size, Arc::clone(&gate), shutdown.clone())))
			.collect();

		let asyncproc = Arc::new(AsyncProc::new(
			config.async_queue_size(),
			Arc::clone(&equeue),
			shutdown.clone(),
		)?);

		let mut threads = Vec::new();
		for (i, ring) in rings.iter().enumerate() {
			let ring = Arc::clone(ring);
			let service = Arc::clone(&service);
			let itc = Arc::clone(&itc);
			let asyncproc = Arc::clone(&asyncproc);
			let shutdown = shutdown.clone();
			threads.push(
				thread::spawn_kind(thread::ThreadKind::Worker, &format!("PbWorker-{i}"), move || {
					runloop::worker_main(ring, service, itc, asyncproc, shutdown);
				})?,
			);
		}

		threads.extend(asyncproc.spawn_threads(config.async_nthreads())?);

		{
			let equeue = Arc::clone(&equeue);
			let rings = rings.clone();
			let gate = Arc::clone(&gate);
			let shutdown = shutdown.clone();
			threads.push(thread::spawn_kind(thread::ThreadKind::Event, "PbDispatcher", move || {
				runloop::dispatcher_main(equeue, consumer, rings, gate, shutdown);
			})?);
		}

		// event pipes carry the flags of the service's own endpoints; all of them untyped
		let (in_node, in_pipe) = service.input_endpoint();
		let (out_node, out_pipe) = service.output_endpoint();
		let request_param = PipeParam {
			input_flags: service.pipe_flags(in_node, in_pipe)?,
			output_flags: service.pipe_flags(out_node, out_pipe)?,
			args: None,
		};
		let eloop = EventLoop::start(registry, &equeue, request_param.clone())?;
		eloop.set_all_accept_param(request_param);

		tracing::info!(workers = nworkers, event_loops = eloop.len(), "scheduler loop started");
		Ok(Self { shutdown, equeue, rings, gate, asyncproc, eloop: Some(eloop), threads })
	}

	/// The kill flag shared by every thread of this loop.
	pub fn shutdown_token(&self) -> ShutdownToken {
		self.shutdown.clone()
	}

	/// Raises the kill flag and wakes every blocked thread.
	pub fn kill(&self) {
		self.shutdown.kill();
		self.equeue.wake_all();
		for ring in &self.rings {
			ring.wake();
		}
		self.gate.wake();
		self.asyncproc.wake();
	}

	/// Waits for every thread of the loop to exit. Call [`Scheduler::kill`] first.
	pub fn join(mut self) -> Result<()> {
		let mut rc = Ok(());
		if let Some(eloop) = self.eloop.take() {
			rc = eloop.join();
		}
		for handle in self.threads.drain(..) {
			if handle.join().is_err() {
				tracing::error!("a scheduler thread panicked");
				if rc.is_ok() {
					rc = Err(Error::State("a scheduler thread panicked"));
				}
			}
		}
		rc
	}
}

impl Drop for Scheduler {
	fn drop(&mut self) {
		if !self.threads.is_empty() {
			self.kill();
			for handle in self.threads.drain(..) {
				let _ = handle.join();
			}
		}
	}
}

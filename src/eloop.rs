//! Event loop threads: the producing side of the event queue.
//!
//! Every module that reports the `EVENT_LOOP` capability gets one thread here, blocking in
//! the module's `accept` and feeding the resulting endpoint pairs into the event queue as
//! I/O events. The accept parameters — in particular the flag words stamped on the request
//! endpoints — are supplied by whoever starts the loop and may be replaced while it runs;
//! the scheduler derives them from the service's own input and output endpoints.
//!
//! Modules are expected to return from a blocked `accept` with an error once the kill flag
//! is raised; the loop re-checks the flag around every call either way.

use {
	crate::{
		equeue::{Equeue, Event, EventMask, IoEvent},
		module::{ModuleFlags, ModuleInstance, PipeParam, Registry},
		thread, Result, ShutdownToken,
	},
	std::sync::{Arc, Mutex},
};

/// The running set of event loop threads, one per accept-capable module.
pub struct EventLoop {
	shutdown: ShutdownToken,
	param: Arc<Mutex<PipeParam>>,
	threads: Vec<std::thread::JoinHandle<()>>,
}

impl EventLoop {
	/// Spawns one loop thread per `EVENT_LOOP` module in the registry. A registry without
	/// any is fine; the loop is then empty.
	pub fn start(registry: &Registry, equeue: &Arc<Equeue>, param: PipeParam) -> Result<Self> {
		let shutdown = equeue.shutdown_token().clone();
		let param = Arc::new(Mutex::new(param));

		let sources: Vec<Arc<ModuleInstance>> = registry
			.open_dir("")
			.filter(|m| m.flags().contains(ModuleFlags::EVENT_LOOP))
			.cloned()
			.collect();

		let mut threads = Vec::new();
		for (i, inst) in sources.into_iter().enumerate() {
			let equeue = Arc::clone(equeue);
			let shutdown = shutdown.clone();
			let param = Arc::clone(&param);
			let name = format!("PbEventLoop-{i}");
			tracing::info!(module = inst.path(), "event loop thread starting");
			threads.push(thread::spawn_kind(thread::ThreadKind::Event, &name, move || {
				accept_main(&inst, &equeue, &param, &shutdown);
			})?);
		}

		Ok(Self { shutdown, param, threads })
	}

	/// Replaces the accept parameters of every loop thread. Takes effect from the next
	/// accept on.
	pub fn set_all_accept_param(&self, param: PipeParam) {
		*self.param.lock().unwrap_or_else(|p| p.into_inner()) = param;
	}

	/// Number of loop threads.
	pub fn len(&self) -> usize {
		self.threads.len()
	}

	/// Whether no module wanted a loop thread.
	pub fn is_empty(&self) -> bool {
		self.threads.is_empty()
	}

	/// Waits for every loop thread to exit; raise the kill flag first.
	pub fn join(mut self) -> Result<()> {
		let mut rc = Ok(());
		for handle in self.threads.drain(..) {
			if handle.join().is_err() {
				tracing::error!("an event loop thread panicked");
				if rc.is_ok() {
					rc = Err(crate::Error::State("an event loop thread panicked"));
				}
			}
		}
		rc
	}
}

impl Drop for EventLoop {
	fn drop(&mut self) {
		if !self.threads.is_empty() {
			self.shutdown.kill();
			for handle in self.threads.drain(..) {
				let _ = handle.join();
			}
		}
	}
}

fn accept_main(
	inst: &Arc<ModuleInstance>,
	equeue: &Arc<Equeue>,
	param: &Arc<Mutex<PipeParam>>,
	shutdown: &ShutdownToken,
) {
	let Ok(token) = equeue.producer_token(EventMask::IO) else {
		tracing::error!(module = inst.path(), "cannot acquire a producer token");
		return;
	};

	while !shutdown.killed() {
		let snapshot = param.lock().unwrap_or_else(|p| p.into_inner()).clone();
		match inst.accept(&snapshot) {
			Ok((input, output)) => {
				let event = Event::Io(IoEvent { input: Some(input), output: Some(output) });
				if let Err(e) = equeue.put(&token, event) {
					// killed while blocked on a full queue; the event's pipes are released
					tracing::info!(module = inst.path(), error = %e, "event dropped during shutdown");
					break;
				}
			}
			Err(crate::Error::Unsupported) => {
				tracing::error!(module = inst.path(), "module advertises an event loop but cannot accept");
				break;
			}
			Err(e) if shutdown.killed() => {
				tracing::debug!(module = inst.path(), error = %e, "accept interrupted by shutdown");
				break;
			}
			Err(e) => {
				tracing::warn!(module = inst.path(), error = %e, "accept failed; retrying");
			}
		}
	}
	tracing::info!(module = inst.path(), "event loop thread exiting");
}

//! The servlet table (STAB): every loaded servlet instance.
//!
//! Loading runs the servlet's init task, which populates its PDT; afterwards the entry is
//! immutable apart from its lazily created object pools. The task pool recycles pipe-slot
//! vectors for exec-class tasks and the async pool recycles the fixed-size async data
//! buffers shared by the three async phases.

use {
	super::{Pdt, Servlet},
	crate::{
		module::ObjPool,
		pipe::{Pipe, PipeId},
		task::{Task, TaskFlags},
		Error, Result,
	},
	std::sync::{
		atomic::{AtomicBool, Ordering::*},
		Arc, OnceLock, RwLock, RwLockReadGuard,
	},
};

/// Id of a loaded servlet instance within the table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServletId(u32);

impl ServletId {
	pub(crate) fn index(self) -> usize {
		self.0 as usize
	}
}

impl std::fmt::Display for ServletId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A loaded servlet: its argv, the binary behind a lock, the PDT built by init, and the
/// lazily created pools.
pub struct ServletEntry {
	argv: Vec<String>,
	servlet: RwLock<Box<dyn Servlet>>,
	pdt: RwLock<Pdt>,
	is_async: bool,
	async_buf_size: usize,
	task_pool: OnceLock<Arc<ObjPool<Vec<Option<Pipe>>>>>,
	async_pool: OnceLock<Arc<ObjPool<Box<[u8]>>>>,
	claimed: AtomicBool,
}

impl ServletEntry {
	fn new(argv: Vec<String>, servlet: Box<dyn Servlet>) -> Self {
		let is_async = servlet.is_async();
		let async_buf_size = servlet.async_buf_size();
		Self {
			argv,
			servlet: RwLock::new(servlet),
			pdt: RwLock::new(Pdt::new()),
			is_async,
			async_buf_size,
			task_pool: OnceLock::new(),
			async_pool: OnceLock::new(),
			claimed: AtomicBool::new(false),
		}
	}

	/// The instantiation arguments, `argv[0]` being the servlet name.
	pub fn argv(&self) -> &[String] {
		&self.argv
	}

	/// Read access to the pipe descriptor table.
	pub fn pdt(&self) -> RwLockReadGuard<'_, Pdt> {
		self.pdt.read().unwrap_or_else(|p| p.into_inner())
	}

	/// Whether the servlet follows the asynchronous lifecycle.
	pub fn is_async(&self) -> bool {
		self.is_async
	}

	/// Size of the async data buffer, zero for servlets that do not need one.
	pub fn async_buf_size(&self) -> usize {
		self.async_buf_size
	}

	/// The pool recycling async data buffers; `None` when the servlet declares none.
	/// Created on first use, shared by every task of the binary.
	pub fn async_pool(&self) -> Option<&Arc<ObjPool<Box<[u8]>>>> {
		if self.async_buf_size == 0 {
			return None;
		}
		let size = self.async_buf_size;
		Some(self.async_pool.get_or_init(|| {
			tracing::debug!(size, "async buffer pool created");
			Arc::new(ObjPool::with_ctor(move || vec![0u8; size].into_boxed_slice()))
		}))
	}

	pub(crate) fn task_pool(&self) -> &Arc<ObjPool<Vec<Option<Pipe>>>> {
		self.task_pool.get_or_init(|| {
			tracing::debug!("servlet task pool created");
			Arc::new(ObjPool::with_ctor(Vec::new))
		})
	}

	pub(crate) fn with_servlet<R>(&self, f: impl FnOnce(&dyn Servlet) -> R) -> R {
		let guard = self.servlet.read().unwrap_or_else(|p| p.into_inner());
		f(guard.as_ref())
	}

	pub(crate) fn with_servlet_mut<R>(&self, f: impl FnOnce(&mut dyn Servlet, &mut Pdt, &[String]) -> R) -> R {
		let mut guard = self.servlet.write().unwrap_or_else(|p| p.into_inner());
		let mut pdt = self.pdt.write().unwrap_or_else(|p| p.into_inner());
		f(guard.as_mut(), &mut pdt, &self.argv)
	}

	/// Marks this instance as belonging to a finalized service. Fails when another service
	/// already holds it.
	pub(crate) fn claim(&self) -> bool {
		self.claimed.compare_exchange(false, true, AcqRel, Acquire).is_ok()
	}

	pub(crate) fn unclaim(&self) {
		self.claimed.store(false, Release);
	}
}

impl std::fmt::Debug for ServletEntry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ServletEntry")
			.field("argv", &self.argv)
			.field("async", &self.is_async)
			.finish_non_exhaustive()
	}
}

/// The servlet table.
#[derive(Default)]
pub struct Stab {
	entries: Vec<Arc<ServletEntry>>,
}

impl Stab {
	/// Creates an empty table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Loads a servlet instance: stores the argv copy, runs the init task (which populates
	/// the PDT) and registers the entry. A failing init leaves the table untouched.
	pub fn load(&mut self, argv: &[&str], servlet: Box<dyn Servlet>) -> Result<ServletId> {
		chk_arg!(!argv.is_empty(), "servlet argv must at least name the servlet");
		if self.entries.len() >= u32::MAX as usize {
			return Err(Error::Resource("servlet table full"));
		}

		let argv: Vec<String> = argv.iter().map(|s| (*s).to_owned()).collect();
		let entry = Arc::new(ServletEntry::new(argv, servlet));

		let mut init = Task::new(&entry, TaskFlags::init())?;
		init.start()?;

		#[allow(clippy::cast_possible_truncation)] // bounded by the u32::MAX check
		let sid = ServletId(self.entries.len() as u32);
		tracing::info!(name = %entry.argv()[0], %sid, "servlet loaded");
		self.entries.push(entry);
		Ok(sid)
	}

	/// The entry behind an id.
	pub fn get(&self, sid: ServletId) -> Option<&Arc<ServletEntry>> {
		self.entries.get(sid.index())
	}

	/// Finds the loaded instance whose argv matches exactly. Service deserialization uses
	/// this to resolve node records.
	pub fn find_by_argv(&self, argv: &[String]) -> Option<ServletId> {
		#[allow(clippy::cast_possible_truncation)]
		self.entries
			.iter()
			.position(|e| e.argv() == argv)
			.map(|i| ServletId(i as u32))
	}

	/// Resolves a pipe name against the servlet's PDT.
	pub fn get_pipe(&self, sid: ServletId, name: &str) -> Result<PipeId> {
		let entry = self.get(sid).ok_or(Error::Argument("unknown servlet id"))?;
		entry
			.pdt()
			.get(name)
			.ok_or(Error::Argument("no pipe slot with the given name"))
	}

	/// Number of pipe slots the servlet defines.
	pub fn num_pipes(&self, sid: ServletId) -> Result<usize> {
		let entry = self.get(sid).ok_or(Error::Argument("unknown servlet id"))?;
		let n = entry.pdt().len();
		Ok(n)
	}

	/// Number of loaded servlets.
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Whether the table is empty.
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Runs every servlet's unload task in load order; all of them run even when some fail,
	/// and the first failure is reported.
	pub fn unload_all(&mut self) -> Result<()> {
		let mut rc = Ok(());
		for entry in self.entries.drain(..) {
			let status = Task::new(&entry, TaskFlags::unload()).and_then(|mut t| t.start());
			if let Err(e) = status {
				tracing::error!(name = %entry.argv()[0], error = %e, "servlet unload failed");
				if rc.is_ok() {
					rc = Err(e);
				}
			}
		}
		rc
	}
}

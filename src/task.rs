//! Runtime tasks: one invocation of one servlet phase against a concrete pipe vector.
//!
//! Exec-class tasks are allocated from the servlet's task pool; init and unload tasks are
//! rare and live on the plain heap. Creating an exec task for an asynchronous servlet
//! produces an *async-init* task instead, owning the async data buffer; once
//! [`Task::async_companions`] carves out the exec and cleanup tasks, the pipe vector moves to
//! the cleanup task and the exec task runs with no pipe access at all, so the async thread
//! can never race a worker on a handle.

use {
	crate::{
		module::ObjPool,
		pipe::{Pipe, PipeId},
		sched::AsyncHandle,
		servlet::{ServletEntry, TaskContext},
		Error, Result,
	},
	std::{
		cell::Cell,
		sync::{
			atomic::{AtomicU64, Ordering::*},
			Arc, Mutex,
		},
	},
};

thread_local! {
	static CURRENT_TASK: Cell<Option<u64>> = const { Cell::new(None) };
}

/// The id of the task whose servlet callback is currently running on this thread, if any.
///
/// This is the backing of the `task_id` API surface for code that has no
/// [`TaskContext`](crate::servlet::TaskContext) in hand; it is set for the duration of
/// [`Task::start`] and cleared when the callback returns.
pub fn current_task_id() -> Option<u64> {
	CURRENT_TASK.with(Cell::get)
}

/// Which servlet phase a task invokes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskAction {
	/// `init` — or `async_setup` when the async bit is set.
	Init,
	/// `exec` — or `async_exec` when the async bit is set.
	Exec,
	/// `unload` — or `async_cleanup` when the async bit is set.
	Unload,
}

/// The flag set of a task: the action, the async bit selecting the async phase triple, and
/// the invoked bit enforcing single execution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TaskFlags {
	/// The action to dispatch.
	pub action: TaskAction,
	/// Selects the async callback triple.
	pub is_async: bool,
	/// Set by [`Task::start`]; a task runs exactly once.
	pub invoked: bool,
}

impl TaskFlags {
	/// Flags for a servlet-initialize task.
	pub fn init() -> Self {
		Self { action: TaskAction::Init, is_async: false, invoked: false }
	}

	/// Flags for a synchronous execution task.
	pub fn exec() -> Self {
		Self { action: TaskAction::Exec, is_async: false, invoked: false }
	}

	/// Flags for a servlet-unload task.
	pub fn unload() -> Self {
		Self { action: TaskAction::Unload, is_async: false, invoked: false }
	}

	fn name(self) -> &'static str {
		match (self.is_async, self.action) {
			(false, TaskAction::Init) => "servlet initialize",
			(false, TaskAction::Exec) => "sync execute",
			(false, TaskAction::Unload) => "servlet unload",
			(true, TaskAction::Init) => "async setup",
			(true, TaskAction::Exec) => "async execute",
			(true, TaskAction::Unload) => "async cleanup",
		}
	}
}

/// The pipe-slot vector, returned to the servlet's task pool when the task dies.
struct PooledSlots {
	vec: Vec<Option<Pipe>>,
	pool: Option<Arc<ObjPool<Vec<Option<Pipe>>>>>,
}

impl PooledSlots {
	fn bare() -> Self {
		Self { vec: Vec::new(), pool: None }
	}

	fn from_pool(pool: &Arc<ObjPool<Vec<Option<Pipe>>>>, npipes: usize) -> Self {
		let mut vec = pool.alloc();
		vec.clear();
		vec.resize_with(npipes, || None);
		Self { vec, pool: Some(Arc::clone(pool)) }
	}
}

impl Drop for PooledSlots {
	fn drop(&mut self) {
		// dropping the pipes here is what deallocates them through their modules
		self.vec.clear();
		if let Some(pool) = self.pool.take() {
			pool.put(std::mem::take(&mut self.vec));
		}
	}
}

struct AsyncBufCell {
	buf: Option<Box<[u8]>>,
	pool: Arc<ObjPool<Box<[u8]>>>,
}

impl Drop for AsyncBufCell {
	fn drop(&mut self) {
		if let Some(buf) = self.buf.take() {
			self.pool.put(buf);
		}
	}
}

/// The async data buffer shared by the three phases of one asynchronous execution. The last
/// task to drop its reference returns the buffer to the binary's pool.
#[derive(Clone)]
pub(crate) struct AsyncBuf {
	inner: Arc<Mutex<AsyncBufCell>>,
}

impl AsyncBuf {
	fn take_from(pool: &Arc<ObjPool<Box<[u8]>>>) -> Self {
		let mut buf = pool.alloc();
		buf.fill(0);
		Self {
			inner: Arc::new(Mutex::new(AsyncBufCell {
				buf: Some(buf),
				pool: Arc::clone(pool),
			})),
		}
	}

	fn with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
		let mut cell = self.inner.lock().unwrap_or_else(|p| p.into_inner());
		f(cell.buf.as_deref_mut().unwrap_or(&mut []))
	}
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// One runtime invocation record.
pub struct Task {
	entry: Arc<ServletEntry>,
	flags: TaskFlags,
	slots: PooledSlots,
	async_data: Option<AsyncBuf>,
	async_handle: Option<Arc<AsyncHandle>>,
	async_owner: bool,
	id: u64,
}

impl Task {
	/// Creates a task for the given servlet and flags.
	///
	/// Exec tasks come from the servlet's task pool with a pipe vector sized to its PDT; for
	/// asynchronous servlets the request turns into an async-init task that additionally
	/// pulls the async buffer and takes its ownership bit.
	pub fn new(entry: &Arc<ServletEntry>, flags: TaskFlags) -> Result<Self> {
		chk_arg!(!flags.invoked, "cannot create a task in the invoked state");

		let mut flags = flags;
		let mut async_data = None;
		let mut async_owner = false;

		let slots = match flags.action {
			TaskAction::Init | TaskAction::Unload if !flags.is_async => PooledSlots::bare(),
			_ => {
				let npipes = entry.pdt().len();
				PooledSlots::from_pool(entry.task_pool(), npipes)
			}
		};

		if flags.action == TaskAction::Exec && !flags.is_async && entry.is_async() {
			// an execution request against an async servlet starts its async lifecycle
			flags = TaskFlags { action: TaskAction::Init, is_async: true, invoked: false };
			async_data = entry.async_pool().map(AsyncBuf::take_from);
			async_owner = true;
		}

		let task = Self {
			entry: Arc::clone(entry),
			flags,
			slots,
			async_data,
			async_handle: None,
			async_owner,
			id: NEXT_TASK_ID.fetch_add(1, Relaxed),
		};
		tracing::trace!(task = task.id, kind = task.flags.name(), servlet = %task.entry.argv()[0], "task created");
		Ok(task)
	}

	/// The task id, as exposed to servlets through their context.
	pub fn id(&self) -> u64 {
		self.id
	}

	/// The current flag set.
	pub fn flags(&self) -> TaskFlags {
		self.flags
	}

	/// The servlet this task runs.
	pub fn servlet(&self) -> &Arc<ServletEntry> {
		&self.entry
	}

	/// Whether this task holds the async buffer/handle ownership bit.
	pub fn is_async_owner(&self) -> bool {
		self.async_owner
	}

	pub(crate) fn set_async_handle(&mut self, handle: Arc<AsyncHandle>) {
		self.async_handle = Some(handle);
	}

	/// The async handle, once the scheduler attached one.
	pub fn async_handle(&self) -> Option<&Arc<AsyncHandle>> {
		self.async_handle.as_ref()
	}

	/// Binds a concrete pipe to a slot. The slot must be empty.
	pub fn bind(&mut self, pid: PipeId, pipe: Pipe) -> Result<()> {
		let slot = self
			.slots
			.vec
			.get_mut(usize::from(pid.0))
			.ok_or(Error::Argument("pipe id out of range for this task"))?;
		if slot.is_some() {
			bad_state!("pipe slot bound twice");
		}
		*slot = Some(pipe);
		Ok(())
	}

	/// Borrows the pipe bound to a slot.
	pub fn pipe_mut(&mut self, pid: PipeId) -> Result<&mut Pipe> {
		self.slots
			.vec
			.get_mut(usize::from(pid.0))
			.ok_or(Error::Argument("pipe id out of range for this task"))?
			.as_mut()
			.ok_or(Error::State("pipe slot not bound"))
	}

	/// Takes the pipe out of a slot.
	pub fn take_pipe(&mut self, pid: PipeId) -> Option<Pipe> {
		self.slots.vec.get_mut(usize::from(pid.0)).and_then(Option::take)
	}

	/// Runs the servlet phase selected by the flags. A task runs exactly once; the status
	/// is whatever the servlet callback returned.
	pub fn start(&mut self) -> Result<()> {
		if self.flags.invoked {
			bad_state!("task started twice");
		}
		if self.flags.is_async && self.async_handle.is_none() {
			bad_state!("async task has no async handle");
		}
		self.flags.invoked = true;
		tracing::trace!(task = self.id, kind = self.flags.name(), "task started");
		CURRENT_TASK.with(|c| c.set(Some(self.id)));

		let entry = Arc::clone(&self.entry);
		let rc = if !self.flags.is_async {
			match self.flags.action {
				TaskAction::Init => entry.with_servlet_mut(|s, pdt, argv| s.init(argv, pdt)),
				TaskAction::Unload => entry.with_servlet_mut(|s, _, _| s.unload()),
				TaskAction::Exec => {
					let pdt = entry.pdt();
					let mut ctx = TaskContext::new(self.id, &pdt, &mut self.slots.vec);
					entry.with_servlet(|s| s.exec(&mut ctx))
				}
			}
		} else {
			let handle = self
				.async_handle
				.clone()
				.ok_or(Error::State("async task has no async handle"))?;
			let data = self.async_data.clone();
			let with_buf = |f: &mut dyn FnMut(&mut [u8]) -> Result<()>| match &data {
				Some(buf) => buf.with(|b| f(b)),
				None => f(&mut []),
			};
			match self.flags.action {
				TaskAction::Init => with_buf(&mut |buf| {
					let pdt = entry.pdt();
					let mut ctx = TaskContext::new(self.id, &pdt, &mut self.slots.vec);
					entry.with_servlet(|s| s.async_setup(&handle, buf, &mut ctx))
				}),
				TaskAction::Exec => with_buf(&mut |buf| entry.with_servlet(|s| s.async_exec(&handle, buf))),
				TaskAction::Unload => with_buf(&mut |buf| {
					let pdt = entry.pdt();
					let mut ctx = TaskContext::new(self.id, &pdt, &mut self.slots.vec);
					entry.with_servlet(|s| s.async_cleanup(&handle, buf, &mut ctx))
				}),
			}
		};

		CURRENT_TASK.with(|c| c.set(None));
		match &rc {
			Ok(()) => tracing::trace!(task = self.id, kind = self.flags.name(), "task finished"),
			Err(e) => tracing::debug!(task = self.id, kind = self.flags.name(), error = %e, "task failed"),
		}
		rc
	}

	/// Carves the async-exec and async-cleanup companion tasks out of a started async-init
	/// task.
	///
	/// The pipe vector moves to the cleanup task, the exec task gets none (it must not touch
	/// pipes), and buffer/handle ownership transfers from this task to the cleanup task.
	pub fn async_companions(&mut self) -> Result<(Task, Task)> {
		chk_arg!(
			self.flags.is_async && self.flags.action == TaskAction::Init,
			"companions can only be carved out of an async init task"
		);
		if !self.async_owner {
			bad_state!("async init task no longer owns its buffer");
		}
		let handle = match &self.async_handle {
			Some(h) => Arc::clone(h),
			None => bad_state!("async init task has no async handle"),
		};

		let exec = Task {
			entry: Arc::clone(&self.entry),
			flags: TaskFlags { action: TaskAction::Exec, is_async: true, invoked: false },
			slots: PooledSlots::bare(),
			async_data: self.async_data.clone(),
			async_handle: Some(Arc::clone(&handle)),
			async_owner: false,
			id: NEXT_TASK_ID.fetch_add(1, Relaxed),
		};

		let cleanup = Task {
			entry: Arc::clone(&self.entry),
			flags: TaskFlags { action: TaskAction::Unload, is_async: true, invoked: false },
			slots: std::mem::replace(&mut self.slots, PooledSlots::bare()),
			async_data: self.async_data.clone(),
			async_handle: Some(handle),
			async_owner: true,
			id: NEXT_TASK_ID.fetch_add(1, Relaxed),
		};

		self.async_owner = false;
		tracing::debug!(task = self.id, "async companions created");
		Ok((exec, cleanup))
	}
}

impl std::fmt::Debug for Task {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Task")
			.field("id", &self.id)
			.field("kind", &self.flags.name())
			.field("servlet", &self.entry.argv().first())
			.finish_non_exhaustive()
	}
}

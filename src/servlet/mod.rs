//! Servlets: the user-authored units of work that populate service graphs.
//!
//! The [`Servlet`] trait is the binary interface. A synchronous servlet implements `init`
//! (declaring its pipes) and `exec` (moving bytes between them); an asynchronous one keeps
//! `exec` untouched and implements the three-phase `async_setup` / `async_exec` /
//! `async_cleanup` lifecycle instead, with `async_exec` running on the async thread pool and
//! forbidden from touching pipes.
//!
//! During execution a servlet reaches its pipes through [`TaskContext`], which resolves the
//! servlet-local pipe ids against the concrete handles the scheduler bound for this task.

use crate::{
	pipe::{CntlReply, Pipe, PipeCntl, PipeId},
	sched::AsyncHandle,
	Error, Result,
};

mod pdt;
mod stab;

pub use {
	pdt::{Pdt, PdtSlot},
	stab::{ServletEntry, ServletId, Stab},
};

/// The servlet binary interface: up to six callbacks plus the async buffer size.
///
/// `init` and `unload` run exclusively; the other callbacks may run concurrently on
/// different tasks of the same servlet instance and therefore take `&self`.
pub trait Servlet: Send + Sync + 'static {
	/// One-line description for diagnostics.
	fn desc(&self) -> &'static str {
		""
	}

	/// Servlet version number.
	fn version(&self) -> u32 {
		0
	}

	/// Initialization: parse `args`, define the pipe slots. Runs once, before any task.
	fn init(&mut self, args: &[String], pdt: &mut Pdt) -> Result<()>;

	/// Synchronous execution against a bound pipe vector.
	fn exec(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
		let _ = ctx;
		Ok(())
	}

	/// Teardown, invoked when the servlet table unloads the instance.
	fn unload(&mut self) -> Result<()> {
		Ok(())
	}

	/// Whether execution follows the asynchronous three-phase lifecycle.
	fn is_async(&self) -> bool {
		false
	}

	/// Size of the per-task async data buffer shared by the three async phases.
	fn async_buf_size(&self) -> usize {
		0
	}

	/// Async phase one, on a worker thread: record into `buf` whatever `async_exec` will
	/// need. Must be cheap; the worker is blocked while it runs.
	fn async_setup(&self, handle: &AsyncHandle, buf: &mut [u8], ctx: &mut TaskContext<'_>) -> Result<()> {
		let _ = (handle, buf, ctx);
		Ok(())
	}

	/// Async phase two, on the async thread pool. No pipe access: everything it needs must
	/// be in `buf`.
	fn async_exec(&self, handle: &AsyncHandle, buf: &mut [u8]) -> Result<()> {
		let _ = (handle, buf);
		Ok(())
	}

	/// Async phase three, back on a worker thread: publish the result from `buf` into the
	/// pipes. The handle reports whether `async_exec` failed.
	fn async_cleanup(&self, handle: &AsyncHandle, buf: &mut [u8], ctx: &mut TaskContext<'_>) -> Result<()> {
		let _ = (handle, buf, ctx);
		Ok(())
	}
}

/// The per-invocation surface a servlet sees: its task id, its PDT, and the concrete pipes
/// bound to its slots.
pub struct TaskContext<'t> {
	task_id: u64,
	pdt: &'t Pdt,
	slots: &'t mut [Option<Pipe>],
}

impl<'t> TaskContext<'t> {
	pub(crate) fn new(task_id: u64, pdt: &'t Pdt, slots: &'t mut [Option<Pipe>]) -> Self {
		Self { task_id, pdt, slots }
	}

	/// The id of the running task.
	pub fn task_id(&self) -> u64 {
		self.task_id
	}

	/// Resolves a slot name to its pipe id.
	pub fn pipe_id(&self, name: &str) -> Result<PipeId> {
		self.pdt
			.get(name)
			.ok_or(Error::Argument("no pipe slot with the given name"))
	}

	/// Borrows the pipe bound to a slot.
	pub fn pipe(&mut self, pid: PipeId) -> Result<&mut Pipe> {
		self.slots
			.get_mut(usize::from(pid.0))
			.ok_or(Error::Argument("pipe id out of range"))?
			.as_mut()
			.ok_or(Error::State("pipe slot not bound for this task"))
	}

	/// Reads from the pipe bound to `pid`.
	pub fn read(&mut self, pid: PipeId, buf: &mut [u8]) -> Result<usize> {
		self.pipe(pid)?.read(buf)
	}

	/// Writes to the pipe bound to `pid`.
	pub fn write(&mut self, pid: PipeId, data: &[u8]) -> Result<usize> {
		self.pipe(pid)?.write(data)
	}

	/// Writes the whole of `data`, failing on a would-block.
	pub fn write_all(&mut self, pid: PipeId, data: &[u8]) -> Result<()> {
		let mut done = 0;
		while done < data.len() {
			let rest = data.get(done..).unwrap_or(&[]);
			let n = self.pipe(pid)?.write(rest)?;
			if n == 0 {
				return Err(Error::Io(std::io::ErrorKind::WouldBlock.into()));
			}
			done += n;
		}
		Ok(())
	}

	/// Whether the pipe bound to `pid` has ended.
	pub fn eof(&mut self, pid: PipeId) -> Result<bool> {
		self.pipe(pid)?.eof()
	}

	/// Dispatches a control request against the pipe bound to `pid`.
	pub fn cntl(&mut self, pid: PipeId, op: PipeCntl<'_>) -> Result<CntlReply> {
		self.pipe(pid)?.cntl(op)
	}
}

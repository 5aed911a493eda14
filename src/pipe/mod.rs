//! Pipe handles: typed, directed byte-stream endpoints.
//!
//! A handle is a fixed header — owning module, flag word, optional pushed state — plus a
//! module-specific body. Every operation is dispatched through the owning module's vtable;
//! header-level concerns (direction checks, the `DISABLED` short-circuit, state push/pop)
//! are settled here before the module sees anything.
//!
//! Ownership is exclusive to the task holding the handle unless duplicated through
//! [`Pipe::fork`]. Dropping a handle deallocates it through the module.

use {
	crate::{
		module::{ModuleInstance, PipeBody, CNTL_EOM},
		Error, Result,
	},
	std::{any::Any, sync::Arc},
};

mod flags;
mod source;

pub use {
	flags::{Direction, PipeFlags, PipeId, PipeSpec},
	source::{DataSource, DataSourceError, DataSourceFate},
};

/// Opaque servlet state pushed into a persistent pipe; the box's destructor doubles as the
/// free callback.
pub type PipeState = Box<dyn Any + Send>;

/// A control request against a pipe handle.
pub enum PipeCntl<'a> {
	/// Reads the flag word.
	GetFlags,
	/// Sets the given flag bits.
	SetFlag(PipeFlags),
	/// Clears the given flag bits.
	ClrFlag(PipeFlags),
	/// Stores servlet state the module preserves across executions of a persistent pipe.
	PushState(PipeState),
	/// Takes the previously pushed state back.
	PopState,
	/// Asks the module whether an unread end-of-message marker is pending.
	Eom,
	/// A module-specific opcode with an opaque in/out argument.
	Module {
		/// Opcode, at or above [`crate::module::CNTL_MODULE_BASE`].
		opcode: u32,
		/// In/out argument interpreted by the module.
		arg: &'a mut dyn Any,
	},
}

/// Reply to a [`PipeCntl`] request.
pub enum CntlReply {
	/// Nothing to report.
	None,
	/// The current flag word.
	Flags(PipeFlags),
	/// The popped state, if any had been pushed.
	State(Option<PipeState>),
	/// Whether an unread end-of-message marker is pending.
	Eom(bool),
}

/// One end of a pipe.
pub struct Pipe {
	module: Arc<ModuleInstance>,
	flags: PipeFlags,
	state: Option<PipeState>,
	body: Option<PipeBody>,
}

impl Pipe {
	pub(crate) fn assemble(module: Arc<ModuleInstance>, flags: PipeFlags, body: PipeBody) -> Self {
		Self { module, flags, state: None, body: Some(body) }
	}

	/// The packed flag word.
	#[inline]
	pub fn flags(&self) -> PipeFlags {
		self.flags
	}

	/// The unpacked view of the flag word.
	pub fn spec(&self) -> Result<PipeSpec> {
		PipeSpec::from_flags(self.flags)
	}

	/// The module instance owning this handle.
	pub fn module(&self) -> &Arc<ModuleInstance> {
		&self.module
	}

	fn body_mut(&mut self) -> Result<&mut dyn Any> {
		match self.body.as_mut() {
			Some(b) => Ok(b.as_mut()),
			None => Err(Error::State("pipe handle already released")),
		}
	}

	/// Reads at most `buf.len()` bytes. `Ok(0)` while [`eof`](Self::eof) is still false
	/// means would-block; a disabled branch reads nothing and reports eof immediately.
	pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
		chk_arg!(self.flags.is_input(), "read on a non-input pipe");
		if self.flags.contains(PipeFlags::DISABLED) {
			return Ok(0);
		}
		let module = Arc::clone(&self.module);
		module.vtable().read(self.body_mut()?, buf)
	}

	/// Writes at most `data.len()` bytes; `Ok(0)` means would-block.
	pub fn write(&mut self, data: &[u8]) -> Result<usize> {
		chk_arg!(self.flags.is_output(), "write on a non-output pipe");
		let module = Arc::clone(&self.module);
		module.vtable().write(self.body_mut()?, data)
	}

	/// Whether the stream has ended. Disabled branches are at end of stream from the start.
	pub fn eof(&mut self) -> Result<bool> {
		if self.flags.contains(PipeFlags::DISABLED) {
			return Ok(true);
		}
		let module = Arc::clone(&self.module);
		module.vtable().eof(self.body_mut()?)
	}

	/// Whether unread bytes are buffered in the handle.
	pub fn has_unread_data(&mut self) -> Result<bool> {
		if self.flags.contains(PipeFlags::DISABLED) {
			return Ok(false);
		}
		let module = Arc::clone(&self.module);
		module.vtable().has_unread_data(self.body_mut()?)
	}

	/// Duplicates an output reference for a shadow edge. The new handle carries `flags` and
	/// shares no read cursor with this one.
	pub fn fork(&mut self, flags: PipeFlags, args: Option<&str>) -> Result<Pipe> {
		let module = Arc::clone(&self.module);
		let body = module.vtable().fork(self.body_mut()?, flags, args)?;
		Ok(Pipe::assemble(module, flags, body))
	}

	/// Dispatches a control request; header-level opcodes are handled here, the rest go to
	/// the module.
	pub fn cntl(&mut self, op: PipeCntl<'_>) -> Result<CntlReply> {
		match op {
			PipeCntl::GetFlags => Ok(CntlReply::Flags(self.flags)),
			PipeCntl::SetFlag(f) => {
				self.flags |= f;
				Ok(CntlReply::None)
			}
			PipeCntl::ClrFlag(f) => {
				self.flags &= !f;
				Ok(CntlReply::None)
			}
			PipeCntl::PushState(state) => {
				if self.state.is_some() {
					bad_state!("pipe already holds pushed state");
				}
				self.state = Some(state);
				Ok(CntlReply::None)
			}
			PipeCntl::PopState => Ok(CntlReply::State(self.state.take())),
			PipeCntl::Eom => {
				let module = Arc::clone(&self.module);
				let mut pending = false;
				module.vtable().cntl(self.body_mut()?, CNTL_EOM, &mut pending)?;
				Ok(CntlReply::Eom(pending))
			}
			PipeCntl::Module { opcode, arg } => {
				let module = Arc::clone(&self.module);
				module.vtable().cntl(self.body_mut()?, opcode, arg)?;
				Ok(CntlReply::None)
			}
		}
	}

	/// Pushes servlet state to survive this execution; see [`PipeCntl::PushState`].
	pub fn push_state(&mut self, state: PipeState) -> Result<()> {
		self.cntl(PipeCntl::PushState(state)).map(|_| ())
	}

	/// Pops previously pushed state; see [`PipeCntl::PopState`].
	pub fn pop_state(&mut self) -> Result<Option<PipeState>> {
		match self.cntl(PipeCntl::PopState)? {
			CntlReply::State(s) => Ok(s),
			_ => Ok(None),
		}
	}

	/// Hands a callback-based data source to the owning module; see [`DataSourceFate`].
	pub fn write_data_source(
		&mut self,
		source: Box<dyn DataSource>,
	) -> Result<DataSourceFate, DataSourceError> {
		if !self.flags.is_output() {
			return Err(DataSourceError {
				error: Error::Argument("data source write on a non-output pipe"),
				source: Some(source),
			});
		}
		let module = Arc::clone(&self.module);
		let body = match self.body_mut() {
			Ok(b) => b,
			Err(e) => return Err(DataSourceError { error: e, source: Some(source) }),
		};
		module.vtable().write_data_source(body, source)
	}
}

impl std::fmt::Debug for Pipe {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Pipe")
			.field("module", &self.module.path())
			.field("flags", &self.flags)
			.field("has_state", &self.state.is_some())
			.finish()
	}
}

impl Drop for Pipe {
	fn drop(&mut self) {
		if let Some(body) = self.body.take() {
			if let Err(e) = self.module.reclaim(body) {
				tracing::warn!(module = self.module.path(), error = %e, "cannot deallocate pipe handle");
			}
		}
		if self.state.is_some() && self.flags.contains(PipeFlags::PERSIST) {
			// an event-loop module that re-delivers this handle is responsible for keeping
			// the state; the core has nothing to hand it to here
			tracing::debug!(module = self.module.path(), "persistent pipe dropped with pushed state");
		}
	}
}

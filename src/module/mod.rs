//! I/O modules: the pluggable providers of pipe implementations.
//!
//! A module is a vtable over a fixed capability set. The required part is small — identity,
//! lifecycle, handle disposal and at least one way to produce pipes — and everything else
//! defaults to "not supported", mirroring the optional slots of the ABI this trait models.
//! All pipe operations in the crate are dispatched through the owning module; nothing else
//! knows what a pipe handle's body looks like.

use {
	crate::{
		pipe::{DataSource, DataSourceError, DataSourceFate, Pipe, PipeFlags},
		prop::{PropCallback, PropValue},
		Result,
	},
	std::{any::Any, sync::Arc},
};

pub mod mem;
mod pool;
mod registry;

pub use {
	pool::{ObjPool, TlpPolicy},
	registry::{DirIter, ModuleType, Registry},
};

/// The module-specific tail of a pipe handle. Only the owning module looks inside.
pub type PipeBody = Box<dyn Any + Send>;

bitflags::bitflags! {
	/// Module capability flags reported by [`Module::flags`].
	#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
	pub struct ModuleFlags: u32 {
		/// The module runs an event loop and produces events by accepting external input.
		const EVENT_LOOP = 1 << 0;
	}
}

/// Parameters for creating a pipe pair through [`Module::allocate`] or [`Module::accept`].
#[derive(Debug, Clone)]
pub struct PipeParam {
	/// Flags stamped on the readable endpoint.
	pub input_flags: PipeFlags,
	/// Flags stamped on the writable endpoint.
	pub output_flags: PipeFlags,
	/// Module-specific argument, e.g. a file path.
	pub args: Option<String>,
}

impl Default for PipeParam {
	fn default() -> Self {
		Self {
			input_flags: PipeFlags::INPUT,
			output_flags: PipeFlags::OUTPUT,
			args: None,
		}
	}
}

/// Recycled handle bodies offered back to a module during allocation.
///
/// Bodies come from the module's own earlier [`Module::deallocate`] calls, so the module may
/// downcast and reuse them instead of constructing fresh ones. Ignoring the offer is fine.
pub struct Salvage<'p> {
	pool: &'p ObjPool<PipeBody>,
}

impl Salvage<'_> {
	/// Takes one recycled body, if any are cached.
	pub fn take(&mut self) -> Option<PipeBody> {
		self.pool.take()
	}
}

/// Opcode namespace for [`Module::cntl`]. Values below this are reserved by the runtime.
pub const CNTL_MODULE_BASE: u32 = 0x100;
/// Runtime-defined cntl opcode: is there an unread end-of-message marker? Writes a `bool`
/// into the argument.
pub const CNTL_EOM: u32 = 0x01;

/// The capability table every I/O module implements.
///
/// `init` runs once at [`Registry::insmod`] time, before the instance is shared; everything
/// else may be called concurrently and takes `&self`.
pub trait Module: Send + Sync + 'static {
	/// The dotted prefix this module class lives under, e.g. `"pipe"`.
	fn mod_prefix(&self) -> &'static str;

	/// Initializes the instance with its insmod arguments.
	fn init(&mut self, args: &[String]) -> Result<()>;

	/// Final cleanup, invoked by [`Registry::finalize`].
	fn cleanup(&self) -> Result<()> {
		Ok(())
	}

	/// The instance-specific path component appended to the prefix. May be empty, in which
	/// case the instance is addressed by the bare prefix.
	fn path_suffix(&self) -> String;

	/// Capability flags of this instance.
	fn flags(&self) -> ModuleFlags {
		ModuleFlags::empty()
	}

	/// Blocking acceptance of an external event, producing the request's endpoint pair.
	/// Event-loop modules implement this.
	fn accept(&self, param: &PipeParam) -> Result<(PipeBody, PipeBody)> {
		let _ = param;
		unsupported!()
	}

	/// Creates a new pipe, returning the readable and writable endpoint bodies. Either may
	/// be absent for one-shot pipes.
	fn allocate(
		&self,
		param: &PipeParam,
		salvage: &mut Salvage<'_>,
	) -> Result<(Option<PipeBody>, Option<PipeBody>)> {
		let _ = (param, salvage);
		unsupported!()
	}

	/// Duplicates a handle for a shadow edge. The new body shares no read cursor with the
	/// source.
	fn fork(&self, body: &mut dyn Any, flags: PipeFlags, args: Option<&str>) -> Result<PipeBody> {
		let _ = (body, flags, args);
		unsupported!()
	}

	/// Reads at most `buf.len()` bytes. `Ok(0)` with [`eof`](Module::eof) still false means
	/// would-block.
	fn read(&self, body: &mut dyn Any, buf: &mut [u8]) -> Result<usize> {
		let _ = (body, buf);
		unsupported!()
	}

	/// Writes at most `data.len()` bytes; `Ok(0)` means would-block.
	fn write(&self, body: &mut dyn Any, data: &[u8]) -> Result<usize> {
		let _ = (body, data);
		unsupported!()
	}

	/// Whether the stream has ended.
	fn eof(&self, body: &mut dyn Any) -> Result<bool> {
		let _ = body;
		unsupported!()
	}

	/// Whether unread bytes are buffered in the handle.
	fn has_unread_data(&self, body: &mut dyn Any) -> Result<bool> {
		let _ = body;
		unsupported!()
	}

	/// Module-specific control. The runtime routes [`CNTL_EOM`] and module-private opcodes
	/// (at or above [`CNTL_MODULE_BASE`]) here; results travel through `arg`.
	fn cntl(&self, body: &mut dyn Any, opcode: u32, arg: &mut dyn Any) -> Result<()> {
		let _ = (body, opcode, arg);
		unsupported!()
	}

	/// Hands a callback-based data source to the module. See [`DataSourceFate`] for the
	/// ownership outcomes.
	fn write_data_source(
		&self,
		body: &mut dyn Any,
		source: Box<dyn DataSource>,
	) -> Result<DataSourceFate, DataSourceError> {
		let _ = body;
		Err(DataSourceError::unsupported(source))
	}

	/// Releases a handle body. Returning `Some` offers the body for recycling through
	/// [`Salvage`]; the module must have scrubbed it first.
	fn deallocate(&self, body: PipeBody) -> Result<Option<PipeBody>>;

	/// Reads an instance property, addressed relative to the module path.
	fn get_property(&self, symbol: &str) -> PropValue {
		let _ = symbol;
		PropValue::None
	}

	/// Writes an instance property. `Ok(false)` when the symbol is not recognized.
	fn set_property(&self, symbol: &str, value: PropValue) -> Result<bool> {
		let _ = (symbol, value);
		Ok(false)
	}

	/// Invoked for every module when the process is about to exit, before any cleanup.
	fn on_exit(&self) -> Result<()> {
		Ok(())
	}
}

/// A loaded module instance: the module, its resolved path, its type id and its handle pool.
pub struct ModuleInstance {
	module: Box<dyn Module>,
	path: String,
	mtype: ModuleType,
	pool: ObjPool<PipeBody>,
}

impl ModuleInstance {
	pub(crate) fn new(module: Box<dyn Module>, path: String, mtype: ModuleType) -> Self {
		let mut pool = ObjPool::new();
		// handles are produced on event-loop threads and consumed elsewhere
		pool.set_thread_policy(crate::ThreadKind::Event, TlpPolicy::PRODUCER);
		pool.set_thread_policy(crate::ThreadKind::Worker, TlpPolicy::CONSUMER);
		pool.set_thread_policy(crate::ThreadKind::Async, TlpPolicy::CONSUMER);
		pool.set_thread_policy(crate::ThreadKind::Io, TlpPolicy::CONSUMER);
		Self { module, path, mtype, pool }
	}

	/// The full dotted path of this instance.
	pub fn path(&self) -> &str {
		&self.path
	}

	/// The dense type id assigned at insmod time.
	pub fn module_type(&self) -> ModuleType {
		self.mtype
	}

	/// Capability flags of the instance.
	pub fn flags(&self) -> ModuleFlags {
		self.module.flags()
	}

	/// Creates a new pipe through the module.
	pub fn allocate(self: &Arc<Self>, param: &PipeParam) -> Result<(Option<Pipe>, Option<Pipe>)> {
		let mut salvage = Salvage { pool: &self.pool };
		let (inb, outb) = self.module.allocate(param, &mut salvage)?;
		Ok((
			inb.map(|b| Pipe::assemble(Arc::clone(self), param.input_flags, b)),
			outb.map(|b| Pipe::assemble(Arc::clone(self), param.output_flags, b)),
		))
	}

	/// Blocks until the module accepts an external event, returning the endpoint pair.
	pub fn accept(self: &Arc<Self>, param: &PipeParam) -> Result<(Pipe, Pipe)> {
		let (inb, outb) = self.module.accept(param)?;
		Ok((
			Pipe::assemble(Arc::clone(self), param.input_flags, inb),
			Pipe::assemble(Arc::clone(self), param.output_flags, outb),
		))
	}

	/// Runs the module's exit hook.
	pub fn on_exit(&self) -> Result<()> {
		self.module.on_exit()
	}

	pub(crate) fn vtable(&self) -> &dyn Module {
		self.module.as_ref()
	}

	pub(crate) fn reclaim(&self, body: PipeBody) -> Result<()> {
		if let Some(scrubbed) = self.module.deallocate(body)? {
			self.pool.put(scrubbed);
		}
		Ok(())
	}

	pub(crate) fn cleanup(&self) -> Result<()> {
		self.module.cleanup()
	}
}

impl std::fmt::Debug for ModuleInstance {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ModuleInstance")
			.field("path", &self.path)
			.field("type", &self.mtype)
			.finish_non_exhaustive()
	}
}

impl PropCallback for ModuleInstance {
	fn get(&self, symbol: &str) -> PropValue {
		if symbol.is_empty() {
			// probing for existence of the module itself
			return PropValue::Integer(1);
		}
		self.module.get_property(symbol)
	}

	fn set(&self, symbol: &str, value: PropValue) -> Result<bool> {
		self.module.set_property(symbol, value)
	}
}

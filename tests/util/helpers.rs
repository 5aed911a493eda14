//! Helper servlets and wiring shorthand shared by the graph and scheduler tests.

use {
	super::TestResult,
	crate::{
		module::{mem::MemPipeModule, Module, ModuleFlags, PipeBody, PipeParam, Registry, Salvage},
		pipe::{Pipe, PipeFlags, PipeId},
		prop::PropRegistry,
		sched::AsyncHandle,
		service::{NodeId, PipeDesc, ServiceBuffer},
		servlet::{Pdt, Servlet, ServletId, Stab, TaskContext},
		Result, ShutdownToken,
	},
	color_eyre::eyre::eyre,
	std::{
		any::Any,
		collections::VecDeque,
		sync::{Arc, Condvar, Mutex},
		time::{Duration, Instant},
	},
};

/// A registry with the `pipe.mem` module loaded; the starting point of every pipe test.
pub fn mem_registry() -> TestResult<(Arc<PropRegistry>, Arc<Registry>)> {
	let props = Arc::new(PropRegistry::new());
	let mut registry = Registry::new(Arc::clone(&props));
	registry.insmod(Box::new(MemPipeModule::new()), &[])?;
	Ok((props, Arc::new(registry)))
}

/// Allocates one mem pipe pair as `(readable, writable)`.
pub fn mem_pair(registry: &Arc<Registry>) -> TestResult<(Pipe, Pipe)> {
	let inst = registry
		.get_from_path("pipe.mem")
		.ok_or_else(|| eyre!("pipe.mem is not loaded"))?;
	let (rd, wr) = inst.allocate(&Default::default())?;
	Ok((
		rd.ok_or_else(|| eyre!("no readable end"))?,
		wr.ok_or_else(|| eyre!("no writable end"))?,
	))
}

/// Polls a pipe until it reaches end of message, collecting everything it produced.
pub fn read_to_eof(pipe: &mut Pipe, timeout: Duration) -> TestResult<Vec<u8>> {
	let deadline = Instant::now() + timeout;
	let mut out = Vec::new();
	let mut buf = [0u8; 256];
	loop {
		let n = pipe.read(&mut buf)?;
		if n > 0 {
			out.extend_from_slice(&buf[..n]);
			continue;
		}
		if pipe.eof()? {
			return Ok(out);
		}
		if Instant::now() > deadline {
			return Err(eyre!("timed out waiting for end of message; got {} bytes", out.len()));
		}
		std::thread::sleep(Duration::from_millis(2));
	}
}

fn pump(ctx: &mut TaskContext<'_>, from: PipeId, to: PipeId) -> Result<()> {
	let mut buf = [0u8; 256];
	loop {
		let n = ctx.read(from, &mut buf)?;
		if n > 0 {
			ctx.write_all(to, &buf[..n])?;
		} else if ctx.eof(from)? {
			return Ok(());
		} else {
			std::thread::yield_now();
		}
	}
}

/// The plain relay: `stdin` copied to `stdout` and nothing else. Single output, so it can
/// sit at the output endpoint of a service.
pub struct RelayServlet;

impl Servlet for RelayServlet {
	fn desc(&self) -> &'static str {
		"relays stdin to stdout"
	}

	fn init(&mut self, _args: &[String], pdt: &mut Pdt) -> Result<()> {
		pdt.define("stdin", PipeFlags::INPUT, None)?;
		pdt.define("stdout", PipeFlags::OUTPUT, None)?;
		Ok(())
	}

	fn exec(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
		let stdin = ctx.pipe_id("stdin")?;
		let stdout = ctx.pipe_id("stdout")?;
		pump(ctx, stdin, stdout)
	}
}

/// The A-shaped helper for graph interiors: `stdin` relayed to `stdout`, plus a silent
/// `stderr` branch to wire error edges through.
pub struct BranchServlet;

impl Servlet for BranchServlet {
	fn init(&mut self, _args: &[String], pdt: &mut Pdt) -> Result<()> {
		pdt.define("stdin", PipeFlags::INPUT, None)?;
		pdt.define("stdout", PipeFlags::OUTPUT, None)?;
		pdt.define("stderr", PipeFlags::OUTPUT, None)?;
		Ok(())
	}

	fn exec(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
		let stdin = ctx.pipe_id("stdin")?;
		let stdout = ctx.pipe_id("stdout")?;
		pump(ctx, stdin, stdout)
	}
}

/// The B-shaped helper: two inputs concatenated onto `stdout`.
pub struct MergeServlet;

impl Servlet for MergeServlet {
	fn init(&mut self, _args: &[String], pdt: &mut Pdt) -> Result<()> {
		pdt.define("stdin1", PipeFlags::INPUT, None)?;
		pdt.define("stdin2", PipeFlags::INPUT, None)?;
		pdt.define("stdout", PipeFlags::OUTPUT, None)?;
		Ok(())
	}

	fn exec(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
		let in1 = ctx.pipe_id("stdin1")?;
		let in2 = ctx.pipe_id("stdin2")?;
		let stdout = ctx.pipe_id("stdout")?;
		pump(ctx, in1, stdout)?;
		pump(ctx, in2, stdout)
	}
}

/// The asynchronous helper: setup parses a decimal from `stdin` into the async buffer, exec
/// doubles it on the async pool, cleanup prints the result to `stdout`.
pub struct DoublerServlet;

impl Servlet for DoublerServlet {
	fn init(&mut self, _args: &[String], pdt: &mut Pdt) -> Result<()> {
		pdt.define("stdin", PipeFlags::INPUT, None)?;
		pdt.define("stdout", PipeFlags::OUTPUT, None)?;
		Ok(())
	}

	fn is_async(&self) -> bool {
		true
	}

	fn async_buf_size(&self) -> usize {
		8
	}

	fn async_setup(&self, _handle: &AsyncHandle, buf: &mut [u8], ctx: &mut TaskContext<'_>) -> Result<()> {
		let stdin = ctx.pipe_id("stdin")?;
		let mut bytes = Vec::new();
		let mut chunk = [0u8; 64];
		loop {
			let n = ctx.read(stdin, &mut chunk)?;
			if n > 0 {
				bytes.extend_from_slice(&chunk[..n]);
			} else if ctx.eof(stdin)? {
				break;
			} else {
				std::thread::yield_now();
			}
		}
		let value: u64 = String::from_utf8_lossy(&bytes)
			.trim()
			.parse()
			.map_err(|_| crate::Error::Argument("request is not a decimal number"))?;
		buf[..8].copy_from_slice(&value.to_le_bytes());
		Ok(())
	}

	fn async_exec(&self, _handle: &AsyncHandle, buf: &mut [u8]) -> Result<()> {
		let mut raw = [0u8; 8];
		raw.copy_from_slice(&buf[..8]);
		let doubled = u64::from_le_bytes(raw).wrapping_mul(2);
		buf[..8].copy_from_slice(&doubled.to_le_bytes());
		Ok(())
	}

	fn async_cleanup(&self, handle: &AsyncHandle, buf: &mut [u8], ctx: &mut TaskContext<'_>) -> Result<()> {
		let stdout = ctx.pipe_id("stdout")?;
		if handle.failed() {
			ctx.write_all(stdout, b"error")?;
			return Ok(());
		}
		let mut raw = [0u8; 8];
		raw.copy_from_slice(&buf[..8]);
		let text = u64::from_le_bytes(raw).to_string();
		ctx.write_all(stdout, text.as_bytes())
	}
}

/// Loads a plain relay under the given name.
pub fn load_relay(stab: &mut Stab, name: &'static str) -> TestResult<ServletId> {
	Ok(stab.load(&[name, "1"], Box::new(RelayServlet))?)
}

/// Loads an A-shaped helper under the given name.
pub fn load_branch(stab: &mut Stab, name: &'static str) -> TestResult<ServletId> {
	Ok(stab.load(&[name, "1"], Box::new(BranchServlet))?)
}

/// Loads a B-shaped helper under the given name.
pub fn load_merge(stab: &mut Stab, name: &'static str) -> TestResult<ServletId> {
	Ok(stab.load(&[name, "1"], Box::new(MergeServlet))?)
}

/// The `(stdin, stdout)` pipe ids of a plain relay.
pub fn relay_pipes(stab: &Stab, sid: ServletId) -> TestResult<(PipeId, PipeId)> {
	Ok((stab.get_pipe(sid, "stdin")?, stab.get_pipe(sid, "stdout")?))
}

/// The `(stdin, stdout, stderr)` pipe ids of an A-shaped helper.
pub fn branch_pipes(stab: &Stab, sid: ServletId) -> TestResult<(PipeId, PipeId, PipeId)> {
	Ok((
		stab.get_pipe(sid, "stdin")?,
		stab.get_pipe(sid, "stdout")?,
		stab.get_pipe(sid, "stderr")?,
	))
}

/// The `(stdin1, stdin2, stdout)` pipe ids of a B-shaped helper.
pub fn merge_pipes(stab: &Stab, sid: ServletId) -> TestResult<(PipeId, PipeId, PipeId)> {
	Ok((
		stab.get_pipe(sid, "stdin1")?,
		stab.get_pipe(sid, "stdin2")?,
		stab.get_pipe(sid, "stdout")?,
	))
}

/// Shorthand for wiring `nodes[src].src_pipe` into `nodes[dst].dst_pipe`.
pub fn wire(
	buf: &mut ServiceBuffer,
	nodes: &[NodeId],
	src: usize,
	src_pipe: PipeId,
	dst: usize,
	dst_pipe: PipeId,
) -> Result<()> {
	buf.add_pipe(PipeDesc {
		src_node: nodes[src],
		src_pipe,
		dst_node: nodes[dst],
		dst_pipe,
	})
}

/// The response side of one simulated request: collected bytes plus a completion flag set
/// when the runtime releases the output handle.
pub type SimSink = Arc<Mutex<(Vec<u8>, bool)>>;

/// Waits until a sink is closed and returns what was written into it.
pub fn sink_body(sink: &SimSink, timeout: Duration) -> TestResult<Vec<u8>> {
	let deadline = Instant::now() + timeout;
	loop {
		{
			let guard = sink.lock().unwrap();
			if guard.1 {
				return Ok(guard.0.clone());
			}
		}
		if Instant::now() > deadline {
			return Err(eyre!("timed out waiting for the simulated response"));
		}
		std::thread::sleep(Duration::from_millis(2));
	}
}

/// Shared state of the simulated event source, kept by the test to feed requests in after
/// the module has been insmod-ed.
pub struct SimState {
	pending: Mutex<VecDeque<(Vec<u8>, SimSink)>>,
	cond: Condvar,
	shutdown: ShutdownToken,
}

impl SimState {
	pub fn new(shutdown: ShutdownToken) -> Arc<Self> {
		Arc::new(Self {
			pending: Mutex::new(VecDeque::new()),
			cond: Condvar::new(),
			shutdown,
		})
	}

	/// Queues one simulated request, returning the sink its response lands in.
	pub fn push_request(&self, body: &[u8]) -> SimSink {
		let sink: SimSink = Arc::new(Mutex::new((Vec::new(), false)));
		self.pending
			.lock()
			.unwrap()
			.push_back((body.to_vec(), Arc::clone(&sink)));
		self.cond.notify_one();
		sink
	}
}

enum SimBody {
	Reader { data: Vec<u8>, cursor: usize },
	Writer { sink: SimSink },
}

/// An event-source module in the spirit of the simulation transport: accept blocks until
/// the test queues a request.
pub struct SimSourceModule {
	state: Arc<SimState>,
}

impl SimSourceModule {
	pub fn new(state: &Arc<SimState>) -> Box<Self> {
		Box::new(Self { state: Arc::clone(state) })
	}
}

impl Module for SimSourceModule {
	fn mod_prefix(&self) -> &'static str {
		"pipe"
	}

	fn init(&mut self, _args: &[String]) -> Result<()> {
		Ok(())
	}

	fn path_suffix(&self) -> String {
		"simulate".to_owned()
	}

	fn flags(&self) -> ModuleFlags {
		ModuleFlags::EVENT_LOOP
	}

	fn accept(&self, _param: &PipeParam) -> Result<(PipeBody, PipeBody)> {
		let guard = self.state.pending.lock().unwrap();
		let (mut guard, killed) =
			self.state
				.shutdown
				.wait_or_stop(guard, &self.state.cond, VecDeque::is_empty);
		if killed {
			return Err(crate::Error::State("simulated event source killed"));
		}
		let (data, sink) = guard.pop_front().expect("woken on an empty queue");
		Ok((
			Box::new(SimBody::Reader { data, cursor: 0 }),
			Box::new(SimBody::Writer { sink }),
		))
	}

	fn read(&self, body: &mut dyn Any, buf: &mut [u8]) -> Result<usize> {
		match body.downcast_mut::<SimBody>() {
			Some(SimBody::Reader { data, cursor }) => {
				let n = (data.len() - *cursor).min(buf.len());
				buf[..n].copy_from_slice(&data[*cursor..*cursor + n]);
				*cursor += n;
				Ok(n)
			}
			_ => Err(crate::Error::Argument("read on a simulated response handle")),
		}
	}

	fn eof(&self, body: &mut dyn Any) -> Result<bool> {
		match body.downcast_mut::<SimBody>() {
			Some(SimBody::Reader { data, cursor }) => Ok(*cursor >= data.len()),
			Some(SimBody::Writer { sink }) => Ok(sink.lock().unwrap().1),
			None => Err(crate::Error::Argument("foreign handle")),
		}
	}

	fn write(&self, body: &mut dyn Any, data: &[u8]) -> Result<usize> {
		match body.downcast_mut::<SimBody>() {
			Some(SimBody::Writer { sink }) => {
				sink.lock().unwrap().0.extend_from_slice(data);
				Ok(data.len())
			}
			_ => Err(crate::Error::Argument("write on a simulated request handle")),
		}
	}

	fn allocate(
		&self,
		_param: &PipeParam,
		_salvage: &mut Salvage<'_>,
	) -> Result<(Option<PipeBody>, Option<PipeBody>)> {
		Err(crate::Error::Unsupported)
	}

	fn deallocate(&self, body: PipeBody) -> Result<Option<PipeBody>> {
		if let Ok(body) = body.downcast::<SimBody>() {
			if let SimBody::Writer { sink } = *body {
				sink.lock().unwrap().1 = true;
			}
		}
		Ok(None)
	}
}

/// A scope that zeroes a shared cell when its entity is disposed; the copy capability
/// mirrors the value into the upper half of the array.
pub struct StatusEnt {
	pub idx: usize,
	pub store: Arc<std::sync::Mutex<Vec<i32>>>,
}

impl crate::rscope::ScopeObject for StatusEnt {
	fn duplicate(&self) -> Result<Box<dyn crate::rscope::ScopeObject>> {
		let half = {
			let store = self.store.lock().unwrap();
			store.len() / 2
		};
		let target = self.idx + half;
		{
			let mut store = self.store.lock().unwrap();
			store[target] = store[self.idx];
		}
		Ok(Box::new(StatusEnt { idx: target, store: Arc::clone(&self.store) }))
	}
}

impl Drop for StatusEnt {
	fn drop(&mut self) {
		if let Ok(mut store) = self.store.lock() {
			store[self.idx] = 0;
		}
	}
}

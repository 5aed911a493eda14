//! The in-memory pipe module, `pipe.mem`.
//!
//! A mem pipe is a byte buffer shared by one writer and any number of reader forks, each
//! with its own cursor. Dropping the writer closes the channel, which is what readers see as
//! end of message. This is the default transport for pipes between nodes of a service graph
//! and the workhorse of the test suite.

use {
	super::{Module, PipeBody, PipeParam, Salvage, CNTL_EOM},
	crate::{pipe::PipeFlags, Error, Result},
	std::{
		any::Any,
		sync::{Arc, Mutex},
	},
};

#[derive(Default)]
struct Channel {
	buf: Vec<u8>,
	closed: bool,
}

struct MemBody {
	chan: Option<Arc<Mutex<Channel>>>,
	cursor: usize,
	writer: bool,
}

impl MemBody {
	fn chan(&self) -> Result<&Arc<Mutex<Channel>>> {
		self.chan
			.as_ref()
			.ok_or(Error::State("mem pipe body used after scrub"))
	}
}

fn body_of(body: &mut dyn Any) -> Result<&mut MemBody> {
	body.downcast_mut::<MemBody>()
		.ok_or(Error::Argument("foreign pipe handle passed to pipe.mem"))
}

/// The `pipe.mem` module. One instance serves any number of independent pipes.
#[derive(Default)]
pub struct MemPipeModule {
	_priv: (),
}

impl MemPipeModule {
	/// Creates the module, ready for `insmod`.
	pub fn new() -> Self {
		Self::default()
	}

	fn make_body(&self, salvage: Option<&mut Salvage<'_>>, chan: Arc<Mutex<Channel>>, writer: bool) -> PipeBody {
		if let Some(salvage) = salvage {
			if let Some(old) = salvage.take() {
				if let Ok(mut body) = old.downcast::<MemBody>() {
					body.chan = Some(chan);
					body.cursor = 0;
					body.writer = writer;
					return body;
				}
			}
		}
		Box::new(MemBody { chan: Some(chan), cursor: 0, writer })
	}
}

impl Module for MemPipeModule {
	fn mod_prefix(&self) -> &'static str {
		"pipe"
	}

	fn init(&mut self, _args: &[String]) -> Result<()> {
		Ok(())
	}

	fn path_suffix(&self) -> String {
		"mem".to_owned()
	}

	fn allocate(
		&self,
		_param: &PipeParam,
		salvage: &mut Salvage<'_>,
	) -> Result<(Option<PipeBody>, Option<PipeBody>)> {
		let chan = Arc::new(Mutex::new(Channel::default()));
		let rd = self.make_body(Some(&mut *salvage), Arc::clone(&chan), false);
		let wr = self.make_body(Some(&mut *salvage), chan, true);
		Ok((Some(rd), Some(wr)))
	}

	fn fork(&self, body: &mut dyn Any, flags: PipeFlags, _args: Option<&str>) -> Result<PipeBody> {
		let body = body_of(body)?;
		let chan = Arc::clone(body.chan()?);
		Ok(self.make_body(None, chan, flags.is_output()))
	}

	fn read(&self, body: &mut dyn Any, buf: &mut [u8]) -> Result<usize> {
		let body = body_of(body)?;
		let chan = Arc::clone(body.chan()?);
		let chan = chan.lock().map_err(crate::poison_error)?;
		let avail = chan.buf.len().saturating_sub(body.cursor);
		let n = avail.min(buf.len());
		if n > 0 {
			let from = chan
				.buf
				.get(body.cursor..body.cursor + n)
				.ok_or(Error::State("mem pipe cursor out of range"))?;
			buf.get_mut(..n)
				.ok_or(Error::Argument("read buffer shrank"))?
				.copy_from_slice(from);
			body.cursor += n;
		}
		// n == 0 with the channel still open is a would-block, not an end of message
		Ok(n)
	}

	fn write(&self, body: &mut dyn Any, data: &[u8]) -> Result<usize> {
		let body = body_of(body)?;
		chk_arg!(body.writer, "write through a mem pipe read handle");
		let mut chan = body.chan()?.lock().map_err(crate::poison_error)?;
		if chan.closed {
			bad_state!("write into a closed mem pipe");
		}
		chan.buf.extend_from_slice(data);
		Ok(data.len())
	}

	fn eof(&self, body: &mut dyn Any) -> Result<bool> {
		let body = body_of(body)?;
		let chan = body.chan()?.lock().map_err(crate::poison_error)?;
		Ok(chan.closed && body.cursor >= chan.buf.len())
	}

	fn has_unread_data(&self, body: &mut dyn Any) -> Result<bool> {
		let body = body_of(body)?;
		let chan = body.chan()?.lock().map_err(crate::poison_error)?;
		Ok(body.cursor < chan.buf.len())
	}

	fn cntl(&self, body: &mut dyn Any, opcode: u32, arg: &mut dyn Any) -> Result<()> {
		match opcode {
			CNTL_EOM => {
				let pending = {
					let body = body_of(body)?;
					let chan = body.chan()?.lock().map_err(crate::poison_error)?;
					chan.closed && body.cursor < chan.buf.len()
				};
				match arg.downcast_mut::<bool>() {
					Some(out) => *out = pending,
					None => return Err(Error::Argument("EOM cntl expects a bool argument")),
				}
				Ok(())
			}
			_ => Err(Error::Unsupported),
		}
	}

	fn deallocate(&self, body: PipeBody) -> Result<Option<PipeBody>> {
		let mut body = body
			.downcast::<MemBody>()
			.map_err(|_| Error::Argument("foreign pipe handle passed to pipe.mem"))?;
		if body.writer {
			if let Some(chan) = body.chan.as_ref() {
				chan.lock().map_err(crate::poison_error)?.closed = true;
			}
		}
		// scrub for recycling
		body.chan = None;
		body.cursor = 0;
		body.writer = false;
		Ok(Some(body))
	}
}

//! Binary serialization of service graphs.
//!
//! The record stream is how a deployed graph crosses a control socket: a magic/version
//! header, the node count and edge count, one argv record per node, one 4-tuple per edge,
//! and the input/output endpoints as a trailer. Deserialization resolves each argv record
//! against the already-loaded servlet table and then runs the ordinary finalization, so a
//! forged record can fail validation but never corrupt state.

use {
	super::{NodeId, PipeDesc, Service, ServiceBuffer},
	crate::{pipe::PipeId, servlet::Stab, Error, Result},
	std::io::{Read, Write},
};

const MAGIC: u32 = 0x504c_4d42; // "PLMB"
const VERSION: u32 = 1;

// refuse absurd counts before allocating for them
const MAX_NODES: u32 = 1 << 20;
const MAX_EDGES: u32 = 1 << 22;
const MAX_ARG_LEN: u32 = 1 << 16;

fn put_u32(w: &mut impl Write, v: u32) -> Result<()> {
	w.write_all(&v.to_le_bytes())?;
	Ok(())
}

fn get_u32(r: &mut impl Read) -> Result<u32> {
	let mut buf = [0u8; 4];
	r.read_exact(&mut buf)?;
	Ok(u32::from_le_bytes(buf))
}

fn get_pipe_id(r: &mut impl Read) -> Result<PipeId> {
	let v = get_u32(r)?;
	u16::try_from(v)
		.map(PipeId)
		.map_err(|_| Error::protocol(format!("pipe id {v} out of range")))
}

impl Service {
	/// Writes the length-prefixed record stream for this graph.
	pub fn dump(&self, w: &mut impl Write) -> Result<()> {
		put_u32(w, MAGIC)?;
		put_u32(w, VERSION)?;
		#[allow(clippy::cast_possible_truncation)]
		{
			put_u32(w, self.num_nodes() as u32)?;
			put_u32(w, self.edges().len() as u32)?;
		}

		for n in 0..self.num_nodes() {
			#[allow(clippy::cast_possible_truncation)]
			let args = self.node_args(NodeId(n as u32))?;
			#[allow(clippy::cast_possible_truncation)]
			put_u32(w, args.len() as u32)?;
			for arg in args {
				#[allow(clippy::cast_possible_truncation)]
				put_u32(w, arg.len() as u32)?;
				w.write_all(arg.as_bytes())?;
			}
		}

		for e in self.edges() {
			put_u32(w, e.src_node.raw())?;
			put_u32(w, u32::from(e.src_pipe.0))?;
			put_u32(w, e.dst_node.raw())?;
			put_u32(w, u32::from(e.dst_pipe.0))?;
		}

		let (in_node, in_pipe) = self.input_endpoint();
		let (out_node, out_pipe) = self.output_endpoint();
		put_u32(w, in_node.raw())?;
		put_u32(w, u32::from(in_pipe.0))?;
		put_u32(w, out_node.raw())?;
		put_u32(w, u32::from(out_pipe.0))?;

		tracing::debug!(nodes = self.num_nodes(), edges = self.edges().len(), "service dumped");
		Ok(())
	}

	/// Rebuilds a graph from a record stream produced by [`Service::dump`], resolving node
	/// records against `stab`, then finalizes it the ordinary way.
	pub fn from_reader(r: &mut impl Read, stab: &Stab) -> Result<Self> {
		if get_u32(r)? != MAGIC {
			return Err(Error::protocol("bad magic"));
		}
		let version = get_u32(r)?;
		if version != VERSION {
			return Err(Error::protocol(format!("unsupported version {version}")));
		}

		let num_nodes = get_u32(r)?;
		let num_edges = get_u32(r)?;
		if num_nodes > MAX_NODES || num_edges > MAX_EDGES {
			return Err(Error::protocol("node or edge count out of range"));
		}

		let mut buf = ServiceBuffer::new();
		// the dump came from a graph that already passed the instance-reuse rule
		buf.allow_reuse_servlet();

		for _ in 0..num_nodes {
			let argc = get_u32(r)?;
			if argc == 0 || argc > MAX_NODES {
				return Err(Error::protocol("node record with no argv"));
			}
			let mut argv = Vec::with_capacity(argc as usize);
			for _ in 0..argc {
				let len = get_u32(r)?;
				if len > MAX_ARG_LEN {
					return Err(Error::protocol("argv entry too long"));
				}
				let mut bytes = vec![0u8; len as usize];
				r.read_exact(&mut bytes)?;
				argv.push(
					String::from_utf8(bytes).map_err(|_| Error::protocol("argv entry is not UTF-8"))?,
				);
			}
			let sid = stab.find_by_argv(&argv).ok_or_else(|| {
				Error::validation(format!("no loaded servlet matches argv {argv:?}"))
			})?;
			buf.add_node(stab, sid)?;
		}

		for _ in 0..num_edges {
			let desc = PipeDesc {
				src_node: NodeId(get_u32(r)?),
				src_pipe: get_pipe_id(r)?,
				dst_node: NodeId(get_u32(r)?),
				dst_pipe: get_pipe_id(r)?,
			};
			buf.add_pipe(desc)?;
		}

		let in_node = NodeId(get_u32(r)?);
		let in_pipe = get_pipe_id(r)?;
		let out_node = NodeId(get_u32(r)?);
		let out_pipe = get_pipe_id(r)?;
		buf.set_input(in_node, in_pipe)?;
		buf.set_output(out_node, out_pipe)?;

		Service::from_buffer(&buf)
	}
}

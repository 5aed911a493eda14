//! The mutable builder a service graph is assembled in.
//!
//! The buffer accepts nodes and edges with local sanity checks only; the expensive
//! whole-graph validation runs in [`Service::from_buffer`], and a buffer that fails it stays
//! fully usable.
//!
//! [`Service::from_buffer`]: super::Service::from_buffer

use {
	super::{NodeId, PipeDesc},
	crate::{
		pipe::PipeId,
		servlet::{ServletEntry, ServletId, Stab},
		Error, Result,
	},
	std::sync::Arc,
};

pub(super) struct BufferNode {
	pub(super) sid: ServletId,
	pub(super) entry: Arc<ServletEntry>,
}

/// A service graph under construction.
#[derive(Default)]
pub struct ServiceBuffer {
	pub(super) nodes: Vec<BufferNode>,
	pub(super) pipes: Vec<PipeDesc>,
	pub(super) input: Option<(NodeId, PipeId)>,
	pub(super) output: Option<(NodeId, PipeId)>,
	pub(super) reuse_ok: bool,
}

impl ServiceBuffer {
	/// Creates an empty buffer.
	pub fn new() -> Self {
		Self::default()
	}

	/// Permits the same servlet instance to appear in more than one node. Testing only:
	/// concrete type resolution assumes a servlet context is not shared between nodes.
	pub fn allow_reuse_servlet(&mut self) {
		self.reuse_ok = true;
	}

	/// Adds a node running the given servlet, returning its id.
	pub fn add_node(&mut self, stab: &Stab, sid: ServletId) -> Result<NodeId> {
		let entry = stab.get(sid).ok_or(Error::Argument("unknown servlet id"))?;
		if self.nodes.len() >= u32::MAX as usize {
			return Err(Error::Resource("service buffer node table full"));
		}
		#[allow(clippy::cast_possible_truncation)] // bounded above
		let nid = NodeId(self.nodes.len() as u32);
		self.nodes.push(BufferNode { sid, entry: Arc::clone(entry) });
		tracing::debug!(node = nid.raw(), servlet = %sid, "service node added");
		Ok(nid)
	}

	fn node(&self, nid: NodeId) -> Result<&BufferNode> {
		self.nodes.get(nid.index()).ok_or(Error::Argument("node id out of range"))
	}

	/// Adds a directed edge. The source pipe must be an output, the destination an input,
	/// and neither end may already be wired.
	pub fn add_pipe(&mut self, desc: PipeDesc) -> Result<()> {
		if desc.src_node == desc.dst_node {
			return Err(Error::validation("a pipe cannot connect a node to itself"));
		}

		let src = self.node(desc.src_node)?;
		let src_slot = src
			.entry
			.pdt()
			.slot(desc.src_pipe)
			.map(|s| s.flags)
			.ok_or(Error::Argument("source pipe id out of range"))?;
		if !src_slot.is_output() {
			return Err(Error::validation(format!(
				"source pipe {} of node {} is not an output",
				desc.src_pipe,
				desc.src_node.raw()
			)));
		}

		let dst = self.node(desc.dst_node)?;
		let dst_slot = dst
			.entry
			.pdt()
			.slot(desc.dst_pipe)
			.map(|s| s.flags)
			.ok_or(Error::Argument("destination pipe id out of range"))?;
		if !dst_slot.is_input() {
			return Err(Error::validation(format!(
				"destination pipe {} of node {} is not an input",
				desc.dst_pipe,
				desc.dst_node.raw()
			)));
		}

		for existing in &self.pipes {
			if existing.src_node == desc.src_node && existing.src_pipe == desc.src_pipe {
				return Err(Error::validation("source pipe already wired; fork a shadow for fan-out"));
			}
			if existing.dst_node == desc.dst_node && existing.dst_pipe == desc.dst_pipe {
				return Err(Error::validation("destination pipe already wired"));
			}
		}

		self.pipes.push(desc);
		Ok(())
	}

	/// Designates the service input endpoint: the pipe incoming requests are bound to.
	pub fn set_input(&mut self, node: NodeId, pipe: PipeId) -> Result<()> {
		let flags = self
			.node(node)?
			.entry
			.pdt()
			.slot(pipe)
			.map(|s| s.flags)
			.ok_or(Error::Argument("input pipe id out of range"))?;
		if !flags.is_input() {
			return Err(Error::validation("service input endpoint must be an input pipe"));
		}
		self.input = Some((node, pipe));
		Ok(())
	}

	/// Designates the service output endpoint: the pipe the response is read from.
	pub fn set_output(&mut self, node: NodeId, pipe: PipeId) -> Result<()> {
		let flags = self
			.node(node)?
			.entry
			.pdt()
			.slot(pipe)
			.map(|s| s.flags)
			.ok_or(Error::Argument("output pipe id out of range"))?;
		if !flags.is_output() {
			return Err(Error::validation("service output endpoint must be an output pipe"));
		}
		self.output = Some((node, pipe));
		Ok(())
	}

	/// Number of nodes added so far.
	pub fn num_nodes(&self) -> usize {
		self.nodes.len()
	}

	/// The edges added so far.
	pub fn pipes(&self) -> &[PipeDesc] {
		&self.pipes
	}
}

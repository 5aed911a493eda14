//! Service graphs: validated DAGs of servlet nodes with typed pipe edges.
//!
//! A graph is assembled in a [`ServiceBuffer`] and frozen by [`Service::from_buffer`], which
//! runs the whole-graph validation: connectivity, acyclicity (the topological order doubles
//! as the scheduling order), concrete-type resolution, shadow resolution and critical-node
//! analysis. A finalized service is immutable; the scheduler walks it concurrently from
//! many worker threads.
//!
//! The whole service is itself shaped like one pipe — a single input endpoint and a single
//! output endpoint — which is what lets services compose with transport modules.
//!
//! # Example
//!
//! ```
//! use plumber::{
//! 	pipe::PipeFlags,
//! 	service::{PipeDesc, Service, ServiceBuffer},
//! 	servlet::{Pdt, Servlet, Stab},
//! };
//!
//! struct Echo;
//! impl Servlet for Echo {
//! 	fn init(&mut self, _args: &[String], pdt: &mut Pdt) -> plumber::Result<()> {
//! 		pdt.define("in", PipeFlags::INPUT, None)?;
//! 		pdt.define("out", PipeFlags::OUTPUT, None)?;
//! 		Ok(())
//! 	}
//! }
//!
//! # fn main() -> plumber::Result<()> {
//! let mut stab = Stab::new();
//! let first = stab.load(&["echo", "--first"], Box::new(Echo))?;
//! let second = stab.load(&["echo", "--second"], Box::new(Echo))?;
//!
//! let mut buf = ServiceBuffer::new();
//! let head = buf.add_node(&stab, first)?;
//! let tail = buf.add_node(&stab, second)?;
//! buf.add_pipe(PipeDesc {
//! 	src_node: head,
//! 	src_pipe: stab.get_pipe(first, "out")?,
//! 	dst_node: tail,
//! 	dst_pipe: stab.get_pipe(second, "in")?,
//! })?;
//! buf.set_input(head, stab.get_pipe(first, "in")?)?;
//! buf.set_output(tail, stab.get_pipe(second, "out")?)?;
//!
//! let service = Service::from_buffer(&buf)?;
//! assert_eq!(service.num_nodes(), 2);
//! # Ok(())
//! # }
//! ```

use {
	crate::{
		pipe::{PipeFlags, PipeId},
		servlet::{ServletEntry, ServletId},
		task::{Task, TaskFlags},
		Error, Result,
	},
	std::{collections::HashMap, sync::Arc},
};

mod buffer;
mod cnode;
mod serial;

pub use {
	buffer::ServiceBuffer,
	cnode::{Boundary, BoundaryDest, CnodeInfo},
};

/// Id of a node inside one service graph.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
	/// The raw node index.
	pub fn raw(self) -> u32 {
		self.0
	}

	pub(crate) fn index(self) -> usize {
		self.0 as usize
	}
}

/// A directed typed edge: source node and output pipe, destination node and input pipe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PipeDesc {
	/// The producing node.
	pub src_node: NodeId,
	/// The output pipe of the producing node.
	pub src_pipe: PipeId,
	/// The consuming node.
	pub dst_node: NodeId,
	/// The input pipe of the consuming node.
	pub dst_pipe: PipeId,
}

struct Node {
	sid: ServletId,
	entry: Arc<ServletEntry>,
}

/// A finalized, immutable service graph.
pub struct Service {
	nodes: Vec<Node>,
	edges: Vec<PipeDesc>,
	incoming: Vec<Vec<PipeDesc>>,
	outgoing: Vec<Vec<PipeDesc>>,
	input: (NodeId, PipeId),
	output: (NodeId, PipeId),
	topo: Vec<NodeId>,
	// concrete type per node per pipe slot, when resolution pinned one down
	types: Vec<Vec<Option<String>>>,
	cnode: CnodeInfo,
	claimed: Vec<Arc<ServletEntry>>,
}

fn is_concrete(expr: &str) -> bool {
	!expr.contains('$')
}

impl Service {
	/// Finalizes a buffer into a service. The buffer is not consumed and stays usable —
	/// in particular after a validation failure.
	pub fn from_buffer(buf: &ServiceBuffer) -> Result<Self> {
		let (input, output) = match (buf.input, buf.output) {
			(Some(i), Some(o)) => (i, o),
			_ => return Err(Error::validation("service input/output endpoints are not both set")),
		};

		let num_nodes = buf.nodes.len();
		if num_nodes == 0 {
			return Err(Error::validation("service graph has no nodes"));
		}

		// servlet instance reuse is disallowed unless the buffer opted in (testing only)
		let mut claimed = Vec::new();
		if !buf.reuse_ok {
			let unclaim_all = |claimed: &Vec<Arc<ServletEntry>>| {
				for e in claimed {
					e.unclaim();
				}
			};
			for node in &buf.nodes {
				if !node.entry.claim() {
					unclaim_all(&claimed);
					return Err(Error::validation(format!(
						"servlet instance {:?} used by more than one node",
						node.entry.argv().first().map(String::as_str).unwrap_or("")
					)));
				}
				claimed.push(Arc::clone(&node.entry));
			}
		}

		let finish = Self::validate(buf, input, output, num_nodes);
		match finish {
			Ok((topo, types, cnode)) => {
				let mut incoming = vec![Vec::new(); num_nodes];
				let mut outgoing = vec![Vec::new(); num_nodes];
				for e in &buf.pipes {
					if let Some(v) = incoming.get_mut(e.dst_node.index()) {
						v.push(*e);
					}
					if let Some(v) = outgoing.get_mut(e.src_node.index()) {
						v.push(*e);
					}
				}
				tracing::info!(
					nodes = num_nodes,
					edges = buf.pipes.len(),
					"service graph finalized"
				);
				Ok(Self {
					nodes: buf
						.nodes
						.iter()
						.map(|n| Node { sid: n.sid, entry: Arc::clone(&n.entry) })
						.collect(),
					edges: buf.pipes.clone(),
					incoming,
					outgoing,
					input,
					output,
					topo,
					types,
					cnode,
					claimed,
				})
			}
			Err(e) => {
				for entry in &claimed {
					entry.unclaim();
				}
				Err(e)
			}
		}
	}

	#[allow(clippy::type_complexity)]
	fn validate(
		buf: &ServiceBuffer,
		input: (NodeId, PipeId),
		output: (NodeId, PipeId),
		num_nodes: usize,
	) -> Result<(Vec<NodeId>, Vec<Vec<Option<String>>>, CnodeInfo)> {
		// the input node takes the incoming request and nothing else
		{
			let entry = &buf
				.nodes
				.get(input.0.index())
				.ok_or(Error::Argument("input endpoint node out of range"))?
				.entry;
			let pdt = entry.pdt();
			let inputs = pdt.iter().filter(|(_, s)| s.flags.is_input()).count();
			if inputs != 1 {
				return Err(Error::validation("the input node must have exactly one input pipe"));
			}
		}

		// and the output node produces the response and nothing else
		{
			let entry = &buf
				.nodes
				.get(output.0.index())
				.ok_or(Error::Argument("output endpoint node out of range"))?
				.entry;
			let pdt = entry.pdt();
			let outputs = pdt.iter().filter(|(_, s)| s.flags.is_output()).count();
			if outputs != 1 {
				return Err(Error::validation("the output node must have exactly one output pipe"));
			}
		}

		// every input slot of every node is fed by exactly one edge (or the input endpoint)
		for (ni, node) in buf.nodes.iter().enumerate() {
			let pdt = node.entry.pdt();
			for (pid, slot) in pdt.iter() {
				if !slot.flags.is_input() {
					continue;
				}
				#[allow(clippy::cast_possible_truncation)]
				let nid = NodeId(ni as u32);
				let mut feeds = buf
					.pipes
					.iter()
					.filter(|e| e.dst_node == nid && e.dst_pipe == pid)
					.count();
				if (nid, pid) == input {
					feeds += 1;
				}
				if feeds != 1 {
					return Err(Error::validation(format!(
						"input pipe {:?} of node {} is fed by {} sources, expected exactly one",
						slot.name,
						nid.raw(),
						feeds
					)));
				}
			}
		}

		// topological order; failure means a cycle
		let topo = Self::toposort(num_nodes, &buf.pipes)?;

		// concrete type resolution along the topological order
		let types = Self::resolve_types(buf, &topo)?;

		// shadow targets must resolve inside each node
		for node in &buf.nodes {
			let pdt = node.entry.pdt();
			for (_, slot) in pdt.iter() {
				if let Some(target) = slot.flags.shadow_target() {
					let tgt = pdt
						.slot(target)
						.ok_or_else(|| Error::validation(format!("shadow target {target} does not resolve")))?;
					if !tgt.flags.is_output() {
						return Err(Error::validation(format!(
							"shadow target {target} is not an output pipe"
						)));
					}
				}
			}
		}

		let cnode = CnodeInfo::analyze(num_nodes, &buf.pipes, &topo, output.0);

		Ok((topo, types, cnode))
	}

	fn toposort(num_nodes: usize, edges: &[PipeDesc]) -> Result<Vec<NodeId>> {
		let mut indegree = vec![0usize; num_nodes];
		for e in edges {
			if let Some(d) = indegree.get_mut(e.dst_node.index()) {
				*d += 1;
			}
		}
		#[allow(clippy::cast_possible_truncation)]
		let mut ready: Vec<NodeId> = (0..num_nodes)
			.filter(|&n| indegree.get(n).copied().unwrap_or(0) == 0)
			.map(|n| NodeId(n as u32))
			.collect();
		let mut order = Vec::with_capacity(num_nodes);
		while let Some(n) = ready.pop() {
			order.push(n);
			for e in edges.iter().filter(|e| e.src_node == n) {
				if let Some(d) = indegree.get_mut(e.dst_node.index()) {
					*d -= 1;
					if *d == 0 {
						ready.push(e.dst_node);
					}
				}
			}
		}
		if order.len() != num_nodes {
			return Err(Error::validation("service graph contains a directed cycle"));
		}
		Ok(order)
	}

	fn resolve_types(buf: &ServiceBuffer, topo: &[NodeId]) -> Result<Vec<Vec<Option<String>>>> {
		let mut types: Vec<Vec<Option<String>>> = buf
			.nodes
			.iter()
			.map(|n| {
				let pdt = n.entry.pdt();
				pdt.iter().map(|(_, s)| s.type_expr.clone()).collect()
			})
			.collect();

		for &nid in topo {
			// variable bindings established by this node's inputs
			let mut bindings: HashMap<String, String> = HashMap::new();

			for e in buf.pipes.iter().filter(|e| e.dst_node == nid) {
				let upstream = types
					.get(e.src_node.index())
					.and_then(|v| v.get(usize::from(e.src_pipe.0)))
					.cloned()
					.flatten();
				let declared = types
					.get(nid.index())
					.and_then(|v| v.get(usize::from(e.dst_pipe.0)))
					.cloned()
					.flatten();

				let resolved = match (upstream, declared) {
					(Some(up), Some(own)) if is_concrete(&up) && is_concrete(&own) => {
						if up != own {
							return Err(Error::validation(format!(
								"type conflict on edge into node {}: {up:?} flows into {own:?}",
								nid.raw()
							)));
						}
						Some(own)
					}
					(Some(up), Some(own)) if is_concrete(&up) => {
						// the declared expression is abstract; the upstream concrete type
						// binds its variable, and conflicting bindings fail
						if let Some(prev) = bindings.get(&own) {
							if *prev != up {
								return Err(Error::validation(format!(
									"type variable {own:?} bound to both {prev:?} and {up:?} in node {}",
									nid.raw()
								)));
							}
						} else {
							bindings.insert(own, up.clone());
						}
						Some(up)
					}
					// most specific wins
					(Some(up), Some(own)) => Some(if is_concrete(&own) { own } else { up }),
					(Some(up), None) => Some(up),
					(None, own) => own,
				};

				if let Some(slot) = types
					.get_mut(nid.index())
					.and_then(|v| v.get_mut(usize::from(e.dst_pipe.0)))
				{
					*slot = resolved;
				}
			}

			// outputs declared with a bound variable become concrete as well
			if let Some(slots) = types.get_mut(nid.index()) {
				for slot in slots.iter_mut() {
					if let Some(expr) = slot.as_ref() {
						if !is_concrete(expr) {
							if let Some(bound) = bindings.get(expr) {
								*slot = Some(bound.clone());
							}
						}
					}
				}
			}
		}

		Ok(types)
	}

	/// Number of nodes.
	pub fn num_nodes(&self) -> usize {
		self.nodes.len()
	}

	/// The edge list, in definition order.
	pub fn edges(&self) -> &[PipeDesc] {
		&self.edges
	}

	/// The node receiving incoming requests.
	pub fn input_node(&self) -> NodeId {
		self.input.0
	}

	/// The node producing the response.
	pub fn output_node(&self) -> NodeId {
		self.output.0
	}

	/// The input endpoint as `(node, pipe)`.
	pub fn input_endpoint(&self) -> (NodeId, PipeId) {
		self.input
	}

	/// The output endpoint as `(node, pipe)`.
	pub fn output_endpoint(&self) -> (NodeId, PipeId) {
		self.output
	}

	/// The whole service viewed as a single pipe descriptor: its input endpoint is the
	/// source, its output endpoint the destination.
	pub fn as_pipe_desc(&self) -> PipeDesc {
		PipeDesc {
			src_node: self.input.0,
			src_pipe: self.input.1,
			dst_node: self.output.0,
			dst_pipe: self.output.1,
		}
	}

	/// The scheduling order: a topological order of the nodes.
	pub fn topo_order(&self) -> &[NodeId] {
		&self.topo
	}

	fn node(&self, nid: NodeId) -> Result<&Node> {
		self.nodes.get(nid.index()).ok_or(Error::Argument("node id out of range"))
	}

	/// The servlet entry a node runs.
	pub fn node_servlet(&self, nid: NodeId) -> Result<&Arc<ServletEntry>> {
		Ok(&self.node(nid)?.entry)
	}

	/// The servlet id a node was built from.
	pub fn node_sid(&self, nid: NodeId) -> Result<ServletId> {
		Ok(self.node(nid)?.sid)
	}

	/// The instantiation arguments of a node's servlet.
	pub fn node_args(&self, nid: NodeId) -> Result<&[String]> {
		Ok(self.node(nid)?.entry.argv())
	}

	/// All edges feeding a node.
	pub fn incoming_pipes(&self, nid: NodeId) -> Result<&[PipeDesc]> {
		self.incoming
			.get(nid.index())
			.map(Vec::as_slice)
			.ok_or(Error::Argument("node id out of range"))
	}

	/// All edges leaving a node.
	pub fn outgoing_pipes(&self, nid: NodeId) -> Result<&[PipeDesc]> {
		self.outgoing
			.get(nid.index())
			.map(Vec::as_slice)
			.ok_or(Error::Argument("node id out of range"))
	}

	/// The declared flag word of one pipe slot of one node.
	pub fn pipe_flags(&self, nid: NodeId, pid: PipeId) -> Result<PipeFlags> {
		let node = self.node(nid)?;
		let pdt = node.entry.pdt();
		pdt.slot(pid)
			.map(|s| s.flags)
			.ok_or(Error::Argument("pipe id out of range"))
	}

	/// The concrete type resolved for a pipe, when finalization pinned one down.
	pub fn pipe_type(&self, nid: NodeId, pid: PipeId) -> Result<Option<&str>> {
		self.types
			.get(nid.index())
			.ok_or(Error::Argument("node id out of range"))?
			.get(usize::from(pid.0))
			.map(|t| t.as_deref().filter(|e| is_concrete(e)))
			.ok_or(Error::Argument("pipe id out of range"))
	}

	/// The abstract type expression the servlet declared for a pipe.
	pub fn pipe_type_expr(&self, nid: NodeId, pid: PipeId) -> Result<Option<String>> {
		let node = self.node(nid)?;
		let pdt = node.entry.pdt();
		Ok(pdt
			.slot(pid)
			.ok_or(Error::Argument("pipe id out of range"))?
			.type_expr
			.clone())
	}

	/// The critical-node information computed at finalization.
	pub fn cnode_info(&self) -> &CnodeInfo {
		&self.cnode
	}

	/// Creates the exec task for a node, with pipe slots sized but unbound; the scheduler
	/// binds them during traversal.
	pub fn create_task(&self, nid: NodeId) -> Result<Task> {
		let node = self.node(nid)?;
		Task::new(&node.entry, TaskFlags::exec())
	}
}

impl Drop for Service {
	fn drop(&mut self) {
		for entry in &self.claimed {
			entry.unclaim();
		}
	}
}

impl std::fmt::Debug for Service {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Service")
			.field("nodes", &self.nodes.len())
			.field("edges", &self.edges.len())
			.field("input", &self.input)
			.field("output", &self.output)
			.finish_non_exhaustive()
	}
}

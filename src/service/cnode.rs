//! Critical-node analysis.
//!
//! For every node `N`, precompute what the scheduler must do when `N` cancels its forward
//! output: the set of *boundary* pipes — inputs of still-runnable downstream nodes that will
//! now never be fed, because every node between `N` and them dies with the cancellation —
//! plus whether the service output itself is among the casualties. A node whose cancellation
//! strands nothing has no boundary record at all.
//!
//! The cancellation cone is computed with dead-ness propagating through nodes all of whose
//! inputs are dead; a node fed from outside the cone survives and becomes a boundary. An
//! edge leaving `N` itself only counts as a boundary when it exits the forward path (its
//! destination cannot reach the output endpoint) — those are the error branches `N` fires
//! instead of its cancelled forward output.

use {
	super::{NodeId, PipeDesc},
	crate::pipe::PipeId,
};

/// One boundary pipe: the destination that inherits work when the owning node cancels.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BoundaryDest {
	/// The downstream node receiving the routed error branch.
	pub node: NodeId,
	/// The input pipe of that node.
	pub pipe: PipeId,
}

/// Boundary information of one node.
#[derive(Debug, Clone)]
pub struct Boundary {
	/// The boundary pipes, in edge-definition order.
	pub dests: Vec<BoundaryDest>,
	/// Whether cancelling this node's forward output also cancels the service output.
	pub output_cancelled: bool,
}

impl Boundary {
	/// Number of boundary pipes.
	pub fn count(&self) -> usize {
		self.dests.len()
	}
}

/// Per-node boundary records, computed once at graph finalization.
#[derive(Debug)]
pub struct CnodeInfo {
	boundary: Vec<Option<Boundary>>,
}

impl CnodeInfo {
	/// The boundary record of `node`, or `None` when its cancellation strands nothing.
	pub fn boundary(&self, node: NodeId) -> Option<&Boundary> {
		self.boundary.get(node.index())?.as_ref()
	}

	pub(super) fn analyze(
		num_nodes: usize,
		edges: &[PipeDesc],
		topo: &[NodeId],
		output_node: NodeId,
	) -> Self {
		// which nodes can still reach the output endpoint (reverse reachability)
		let mut reaches_output = vec![false; num_nodes];
		if let Some(slot) = reaches_output.get_mut(output_node.index()) {
			*slot = true;
		}
		for &node in topo.iter().rev() {
			if edges
				.iter()
				.any(|e| e.src_node == node && reaches_output.get(e.dst_node.index()).copied().unwrap_or(false))
			{
				if let Some(slot) = reaches_output.get_mut(node.index()) {
					*slot = true;
				}
			}
		}

		let has_incoming: Vec<bool> = (0..num_nodes)
			.map(|n| edges.iter().any(|e| e.dst_node.index() == n))
			.collect();

		let boundary = (0..num_nodes)
			.map(|n| {
				let mut dead = vec![false; num_nodes];
				let edge_dead = |dead: &[bool], e: &PipeDesc| {
					e.src_node.index() == n || dead.get(e.src_node.index()).copied().unwrap_or(false)
				};

				for &m in topo {
					let mi = m.index();
					if mi == n || !has_incoming.get(mi).copied().unwrap_or(false) {
						continue;
					}
					let all_dead = edges
						.iter()
						.filter(|e| e.dst_node == m)
						.all(|e| edge_dead(&dead, e));
					if all_dead {
						if let Some(slot) = dead.get_mut(mi) {
							*slot = true;
						}
					}
				}

				let dests: Vec<BoundaryDest> = edges
					.iter()
					.filter(|e| {
						edge_dead(&dead, e)
							&& !dead.get(e.dst_node.index()).copied().unwrap_or(false)
							&& (e.src_node.index() != n
								|| !reaches_output.get(e.dst_node.index()).copied().unwrap_or(false))
					})
					.map(|e| BoundaryDest { node: e.dst_node, pipe: e.dst_pipe })
					.collect();

				let any_dead = dead.iter().any(|&d| d);
				if dests.is_empty() && !any_dead {
					return None;
				}
				Some(Boundary {
					dests,
					output_cancelled: n == output_node.index()
						|| dead.get(output_node.index()).copied().unwrap_or(false),
				})
			})
			.collect();

		Self { boundary }
	}
}

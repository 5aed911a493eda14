//! One request's traversal of the service graph.
//!
//! The worker steps through the nodes in topological order. At each step the next node's
//! exec task is created, its input slots are bound to the pipes upstream steps delivered,
//! and fresh inter-node pipes are allocated for its outputs — the readable ends parked for
//! the downstream nodes, the writable ends bound into the task. Dropping the task closes
//! its writable ends, which is what downstream nodes observe as end of message.
//!
//! The request-local scope lives exactly as long as the traversal; disposing the run frees
//! it along with every undelivered pipe.

use {
	crate::{
		equeue::IoEvent,
		module::{ModuleInstance, PipeParam},
		pipe::{Pipe, PipeFlags, PipeId},
		rscope::Scope,
		service::{NodeId, Service},
		task::Task,
		Error, Result,
	},
	std::sync::Arc,
};

/// What the traversal wants the worker to do next.
pub(crate) enum NextTask {
	/// Every node has run; the response (if any) has been written.
	Finished,
	/// Run this task in place.
	Sync(Task),
	/// Post this async-init task to the async processor and park the run.
	Async(Task),
}

/// The in-flight state of one request.
pub(crate) struct RequestRun {
	service: Arc<Service>,
	itc: Arc<ModuleInstance>,
	scope: Scope,
	pos: usize,
	// per node, per pipe slot: input pipes delivered by upstream steps
	inputs: Vec<Vec<Option<Pipe>>>,
	output: Option<Pipe>,
}

impl RequestRun {
	pub(crate) fn new(service: Arc<Service>, itc: Arc<ModuleInstance>, event: IoEvent) -> Result<Self> {
		let IoEvent { input, output } = event;
		chk_arg!(input.is_some(), "request event carries no input pipe");

		let mut inputs: Vec<Vec<Option<Pipe>>> = (0..service.num_nodes())
			.map(|n| {
				#[allow(clippy::cast_possible_truncation)]
				let nid = NodeId(n as u32);
				let len = service
					.node_servlet(nid)
					.map(|e| e.pdt().len())
					.unwrap_or(0);
				(0..len).map(|_| None).collect()
			})
			.collect();

		let (in_node, in_pipe) = service.input_endpoint();
		if let Some(slot) = inputs
			.get_mut(in_node.index())
			.and_then(|v| v.get_mut(usize::from(in_pipe.0)))
		{
			*slot = input;
		}

		let scope = Scope::new();
		tracing::debug!(scope = scope.id(), "request traversal started");
		Ok(Self { service, itc, scope, pos: 0, inputs, output })
	}

	fn stash_input(&mut self, node: NodeId, pipe: PipeId, handle: Pipe) -> Result<()> {
		let slot = self
			.inputs
			.get_mut(node.index())
			.and_then(|v| v.get_mut(usize::from(pipe.0)))
			.ok_or(Error::State("edge destination out of range"))?;
		if slot.is_some() {
			bad_state!("input pipe delivered twice");
		}
		*slot = Some(handle);
		Ok(())
	}

	/// Builds and binds the next ready task, in topological order.
	pub(crate) fn next_task(&mut self) -> Result<NextTask> {
		let Some(&nid) = self.service.topo_order().get(self.pos) else {
			tracing::debug!(scope = self.scope.id(), "request traversal finished");
			return Ok(NextTask::Finished);
		};
		self.pos += 1;

		let service = Arc::clone(&self.service);
		let mut task = service.create_task(nid)?;

		// snapshot the slot table so no PDT lock is held across pipe allocation
		let slots: Vec<(PipeId, PipeFlags)> = {
			let entry = service.node_servlet(nid)?;
			let pdt = entry.pdt();
			pdt.iter().map(|(pid, s)| (pid, s.flags)).collect()
		};

		for &(pid, _) in slots.iter().filter(|(_, f)| f.is_input()) {
			let handle = self
				.inputs
				.get_mut(nid.index())
				.and_then(|v| v.get_mut(usize::from(pid.0)))
				.and_then(Option::take)
				.ok_or(Error::State("input pipe was not delivered by upstream"))?;
			task.bind(pid, handle)?;
		}

		let output_endpoint = service.output_endpoint();
		for &(pid, flags) in slots.iter().filter(|(_, f)| f.is_output()) {
			// the response pipe of the whole service is handed in with the event
			if (nid, pid) == output_endpoint {
				if let Some(out) = self.output.take() {
					task.bind(pid, out)?;
					continue;
				}
			}

			// shadow slots alias another output of the same node
			if let Some(target) = flags.shadow_target() {
				let forked = task.pipe_mut(target)?.fork(flags, None)?;
				task.bind(pid, forked)?;
				continue;
			}

			let edge = service
				.outgoing_pipes(nid)?
				.iter()
				.find(|e| e.src_pipe == pid)
				.copied();
			match edge {
				Some(e) => {
					let dst_flags = service.pipe_flags(e.dst_node, e.dst_pipe)?;
					let param = PipeParam {
						input_flags: dst_flags,
						output_flags: flags,
						args: None,
					};
					let (rd, wr) = self.itc.allocate(&param)?;
					let wr = wr.ok_or(Error::State("itc module produced no output endpoint"))?;
					let rd = rd.ok_or(Error::State("itc module produced no input endpoint"))?;
					task.bind(pid, wr)?;
					self.stash_input(e.dst_node, e.dst_pipe, rd)?;
				}
				None => {
					// dangling output: give the servlet somewhere to write into the void
					let param = PipeParam {
						output_flags: flags,
						..PipeParam::default()
					};
					let (_rd, wr) = self.itc.allocate(&param)?;
					let wr = wr.ok_or(Error::State("itc module produced no output endpoint"))?;
					task.bind(pid, wr)?;
				}
			}
		}

		tracing::trace!(node = nid.raw(), "node task bound");
		if task.flags().is_async {
			Ok(NextTask::Async(task))
		} else {
			Ok(NextTask::Sync(task))
		}
	}

	/// The id of the request's scope, for logging.
	pub(crate) fn scope_id(&self) -> u64 {
		self.scope.id()
	}
}

//! Critical-node analysis against the reference shapes.

use {
	crate::{
		service::{Service, ServiceBuffer},
		servlet::Stab,
		tests::util::*,
	},
	color_eyre::eyre::ensure,
};

#[test]
fn linear_chain() -> TestResult {
	testinit();
	let mut stab = Stab::new();
	let serv_a = load_branch(&mut stab, "cnode_a1")?;
	let serv_b = load_merge(&mut stab, "cnode_b1")?;
	let serv_tail = load_relay(&mut stab, "cnode_t1")?;
	let (a_in, a_out, a_err) = branch_pipes(&stab, serv_a)?;
	let (b_in1, b_in2, _) = merge_pipes(&stab, serv_b)?;
	let (r_in, r_out) = relay_pipes(&stab, serv_tail)?;

	let mut buf = ServiceBuffer::new();
	buf.allow_reuse_servlet();
	let mut nodes = Vec::new();
	for _ in 0..9 {
		nodes.push(buf.add_node(&stab, serv_a)?);
	}
	nodes.push(buf.add_node(&stab, serv_tail)?);
	nodes.push(buf.add_node(&stab, serv_b)?);

	for i in 0..8 {
		wire(&mut buf, &nodes, i, a_out, i + 1, a_in)?;
	}
	wire(&mut buf, &nodes, 8, a_out, 9, r_in)?;
	wire(&mut buf, &nodes, 8, a_err, 10, b_in1)?;
	wire(&mut buf, &nodes, 0, a_err, 10, b_in2)?;

	buf.set_input(nodes[0], a_in)?;
	buf.set_output(nodes[9], r_out)?;

	let service = Service::from_buffer(&buf)?;
	let info = service.cnode_info();

	for i in 0..9 {
		ensure!(info.boundary(nodes[i]).is_some(), "node {i} has no boundary record");
	}
	ensure!(info.boundary(nodes[9]).is_none(), "the output node grew a boundary record");

	let head = info.boundary(nodes[0]).unwrap();
	ensure_eq!(head.count(), 0);
	ensure!(head.output_cancelled, "cancelling the entry keeps the output alive?");

	for i in 1..9 {
		let b = info.boundary(nodes[i]).unwrap();
		ensure_eq!(b.count(), 1, "node {i}");
		ensure!(b.output_cancelled, "node {i} does not cancel the output");
		ensure_eq!(b.dests[0].node, nodes[10], "node {i}");
		ensure_eq!(b.dests[0].pipe, b_in1, "node {i}");
	}
	Ok(())
}

// the compressed variant: the error branch hangs off the last node before the exit
#[test]
fn linear_chain_short() -> TestResult {
	testinit();
	let mut stab = Stab::new();
	let serv_a = load_branch(&mut stab, "cnode_a2")?;
	let serv_b = load_merge(&mut stab, "cnode_b2")?;
	let serv_tail = load_relay(&mut stab, "cnode_t2")?;
	let (a_in, a_out, a_err) = branch_pipes(&stab, serv_a)?;
	let (b_in1, b_in2, _) = merge_pipes(&stab, serv_b)?;
	let (r_in, r_out) = relay_pipes(&stab, serv_tail)?;

	let mut buf = ServiceBuffer::new();
	buf.allow_reuse_servlet();
	let mut nodes = Vec::new();
	for _ in 0..5 {
		nodes.push(buf.add_node(&stab, serv_a)?);
	}
	nodes.push(buf.add_node(&stab, serv_tail)?);
	nodes.push(buf.add_node(&stab, serv_b)?);

	for i in 0..4 {
		wire(&mut buf, &nodes, i, a_out, i + 1, a_in)?;
	}
	wire(&mut buf, &nodes, 4, a_out, 5, r_in)?;
	wire(&mut buf, &nodes, 4, a_err, 6, b_in1)?;
	wire(&mut buf, &nodes, 0, a_err, 6, b_in2)?;

	buf.set_input(nodes[0], a_in)?;
	buf.set_output(nodes[5], r_out)?;

	let service = Service::from_buffer(&buf)?;
	let info = service.cnode_info();

	let head = info.boundary(nodes[0]).unwrap();
	ensure_eq!(head.count(), 0);
	ensure!(head.output_cancelled, "entry cancellation must cancel the output");

	// node 4 fires its own error branch; 1..=3 inherit it through the dead tail
	for i in 1..5 {
		let b = info.boundary(nodes[i]).unwrap();
		ensure_eq!(b.count(), 1, "node {i}");
		ensure!(b.output_cancelled, "node {i}");
		ensure_eq!(b.dests[0].node, nodes[6], "node {i}");
		ensure_eq!(b.dests[0].pipe, b_in1, "node {i}");
	}
	ensure!(info.boundary(nodes[5]).is_none(), "the exit node grew a boundary record");
	Ok(())
}

#[test]
fn binary_tree() -> TestResult {
	testinit();
	let mut stab = Stab::new();
	let serv_a = load_branch(&mut stab, "cnode_a3")?;
	let serv_b = load_merge(&mut stab, "cnode_b3")?;
	let (a_in, a_out, a_err) = branch_pipes(&stab, serv_a)?;
	let (b_in1, b_in2, b_out) = merge_pipes(&stab, serv_b)?;

	let mut buf = ServiceBuffer::new();
	buf.allow_reuse_servlet();
	let mut nodes = Vec::new();
	for _ in 0..7 {
		nodes.push(buf.add_node(&stab, serv_a)?);
	}
	for _ in 7..10 {
		nodes.push(buf.add_node(&stab, serv_b)?);
	}

	wire(&mut buf, &nodes, 0, a_out, 1, a_in)?;
	wire(&mut buf, &nodes, 0, a_err, 2, a_in)?;
	wire(&mut buf, &nodes, 1, a_out, 3, a_in)?;
	wire(&mut buf, &nodes, 1, a_err, 4, a_in)?;
	wire(&mut buf, &nodes, 2, a_out, 5, a_in)?;
	wire(&mut buf, &nodes, 2, a_err, 6, a_in)?;

	wire(&mut buf, &nodes, 3, a_out, 7, b_in1)?;
	wire(&mut buf, &nodes, 4, a_out, 7, b_in2)?;
	wire(&mut buf, &nodes, 5, a_out, 8, b_in1)?;
	wire(&mut buf, &nodes, 6, a_out, 8, b_in2)?;
	wire(&mut buf, &nodes, 7, b_out, 9, b_in1)?;
	wire(&mut buf, &nodes, 8, b_out, 9, b_in2)?;

	buf.set_input(nodes[0], a_in)?;
	buf.set_output(nodes[9], b_out)?;

	let service = Service::from_buffer(&buf)?;
	let info = service.cnode_info();

	for i in 0..3 {
		ensure!(info.boundary(nodes[i]).is_some(), "node {i} lost its boundary record");
	}
	for i in 3..10 {
		ensure!(info.boundary(nodes[i]).is_none(), "node {i} grew a boundary record");
	}

	let root = info.boundary(nodes[0]).unwrap();
	ensure_eq!(root.count(), 0);
	ensure!(root.output_cancelled, "root cancellation must cancel the output");

	let left = info.boundary(nodes[1]).unwrap();
	ensure_eq!(left.count(), 1);
	ensure!(!left.output_cancelled, "left subtree takes the output down with it?");
	ensure_eq!(left.dests[0].node, nodes[9]);
	ensure_eq!(left.dests[0].pipe, b_in1);

	let right = info.boundary(nodes[2]).unwrap();
	ensure_eq!(right.count(), 1);
	ensure!(!right.output_cancelled, "right subtree takes the output down with it?");
	ensure_eq!(right.dests[0].node, nodes[9]);
	ensure_eq!(right.dests[0].pipe, b_in2);
	Ok(())
}

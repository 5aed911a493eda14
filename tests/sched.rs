//! The scheduler end to end: real services driven through the event queue.

use {
	crate::{
		equeue::{Equeue, Event, EventMask, IoEvent},
		pipe::Pipe,
		prop::{PropRegistry, PropValue},
		sched::{SchedConfig, Scheduler},
		service::{PipeDesc, Service, ServiceBuffer},
		servlet::Stab,
		tests::util::*,
		ShutdownToken,
	},
	color_eyre::eyre::{ensure, eyre},
	std::{sync::Arc, time::Duration},
};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
	registry: Arc<crate::module::Registry>,
	equeue: Arc<Equeue>,
	scheduler: Scheduler,
}

impl Harness {
	fn start(service: Service, config: &SchedConfig) -> TestResult<Self> {
		let (_props, registry) = mem_registry()?;
		let equeue = Arc::new(Equeue::new(64, ShutdownToken::new()));
		let scheduler = Scheduler::start(Arc::new(service), &registry, Arc::clone(&equeue), config)?;
		Ok(Self { registry, equeue, scheduler })
	}

	/// Sends one request and returns the pipe the response will appear on.
	fn submit(&self, body: &[u8]) -> TestResult<Pipe> {
		let (req_rd, mut req_wr) = mem_pair(&self.registry)?;
		req_wr.write(body)?;
		drop(req_wr); // end of message

		let (resp_rd, resp_wr) = mem_pair(&self.registry)?;
		let token = self.equeue.producer_token(EventMask::IO)?;
		self.equeue.put(
			&token,
			Event::Io(IoEvent { input: Some(req_rd), output: Some(resp_wr) }),
		)?;
		Ok(resp_rd)
	}

	fn stop(self) -> TestResult {
		self.scheduler.kill();
		self.scheduler.join()?;
		Ok(())
	}
}

fn relay_chain_service(stab: &mut Stab, len: usize) -> TestResult<Service> {
	let serv_a = load_relay(stab, "sched_relay")?;
	let (a_in, a_out) = relay_pipes(stab, serv_a)?;

	let mut buf = ServiceBuffer::new();
	buf.allow_reuse_servlet();
	let nodes: Vec<_> = (0..len)
		.map(|_| buf.add_node(stab, serv_a))
		.collect::<Result<_, _>>()?;
	for i in 1..len {
		wire(&mut buf, &nodes, i - 1, a_out, i, a_in)?;
	}
	buf.set_input(nodes[0], a_in)?;
	buf.set_output(nodes[len - 1], a_out)?;
	Ok(Service::from_buffer(&buf)?)
}

#[test]
fn linear_pipeline_relays_the_request() -> TestResult {
	testinit();
	let mut stab = Stab::new();
	let service = relay_chain_service(&mut stab, 4)?;

	let config = SchedConfig::new();
	config.set_worker_nthreads(2)?;
	config.set_async_nthreads(1)?;
	let harness = Harness::start(service, &config)?;

	let mut resp = harness.submit(b"hello through the graph")?;
	let body = read_to_eof(&mut resp, RESPONSE_TIMEOUT)?;
	ensure_eq!(body, b"hello through the graph".to_vec());

	harness.stop()
}

#[test]
fn many_requests_share_the_loop() -> TestResult {
	testinit();
	let mut stab = Stab::new();
	let service = relay_chain_service(&mut stab, 3)?;

	let config = SchedConfig::new();
	config.set_worker_nthreads(4)?;
	config.set_worker_queue_size(8)?;
	config.set_async_nthreads(1)?;
	let harness = Harness::start(service, &config)?;

	let mut responses = Vec::new();
	for i in 0..32u32 {
		let body = format!("request-{i}");
		responses.push((body.clone(), harness.submit(body.as_bytes())?));
	}
	for (expect, mut resp) in responses {
		let body = read_to_eof(&mut resp, RESPONSE_TIMEOUT)?;
		ensure_eq!(String::from_utf8_lossy(&body), expect);
	}

	harness.stop()
}

#[test]
fn fan_out_merges_both_branches() -> TestResult {
	testinit();
	let mut stab = Stab::new();
	let serv_a = load_branch(&mut stab, "sched_fan_a")?;
	let serv_b = load_merge(&mut stab, "sched_fan_b")?;
	let (a_in, a_out, a_err) = branch_pipes(&stab, serv_a)?;
	let (b_in1, b_in2, b_out) = merge_pipes(&stab, serv_b)?;

	// the branch duplicates nothing: stdout carries the body, stderr stays silent, so the
	// merge sees the body once followed by an empty branch
	let mut buf = ServiceBuffer::new();
	buf.allow_reuse_servlet();
	let n0 = buf.add_node(&stab, serv_a)?;
	let n1 = buf.add_node(&stab, serv_b)?;
	buf.add_pipe(PipeDesc { src_node: n0, src_pipe: a_out, dst_node: n1, dst_pipe: b_in1 })?;
	buf.add_pipe(PipeDesc { src_node: n0, src_pipe: a_err, dst_node: n1, dst_pipe: b_in2 })?;
	buf.set_input(n0, a_in)?;
	buf.set_output(n1, b_out)?;
	let service = Service::from_buffer(&buf)?;

	let config = SchedConfig::new();
	config.set_worker_nthreads(1)?;
	config.set_async_nthreads(1)?;
	let harness = Harness::start(service, &config)?;

	let mut resp = harness.submit(b"merged")?;
	let body = read_to_eof(&mut resp, RESPONSE_TIMEOUT)?;
	ensure_eq!(body, b"merged".to_vec());

	harness.stop()
}

#[test]
fn async_servlet_doubles_exactly_once() -> TestResult {
	testinit();
	let mut stab = Stab::new();
	let doubler = stab.load(&["sched_doubler"], Box::new(DoublerServlet))?;
	let d_in = stab.get_pipe(doubler, "stdin")?;
	let d_out = stab.get_pipe(doubler, "stdout")?;

	let mut buf = ServiceBuffer::new();
	let node = buf.add_node(&stab, doubler)?;
	buf.set_input(node, d_in)?;
	buf.set_output(node, d_out)?;
	let service = Service::from_buffer(&buf)?;

	let entry = Arc::clone(stab.get(doubler).ok_or_else(|| eyre!("servlet lost"))?);

	let config = SchedConfig::new();
	config.set_worker_nthreads(1)?;
	config.set_async_nthreads(2)?;
	let harness = Harness::start(service, &config)?;

	let mut resp = harness.submit(b"21")?;
	let body = read_to_eof(&mut resp, RESPONSE_TIMEOUT)?;
	ensure_eq!(String::from_utf8_lossy(&body), "42");

	// the async buffer went back to its pool once the three phases finished
	let deadline = std::time::Instant::now() + Duration::from_secs(5);
	let pool = entry.async_pool().ok_or_else(|| eyre!("async servlet without a buffer pool"))?;
	while pool.outstanding() != 0 {
		ensure!(std::time::Instant::now() < deadline, "async buffer never returned to its pool");
		std::thread::sleep(Duration::from_millis(5));
	}

	harness.stop()
}

#[test]
fn event_loop_drives_accepted_requests() -> TestResult {
	testinit();
	let mut stab = Stab::new();
	let service = relay_chain_service(&mut stab, 3)?;

	let shutdown = ShutdownToken::new();
	let sim = SimState::new(shutdown.clone());

	let props = Arc::new(PropRegistry::new());
	let mut registry = crate::module::Registry::new(Arc::clone(&props));
	registry.insmod(Box::new(crate::module::mem::MemPipeModule::new()), &[])?;
	registry.insmod(SimSourceModule::new(&sim), &[])?;
	let registry = Arc::new(registry);

	let equeue = Arc::new(Equeue::new(64, shutdown));
	let config = SchedConfig::new();
	config.set_worker_nthreads(2)?;
	config.set_async_nthreads(1)?;
	let scheduler = Scheduler::start(Arc::new(service), &registry, Arc::clone(&equeue), &config)?;

	// requests enter through the module's accept, not through a hand-built event
	let first = sim.push_request(b"via the event loop");
	let second = sim.push_request(b"and another one");
	ensure_eq!(sink_body(&first, RESPONSE_TIMEOUT)?, b"via the event loop".to_vec());
	ensure_eq!(sink_body(&second, RESPONSE_TIMEOUT)?, b"and another one".to_vec());

	scheduler.kill();
	scheduler.join()?;
	Ok(())
}

#[test]
fn knobs_round_and_freeze() -> TestResult {
	testinit();
	let props = Arc::new(PropRegistry::new());
	let config = Arc::new(SchedConfig::new());
	config.register_props(&props)?;

	ensure!(props.set("scheduler.worker.nthreads", PropValue::Integer(3))?, "nthreads unclaimed");
	ensure!(props.set("scheduler.worker.queue_size", PropValue::Integer(1000))?, "queue_size unclaimed");
	ensure!(props.set("scheduler.async.nthreads", PropValue::Integer(2))?, "async nthreads unclaimed");
	ensure!(props.set("scheduler.async.queue_size", PropValue::Integer(100))?, "async queue unclaimed");
	ensure!(
		props.set("scheduler.worker.default_itc_pipe", PropValue::String("pipe.mem".into()))?,
		"default_itc_pipe unclaimed"
	);
	ensure!(!props.set("scheduler.worker.nope", PropValue::Integer(1))?, "unknown knob claimed");

	// queue sizes surface rounded up to the next power of two
	ensure_eq!(config.worker_nthreads(), 3);
	ensure_eq!(config.worker_queue_size(), 1024);
	ensure_eq!(config.async_queue_size(), 128);
	ensure_eq!(props.get("scheduler.worker.queue_size"), PropValue::Integer(1024));

	// wrong types are refused
	ensure!(props.set("scheduler.worker.nthreads", PropValue::String("x".into())).is_err(), "type mismatch accepted");

	// once a loop starts, the knobs freeze
	let mut stab = Stab::new();
	let service = relay_chain_service(&mut stab, 2)?;
	let (_p, registry) = mem_registry()?;
	let equeue = Arc::new(Equeue::new(16, ShutdownToken::new()));
	let scheduler = Scheduler::start(Arc::new(service), &registry, equeue, &config)?;
	ensure!(config.set_worker_nthreads(8).is_err(), "knob changed after start");
	ensure!(props.set("scheduler.worker.nthreads", PropValue::Integer(8)).is_err(), "knob changed after start");

	scheduler.kill();
	scheduler.join()?;
	Ok(())
}

#[test]
fn starting_the_same_config_twice_fails() -> TestResult {
	testinit();
	let mut stab = Stab::new();
	let service = Arc::new(relay_chain_service(&mut stab, 2)?);
	let (_p, registry) = mem_registry()?;
	let config = SchedConfig::new();
	config.set_worker_nthreads(1)?;
	config.set_async_nthreads(1)?;

	let equeue = Arc::new(Equeue::new(16, ShutdownToken::new()));
	let scheduler = Scheduler::start(Arc::clone(&service), &registry, Arc::clone(&equeue), &config)?;

	let other = Arc::new(Equeue::new(16, ShutdownToken::new()));
	ensure!(
		Scheduler::start(service, &registry, other, &config).is_err(),
		"one config started two loops"
	);

	scheduler.kill();
	scheduler.join()?;
	Ok(())
}

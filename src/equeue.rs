//! The event queue: how I/O modules hand work to the scheduler.
//!
//! A bounded multi-producer queue with *typed masks*: producers hold a token for one event
//! type, the single consumer — the dispatcher — takes events matching a mask of type bits.
//! Ordering is FIFO per producer type; nothing stronger is promised across types. Every
//! blocking boundary honors the runtime kill flag through one-second timed waits, and an
//! event dropped without being consumed deallocates whatever pipes it carried.

use {
	crate::{pipe::Pipe, sched::AsyncHandle, Error, Result, ShutdownToken},
	std::{
		collections::VecDeque,
		sync::{
			atomic::{AtomicBool, Ordering::*},
			Arc, Condvar, Mutex,
		},
	},
};

bitflags::bitflags! {
	/// Mask of event-type bits a consumer is willing to take.
	#[derive(Copy, Clone, Debug, PartialEq, Eq)]
	pub struct EventMask: u32 {
		/// I/O events: a new request delivered by an event-loop module.
		const IO = 1 << 0;
		/// Async completions: an async handle whose exec phase finished.
		const ASYNC = 1 << 1;
	}
}

const NTYPES: usize = 2;

fn type_index(mask: EventMask) -> usize {
	if mask.contains(EventMask::IO) {
		0
	} else {
		1
	}
}

/// An I/O event: the endpoint pair of one incoming request.
#[derive(Debug)]
pub struct IoEvent {
	/// The readable end carrying the request.
	pub input: Option<Pipe>,
	/// The writable end the response goes to.
	pub output: Option<Pipe>,
}

/// An async completion event.
pub struct AsyncEvent {
	/// The handle whose `async_exec` phase has finished.
	pub handle: Arc<AsyncHandle>,
}

/// One queued event. The tag leaves room for future event types without changing the queue
/// protocol.
pub enum Event {
	/// A new request.
	Io(IoEvent),
	/// An async completion.
	Async(AsyncEvent),
}

impl Event {
	/// The type bit of this event.
	pub fn mask(&self) -> EventMask {
		match self {
			Self::Io(_) => EventMask::IO,
			Self::Async(_) => EventMask::ASYNC,
		}
	}
}

impl std::fmt::Debug for Event {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Io(ev) => f.debug_tuple("Io").field(ev).finish(),
			Self::Async(_) => f.debug_tuple("Async").finish(),
		}
	}
}

/// A producer's capability to put events of one type.
#[derive(Debug, Clone)]
pub struct ProducerToken {
	mask: EventMask,
}

/// The scheduler's capability to take events. Only one exists per queue.
#[derive(Debug)]
pub struct ConsumerToken {
	_priv: (),
}

struct TypeQueue {
	buf: Mutex<VecDeque<Event>>,
	// producers block here while the ring is full
	space: Condvar,
}

/// The bounded MPMC event queue.
pub struct Equeue {
	cap: usize,
	queues: [TypeQueue; NTYPES],
	// signed on purpose: take may observe a push before its pending increment lands
	pending: Mutex<[i64; NTYPES]>,
	ready: Condvar,
	consumer_taken: AtomicBool,
	shutdown: ShutdownToken,
}

impl Equeue {
	/// Creates a queue with the given per-type capacity, rounded up to a power of two.
	pub fn new(capacity: u32, shutdown: ShutdownToken) -> Self {
		let cap = crate::next_pow2(capacity) as usize;
		Self {
			cap,
			queues: [
				TypeQueue { buf: Mutex::new(VecDeque::new()), space: Condvar::new() },
				TypeQueue { buf: Mutex::new(VecDeque::new()), space: Condvar::new() },
			],
			pending: Mutex::new([0; NTYPES]),
			ready: Condvar::new(),
			consumer_taken: AtomicBool::new(false),
			shutdown: ShutdownToken::clone(&shutdown),
		}
	}

	/// The per-type capacity.
	pub fn capacity(&self) -> usize {
		self.cap
	}

	/// Creates a producer token for one event type.
	pub fn producer_token(&self, mask: EventMask) -> Result<ProducerToken> {
		chk_arg!(mask.bits().count_ones() == 1, "a producer token covers exactly one event type");
		Ok(ProducerToken { mask })
	}

	/// Claims the single consumer token. Fails once somebody holds it.
	pub fn scheduler_token(&self) -> Result<ConsumerToken> {
		if self.consumer_taken.swap(true, AcqRel) {
			bad_state!("the scheduler token has already been taken");
		}
		Ok(ConsumerToken { _priv: () })
	}

	/// Blocks until there is room, then enqueues. With the kill flag raised the call
	/// returns immediately; the event is dropped, deallocating its pipes.
	pub fn put(&self, token: &ProducerToken, event: Event) -> Result<()> {
		chk_arg!(event.mask() == token.mask, "event type does not match the producer token");
		let qi = type_index(token.mask);
		let queue = self.queues.get(qi).ok_or(Error::State("event type out of range"))?;

		let guard = queue.buf.lock().map_err(crate::poison_error)?;
		let (mut guard, killed) =
			self.shutdown.wait_or_stop(guard, &queue.space, |buf| buf.len() >= self.cap);
		if killed {
			return Err(Error::State("event queue killed"));
		}
		guard.push_back(event);
		drop(guard);

		let mut pending = self.pending.lock().map_err(crate::poison_error)?;
		if let Some(p) = pending.get_mut(qi) {
			*p += 1;
		}
		self.ready.notify_one();
		Ok(())
	}

	/// Takes one event matching the mask, preferring I/O events. Non-blocking.
	pub fn take(&self, _consumer: &ConsumerToken, mask: EventMask) -> Result<Option<Event>> {
		for (qi, queue) in self.queues.iter().enumerate() {
			let bit = if qi == 0 { EventMask::IO } else { EventMask::ASYNC };
			if !mask.contains(bit) {
				continue;
			}
			let mut buf = queue.buf.lock().map_err(crate::poison_error)?;
			let was_full = buf.len() >= self.cap;
			let Some(event) = buf.pop_front() else { continue };
			if was_full {
				queue.space.notify_one();
			}
			drop(buf);

			let mut pending = self.pending.lock().map_err(crate::poison_error)?;
			if let Some(p) = pending.get_mut(qi) {
				*p -= 1;
			}
			return Ok(Some(event));
		}
		Ok(None)
	}

	/// Whether no event is queued, of any type.
	pub fn empty(&self, _consumer: &ConsumerToken) -> bool {
		self.queues.iter().all(|q| {
			q.buf.lock().map_or(true, |b| b.is_empty())
		})
	}

	/// Blocks until an event matching the mask may be available or the queue is killed.
	/// Returns `false` when woken by the kill flag.
	pub fn wait(&self, _consumer: &ConsumerToken, mask: EventMask) -> bool {
		let Ok(pending) = self.pending.lock() else { return false };
		let matching = |p: &[i64; NTYPES]| {
			let io = mask.contains(EventMask::IO) && p.first().copied().unwrap_or(0) > 0;
			let asy = mask.contains(EventMask::ASYNC) && p.get(1).copied().unwrap_or(0) > 0;
			io || asy
		};
		let (_pending, killed) = self.shutdown.wait_or_stop(pending, &self.ready, |p| !matching(p));
		!killed
	}

	/// The kill flag this queue polls at its blocking boundaries.
	pub fn shutdown_token(&self) -> &ShutdownToken {
		&self.shutdown
	}

	/// Wakes every waiter so they can observe the kill flag promptly.
	pub fn wake_all(&self) {
		for q in &self.queues {
			q.space.notify_all();
		}
		self.ready.notify_all();
	}
}

impl std::fmt::Debug for Equeue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Equeue").field("capacity", &self.cap).finish_non_exhaustive()
	}
}

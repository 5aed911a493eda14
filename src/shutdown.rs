//! Cooperative shutdown.
//!
//! A single kill flag shared by every blocking loop in the runtime. Waiters never block
//! indefinitely: they sleep on their own condvar in one-second slices and re-check the flag
//! between slices, so a kill is observed within a second even when nobody bothers to notify
//! the condvar. Hot paths that do hold the right mutex still get woken promptly because the
//! killer is expected to notify the condvars it knows about.

use std::{
	sync::{
		atomic::{AtomicBool, Ordering::*},
		Arc, Condvar, MutexGuard,
	},
	time::Duration,
};

const POLL_SLICE: Duration = Duration::from_secs(1);

/// A cloneable handle on the runtime-wide kill flag.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
	/// Creates a token with the flag cleared.
	pub fn new() -> Self {
		Self::default()
	}

	/// Whether the runtime has been killed.
	#[inline]
	pub fn killed(&self) -> bool {
		self.0.load(Acquire)
	}

	/// Raises the kill flag. Waiters observe it within one poll slice; loops that own a
	/// condvar should additionally notify it for a prompt wakeup.
	pub fn kill(&self) {
		self.0.store(true, Release);
		tracing::info!("shutdown requested");
	}

	/// Blocks on `cv` until `cond` turns false or the kill flag is raised, whichever comes
	/// first. Returns the reacquired guard and whether the wait ended because of a kill.
	///
	/// `cond` is the *blocking* condition: the wait continues while it holds.
	pub fn wait_or_stop<'a, T>(
		&self,
		mut guard: MutexGuard<'a, T>,
		cv: &Condvar,
		mut cond: impl FnMut(&T) -> bool,
	) -> (MutexGuard<'a, T>, bool) {
		while cond(&guard) {
			if self.killed() {
				return (guard, true);
			}
			let (g, _timeout) = cv
				.wait_timeout(guard, POLL_SLICE)
				.unwrap_or_else(|_| panic!("{}", crate::LOCK_POISON));
			guard = g;
		}
		(guard, self.killed())
	}
}

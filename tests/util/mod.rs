//! Test utilities: the result type, one-time init, deterministic randomness and the helper
//! servlets most graph tests are built from.
#![allow(dead_code, unused_macros)]

#[macro_use]
mod eyre;
mod helpers;
#[macro_use]
mod xorshift;

#[allow(unused_imports)]
pub use {eyre::*, helpers::*, xorshift::*};

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs color-eyre and a tracing subscriber once per process. Every test calls this
/// first.
pub fn testinit() {
	INIT.call_once(|| {
		eyre::install();
		let _ = tracing_subscriber::fmt()
			.with_env_filter(
				tracing_subscriber::EnvFilter::try_from_default_env()
					.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
			)
			.with_test_writer()
			.try_init();
	});
}

fn intvar(nam: &str) -> Option<u32> {
	let val = std::env::var(nam).ok()?;
	val.trim().parse().ok()
}

/// Producer thread count for the event queue stress test, overridable from the environment.
pub fn num_producers() -> u32 {
	intvar("PLUMBER_TEST_NUM_PRODUCERS").filter(|n| *n > 0).unwrap_or(64)
}

/// Events each producer pushes in the stress test.
pub fn events_per_producer() -> u32 {
	intvar("PLUMBER_TEST_EVENTS_PER_PRODUCER").filter(|n| *n > 0).unwrap_or(1000)
}

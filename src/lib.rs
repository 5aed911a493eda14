#![doc = include_str!("../README.md")]
// If this was in Cargo.toml, it would cover examples as well
#![warn(
	missing_docs,
	clippy::panic_in_result_fn,
	clippy::missing_assert_message,
	clippy::indexing_slicing,
	clippy::arithmetic_side_effects
)]

#[macro_use]
mod macros;

pub mod eloop;
pub mod equeue;
pub mod error;
pub mod module;
pub mod pipe;
pub mod prop;
pub mod rscope;
pub mod sched;
pub mod service;
pub mod servlet;
pub mod task;

mod shutdown;
pub use shutdown::ShutdownToken;

mod thread;
pub use thread::{spawn_kind, ThreadKind};

pub use error::{Error, Result};

mod misc;
pub(crate) use misc::*;

#[cfg(test)]
#[path = "../tests/index.rs"]
#[allow(
	clippy::unwrap_used,
	clippy::arithmetic_side_effects,
	clippy::indexing_slicing,
	missing_docs
)]
mod tests;

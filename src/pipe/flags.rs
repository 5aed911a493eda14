//! The pipe flag word.
//!
//! At the module ABI boundary flags travel packed in a single `u32`, with the shadow target
//! pipe id embedded in the upper half. Inside the crate the word is unpacked into
//! [`PipeSpec`], which is what validation and the scheduler actually look at.

use crate::{Error, Result};

/// A servlet-local pipe id: an index into the servlet's pipe descriptor table, assigned in
/// definition order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(pub u16);

impl std::fmt::Display for PipeId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

bitflags::bitflags! {
	/// The packed pipe flag word as it crosses the module ABI.
	///
	/// Exactly one of `INPUT` and `OUTPUT` must be set. Bits 16–31 carry the shadow target
	/// pipe id and are only meaningful while `SHADOW` is set; use [`PipeFlags::shadow_target`]
	/// and [`PipeFlags::with_shadow_target`] rather than touching them directly.
	#[derive(Copy, Clone, Debug, PartialEq, Eq)]
	pub struct PipeFlags: u32 {
		/// The handle is readable by its owner.
		const INPUT    = 1 << 0;
		/// The handle is writable by its owner.
		const OUTPUT   = 1 << 1;
		/// The result is produced by background work.
		const ASYNC    = 1 << 2;
		/// State pushed into the pipe survives one execution.
		const PERSIST  = 1 << 3;
		/// The handle aliases another output of the same node.
		const SHADOW   = 1 << 4;
		/// Default-off branch of a demultiplexer.
		const DISABLED = 1 << 5;

		const _ = !0; // the target id lives in the payload bits
	}
}

const TARGET_SHIFT: u32 = 16;

impl PipeFlags {
	/// Returns the flags with `SHADOW` set and the target pipe id embedded.
	#[must_use]
	pub fn with_shadow_target(self, target: PipeId) -> Self {
		let bits = (self.bits() & 0xffff) | Self::SHADOW.bits() | (u32::from(target.0) << TARGET_SHIFT);
		Self::from_bits_retain(bits)
	}

	/// The shadow target pipe id, when `SHADOW` is set.
	pub fn shadow_target(self) -> Option<PipeId> {
		self.contains(Self::SHADOW)
			.then(|| PipeId((self.bits() >> TARGET_SHIFT) as u16))
	}

	/// Whether the direction bits are well formed: exactly one of `INPUT`/`OUTPUT`.
	pub fn direction_valid(self) -> bool {
		self.contains(Self::INPUT) != self.contains(Self::OUTPUT)
	}

	/// Whether this is a readable endpoint.
	#[inline]
	pub fn is_input(self) -> bool {
		self.contains(Self::INPUT)
	}

	/// Whether this is a writable endpoint.
	#[inline]
	pub fn is_output(self) -> bool {
		self.contains(Self::OUTPUT)
	}
}

/// The direction of a pipe endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
	/// Readable by the owning task.
	Input,
	/// Writable by the owning task.
	Output,
}

/// The unpacked view of a flag word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PipeSpec {
	/// Which way bytes flow, from the owner's point of view.
	pub direction: Direction,
	/// The result is produced by background work.
	pub is_async: bool,
	/// State pushed into the pipe survives one execution.
	pub persistent: bool,
	/// The output slot this one aliases, for demux branch selection.
	pub shadow: Option<PipeId>,
	/// Default-off branch of a demux.
	pub disabled: bool,
}

impl PipeSpec {
	/// Unpacks a flag word, failing on malformed direction bits.
	pub fn from_flags(flags: PipeFlags) -> Result<Self> {
		if !flags.direction_valid() {
			return Err(Error::Argument("pipe flags must set exactly one direction bit"));
		}
		Ok(Self {
			direction: if flags.is_input() { Direction::Input } else { Direction::Output },
			is_async: flags.contains(PipeFlags::ASYNC),
			persistent: flags.contains(PipeFlags::PERSIST),
			shadow: flags.shadow_target(),
			disabled: flags.contains(PipeFlags::DISABLED),
		})
	}

	/// Packs the spec back into the ABI flag word.
	pub fn to_flags(self) -> PipeFlags {
		let mut flags = match self.direction {
			Direction::Input => PipeFlags::INPUT,
			Direction::Output => PipeFlags::OUTPUT,
		};
		if self.is_async {
			flags |= PipeFlags::ASYNC;
		}
		if self.persistent {
			flags |= PipeFlags::PERSIST;
		}
		if self.disabled {
			flags |= PipeFlags::DISABLED;
		}
		match self.shadow {
			Some(target) => flags.with_shadow_target(target),
			None => flags,
		}
	}
}

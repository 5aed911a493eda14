//! The pipe descriptor table: a servlet's named pipe slots.
//!
//! A servlet declares its pipes during `init` by calling [`Pdt::define`]; ids are assigned in
//! definition order and the table is fixed once the init task returns. Shadow slots must
//! name a previously defined output slot of the same servlet.

use {
	crate::{
		pipe::{PipeFlags, PipeId},
		Error, Result,
	},
	std::fmt,
};

/// One named pipe slot of a servlet.
#[derive(Debug, Clone)]
pub struct PdtSlot {
	/// The slot name, unique within the servlet.
	pub name: String,
	/// The packed flag word declared for the slot.
	pub flags: PipeFlags,
	/// The declared type expression; `None` for an untyped pipe.
	pub type_expr: Option<String>,
}

/// A servlet's pipe descriptor table.
#[derive(Default, Clone)]
pub struct Pdt {
	slots: Vec<PdtSlot>,
}

impl Pdt {
	/// Creates an empty table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Defines a pipe slot, returning its id. Ids follow definition order.
	pub fn define(&mut self, name: &str, flags: PipeFlags, type_expr: Option<&str>) -> Result<PipeId> {
		chk_arg!(!name.is_empty(), "empty pipe name");
		chk_arg!(flags.direction_valid(), "pipe flags must set exactly one direction bit");
		if self.slots.len() >= usize::from(u16::MAX) {
			return Err(Error::Resource("pipe descriptor table full"));
		}
		if self.slots.iter().any(|s| s.name == name) {
			return Err(Error::validation(format!("pipe {name:?} defined twice")));
		}
		if let Some(target) = flags.shadow_target() {
			let slot = self
				.slots
				.get(usize::from(target.0))
				.ok_or_else(|| Error::validation(format!("shadow target {target} of pipe {name:?} is not defined yet")))?;
			if !slot.flags.is_output() {
				return Err(Error::validation(format!(
					"shadow target {target} of pipe {name:?} is not an output pipe"
				)));
			}
		}

		#[allow(clippy::cast_possible_truncation)] // bounded by the u16::MAX check
		let pid = PipeId(self.slots.len() as u16);
		self.slots.push(PdtSlot {
			name: name.to_owned(),
			flags,
			type_expr: type_expr.map(str::to_owned),
		});
		tracing::debug!(name, pid = %pid, "pipe slot defined");
		Ok(pid)
	}

	/// Looks a slot up by exact name.
	pub fn get(&self, name: &str) -> Option<PipeId> {
		#[allow(clippy::cast_possible_truncation)]
		self.slots
			.iter()
			.position(|s| s.name == name)
			.map(|i| PipeId(i as u16))
	}

	/// The slot record behind an id.
	pub fn slot(&self, pid: PipeId) -> Option<&PdtSlot> {
		self.slots.get(usize::from(pid.0))
	}

	/// Number of defined slots.
	pub fn len(&self) -> usize {
		self.slots.len()
	}

	/// Whether no slot has been defined.
	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	/// Iterates over `(id, slot)` pairs in definition order.
	pub fn iter(&self) -> impl Iterator<Item = (PipeId, &PdtSlot)> {
		#[allow(clippy::cast_possible_truncation)]
		self.slots.iter().enumerate().map(|(i, s)| (PipeId(i as u16), s))
	}
}

impl fmt::Debug for Pdt {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_map()
			.entries(self.slots.iter().enumerate().map(|(i, s)| (i, &s.name)))
			.finish()
	}
}

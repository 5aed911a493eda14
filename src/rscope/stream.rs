//! Scope token streams: read cursors over RLS entities.

use {
	super::{Entity, ScopeToken},
	crate::Result,
};

/// A wait primitive for a stream whose source is non-blocking and currently empty: the file
/// descriptor (or descriptor-like handle) the consumer should poll before reading again.
#[derive(Copy, Clone, Debug)]
pub struct ReadyEvent {
	/// The pollable descriptor.
	pub fd: i32,
}

/// One read cursor over a scope entity. Opened by [`ScopeObject::open_stream`]; the handle
/// owning it is [`ScopeStreamHandle`].
///
/// [`ScopeObject::open_stream`]: super::ScopeObject::open_stream
pub trait ScopeStream: Send {
	/// Reads at most `buf.len()` bytes, returning how many were produced. Zero with
	/// [`eof`](Self::eof) false means the source would stall; ask for the ready event.
	fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

	/// Whether the cursor has passed the last byte.
	fn eof(&self) -> Result<bool>;

	/// The wait primitive to poll when a read would stall, if the source has one.
	fn ready_event(&self) -> Option<ReadyEvent> {
		None
	}
}

/// An open stream plus the entity reference keeping its payload alive.
pub struct ScopeStreamHandle {
	// declared before the entity so the cursor is dropped first
	cursor: Box<dyn ScopeStream>,
	entity: Entity,
	token: ScopeToken,
}

impl ScopeStreamHandle {
	pub(super) fn open(entity: Entity, token: ScopeToken) -> Result<Self> {
		let cursor = entity.object().open_stream()?;
		tracing::debug!(token = token.raw(), "scope token opened as a byte stream");
		Ok(Self { cursor, entity, token })
	}

	/// The token this stream was opened from.
	pub fn token(&self) -> ScopeToken {
		self.token
	}

	/// Reads at most `buf.len()` bytes.
	pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
		self.cursor.read(buf)
	}

	/// Whether the stream has ended.
	pub fn eof(&self) -> Result<bool> {
		self.cursor.eof()
	}

	/// The wait primitive for a stalled non-blocking source, if any.
	pub fn ready_event(&self) -> Option<ReadyEvent> {
		self.cursor.ready_event()
	}

	/// Borrows the underlying entity.
	pub fn entity(&self) -> &Entity {
		&self.entity
	}
}

impl Drop for ScopeStreamHandle {
	fn drop(&mut self) {
		// the cursor goes first, then the entity reference it relied on
		tracing::debug!(token = self.token.raw(), "scope stream closed");
	}
}

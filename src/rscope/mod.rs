//! Request-local scope (RLS): a per-request arena of reference-counted entities.
//!
//! A scope is created when a request starts and freed when it completes. Servlets park
//! payloads in it — a parsed body, an open file, a lazily produced stream — and pass 32-bit
//! *tokens* through pipes instead of the payloads themselves. Freeing the scope drops one
//! reference from every entity it issued; entities stay alive while streams opened on them
//! are still held, which is what lets an asynchronous writer outlive the request that
//! produced it.
//!
//! Tokens are only meaningful on the thread that issued them; the scope object itself may
//! travel (a parked request resumes wherever the scheduler puts it) because it keeps a handle
//! on its issuing thread's table.
//!
//! # Example
//!
//! ```
//! use plumber::rscope::{Scope, ScopeObject};
//!
//! struct Greeting(String);
//! impl ScopeObject for Greeting {}
//!
//! # fn main() -> plumber::Result<()> {
//! let mut scope = Scope::new();
//! let token = scope.add(Box::new(Greeting("hello".to_owned())))?;
//!
//! // the token is what travels through pipes; the payload stays put
//! let entity = scope.get(token)?;
//! assert_eq!(entity.downcast_ref::<Greeting>().unwrap().0, "hello");
//!
//! drop(scope); // disposes every entity the scope still owns
//! # Ok(())
//! # }
//! ```

use {
	crate::{Error, Result},
	std::{
		any::Any,
		sync::{
			atomic::{AtomicU64, Ordering::*},
			Arc,
		},
	},
};

mod stream;
mod table;

pub use {
	stream::{ReadyEvent, ScopeStream, ScopeStreamHandle},
	table::ensure_capacity,
};

use table::{ThreadTable, NIL};

/// A payload stored in a request-local scope.
///
/// The required part is just ownership (`Drop` is the free callback). Everything else —
/// deep copy, the byte-stream interface, the identity hash — is an optional capability with
/// a "not supported" default.
pub trait ScopeObject: Any + Send + Sync {
	/// Deep-copies the payload. Required by [`Scope::copy`].
	fn duplicate(&self) -> Result<Box<dyn ScopeObject>> {
		unsupported!()
	}

	/// Opens a read cursor over the payload. Required by [`stream_open`].
	fn open_stream(&self) -> Result<Box<dyn ScopeStream>> {
		unsupported!()
	}

	/// A 128-bit identity hash, when the payload supports one.
	fn hash128(&self) -> Option<[u64; 2]> {
		None
	}
}

/// A reference-counted handle on a scope entity. The last holder to drop it disposes the
/// payload.
#[derive(Clone)]
pub struct Entity(Arc<dyn ScopeObject>);

impl Entity {
	fn new(object: Box<dyn ScopeObject>) -> Self {
		Self(Arc::from(object))
	}

	/// Borrows the payload as a concrete type.
	pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
		let any: &dyn Any = &*self.0;
		any.downcast_ref::<T>()
	}

	pub(crate) fn object(&self) -> &dyn ScopeObject {
		&*self.0
	}
}

impl std::fmt::Debug for Entity {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Entity")
			.field("refs", &Arc::strong_count(&self.0))
			.finish()
	}
}

/// A token naming one entity inside the scope that issued it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScopeToken(u32);

impl ScopeToken {
	/// The raw table index. Useful for diagnostics only; tokens are opaque.
	pub fn raw(self) -> u32 {
		self.0
	}
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(0);

/// One request's arena. Dropping the scope releases every token it issued.
pub struct Scope {
	id: u64,
	head: u32,
	table: Arc<ThreadTable>,
}

impl Scope {
	/// Creates a fresh scope with the next monotonic id, bound to the calling thread's token
	/// table.
	pub fn new() -> Self {
		let id = NEXT_SCOPE_ID.fetch_add(1, Relaxed);
		tracing::debug!(scope = id, "request local scope created");
		Self { id, head: NIL, table: table::current_table() }
	}

	/// The scope id.
	pub fn id(&self) -> u64 {
		self.id
	}

	/// Stores `object` in the scope, returning its token. The entity starts with a single
	/// reference, owned by the scope.
	pub fn add(&mut self, object: Box<dyn ScopeObject>) -> Result<ScopeToken> {
		let entity = Entity::new(object);
		let mut entries = self.table.lock();
		let tok = entries.alloc(self.id, entity)?;
		if let Some(entry) = entries.slots.get_mut(tok as usize) {
			entry.next = self.head;
		}
		self.head = tok;
		tracing::debug!(scope = self.id, token = tok, "scope entity added");
		Ok(ScopeToken(tok))
	}

	/// Deep-copies the entity behind `token` and stores the copy in this scope. Requires
	/// the copy capability; when the underlying copy fails, nothing is added.
	pub fn copy(&mut self, token: ScopeToken) -> Result<(ScopeToken, Entity)> {
		let copied = self.lookup(token)?.object().duplicate()?;
		let entity = Entity::new(copied);
		let result = entity.clone();
		let mut entries = self.table.lock();
		let tok = entries.alloc(self.id, entity)?;
		if let Some(entry) = entries.slots.get_mut(tok as usize) {
			entry.next = self.head;
		}
		self.head = tok;
		tracing::debug!(scope = self.id, from = token.0, to = tok, "scope entity duplicated");
		Ok((ScopeToken(tok), result))
	}

	/// Resolves a token issued by this scope.
	pub fn get(&self, token: ScopeToken) -> Result<Entity> {
		self.lookup(token)
	}

	fn lookup(&self, token: ScopeToken) -> Result<Entity> {
		let entries = self.table.lock();
		let entry = entries
			.slots
			.get(token.0 as usize)
			.ok_or(Error::Argument("scope token out of range"))?;
		if entry.scope_id != self.id {
			return Err(Error::Argument("scope token issued by a different scope"));
		}
		entry
			.data
			.clone()
			.ok_or(Error::Argument("scope token already released"))
	}
}

impl Default for Scope {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for Scope {
	fn drop(&mut self) {
		let mut entries = self.table.lock();
		let mut tok = self.head;
		while tok != NIL {
			let next = entries.slots.get(tok as usize).map_or(NIL, |e| e.next);
			entries.release(tok);
			tok = next;
		}
		tracing::debug!(scope = self.id, "request local scope disposed");
	}
}

impl std::fmt::Debug for Scope {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Scope").field("id", &self.id).finish_non_exhaustive()
	}
}

/// Opens a byte stream over the entity behind `token`, which must have been issued on the
/// calling thread. The stream holds its own reference, so it may outlive the scope.
pub fn stream_open(token: ScopeToken) -> Result<ScopeStreamHandle> {
	let entity = {
		let table = table::current_table();
		let entries = table.lock();
		entries
			.slots
			.get(token.raw() as usize)
			.and_then(|e| e.data.clone())
			.ok_or(Error::Argument("scope token does not resolve on this thread"))?
	};
	ScopeStreamHandle::open(entity, token)
}

/// The 128-bit identity hash of the entity behind `token`, when it supports one.
pub fn get_hash(token: ScopeToken) -> Result<Option<[u64; 2]>> {
	let table = table::current_table();
	let entries = table.lock();
	let entity = entries
		.slots
		.get(token.raw() as usize)
		.and_then(|e| e.data.clone())
		.ok_or(Error::Argument("scope token does not resolve on this thread"))?;
	drop(entries);
	Ok(entity.object().hash128())
}

//! The property system: dotted-symbol key/value settings.
//!
//! Modules and the scheduler expose their tunables under dotted prefixes (`pipe.mem.…`,
//! `scheduler.worker.…`). A callback registers itself for a prefix; `get`/`set` route the
//! remainder of the symbol to the callback owning the longest matching prefix. From the
//! runtime's point of view these are plain set/get channels; the service-script VM (out of
//! scope here) is the usual driver.

use {
	crate::Result,
	std::sync::{Arc, RwLock},
};

/// A property value crossing the registry boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
	/// An integer setting.
	Integer(i64),
	/// A string setting.
	String(String),
	/// The property exists but has no value, or the symbol is not recognized.
	None,
}

/// One prefix worth of get/set handlers.
///
/// `set` returns `Ok(true)` when the symbol was recognized and applied, `Ok(false)` when the
/// symbol is unknown to this callback (which is not an error; the registry logs and moves on).
pub trait PropCallback: Send + Sync {
	/// Reads the property addressed by `symbol`, relative to the registered prefix.
	fn get(&self, symbol: &str) -> PropValue {
		let _ = symbol;
		PropValue::None
	}
	/// Writes the property addressed by `symbol`, relative to the registered prefix.
	fn set(&self, symbol: &str, value: PropValue) -> Result<bool>;
}

/// The process-wide routing table from symbol prefixes to callbacks.
#[derive(Default)]
pub struct PropRegistry {
	// sorted by prefix so the longest match wins via reverse scan
	callbacks: RwLock<Vec<(String, Arc<dyn PropCallback>)>>,
}

impl PropRegistry {
	/// Creates an empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `callback` for every symbol starting with `prefix` followed by a dot.
	///
	/// Re-registering the same prefix is refused.
	pub fn register(&self, prefix: &str, callback: Arc<dyn PropCallback>) -> Result<()> {
		chk_arg!(!prefix.is_empty(), "empty property prefix");
		let mut cbs = self.callbacks.write().map_err(crate::poison_error)?;
		match cbs.binary_search_by(|(p, _)| p.as_str().cmp(prefix)) {
			Ok(_) => bad_state!("property prefix registered twice"),
			Err(pos) => cbs.insert(pos, (prefix.to_owned(), callback)),
		}
		tracing::debug!(prefix, "property callback registered");
		Ok(())
	}

	fn route<R>(&self, symbol: &str, f: impl FnOnce(&dyn PropCallback, &str) -> R) -> Option<R> {
		let cbs = self.callbacks.read().ok()?;
		// longest registered prefix that is a dotted prefix of the symbol
		cbs.iter()
			.rev()
			.find(|(prefix, _)| {
				symbol.strip_prefix(prefix.as_str())
					.is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
			})
			.map(|(prefix, cb)| {
				let rest = symbol.get(prefix.len()..).unwrap_or("");
				f(cb.as_ref(), rest.strip_prefix('.').unwrap_or(rest))
			})
	}

	/// Reads the property addressed by the fully qualified `symbol`.
	pub fn get(&self, symbol: &str) -> PropValue {
		self.route(symbol, |cb, rest| cb.get(rest)).unwrap_or(PropValue::None)
	}

	/// Writes the property addressed by the fully qualified `symbol`.
	///
	/// Returns `Ok(false)` when no callback claims the symbol.
	pub fn set(&self, symbol: &str, value: PropValue) -> Result<bool> {
		chk_arg!(!symbol.is_empty(), "empty property symbol");
		match self.route(symbol, |cb, rest| cb.set(rest, value)) {
			Some(rc) => rc,
			None => {
				tracing::warn!(symbol, "no property callback claims this symbol");
				Ok(false)
			}
		}
	}
}

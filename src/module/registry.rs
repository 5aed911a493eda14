//! The module registry: every loaded I/O module, addressable by type id or by path.
//!
//! The path index is a lexicographically sorted array rather than a map: exact lookup is a
//! binary search, and the `open_dir` prefix query — "every instance under `pipe.`" — is a
//! contiguous range of it. Once inserted, an instance's type id and address never change.

use {
	super::{Module, ModuleInstance},
	crate::{prop::PropRegistry, Error, Result},
	std::sync::Arc,
};

/// Dense id of a loaded module instance. At most 255 modules can be loaded; the all-ones
/// value is reserved.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleType(u8);

impl ModuleType {
	const LIMIT: usize = u8::MAX as usize;

	pub(crate) fn index(self) -> usize {
		self.0 as usize
	}
}

impl std::fmt::Display for ModuleType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "0x{:02x}", self.0)
	}
}

/// The registry. Built up front by `insmod` calls and treated as immutable afterwards; the
/// scheduler and every pipe hold `Arc`s into it.
pub struct Registry {
	props: Arc<PropRegistry>,
	// dense, indexed by ModuleType
	modules: Vec<Arc<ModuleInstance>>,
	// sorted by instance path
	path_index: Vec<Arc<ModuleInstance>>,
}

impl Registry {
	/// Creates an empty registry. Module property callbacks register themselves in `props`
	/// under the instance path as `insmod` loads them.
	pub fn new(props: Arc<PropRegistry>) -> Self {
		Self { props, modules: Vec::new(), path_index: Vec::new() }
	}

	/// Instantiates a module: runs its `init`, resolves its path, checks uniqueness and
	/// inserts it into both indexes.
	pub fn insmod(&mut self, mut module: Box<dyn Module>, args: &[String]) -> Result<ModuleType> {
		if self.modules.len() >= ModuleType::LIMIT {
			return Err(Error::Resource("module type space exhausted"));
		}

		module.init(args)?;

		let mut path = module.mod_prefix().to_owned();
		let suffix = module.path_suffix();
		if !suffix.is_empty() {
			path.push('.');
			path.push_str(&suffix);
		}

		let pos = match self.path_index.binary_search_by(|m| m.path().cmp(&path)) {
			Ok(_) => {
				tracing::error!(%path, "insmod: name conflict");
				return Err(Error::validation(format!("module path {path:?} already registered")));
			}
			Err(pos) => pos,
		};

		#[allow(clippy::cast_possible_truncation)] // bounded by LIMIT above
		let mtype = ModuleType(self.modules.len() as u8);
		let inst = Arc::new(ModuleInstance::new(module, path, mtype));

		self.modules.push(Arc::clone(&inst));
		self.path_index.insert(pos, Arc::clone(&inst));

		let prop_cb: Arc<dyn crate::prop::PropCallback> = inst.clone() as Arc<dyn crate::prop::PropCallback>;
		if let Err(e) = self.props.register(inst.path(), prop_cb) {
			tracing::warn!(path = inst.path(), error = %e, "cannot register module property callback");
		}

		tracing::info!(path = inst.path(), %mtype, "module instance registered");
		Ok(mtype)
	}

	/// Looks an instance up by its exact path.
	pub fn get_from_path(&self, path: &str) -> Option<&Arc<ModuleInstance>> {
		self.path_index
			.binary_search_by(|m| m.path().cmp(path))
			.ok()
			.and_then(|i| self.path_index.get(i))
	}

	/// The type id of the instance at `path`.
	pub fn get_module_type_from_path(&self, path: &str) -> Result<ModuleType> {
		match self.get_from_path(path) {
			Some(inst) => Ok(inst.module_type()),
			None => {
				tracing::info!(path, "no such module instance");
				Err(Error::Argument("no module instance at the given path"))
			}
		}
	}

	/// Looks an instance up by its type id.
	pub fn get_from_module_type(&self, mtype: ModuleType) -> Option<&Arc<ModuleInstance>> {
		self.modules.get(mtype.index())
	}

	/// Iterates over every instance whose path begins with `prefix` — pass `"pipe."` to list
	/// a directory. An unknown prefix yields an empty iterator rather than an error.
	pub fn open_dir<'r>(&'r self, prefix: &str) -> DirIter<'r> {
		let start = self.path_index.partition_point(|m| m.path() < prefix);
		let end = start
			+ self.path_index.get(start..).map_or(0, |tail| {
				tail.iter().take_while(|m| m.path().starts_with(prefix)).count()
			});
		DirIter { slice: self.path_index.get(start..end).unwrap_or(&[]) }
	}

	/// Number of loaded instances.
	pub fn len(&self) -> usize {
		self.modules.len()
	}

	/// Whether no module has been loaded.
	pub fn is_empty(&self) -> bool {
		self.modules.is_empty()
	}

	/// Runs every module's exit hook in registration order; all of them run even when some
	/// fail, and the first failure is reported.
	pub fn on_exit(&self) -> Result<()> {
		let mut rc = Ok(());
		for inst in &self.modules {
			if let Err(e) = inst.on_exit() {
				tracing::error!(path = inst.path(), error = %e, "module exit hook failed");
				if rc.is_ok() {
					rc = Err(e);
				}
			}
		}
		rc
	}

	/// Runs every module's cleanup in registration order, reporting a composite status.
	pub fn finalize(&mut self) -> Result<()> {
		let mut rc = Ok(());
		for inst in &self.modules {
			if let Err(e) = inst.cleanup() {
				tracing::error!(path = inst.path(), error = %e, "module cleanup failed");
				if rc.is_ok() {
					rc = Err(e);
				}
			}
		}
		rc
	}
}

/// Iterator over a contiguous prefix range of the path index.
pub struct DirIter<'r> {
	slice: &'r [Arc<ModuleInstance>],
}

impl<'r> Iterator for DirIter<'r> {
	type Item = &'r Arc<ModuleInstance>;

	fn next(&mut self) -> Option<Self::Item> {
		let (first, rest) = self.slice.split_first()?;
		self.slice = rest;
		Some(first)
	}
}

impl std::iter::FusedIterator for DirIter<'_> {}

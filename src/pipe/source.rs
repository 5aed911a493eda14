//! Callback-based data sources handed to modules for zero-copy writes.

use crate::{Error, Result};

/// A pull-style byte source a servlet can hand to a pipe module instead of writing bytes
/// through the pipe itself. Dropping the source releases it.
pub trait DataSource: Send {
	/// Pulls at most `buf.len()` bytes.
	fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
	/// Whether the source is exhausted.
	fn eof(&mut self) -> Result<bool>;
}

/// Successful outcome of handing a data source to a module.
pub enum DataSourceFate {
	/// The module took ownership and will drive the source to completion.
	Accepted,
	/// The module consumed the source synchronously; the caller still owns it.
	Consumed(Box<dyn DataSource>),
}

/// Failure outcome of handing a data source to a module.
///
/// When `source` is `None` the module kept (and will dispose of) the source despite the
/// failure, and the caller must not touch it again.
pub struct DataSourceError {
	/// What went wrong.
	pub error: Error,
	/// The source, when ownership stayed with the caller.
	pub source: Option<Box<dyn DataSource>>,
}

impl DataSourceError {
	pub(crate) fn unsupported(source: Box<dyn DataSource>) -> Self {
		Self { error: Error::Unsupported, source: Some(source) }
	}
}

impl std::fmt::Debug for DataSourceError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DataSourceError")
			.field("error", &self.error)
			.field("transferred", &self.source.is_none())
			.finish()
	}
}

impl std::fmt::Display for DataSourceError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "data source write failed: {}", self.error)
	}
}

impl std::error::Error for DataSourceError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		Some(&self.error)
	}
}

impl From<DataSourceError> for Error {
	fn from(e: DataSourceError) -> Self {
		if e.source.is_none() && !matches!(e.error, Error::OwnershipTransfer) {
			Error::OwnershipTransfer
		} else {
			e.error
		}
	}
}

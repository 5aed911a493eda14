//! Error types shared by every subsystem of the runtime.
//!
//! All public entry points return [`Result`]; the variant communicates the abstract kind of
//! failure and is stable across subsystems, so callers can react to the kind without knowing
//! which layer detected it. Errors are logged at the point of detection and then propagated
//! unchanged; a request-level failure never takes the scheduler down.

use std::io;

/// Specialized result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The discriminated status returned by every fallible core operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// A public entry point received a null, out-of-range or contract-violating input.
	#[error("invalid argument: {0}")]
	Argument(&'static str),
	/// An allocation or pool acquisition failed.
	#[error("resource exhausted: {0}")]
	Resource(&'static str),
	/// A service graph, PDT entry or type expression failed a structural check.
	#[error("validation failed: {0}")]
	Validation(String),
	/// A pipe module reported a hard I/O failure, fatal to the current traversal.
	#[error(transparent)]
	Io(#[from] io::Error),
	/// An operation was attempted in the wrong lifecycle state.
	#[error("invalid state: {0}")]
	State(&'static str),
	/// An on-disk record violated the service-graph binary format.
	#[error("malformed service record: {0}")]
	Protocol(String),
	/// A data source was accepted by a module and must not be disposed again by the caller.
	#[error("ownership of the data source was transferred to the module")]
	OwnershipTransfer,
	/// The operation is not implemented by the module or entity it was dispatched to.
	#[error("operation not supported")]
	Unsupported,
}

impl Error {
	/// Whether this is a recoverable would-block condition rather than a hard failure.
	pub fn is_would_block(&self) -> bool {
		matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
	}

	pub(crate) fn validation(msg: impl Into<String>) -> Self {
		let msg = msg.into();
		tracing::error!("validation failed: {msg}");
		Self::Validation(msg)
	}

	pub(crate) fn protocol(msg: impl Into<String>) -> Self {
		let msg = msg.into();
		tracing::error!("malformed service record: {msg}");
		Self::Protocol(msg)
	}
}

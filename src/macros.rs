#![allow(unused_macros)]

/// Logs at error level and returns an [`Error::Argument`](crate::Error::Argument) when the
/// guard fails. Public entry points use this for their contract checks.
macro_rules! chk_arg {
	($cond:expr, $msg:expr) => {
		if !$cond {
			::tracing::error!(concat!("invalid argument: ", $msg));
			return Err($crate::Error::Argument($msg));
		}
	};
}

/// Logs at error level and returns an [`Error::State`](crate::Error::State). For operations
/// attempted in the wrong lifecycle state.
macro_rules! bad_state {
	($msg:expr) => {{
		::tracing::error!(concat!("invalid state: ", $msg));
		return Err($crate::Error::State($msg));
	}};
}

/// The standard body of an optional module capability that the module does not implement.
macro_rules! unsupported {
	() => {
		return Err($crate::Error::Unsupported)
	};
}

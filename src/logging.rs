//! Library-level log events.
//!
//! With the `logging` feature the level macros are tracing's own; the
//! embedding application installs the subscriber. Without it every level
//! expands to nothing, arguments included.
//!
//! Levels used across the crate:
//!
//! - `trace`: allocations in module and connection memory
//! - `debug`: call dispatch, handler and proxy registration
//! - `info`: connection and worker lifecycle
//! - `warn`: leaked proxies, unexpected or failed bridge messages
//! - `error`: destructors failing where no caller can see the error
//!
//! ```rust,ignore
//! use crate::logging::{debug, warn};
//!
//! debug!(name = %name, params = params.len(), "calling worker");
//! warn!(handle, rep, "resource proxy dropped without release");
//! ```

#[cfg(feature = "logging")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "logging"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "logging"))]
pub(crate) use discard as debug;
#[cfg(not(feature = "logging"))]
pub(crate) use discard as error;
#[cfg(not(feature = "logging"))]
pub(crate) use discard as info;
#[cfg(not(feature = "logging"))]
pub(crate) use discard as trace;
#[cfg(not(feature = "logging"))]
pub(crate) use discard as warn;

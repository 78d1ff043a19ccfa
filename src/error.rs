//! Unified error type for the wit-bridge library.
//!
//! This module provides a single [`Error`] type that encompasses all errors
//! that can occur in the library, so services, bindings and callers can share
//! one `Result` type.

use std::fmt;

use thiserror::Error;

use crate::abi::{Trap, Value};
#[cfg(feature = "bridge")]
use crate::bridge::ProtocolError;
#[cfg(feature = "config")]
use crate::config::ConfigError;
use crate::context::InitError;
#[cfg(feature = "wit")]
use crate::wit::WitTypeError;

/// A declared error raised by a service, or received as the error case of a
/// `result` with an error class.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultError {
    pub class: String,
    pub value: Option<Value>,
}

impl ResultError {
    pub fn new(class: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            class: class.into(),
            value,
        }
    }
}

impl fmt::Display for ResultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}: {:?}", self.class, value),
            None => write!(f, "{}", self.class),
        }
    }
}

impl std::error::Error for ResultError {}

/// Unified error type for all wit-bridge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed data crossing the boundary.
    #[error(transparent)]
    Abi(#[from] Trap),

    /// A value carried by the error case of a `result`.
    #[error(transparent)]
    Declared(#[from] ResultError),

    /// Failure in the cross-thread bridge.
    #[cfg(feature = "bridge")]
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Missing exports or state initialized twice.
    #[error(transparent)]
    Init(#[from] InitError),

    #[cfg(feature = "config")]
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A WIT type that has no descriptor.
    #[cfg(feature = "wit")]
    #[error(transparent)]
    WitType(#[from] WitTypeError),

    /// WIT parsing error.
    #[error("WIT parsing error: {0}")]
    WitParse(#[from] anyhow::Error),

    /// A service failed with an undeclared error.
    #[error("Service error: {0}")]
    Service(String),
}

/// A [`Result`] type alias using the unified [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn service(msg: impl Into<String>) -> Self {
        Self::Service(msg.into())
    }

    /// Raise `value` as a declared error of class `class`.
    pub fn declared(class: impl Into<String>, value: Option<Value>) -> Self {
        Self::Declared(ResultError::new(class, value))
    }

    /// Returns `true` if this is an ABI trap.
    pub fn is_abi(&self) -> bool {
        matches!(self, Self::Abi(_))
    }

    /// Returns `true` if this is a declared result error.
    pub fn is_declared(&self) -> bool {
        matches!(self, Self::Declared(_))
    }

    /// Returns `true` if this is a bridge protocol error.
    #[cfg(feature = "bridge")]
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Returns `true` if this is an initialization error.
    pub fn is_init(&self) -> bool {
        matches!(self, Self::Init(_))
    }

    /// The declared error, if this error matches `class`.
    pub fn as_declared(&self, class: &str) -> Option<&ResultError> {
        match self {
            Self::Declared(err) if err.class == class => Some(err),
            _ => None,
        }
    }
}

//! Error taxonomy for journeys, the lookup cache and result stores.
//!
//! Two layers:
//! - [`StoreError`] is what a [`ResultStore`](crate::cache::ResultStore)
//!   backend reports. It knows nothing about paths or parameters.
//! - [`JourneyError`] is what every public operation returns. The lookup
//!   cache translates store errors into it, so an I/O failure surfaces as
//!   [`JourneyError::StorageUnavailable`] and never as a quiet cache miss.

use thiserror::Error;

use crate::param::{Role, ValueKind};

/// Failure reported by a result store backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Backend I/O failed (disk, database, lock). Retrying may help.
    #[error("result store unavailable: {0}")]
    Unavailable(String),

    /// Stored bytes could not be decoded.
    #[error("corrupt result store record: {0}")]
    Corrupt(String),

    /// The record was written by an older (or newer) key/record scheme.
    #[error("record uses scheme v{found}, this build reads v{expected}")]
    VersionMismatch { found: u32, expected: u32 },
}

impl StoreError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }

    pub fn corrupt(err: impl std::fmt::Display) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Every error a journey, environment or lookup cache can surface.
#[derive(Debug, Error)]
pub enum JourneyError {
    /// An environment lacks a parameter the path declares it needs.
    #[error("path '{path}' needs parameter '{parameter}' in environment '{environment}'")]
    IncompleteParameter {
        path: String,
        environment: String,
        parameter: String,
    },

    /// A path depends on an environment the journey does not define.
    #[error("path '{path}' depends on unknown environment '{environment}'")]
    UnknownEnvironment { path: String, environment: String },

    /// An update tried to change a parameter its origin may not touch.
    #[error("cannot {attempted} {role} parameter '{parameter}' in environment '{environment}'")]
    RoleViolation {
        environment: String,
        parameter: String,
        role: Role,
        attempted: &'static str,
    },

    #[error("environment '{environment}' has no parameter '{parameter}'")]
    UnknownParameter {
        environment: String,
        parameter: String,
    },

    #[error("parameter '{0}' is defined twice")]
    DuplicateParameter(String),

    #[error("parameter '{parameter}' holds {expected} values, got {found}")]
    TypeMismatch {
        parameter: String,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("value {value} for '{parameter}' is outside [{min}, {max}]")]
    OutOfBounds {
        parameter: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("invalid parameter '{parameter}': {reason}")]
    InvalidParameter { parameter: String, reason: String },

    #[error("unknown path '{0}'")]
    UnknownPath(String),

    /// Missing subpaths or a dependency cycle.
    #[error("invalid journey: {0}")]
    InvalidJourney(String),

    /// The backend failed. Distinct from "no entry found".
    #[error(transparent)]
    StorageUnavailable(StoreError),

    /// `run`, `evaluate` or a subpath failed. Nothing was written to the store.
    #[error("path '{path}' failed during {stage}: {message}")]
    PathExecution {
        path: String,
        stage: &'static str,
        message: String,
    },

    /// A stored entry was produced under another canonicalization scheme.
    #[error("entry {key} uses key scheme v{found}, expected v{expected}")]
    KeyVersionMismatch { key: String, found: u32, expected: u32 },

    #[error("no pending proposal for key {0}")]
    UnknownProposal(String),
}

impl JourneyError {
    /// Storage failures are the only errors a caller can sensibly retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

pub type Result<T, E = JourneyError> = std::result::Result<T, E>;

//! jmaps - JourneyMAPS experiment orchestration
//!
//! Runs named experiment paths against typed parameter environments and
//! caches every result under a key derived from the parameters that
//! actually determine it. Re-running a path with unchanged Settings and
//! Variables is a lookup, not a recomputation.
//!
//! # Architecture
//!
//! ```text
//! Environment → PathSpec → LookupCache → ResultStore → Journey → Optimizer
//!      ↓            ↓           ↓             ↓            ↓          ↓
//!  typed params  identity   canonical     redb / fs /   state      TPE over
//!  + roles       + subpaths  SHA-256 key   memory        machine    history
//! ```
//!
//! # Key properties
//!
//! - Options never reach the key; Settings and Variables always do
//! - A failing store is an error or a warning, never a silent miss
//! - A failed run never writes an entry
//! - Last writer wins, earlier runs move into the entry's history

pub mod cache;
pub mod config;
pub mod environment;
pub mod error;
pub mod journey;
pub mod optimizer;
pub mod param;
pub mod path;
pub mod report;

// Re-export core types
pub use environment::{Environment, ParameterAssignment, UpdateOrigin};
pub use error::{JourneyError, Result, StoreError};
pub use param::{ParamRange, ParamValue, Parameter, ParameterSet, Role, ValueKind};
pub use path::{
    ArtifactRef, FigureOfMerit, FnPath, PathIdentity, PathOps, PathSpec, PathState, RunContext,
    RunOutcome,
};

// Re-export orchestration types
pub use journey::{
    FailurePolicy, Journey, JourneyReport, PathOptions, PathReport, Proposal, Warning,
};
pub use optimizer::{Direction, Optimizer, OptimizerSettings};

// Re-export storage types
pub use cache::{CanonicalKey, Entry, FsStore, LookupCache, MemoryStore, RedbStore, ResultStore};
pub use config::Config;

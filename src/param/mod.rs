//! Typed parameters and their three roles.
//!
//! | Role     | Optimizer may change | Part of the cache key |
//! |----------|----------------------|-----------------------|
//! | Variable | yes                  | yes                   |
//! | Setting  | no                   | yes                   |
//! | Option   | no                   | no                    |
//!
//! Options exist for knobs that cannot change a result (verbosity, output
//! directories, plotting). Toggling one must never invalidate a cached
//! result, so they are excluded from identity by construction.

mod range;
mod set;
mod value;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use range::ParamRange;
pub use set::ParameterSet;
pub use value::{ParamValue, ValueKind};
pub(crate) use value::write_bytes;

/// What a parameter is for. Fixed once the parameter is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Explored by the optimizer; identity-relevant.
    Variable,
    /// Fixed context; identity-relevant.
    Setting,
    /// Fixed; never part of identity.
    Option,
}

impl Role {
    pub fn optimizable(self) -> bool {
        matches!(self, Role::Variable)
    }

    pub fn identity_relevant(self) -> bool {
        matches!(self, Role::Variable | Role::Setting)
    }

    /// Roles a user edit through `Environment::update` may change.
    pub fn user_mutable(self) -> bool {
        matches!(self, Role::Variable | Role::Setting)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Variable => "variable",
            Role::Setting => "setting",
            Role::Option => "option",
        };
        f.pad(name)
    }
}

/// A named, typed value with a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ParamValue,
    pub role: Role,
    /// Search bounds, numeric Variables only.
    pub bounds: Option<ParamRange>,
}

impl Parameter {
    /// An optimizable parameter with declared bounds.
    pub fn variable(name: impl Into<String>, value: impl Into<ParamValue>, bounds: ParamRange) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            role: Role::Variable,
            bounds: Some(bounds),
        }
    }

    /// A Variable the optimizer cannot sample (no bounds), still part of identity.
    pub fn unbounded_variable(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            role: Role::Variable,
            bounds: None,
        }
    }

    pub fn setting(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            role: Role::Setting,
            bounds: None,
        }
    }

    pub fn option(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            role: Role::Option,
            bounds: None,
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.value.kind()
    }
}

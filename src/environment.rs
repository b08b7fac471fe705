//! Named parameter scopes shared by the paths that read them.
//!
//! An environment owns the live [`ParameterSet`]. Every accepted change bumps
//! its version; snapshots handed to paths and to the result store are plain
//! clones, so later edits never leak into a run that already started.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{JourneyError, Result};
use crate::param::{ParamValue, Parameter, ParameterSet, Role};

/// Who is asking for a parameter change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Explicit user edit: Variables and Settings.
    User,
    /// Optimizer proposal: Variables only.
    Optimizer,
}

/// A set of Variable values for one environment, as proposed by the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterAssignment {
    pub environment: String,
    pub values: BTreeMap<String, ParamValue>,
}

impl ParameterAssignment {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }
}

#[derive(Debug, Clone)]
pub struct Environment {
    name: String,
    params: ParameterSet,
    version: u64,
    /// Paths that read this environment.
    paths: BTreeSet<String>,
}

impl Environment {
    pub fn new(name: impl Into<String>, params: ParameterSet) -> Self {
        Self {
            name: name.into(),
            params,
            version: 0,
            paths: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Incremented on every accepted change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Read-only view of the live parameters.
    pub fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    /// Immutable copy of the current parameters.
    pub fn current_snapshot(&self) -> ParameterSet {
        self.params.clone()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub(crate) fn register_path(&mut self, path: &str) {
        self.paths.insert(path.to_string());
    }

    /// Change a Variable or Setting.
    ///
    /// Options cannot be changed here (see [`Environment::set_option`]), and
    /// the optimizer may only touch Variables.
    pub fn update(
        &mut self,
        name: &str,
        value: impl Into<ParamValue>,
        origin: UpdateOrigin,
    ) -> Result<()> {
        let param = self.lookup(name)?;
        self.check_origin(param, origin)?;
        self.params.replace_value(name, value.into())?;
        self.version += 1;
        Ok(())
    }

    /// Change an Option. Options never affect identity, so this never
    /// invalidates a cached result.
    pub fn set_option(&mut self, name: &str, value: impl Into<ParamValue>) -> Result<()> {
        let param = self.lookup(name)?;
        if param.role != Role::Option {
            return Err(JourneyError::RoleViolation {
                environment: self.name.clone(),
                parameter: name.to_string(),
                role: param.role,
                attempted: "set as option",
            });
        }
        self.params.replace_value(name, value.into())?;
        self.version += 1;
        Ok(())
    }

    /// Apply an optimizer proposal. Either every value is accepted or the
    /// environment is left untouched.
    pub fn apply(&mut self, assignment: &ParameterAssignment) -> Result<()> {
        if assignment.environment != self.name {
            return Err(JourneyError::UnknownEnvironment {
                path: "<proposal>".into(),
                environment: assignment.environment.clone(),
            });
        }
        let mut staged = self.params.clone();
        for (name, value) in &assignment.values {
            let param = self.lookup(name)?;
            self.check_origin(param, UpdateOrigin::Optimizer)?;
            staged.replace_value(name, value.clone())?;
        }
        self.params = staged;
        self.version += 1;
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<&Parameter> {
        self.params.get(name).ok_or_else(|| JourneyError::UnknownParameter {
            environment: self.name.clone(),
            parameter: name.to_string(),
        })
    }

    fn check_origin(&self, param: &Parameter, origin: UpdateOrigin) -> Result<()> {
        let allowed = match origin {
            UpdateOrigin::User => param.role.user_mutable(),
            UpdateOrigin::Optimizer => param.role.optimizable(),
        };
        if allowed {
            return Ok(());
        }
        Err(JourneyError::RoleViolation {
            environment: self.name.clone(),
            parameter: param.name.clone(),
            role: param.role,
            attempted: match origin {
                UpdateOrigin::User => "update",
                UpdateOrigin::Optimizer => "optimize",
            },
        })
    }
}

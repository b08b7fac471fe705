use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{ParamValue, Parameter, Role};
use crate::error::{JourneyError, Result};

/// Ordered, role-partitioned parameters of one environment.
///
/// Insertion order is kept for display only. Anything that feeds identity
/// goes through [`ParameterSet::identity`], which is sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    params: IndexMap<String, Parameter>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, validating every parameter.
    pub fn from_params(params: impl IntoIterator<Item = Parameter>) -> Result<Self> {
        let mut set = Self::new();
        for param in params {
            set.insert(param)?;
        }
        Ok(set)
    }

    /// Builder-style insert.
    pub fn with(mut self, param: Parameter) -> Result<Self> {
        self.insert(param)?;
        Ok(self)
    }

    /// Add a parameter. Names are unique; bounds only on numeric Variables.
    pub fn insert(&mut self, param: Parameter) -> Result<()> {
        if self.params.contains_key(&param.name) {
            return Err(JourneyError::DuplicateParameter(param.name));
        }
        validate(&param)?;
        self.params.insert(param.name.clone(), param);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name).map(|p| &p.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.values()
    }

    pub fn by_role(&self, role: Role) -> impl Iterator<Item = &Parameter> {
        self.params.values().filter(move |p| p.role == role)
    }

    pub fn options(&self) -> impl Iterator<Item = &Parameter> {
        self.by_role(Role::Option)
    }

    /// Setting + Variable values keyed by name, in lexicographic order.
    pub fn identity(&self) -> BTreeMap<&str, &ParamValue> {
        self.params
            .values()
            .filter(|p| p.role.identity_relevant())
            .map(|p| (p.name.as_str(), &p.value))
            .collect()
    }

    /// Structural equality over Settings and Variables only.
    pub fn identity_eq(&self, other: &ParameterSet) -> bool {
        self.identity() == other.identity()
    }

    /// Names of identity parameters whose values differ between the sets,
    /// including names present on only one side.
    pub fn identity_diff(&self, other: &ParameterSet) -> Vec<String> {
        let ours = self.identity();
        let theirs = other.identity();
        let mut names: Vec<String> = ours
            .keys()
            .chain(theirs.keys())
            .filter(|name| ours.get(*name) != theirs.get(*name))
            .map(|name| name.to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Replace a value after checking kind and bounds. Role checks belong
    /// to the caller, which knows who is asking.
    pub(crate) fn replace_value(&mut self, name: &str, value: ParamValue) -> Result<()> {
        let Some(param) = self.params.get_mut(name) else {
            return Err(JourneyError::InvalidParameter {
                parameter: name.to_string(),
                reason: "not defined".into(),
            });
        };
        check_value(param, &value)?;
        param.value = value;
        Ok(())
    }
}

/// Kind must not change; bounded Variables must stay inside their bounds.
pub(crate) fn check_value(param: &Parameter, value: &ParamValue) -> Result<()> {
    if value.kind() != param.kind() {
        return Err(JourneyError::TypeMismatch {
            parameter: param.name.clone(),
            expected: param.kind(),
            found: value.kind(),
        });
    }
    if let (Some(bounds), Some(v)) = (param.bounds, value.as_f64()) {
        if !bounds.contains(v) {
            return Err(JourneyError::OutOfBounds {
                parameter: param.name.clone(),
                value: v,
                min: bounds.min,
                max: bounds.max,
            });
        }
    }
    Ok(())
}

fn validate(param: &Parameter) -> Result<()> {
    if param.name.is_empty() {
        return Err(JourneyError::InvalidParameter {
            parameter: param.name.clone(),
            reason: "name must not be empty".into(),
        });
    }
    let Some(bounds) = param.bounds else {
        return Ok(());
    };
    if param.role != Role::Variable {
        return Err(JourneyError::InvalidParameter {
            parameter: param.name.clone(),
            reason: format!("bounds are only allowed on variables, not on a {}", param.role),
        });
    }
    if !param.kind().is_numeric() {
        return Err(JourneyError::InvalidParameter {
            parameter: param.name.clone(),
            reason: format!("bounds need a numeric value, got {}", param.kind()),
        });
    }
    bounds.validate().map_err(|reason| JourneyError::InvalidParameter {
        parameter: param.name.clone(),
        reason,
    })?;
    check_value(param, &param.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{ParamRange, ValueKind};

    fn furnace() -> ParameterSet {
        ParameterSet::from_params([
            Parameter::setting("temp", 300),
            Parameter::variable("power", 5.0, ParamRange::linear(1.0, 10.0)),
            Parameter::option("verbose", true),
        ])
        .unwrap()
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = furnace().with(Parameter::setting("temp", 350)).unwrap_err();
        assert!(matches!(err, JourneyError::DuplicateParameter(name) if name == "temp"));
    }

    #[test]
    fn test_identity_excludes_options() {
        let set = furnace();
        let identity = set.identity();
        assert_eq!(identity.len(), 2);
        assert!(identity.contains_key("temp"));
        assert!(identity.contains_key("power"));
        assert!(!identity.contains_key("verbose"));
    }

    #[test]
    fn test_identity_ignores_insertion_order() {
        let reordered = ParameterSet::from_params([
            Parameter::option("verbose", false),
            Parameter::variable("power", 5.0, ParamRange::linear(1.0, 10.0)),
            Parameter::setting("temp", 300),
        ])
        .unwrap();
        assert!(furnace().identity_eq(&reordered));
        assert!(furnace().identity_diff(&reordered).is_empty());
    }

    #[test]
    fn test_identity_diff_names_changed_values() {
        let mut changed = furnace();
        changed.replace_value("power", ParamValue::Float(7.0)).unwrap();
        assert!(!furnace().identity_eq(&changed));
        assert_eq!(furnace().identity_diff(&changed), vec!["power".to_string()]);
    }

    #[test]
    fn test_bounds_only_on_numeric_variables() {
        let bounded_setting = Parameter {
            bounds: Some(ParamRange::linear(0.0, 1.0)),
            ..Parameter::setting("temp", 0.5)
        };
        assert!(ParameterSet::from_params([bounded_setting]).is_err());

        let bounded_text = Parameter {
            bounds: Some(ParamRange::linear(0.0, 1.0)),
            ..Parameter::unbounded_variable("mode", "fast")
        };
        assert!(ParameterSet::from_params([bounded_text]).is_err());
    }

    #[test]
    fn test_initial_value_must_be_in_bounds() {
        let err = ParameterSet::from_params([Parameter::variable(
            "power",
            50.0,
            ParamRange::linear(1.0, 10.0),
        )])
        .unwrap_err();
        assert!(matches!(err, JourneyError::OutOfBounds { .. }));
    }

    #[test]
    fn test_replace_value_checks_kind() {
        let mut set = furnace();
        let err = set.replace_value("temp", ParamValue::Float(300.0)).unwrap_err();
        assert!(matches!(
            err,
            JourneyError::TypeMismatch {
                expected: ValueKind::Int,
                found: ValueKind::Float,
                ..
            }
        ));
    }

    #[test]
    fn test_by_role_partitions() {
        let set = furnace();
        assert_eq!(set.by_role(Role::Variable).count(), 1);
        assert_eq!(set.by_role(Role::Setting).count(), 1);
        assert_eq!(set.by_role(Role::Option).count(), 1);
    }
}

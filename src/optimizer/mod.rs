//! Proposal of the next Variable values for a path.
//!
//! The optimizer reads a path's history through the [`LookupCache`], keeps
//! only entries comparable with the current fixed context, and asks the
//! TPE engine for the next point. Proposals touch Variables only.

mod tpe;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use crate::environment::ParameterAssignment;
use tpe::{Tpe, Trial};

use crate::cache::{EnvSnapshot, LookupCache, translate_store_error};
use crate::environment::Environment;
use crate::error::{JourneyError, Result, StoreError};
use crate::param::{ParamRange, ParamValue, ParameterSet, Role, ValueKind};
use crate::path::{FigureOfMerit, PathIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Maximize,
    Minimize,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Maximize => f.write_str("maximize"),
            Direction::Minimize => f.write_str("minimize"),
        }
    }
}

/// Tuning knobs for proposals.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSettings {
    /// Fraction of observations treated as "good".
    pub gamma: f64,
    /// Below this many observations, sample uniformly.
    pub min_observations: usize,
    /// Candidates drawn from the good density per proposal.
    pub candidates: usize,
    pub seed: u64,
    /// Float proposals keep this many significant digits.
    pub round_digits: u32,
    pub direction: Direction,
    /// Metric read from a structured figure of merit.
    pub objective: Option<String>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            gamma: 0.25,
            min_observations: 10,
            candidates: 24,
            seed: 0,
            round_digits: 6,
            direction: Direction::Maximize,
            objective: None,
        }
    }
}

/// A past run usable as optimizer input.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Values of the optimized Variables.
    pub values: BTreeMap<String, ParamValue>,
    /// Figure of merit reduced to a scalar, as stored (not direction-adjusted).
    pub score: f64,
}

/// One Variable being optimized.
#[derive(Debug, Clone)]
struct Dimension {
    name: String,
    kind: ValueKind,
    range: ParamRange,
}

pub struct Optimizer {
    cache: Arc<LookupCache>,
    settings: OptimizerSettings,
    tpe: Tpe,
    rng: StdRng,
}

impl Optimizer {
    pub fn new(cache: Arc<LookupCache>, settings: OptimizerSettings) -> Self {
        let tpe = Tpe {
            gamma: settings.gamma,
            min_observations: settings.min_observations,
            candidates: settings.candidates,
        };
        let rng = StdRng::seed_from_u64(settings.seed);
        Self {
            cache,
            settings,
            tpe,
            rng,
        }
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    /// Propose values for `variables` of `target` (all bounded Variables when
    /// empty). `context` holds the other environments the path reads; only
    /// history recorded under identical context values is considered.
    pub fn propose(
        &mut self,
        path: &PathIdentity,
        target: &Environment,
        context: &[&Environment],
        variables: &[String],
    ) -> Result<ParameterAssignment> {
        let dims = dimensions(target, variables)?;
        let observations = self.observations_for(path, target, context, &dims)?;

        let trials: Vec<Trial> = observations
            .iter()
            .filter_map(|obs| {
                let point = dims
                    .iter()
                    .map(|d| obs.values.get(&d.name)?.as_f64().map(|v| d.range.normalize(v)))
                    .collect::<Option<Vec<f64>>>()?;
                let score = match self.settings.direction {
                    Direction::Maximize => obs.score,
                    Direction::Minimize => -obs.score,
                };
                Some(Trial { point, score })
            })
            .collect();

        let point = self.tpe.suggest(dims.len(), &trials, &mut self.rng);
        debug!(
            path = %path.name,
            environment = target.name(),
            observations = trials.len(),
            "proposing next point"
        );

        let mut assignment = ParameterAssignment::new(target.name());
        for (dim, t) in dims.iter().zip(point) {
            let value = round_value(dim, dim.range.denormalize(t), self.settings.round_digits);
            assignment.values.insert(dim.name.clone(), value);
        }
        Ok(assignment)
    }

    /// History of `path` comparable with the current values of `target`'s
    /// Settings and the `context` environments. Every Variable of `target`
    /// is treated as free.
    pub fn observations(
        &self,
        path: &PathIdentity,
        target: &Environment,
        context: &[&Environment],
    ) -> Result<Vec<Observation>> {
        let dims = dimensions(target, &[])?;
        self.observations_for(path, target, context, &dims)
    }

    fn observations_for(
        &self,
        path: &PathIdentity,
        target: &Environment,
        context: &[&Environment],
        dims: &[Dimension],
    ) -> Result<Vec<Observation>> {
        let free: Vec<&str> = dims.iter().map(|d| d.name.as_str()).collect();
        let fixed = fixed_identity(target.parameters(), &free);
        let objective = self.settings.objective.as_deref();

        let mut observations = Vec::new();
        for entry in self.cache.history(path)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e @ (StoreError::Corrupt(_) | StoreError::VersionMismatch { .. })) => {
                    warn!(path = %path.name, error = %e, "skipping unreadable history entry");
                    continue;
                }
                Err(e) => return Err(translate_store_error(None, e)),
            };
            if !comparable(&entry.snapshot, target.name(), &fixed, &free, context) {
                continue;
            }
            let Some(snap) = entry.snapshot_of(target.name()) else {
                continue;
            };
            let values: BTreeMap<String, ParamValue> = free
                .iter()
                .filter_map(|name| Some((name.to_string(), snap.parameters.value(name)?.clone())))
                .collect();

            let runs = std::iter::once(&entry.figure_of_merit)
                .chain(entry.history.iter().map(|prior| &prior.figure_of_merit));
            for fom in runs {
                if let Some(score) = usable_score(fom, objective) {
                    observations.push(Observation {
                        values: values.clone(),
                        score,
                    });
                }
            }
        }
        Ok(observations)
    }
}

fn usable_score(fom: &FigureOfMerit, objective: Option<&str>) -> Option<f64> {
    let score = fom.score(objective);
    if score.is_none() {
        debug!(%fom, "skipping figure of merit without a usable score");
    }
    score
}

/// Resolve the Variables to optimize.
fn dimensions(target: &Environment, variables: &[String]) -> Result<Vec<Dimension>> {
    let params = target.parameters();
    let names: Vec<String> = if variables.is_empty() {
        params
            .by_role(Role::Variable)
            .filter(|p| p.bounds.is_some())
            .map(|p| p.name.clone())
            .collect()
    } else {
        variables.to_vec()
    };

    let mut dims = Vec::with_capacity(names.len());
    for name in names {
        let param = params.get(&name).ok_or_else(|| JourneyError::UnknownParameter {
            environment: target.name().to_string(),
            parameter: name.clone(),
        })?;
        if !param.role.optimizable() {
            return Err(JourneyError::RoleViolation {
                environment: target.name().to_string(),
                parameter: name,
                role: param.role,
                attempted: "optimize",
            });
        }
        let Some(range) = param.bounds else {
            return Err(JourneyError::InvalidParameter {
                parameter: name,
                reason: "needs bounds to be optimized".into(),
            });
        };
        let kind = param.kind();
        if kind == ValueKind::Int && range.min.ceil() > range.max.floor() {
            return Err(JourneyError::InvalidParameter {
                parameter: name,
                reason: format!("no integer inside [{}, {}]", range.min, range.max),
            });
        }
        dims.push(Dimension { name, kind, range });
    }
    Ok(dims)
}

/// Identity values of `params` other than the free ones.
fn fixed_identity<'a>(params: &'a ParameterSet, free: &[&str]) -> BTreeMap<&'a str, &'a ParamValue> {
    params
        .identity()
        .into_iter()
        .filter(|(name, _)| !free.contains(name))
        .collect()
}

/// Whether a stored run was made under the current fixed context.
fn comparable(
    snapshot: &[EnvSnapshot],
    target: &str,
    fixed: &BTreeMap<&str, &ParamValue>,
    free: &[&str],
    context: &[&Environment],
) -> bool {
    let find = |name: &str| snapshot.iter().find(|s| s.environment == name);

    let Some(target_snap) = find(target) else {
        return false;
    };
    if &fixed_identity(&target_snap.parameters, free) != fixed {
        return false;
    }
    context.iter().all(|env| {
        find(env.name()).is_some_and(|snap| snap.parameters.identity_eq(env.parameters()))
    })
}

/// Snap a denormalized value onto what the parameter can hold.
fn round_value(dim: &Dimension, value: f64, digits: u32) -> ParamValue {
    match dim.kind {
        ValueKind::Int => {
            let v = value.round().clamp(dim.range.min.ceil(), dim.range.max.floor());
            ParamValue::Int(v as i64)
        }
        _ => ParamValue::Float(round_significant(value, digits).clamp(dim.range.min, dim.range.max)),
    }
}

/// Round to `digits` significant digits, so log-scale values keep their
/// precision in every decade.
fn round_significant(value: f64, digits: u32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let digits = digits.clamp(1, 15) as i32;
    let magnitude = value.abs().log10().floor() as i32;
    let shift = digits - 1 - magnitude;
    let scale = 10f64.powi(shift.abs());
    if !scale.is_finite() {
        return value;
    }
    if shift >= 0 {
        (value * scale).round() / scale
    } else {
        (value / scale).round() * scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Entry, MemoryStore};
    use crate::environment::UpdateOrigin;
    use crate::param::Parameter;
    use crate::path::{PathSpec, RunOutcome};

    fn furnace() -> Environment {
        let params = ParameterSet::from_params([
            Parameter::setting("temp", 300),
            Parameter::variable("power", 5.0, ParamRange::linear(1.0, 10.0)),
            Parameter::variable("passes", 3, ParamRange::linear(1.0, 8.0)),
            Parameter::option("verbose", true),
        ])
        .unwrap();
        Environment::new("furnace", params)
    }

    fn anneal() -> PathSpec {
        PathSpec::new("anneal").environment("furnace")
    }

    fn setup() -> (Arc<LookupCache>, Optimizer) {
        let cache = Arc::new(LookupCache::new(Arc::new(MemoryStore::default())));
        let optimizer = Optimizer::new(cache.clone(), OptimizerSettings::default());
        (cache, optimizer)
    }

    fn record(cache: &LookupCache, env: &Environment, fom: f64) {
        let key = cache.key(&anneal().identity(), &[env], &[]).unwrap();
        cache
            .put(Entry::new(
                key,
                anneal().identity(),
                FigureOfMerit::Scalar(fom),
                RunOutcome::new(),
                vec![EnvSnapshot::of(env)],
            ))
            .unwrap();
    }

    #[test]
    fn test_proposal_with_three_observations_stays_in_bounds() {
        let (cache, mut optimizer) = setup();
        let mut env = furnace();
        for (power, fom) in [(2.0, 0.4), (5.0, 0.7), (8.0, 0.5)] {
            env.update("power", power, UpdateOrigin::Optimizer).unwrap();
            record(&cache, &env, fom);
        }

        let assignment = optimizer
            .propose(&anneal().identity(), &env, &[], &["power".to_string()])
            .unwrap();
        assert_eq!(assignment.environment, "furnace");
        assert_eq!(assignment.values.len(), 1);
        let power = assignment.get("power").and_then(ParamValue::as_f64).unwrap();
        assert!((1.0..=10.0).contains(&power));

        env.apply(&assignment).unwrap();
    }

    #[test]
    fn test_proposal_never_touches_settings_or_options() {
        let (_, mut optimizer) = setup();
        let env = furnace();
        let assignment = optimizer.propose(&anneal().identity(), &env, &[], &[]).unwrap();
        let names: Vec<&str> = assignment.values.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["passes", "power"]);
    }

    #[test]
    fn test_integer_variables_are_rounded() {
        let (_, mut optimizer) = setup();
        let env = furnace();
        for _ in 0..20 {
            let assignment = optimizer
                .propose(&anneal().identity(), &env, &[], &["passes".to_string()])
                .unwrap();
            let ParamValue::Int(passes) = assignment.get("passes").unwrap() else {
                panic!("passes must stay an integer");
            };
            assert!((1..=8).contains(passes));
        }
    }

    #[test]
    fn test_float_rounding_digits() {
        let dim = Dimension {
            name: "power".into(),
            kind: ValueKind::Float,
            range: ParamRange::linear(1.0, 10.0),
        };
        assert_eq!(round_value(&dim, 3.14159, 3), ParamValue::Float(3.14));
        assert_eq!(round_value(&dim, 12.0, 3), ParamValue::Float(10.0));
        assert_eq!(round_significant(0.000123456, 3), 0.000123);
        assert_eq!(round_significant(-98765.0, 2), -99000.0);
        assert_eq!(round_significant(0.0, 6), 0.0);
    }

    #[test]
    fn test_log_range_proposals_cover_every_decade() {
        let (_, mut optimizer) = setup();
        let params = ParameterSet::from_params([Parameter::variable(
            "rate",
            1e-6,
            ParamRange::log(1e-9, 1e-3),
        )])
        .unwrap();
        let env = Environment::new("schedule", params);
        let path = PathSpec::new("decay").environment("schedule").identity();

        let rates: Vec<f64> = (0..200)
            .map(|_| {
                let a = optimizer.propose(&path, &env, &[], &[]).unwrap();
                a.get("rate").and_then(ParamValue::as_f64).unwrap()
            })
            .collect();

        assert!(rates.iter().all(|r| (1e-9..=1e-3).contains(r)));
        let at_min = rates.iter().filter(|r| **r == 1e-9).count();
        assert!(at_min <= 2, "{at_min} proposals collapsed onto the minimum");
        let distinct: std::collections::HashSet<u64> = rates.iter().map(|r| r.to_bits()).collect();
        assert!(distinct.len() >= 190, "only {} distinct rates", distinct.len());
        // uniform in log space: roughly a third below 1e-7
        let low = rates.iter().filter(|r| **r < 1e-7).count();
        assert!(low > 30, "only {low} proposals in the two lowest decades");
    }

    #[test]
    fn test_unreadable_history_is_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(crate::cache::FsStore::open(dir.path(), 4).unwrap());
        let cache = Arc::new(LookupCache::new(store));
        let mut optimizer = Optimizer::new(cache.clone(), OptimizerSettings::default());

        let mut env = furnace();
        let mut keys = Vec::new();
        for (power, fom) in [(2.0, 0.4), (5.0, 0.7), (8.0, 0.5)] {
            env.update("power", power, UpdateOrigin::Optimizer).unwrap();
            record(&cache, &env, fom);
            keys.push(cache.key(&anneal().identity(), &[&env], &[]).unwrap());
        }
        let file = dir.path().join("entries").join(format!("{}.bin", keys[0].to_hex()));
        std::fs::write(file, [7u8, 0, 0, 0, 1, 2]).unwrap();

        let observations = optimizer.observations(&anneal().identity(), &env, &[]).unwrap();
        assert_eq!(observations.len(), 2);
        assert!(optimizer.propose(&anneal().identity(), &env, &[], &[]).is_ok());
    }

    #[test]
    fn test_refuses_to_optimize_settings() {
        let (_, mut optimizer) = setup();
        let env = furnace();
        let err = optimizer
            .propose(&anneal().identity(), &env, &[], &["temp".to_string()])
            .unwrap_err();
        assert!(matches!(err, JourneyError::RoleViolation { role: Role::Setting, .. }));
    }

    #[test]
    fn test_history_filtered_by_settings() {
        let (cache, optimizer) = setup();
        let mut env = furnace();
        record(&cache, &env, 0.5);
        env.update("power", 6.0, UpdateOrigin::Optimizer).unwrap();
        record(&cache, &env, 0.6);

        // a different temperature makes earlier runs incomparable
        env.update("temp", 350, UpdateOrigin::User).unwrap();
        record(&cache, &env, 0.9);

        let observations = optimizer.observations(&anneal().identity(), &env, &[]).unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].score, 0.9);
    }

    #[test]
    fn test_minimize_flips_preference() {
        let cache = Arc::new(LookupCache::new(Arc::new(MemoryStore::default())));
        let settings = OptimizerSettings {
            direction: Direction::Minimize,
            min_observations: 4,
            seed: 3,
            ..OptimizerSettings::default()
        };
        let mut optimizer = Optimizer::new(cache.clone(), settings);

        // loss grows with power: low power is better
        let mut env = furnace();
        for step in 0..19 {
            let power = 1.0 + step as f64 * 0.5;
            env.update("power", power, UpdateOrigin::Optimizer).unwrap();
            record(&cache, &env, power);
        }

        let mean: f64 = (0..20)
            .map(|_| {
                let a = optimizer
                    .propose(&anneal().identity(), &env, &[], &["power".to_string()])
                    .unwrap();
                a.get("power").and_then(ParamValue::as_f64).unwrap()
            })
            .sum::<f64>()
            / 20.0;
        assert!(mean < 5.5, "mean proposal {mean} should lean toward low power");
    }
}

//! Stored results and their on-disk record format.
//!
//! Record layout: `format:u32 (LE) | bincode(Entry)`. The format word is
//! checked before anything else is decoded, so a record written by another
//! build is reported as a version mismatch instead of being misread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::{CanonicalKey, KEY_SCHEME_VERSION};
use crate::environment::Environment;
use crate::error::StoreError;
use crate::param::ParameterSet;
use crate::path::{FigureOfMerit, PathIdentity, RunOutcome};

/// Version of the persisted record layout.
pub const RECORD_FORMAT: u32 = 1;

/// Full parameters of one environment at the time of a run, all roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvSnapshot {
    pub environment: String,
    pub version: u64,
    pub parameters: ParameterSet,
}

impl EnvSnapshot {
    pub fn of(env: &Environment) -> Self {
        Self {
            environment: env.name().to_string(),
            version: env.version(),
            parameters: env.current_snapshot(),
        }
    }
}

/// A run that was superseded by a later write to the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorRun {
    pub created_at: DateTime<Utc>,
    pub figure_of_merit: FigureOfMerit,
    pub outcome: RunOutcome,
    pub snapshot: Vec<EnvSnapshot>,
}

/// One cached result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: CanonicalKey,
    pub path: PathIdentity,
    pub key_scheme: u32,
    pub figure_of_merit: FigureOfMerit,
    pub outcome: RunOutcome,
    /// Kept for audit; never used to derive the key.
    pub snapshot: Vec<EnvSnapshot>,
    pub created_at: DateTime<Utc>,
    /// Earlier runs for the same key, newest first.
    pub history: Vec<PriorRun>,
}

impl Entry {
    pub fn new(
        key: CanonicalKey,
        path: PathIdentity,
        figure_of_merit: FigureOfMerit,
        outcome: RunOutcome,
        snapshot: Vec<EnvSnapshot>,
    ) -> Self {
        Self {
            key,
            path,
            key_scheme: KEY_SCHEME_VERSION,
            figure_of_merit,
            outcome,
            snapshot,
            created_at: Utc::now(),
            history: Vec::new(),
        }
    }

    pub fn snapshot_of(&self, environment: &str) -> Option<&EnvSnapshot> {
        self.snapshot.iter().find(|s| s.environment == environment)
    }

    /// `env.param` names whose identity value in `current` differs from this
    /// entry's snapshot. An environment missing from `current` is reported
    /// as `env.*`.
    pub fn stale_parameters(&self, current: &[EnvSnapshot]) -> Vec<String> {
        let mut changed = Vec::new();
        for snap in &self.snapshot {
            match current.iter().find(|c| c.environment == snap.environment) {
                Some(now) => changed.extend(
                    snap.parameters
                        .identity_diff(&now.parameters)
                        .into_iter()
                        .map(|p| format!("{}.{p}", snap.environment)),
                ),
                None => changed.push(format!("{}.*", snap.environment)),
            }
        }
        changed
    }

    /// Last writer wins, but the loser's run (including its Option values)
    /// moves into the history instead of being dropped.
    pub(crate) fn supersede(mut self, prior: Entry, limit: usize) -> Entry {
        let mut history = Vec::with_capacity(limit.min(prior.history.len() + 1));
        history.push(PriorRun {
            created_at: prior.created_at,
            figure_of_merit: prior.figure_of_merit,
            outcome: prior.outcome,
            snapshot: prior.snapshot,
        });
        history.extend(prior.history);
        history.truncate(limit);
        self.history = history;
        self
    }
}

pub(crate) fn encode(entry: &Entry) -> Result<Vec<u8>, StoreError> {
    let body = bincode::serialize(entry).map_err(StoreError::corrupt)?;
    let mut bytes = Vec::with_capacity(body.len() + 4);
    bytes.extend_from_slice(&RECORD_FORMAT.to_le_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Entry, StoreError> {
    let Some((head, body)) = bytes.split_first_chunk::<4>() else {
        return Err(StoreError::Corrupt(format!("record too short ({} bytes)", bytes.len())));
    };
    let format = u32::from_le_bytes(*head);
    if format != RECORD_FORMAT {
        return Err(StoreError::VersionMismatch {
            found: format,
            expected: RECORD_FORMAT,
        });
    }
    let entry: Entry = bincode::deserialize(body).map_err(StoreError::corrupt)?;
    if entry.key_scheme != KEY_SCHEME_VERSION {
        return Err(StoreError::VersionMismatch {
            found: entry.key_scheme,
            expected: KEY_SCHEME_VERSION,
        });
    }
    Ok(entry)
}

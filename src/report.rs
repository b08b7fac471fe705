//! Terminal rendering for stored results: sparklines, one-line entry
//! summaries and per-path history digests.

use owo_colors::OwoColorize;

use crate::cache::Entry;
use crate::optimizer::Direction;

/// Render sparkline from values.
pub fn sparkline(values: &[f64], width: usize) -> String {
    if values.is_empty() {
        return " ".repeat(width);
    }

    let chars = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let range = (max - min).max(0.001);

    // Sample or pad to width
    let mut result = String::new();
    for i in 0..width {
        let idx = if values.len() <= width {
            if i < values.len() { Some(i) } else { None }
        } else {
            Some(i * values.len() / width)
        };

        if let Some(idx) = idx {
            let normalized = (values[idx] - min) / range;
            let char_idx = ((normalized * 7.0).round() as usize).min(7);
            result.push(chars[char_idx]);
        } else {
            result.push(' ');
        }
    }
    result
}

/// Identity values of the entry's snapshot, `env.name=value`.
fn identity_values(entry: &Entry) -> String {
    entry
        .snapshot
        .iter()
        .flat_map(|snap| {
            snap.parameters
                .identity()
                .into_iter()
                .map(move |(name, value)| format!("{}.{name}={value}", snap.environment))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `<key>  <fom>  <created>  <parameters>`
pub fn entry_line(entry: &Entry) -> String {
    format!(
        "{}  {:>10}  {}  {}",
        entry.key.short().cyan(),
        entry.figure_of_merit.to_string(),
        entry.created_at.format("%Y-%m-%d %H:%M:%S").dimmed(),
        identity_values(entry)
    )
}

/// Full multi-line description of an entry.
pub fn entry_detail(entry: &Entry) -> String {
    let mut lines = vec![
        format!("{} {}", "Key:".bold(), entry.key),
        format!("{} {}", "Path:".bold(), entry.path),
        format!("{} {}", "Figure of merit:".bold(), entry.figure_of_merit),
        format!("{} {}", "Created:".bold(), entry.created_at.to_rfc3339()),
        format!("{} v{}", "Key scheme:".bold(), entry.key_scheme),
    ];

    for snap in &entry.snapshot {
        lines.push(format!("{} {} (v{})", "Environment".bold(), snap.environment, snap.version));
        for param in snap.parameters.iter() {
            lines.push(format!("   {:<9} {} = {}", param.role.dimmed(), param.name, param.value));
        }
    }

    if !entry.outcome.values.is_empty() {
        lines.push("Values:".bold().to_string());
        for (name, value) in &entry.outcome.values {
            lines.push(format!("   {name} = {value}"));
        }
    }
    if !entry.outcome.artifacts.is_empty() {
        lines.push("Artifacts:".bold().to_string());
        for artifact in &entry.outcome.artifacts {
            lines.push(format!("   {} -> {}", artifact.name, artifact.uri));
        }
    }
    if !entry.history.is_empty() {
        lines.push(format!("{} {} prior run(s)", "History:".bold(), entry.history.len()));
        for prior in &entry.history {
            lines.push(format!(
                "   {}  {}",
                prior.created_at.format("%Y-%m-%d %H:%M:%S"),
                prior.figure_of_merit
            ));
        }
    }
    lines.join("\n")
}

/// Scores of a path's entries in creation order, plus the best entry.
#[derive(Debug)]
pub struct HistorySummary {
    pub scores: Vec<f64>,
    pub best: Option<Entry>,
    /// Entries whose figure of merit had no usable score.
    pub unscored: usize,
}

impl HistorySummary {
    pub fn from_entries(
        mut entries: Vec<Entry>,
        objective: Option<&str>,
        direction: Direction,
    ) -> Self {
        entries.sort_by_key(|e| e.created_at);

        let mut scores = Vec::with_capacity(entries.len());
        let mut best: Option<(f64, Entry)> = None;
        let mut unscored = 0;
        for entry in entries {
            let Some(score) = entry.figure_of_merit.score(objective) else {
                unscored += 1;
                continue;
            };
            scores.push(score);
            let better = match &best {
                None => true,
                Some((b, _)) => match direction {
                    Direction::Maximize => score > *b,
                    Direction::Minimize => score < *b,
                },
            };
            if better {
                best = Some((score, entry));
            }
        }

        Self {
            scores,
            best: best.map(|(_, e)| e),
            unscored,
        }
    }

    /// Change from the first to the last score, colored by whether it
    /// moved in the preferred direction.
    pub fn delta(&self, direction: Direction) -> Option<String> {
        let (first, last) = (self.scores.first()?, self.scores.last()?);
        let delta = last - first;
        let improved = match direction {
            Direction::Maximize => delta > 0.0,
            Direction::Minimize => delta < 0.0,
        };
        let text = format!("{delta:+.4}");
        Some(if delta == 0.0 {
            text.dimmed().to_string()
        } else if improved {
            text.green().to_string()
        } else {
            text.red().to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CanonicalKey, EnvSnapshot};
    use crate::environment::Environment;
    use crate::param::{ParamRange, Parameter, ParameterSet};
    use crate::path::{FigureOfMerit, PathSpec, RunOutcome};

    fn entry(power: f64, fom: f64) -> Entry {
        let params = ParameterSet::from_params([
            Parameter::setting("temp", 300),
            Parameter::variable("power", power, ParamRange::linear(1.0, 10.0)),
        ])
        .unwrap();
        let path = PathSpec::new("anneal").environment("furnace").identity();
        let key = CanonicalKey::derive(&path, &[("furnace", &params)], &[]);
        Entry::new(
            key,
            path,
            FigureOfMerit::Scalar(fom),
            RunOutcome::new().with_value("yield", fom),
            vec![EnvSnapshot::of(&Environment::new("furnace", params))],
        )
    }

    #[test]
    fn test_sparkline_width_and_extremes() {
        let line = sparkline(&[0.0, 0.5, 1.0], 5);
        assert_eq!(line.chars().count(), 5);
        assert!(line.starts_with('▁'));
        assert_eq!(line.chars().nth(2), Some('█'));
        assert_eq!(sparkline(&[], 3), "   ");
    }

    #[test]
    fn test_sparkline_downsamples() {
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        assert_eq!(sparkline(&values, 10).chars().count(), 10);
    }

    #[test]
    fn test_entry_line_mentions_parameters() {
        let line = entry_line(&entry(5.0, 0.82));
        assert!(line.contains("furnace.power=5"));
        assert!(line.contains("0.8200"));
    }

    #[test]
    fn test_entry_detail_lists_values() {
        let detail = entry_detail(&entry(5.0, 0.82));
        assert!(detail.contains("yield"));
        assert!(detail.contains("anneal"));
    }

    #[test]
    fn test_history_summary_best_by_direction() {
        let entries = vec![entry(2.0, 0.4), entry(5.0, 0.9), entry(8.0, 0.6)];

        let max = HistorySummary::from_entries(entries.clone(), None, Direction::Maximize);
        assert_eq!(max.scores.len(), 3);
        assert_eq!(max.best.unwrap().figure_of_merit, FigureOfMerit::Scalar(0.9));

        let min = HistorySummary::from_entries(entries, None, Direction::Minimize);
        assert_eq!(min.best.unwrap().figure_of_merit, FigureOfMerit::Scalar(0.4));
    }

    #[test]
    fn test_unscored_entries_are_counted() {
        let mut structured = entry(3.0, 0.0);
        structured.figure_of_merit = FigureOfMerit::Structured(Default::default());
        let summary = HistorySummary::from_entries(vec![structured], None, Direction::Maximize);
        assert_eq!(summary.unscored, 1);
        assert!(summary.best.is_none());
        assert!(summary.delta(Direction::Maximize).is_none());
    }
}

//! Tree-structured Parzen Estimator over a normalized `[0, 1]^d` space.
//!
//! Observations are split at the `gamma` quantile into "good" and "bad".
//! Each side gets a per-dimension Parzen mixture: one Gaussian kernel per
//! observation plus a uniform prior component, so no region ever has zero
//! density. Candidates are drawn from the good mixture and the one that
//! maximizes `Σ ln l(x) − ln g(x)` wins.
//!
//! Scores are "higher is better"; callers flip the sign to minimize.

use std::f64::consts::PI;

use rand::Rng;

/// Narrowest kernel, in normalized units. Keeps repeated observations of the
/// same point from collapsing the density to a spike.
const MIN_BANDWIDTH: f64 = 0.05;
const MAX_BANDWIDTH: f64 = 0.5;

/// Two candidates whose objective differs by less than this are tied.
const TIE_EPSILON: f64 = 1e-9;

/// One evaluated point, normalized per dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub point: Vec<f64>,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct Tpe {
    pub gamma: f64,
    pub min_observations: usize,
    pub candidates: usize,
}

impl Default for Tpe {
    fn default() -> Self {
        Self {
            gamma: 0.25,
            min_observations: 10,
            candidates: 24,
        }
    }
}

impl Tpe {
    /// Next point to try, in normalized coordinates.
    ///
    /// Trials whose point does not have `ndim` coordinates are ignored.
    pub fn suggest<R: Rng>(&self, ndim: usize, trials: &[Trial], rng: &mut R) -> Vec<f64> {
        if ndim == 0 {
            return Vec::new();
        }
        let trials: Vec<Trial> = trials
            .iter()
            .filter(|t| t.point.len() == ndim)
            .cloned()
            .collect();
        if trials.len() < self.min_observations.max(2) {
            return sample_uniform(ndim, rng);
        }

        let (good, bad) = self.split(&trials);
        let good = Mixture::fit(ndim, &good);
        let bad = Mixture::fit(ndim, &bad);

        let scored: Vec<(Vec<f64>, f64)> = (0..self.candidates.max(1))
            .map(|_| {
                let candidate = good.sample(rng);
                let ratio = good.log_density(&candidate) - bad.log_density(&candidate);
                (candidate, ratio)
            })
            .collect();

        match select_candidate(scored, &trials) {
            Some(point) => point,
            None => sample_uniform(ndim, rng),
        }
    }

    /// Best `ceil(gamma * n)` trials (at least one, at most `n - 1`) are good.
    fn split<'a>(&self, trials: &'a [Trial]) -> (Vec<&'a Trial>, Vec<&'a Trial>) {
        let mut sorted: Vec<&Trial> = trials.iter().collect();
        sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

        let n = sorted.len();
        let n_good = ((self.gamma.clamp(0.0, 1.0) * n as f64).ceil() as usize).clamp(1, n - 1);
        let bad = sorted.split_off(n_good);
        (sorted, bad)
    }
}

/// Highest acquisition wins. Candidates tied on acquisition are broken
/// toward the one farthest from every tried point.
fn select_candidate(scored: Vec<(Vec<f64>, f64)>, trials: &[Trial]) -> Option<Vec<f64>> {
    let mut best: Option<(Vec<f64>, f64, f64)> = None;
    for (candidate, ratio) in scored {
        let spread = min_distance_to_trials(&candidate, trials);
        let better = match &best {
            None => true,
            Some((_, best_ratio, best_spread)) => {
                if (ratio - best_ratio).abs() <= TIE_EPSILON {
                    spread > *best_spread
                } else {
                    ratio > *best_ratio
                }
            }
        };
        if better {
            best = Some((candidate, ratio, spread));
        }
    }
    best.map(|(point, _, _)| point)
}

/// Uniform point in the unit cube.
pub fn sample_uniform<R: Rng>(ndim: usize, rng: &mut R) -> Vec<f64> {
    (0..ndim).map(|_| rng.r#gen::<f64>()).collect()
}

/// Product of independent per-dimension Parzen mixtures.
struct Mixture {
    /// Kernel centers per dimension.
    centers: Vec<Vec<f64>>,
    bandwidths: Vec<f64>,
}

impl Mixture {
    fn fit(ndim: usize, trials: &[&Trial]) -> Self {
        let centers: Vec<Vec<f64>> = (0..ndim)
            .map(|d| trials.iter().map(|t| t.point[d]).collect())
            .collect();
        let bandwidths = centers.iter().map(|c| bandwidth(c)).collect();
        Self { centers, bandwidths }
    }

    /// Sum over dimensions of the log mixture density.
    fn log_density(&self, point: &[f64]) -> f64 {
        self.centers
            .iter()
            .zip(&self.bandwidths)
            .zip(point)
            .map(|((centers, &sigma), &x)| {
                let components = (centers.len() + 1) as f64;
                // uniform prior on [0, 1] has density 1
                let kernels: f64 = centers.iter().map(|&mu| gaussian_pdf(x, mu, sigma)).sum();
                ((1.0 + kernels) / components).ln()
            })
            .sum()
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> Vec<f64> {
        self.centers
            .iter()
            .zip(&self.bandwidths)
            .map(|(centers, &sigma)| {
                let pick = rng.gen_range(0..=centers.len());
                match centers.get(pick) {
                    Some(&mu) => (mu + sigma * standard_normal(rng)).clamp(0.0, 1.0),
                    // the extra component is the uniform prior
                    None => rng.r#gen::<f64>(),
                }
            })
            .collect()
    }
}

/// Scott's rule, clamped to sane kernel widths.
fn bandwidth(centers: &[f64]) -> f64 {
    let n = centers.len().max(1) as f64;
    let mean = centers.iter().sum::<f64>() / n;
    let var = centers.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    (1.06 * var.sqrt() * n.powf(-0.2)).clamp(MIN_BANDWIDTH, MAX_BANDWIDTH)
}

fn gaussian_pdf(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    (-0.5 * z * z).exp() / (sigma * (2.0 * PI).sqrt())
}

/// Box-Muller.
fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.r#gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.r#gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Minimum normalized distance from point to any tried point.
fn min_distance_to_trials(point: &[f64], trials: &[Trial]) -> f64 {
    trials
        .iter()
        .map(|t| normalized_distance(point, &t.point))
        .fold(f64::INFINITY, f64::min)
}

/// RMS distance between normalized points.
pub(crate) fn normalized_distance(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = a.iter().zip(b).map(|(av, bv)| (av - bv).powi(2)).sum();
    (sum_sq / a.len() as f64).sqrt()
}

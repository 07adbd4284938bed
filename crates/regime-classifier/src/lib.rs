//! Market regime classification: standardize features, then fit either
//! k-means clustering or a Gaussian-emission Hidden Markov Model, and always
//! order the resulting states by ascending risk (first feature, volatility).

mod hmm;
mod kmeans;
mod scaler;

use depeg_core::{CalibrationError, CalibrationResult, FeatureRow, Regime, RegimeState};
use std::collections::BTreeMap;

pub use hmm::GaussianEmission;
pub use kmeans::KMeansResult;
pub use scaler::StandardScaler;

const DIM: usize = FeatureRow::DIM;

/// Fitting method for `RegimeClassifier::fit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegimeFitMethod {
    KMeans,
    Hmm,
}

/// Per-regime summary returned by `RegimeClassifier::regime_statistics`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegimeStats {
    pub regime: Regime,
    pub mean: FeatureRow,
    pub stationary_prob: f64,
}

enum FittedModel {
    KMeans {
        centers: Vec<[f64; DIM]>,
        order: Vec<usize>,
        transition_matrix: Vec<Vec<f64>>,
        initial_probs: Vec<f64>,
    },
    Hmm {
        emissions: Vec<GaussianEmission>,
        order: Vec<usize>,
        transition_matrix: Vec<Vec<f64>>,
        initial_probs: Vec<f64>,
    },
}

/// Classifies feature rows into `Regime::Calm`/`Volatile`/`Crisis`, fitted
/// either by k-means or by a 3-state Gaussian HMM with Baum-Welch.
pub struct RegimeClassifier {
    n_regimes: usize,
    scaler: Option<StandardScaler>,
    model: Option<FittedModel>,
}

impl RegimeClassifier {
    pub fn new(n_regimes: usize) -> Self {
        Self {
            n_regimes,
            scaler: None,
            model: None,
        }
    }

    /// Standardize `features` and fit the chosen model. `seed` drives the
    /// k-means restarts (and the HMM's k-means initialization).
    pub fn fit(
        &mut self,
        features: &[FeatureRow],
        method: RegimeFitMethod,
        seed: u64,
    ) -> CalibrationResult<()> {
        if features.len() < self.n_regimes * 3 {
            return Err(CalibrationError::InsufficientData(format!(
                "{} samples for {} regimes, need at least {}",
                features.len(),
                self.n_regimes,
                self.n_regimes * 3
            )));
        }

        let raw: Vec<[f64; DIM]> = features.iter().map(|f| f.as_array()).collect();
        let scaler = StandardScaler::fit(&raw);
        let scaled: Vec<[f64; DIM]> = raw.iter().map(|x| scaler.transform(x)).collect();

        self.model = Some(match method {
            RegimeFitMethod::KMeans => self.fit_kmeans(&scaled, seed),
            RegimeFitMethod::Hmm => self.fit_hmm(&scaled, seed),
        });
        self.scaler = Some(scaler);
        Ok(())
    }

    fn fit_kmeans(&self, scaled: &[[f64; DIM]], seed: u64) -> FittedModel {
        let result = kmeans::fit(scaled, self.n_regimes, seed, 10);
        let order = risk_order(&result.centers);
        let transition_matrix = estimate_transition_matrix(&result.labels, self.n_regimes);
        let initial_probs = stationary_distribution(&transition_matrix);
        FittedModel::KMeans {
            centers: result.centers,
            order,
            transition_matrix,
            initial_probs,
        }
    }

    fn fit_hmm(&self, scaled: &[[f64; DIM]], seed: u64) -> FittedModel {
        let init = kmeans::fit(scaled, self.n_regimes, seed, 10);
        let mut emissions: Vec<GaussianEmission> = (0..self.n_regimes)
            .map(|k| {
                let members: Vec<&[f64; DIM]> = scaled
                    .iter()
                    .zip(init.labels.iter())
                    .filter(|(_, &l)| l == k)
                    .map(|(x, _)| x)
                    .collect();
                GaussianEmission::from_members(init.centers[k], &members)
            })
            .collect();

        let mut transition_matrix = estimate_transition_matrix(&init.labels, self.n_regimes);
        let mut initial_probs = stationary_distribution(&transition_matrix);

        for _ in 0..50 {
            let (gamma, xi) = hmm::forward_backward(scaled, &emissions, &transition_matrix, &initial_probs);
            let n_samples = scaled.len();

            for k in 0..self.n_regimes {
                let weight_sum: f64 = gamma.iter().map(|row| row[k]).sum();
                if weight_sum > 0.0 {
                    let mut mean = [0.0; DIM];
                    for (t, x) in scaled.iter().enumerate() {
                        for d in 0..DIM {
                            mean[d] += gamma[t][k] * x[d];
                        }
                    }
                    for d in 0..DIM {
                        mean[d] /= weight_sum;
                    }

                    let mut cov = [[0.0; DIM]; DIM];
                    for (t, x) in scaled.iter().enumerate() {
                        let w = gamma[t][k];
                        for a in 0..DIM {
                            for b in 0..DIM {
                                cov[a][b] += w * (x[a] - mean[a]) * (x[b] - mean[b]);
                            }
                        }
                    }
                    for a in 0..DIM {
                        for b in 0..DIM {
                            cov[a][b] /= weight_sum;
                        }
                        cov[a][a] += 0.01;
                    }
                    emissions[k] = GaussianEmission::new(mean, cov);
                }
            }

            for i in 0..self.n_regimes {
                let denom: f64 = (0..n_samples - 1).map(|t| gamma[t][i]).sum();
                for j in 0..self.n_regimes {
                    let numer: f64 = (0..n_samples - 1).map(|t| xi[t][i][j]).sum();
                    transition_matrix[i][j] = if denom > 0.0 { numer / denom } else { 0.0 };
                }
            }
            initial_probs = gamma[0].clone();
        }

        let order = risk_order(&emissions.iter().map(|e| e.mean).collect::<Vec<_>>());

        FittedModel::Hmm {
            emissions,
            order,
            transition_matrix,
            initial_probs,
        }
    }

    /// Classify a single observation.
    ///
    /// `probs` and `transition_matrix` are indexed by cluster/emission
    /// *label* (0..n_regimes, the order k-means or the HMM produced them
    /// in); `order[rank] = label` maps ascending-risk rank to that label.
    /// Regime codes equal rank, so converting a label to a `Regime` means
    /// finding its position in `order`, not indexing `order` by it.
    pub fn classify(&self, features: FeatureRow) -> CalibrationResult<RegimeState> {
        let (scaler, model) = self.require_fit()?;
        let x = scaler.transform(&features.as_array());

        let probs = match model {
            FittedModel::KMeans { centers, .. } => {
                let distances: Vec<f64> = centers.iter().map(|c| euclidean(c, &x)).collect();
                softmax_neg(&distances)
            }
            FittedModel::Hmm { emissions, .. } => emission_probabilities(emissions, &x),
        };

        let (order, transition_matrix) = match model {
            FittedModel::KMeans { order, transition_matrix, .. } => (order, transition_matrix),
            FittedModel::Hmm { order, transition_matrix, .. } => (order, transition_matrix),
        };

        let best_label = argmax(&probs);
        let rank = order.iter().position(|&l| l == best_label).unwrap_or(0);
        let regime = Regime::from_code(rank)
            .ok_or_else(|| CalibrationError::BadArgument("regime index out of range".to_string()))?;

        let mut transition_probs = BTreeMap::new();
        for (j, &label_j) in order.iter().enumerate() {
            if let Some(r) = Regime::from_code(j) {
                transition_probs.insert(r, transition_matrix[best_label][label_j]);
            }
        }

        Ok(RegimeState {
            regime,
            confidence: probs[best_label],
            features,
            transition_probs: Some(transition_probs),
        })
    }

    /// Classify a sequence with Viterbi decoding (HMM) or direct nearest-
    /// cluster assignment (k-means), returning the regime path and the
    /// per-timestep state-probability matrix (rows sum to 1).
    pub fn classify_sequence(
        &self,
        features: &[FeatureRow],
    ) -> CalibrationResult<(Vec<Regime>, Vec<Vec<f64>>)> {
        let (scaler, model) = self.require_fit()?;
        let scaled: Vec<[f64; DIM]> = features.iter().map(|f| scaler.transform(&f.as_array())).collect();

        match model {
            FittedModel::KMeans { centers, order, .. } => {
                let mut sequence = Vec::with_capacity(scaled.len());
                let mut probs = Vec::with_capacity(scaled.len());
                for x in &scaled {
                    let distances: Vec<f64> = centers.iter().map(|c| euclidean(c, x)).collect();
                    let label = argmin(&distances);
                    let rank = order.iter().position(|&l| l == label).unwrap_or(0);
                    let mut row = vec![0.0; self.n_regimes];
                    row[label] = 1.0;
                    sequence.push(
                        Regime::from_code(rank)
                            .ok_or_else(|| CalibrationError::BadArgument("bad regime index".to_string()))?,
                    );
                    probs.push(row);
                }
                Ok((sequence, probs))
            }
            FittedModel::Hmm {
                emissions,
                order,
                transition_matrix,
                initial_probs,
            } => {
                let (path, probs) = hmm::viterbi(&scaled, emissions, transition_matrix, initial_probs);
                let sequence: CalibrationResult<Vec<Regime>> = path
                    .iter()
                    .map(|&label| {
                        let rank = order.iter().position(|&l| l == label).unwrap_or(0);
                        Regime::from_code(rank)
                            .ok_or_else(|| CalibrationError::BadArgument("bad regime index".to_string()))
                    })
                    .collect();
                Ok((sequence?, probs))
            }
        }
    }

    /// `order[rank] = label`, so the label for a given regime code (which
    /// equals its rank) is a direct index, not a search.
    pub fn transition_probability(&self, from: Regime, to: Regime) -> CalibrationResult<f64> {
        let (_, model) = self.require_fit()?;
        let (order, transition_matrix) = match model {
            FittedModel::KMeans { order, transition_matrix, .. } => (order, transition_matrix),
            FittedModel::Hmm { order, transition_matrix, .. } => (order, transition_matrix),
        };
        let from_label = *order
            .get(from.code() as usize)
            .ok_or_else(|| CalibrationError::BadArgument("from_regime not found".to_string()))?;
        let to_label = *order
            .get(to.code() as usize)
            .ok_or_else(|| CalibrationError::BadArgument("to_regime not found".to_string()))?;
        Ok(transition_matrix[from_label][to_label])
    }

    pub fn regime_statistics(&self) -> CalibrationResult<Vec<RegimeStats>> {
        let (scaler, model) = self.require_fit()?;
        let stats = match model {
            FittedModel::KMeans { centers, order, initial_probs, .. } => order
                .iter()
                .enumerate()
                .map(|(rank, &label)| RegimeStats {
                    regime: Regime::from_code(rank).expect("valid regime index"),
                    mean: FeatureRow::from_array(scaler.inverse_transform(&centers[label])),
                    stationary_prob: initial_probs[label],
                })
                .collect(),
            FittedModel::Hmm { emissions, order, initial_probs, .. } => order
                .iter()
                .enumerate()
                .map(|(rank, &label)| RegimeStats {
                    regime: Regime::from_code(rank).expect("valid regime index"),
                    mean: FeatureRow::from_array(scaler.inverse_transform(&emissions[label].mean)),
                    stationary_prob: initial_probs[label],
                })
                .collect(),
        };
        Ok(stats)
    }

    fn require_fit(&self) -> CalibrationResult<(&StandardScaler, &FittedModel)> {
        match (&self.scaler, &self.model) {
            (Some(s), Some(m)) => Ok((s, m)),
            _ => Err(CalibrationError::NotFitted(
                "RegimeClassifier::fit was not called".to_string(),
            )),
        }
    }
}

fn euclidean(a: &[f64; DIM], b: &[f64; DIM]) -> f64 {
    (0..DIM).map(|i| (a[i] - b[i]).powi(2)).sum::<f64>().sqrt()
}

fn softmax_neg(distances: &[f64]) -> Vec<f64> {
    let exp: Vec<f64> = distances.iter().map(|d| (-d).exp()).collect();
    let sum: f64 = exp.iter().sum();
    if sum > 0.0 {
        exp.iter().map(|v| v / sum).collect()
    } else {
        vec![1.0 / distances.len() as f64; distances.len()]
    }
}

fn emission_probabilities(emissions: &[GaussianEmission], x: &[f64; DIM]) -> Vec<f64> {
    let raw: Vec<f64> = emissions.iter().map(|e| e.pdf(x)).collect();
    let sum: f64 = raw.iter().sum();
    if sum > 0.0 {
        raw.iter().map(|v| v / sum).collect()
    } else {
        vec![1.0 / emissions.len() as f64; emissions.len()]
    }
}

fn argmax(v: &[f64]) -> usize {
    v.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn argmin(v: &[f64]) -> usize {
    v.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Ascending order by first feature (volatility) value — lower volatility
/// clusters are mapped to lower-numbered (lower-risk) regimes.
fn risk_order(centers: &[[f64; DIM]]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..centers.len()).collect();
    order.sort_by(|&a, &b| centers[a][0].partial_cmp(&centers[b][0]).unwrap());
    order
}

fn estimate_transition_matrix(labels: &[usize], n_states: usize) -> Vec<Vec<f64>> {
    let mut counts = vec![vec![0.0; n_states]; n_states];
    for w in labels.windows(2) {
        counts[w[0]][w[1]] += 1.0;
    }
    for row in counts.iter_mut() {
        let sum: f64 = row.iter().sum();
        if sum > 0.0 {
            for v in row.iter_mut() {
                *v /= sum;
            }
        } else {
            let n = row.len();
            for v in row.iter_mut() {
                *v = 1.0 / n as f64;
            }
        }
    }
    counts
}

/// Solves `(P^T - I) pi = 0, sum(pi) = 1` by least squares via normal
/// equations, clamped to the simplex.
fn stationary_distribution(p: &[Vec<f64>]) -> Vec<f64> {
    use nalgebra::{DMatrix, DVector};
    let n = p.len();
    let mut a = DMatrix::<f64>::zeros(n + 1, n);
    for i in 0..n {
        for j in 0..n {
            a[(i, j)] = p[j][i] - if i == j { 1.0 } else { 0.0 };
        }
    }
    for j in 0..n {
        a[(n, j)] = 1.0;
    }
    let mut b = DVector::<f64>::zeros(n + 1);
    b[n] = 1.0;

    let ata = a.transpose() * &a;
    let atb = a.transpose() * &b;
    let sol = ata
        .try_inverse()
        .map(|inv| inv * atb)
        .unwrap_or_else(|| DVector::from_element(n, 1.0 / n as f64));

    let mut pi: Vec<f64> = sol.iter().map(|&v| v.max(0.0)).collect();
    let sum: f64 = pi.iter().sum();
    if sum > 0.0 {
        for v in pi.iter_mut() {
            *v /= sum;
        }
    } else {
        pi = vec![1.0 / n as f64; n];
    }
    pi
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_features(n: usize, base: f64, jitter: f64, seed: u64) -> Vec<FeatureRow> {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                FeatureRow {
                    volatility_bps: base + rng.gen_range(-jitter..jitter),
                    max_drawdown_bps: base * 0.5 + rng.gen_range(-jitter..jitter),
                    peg_deviation_bps: base * 0.2 + rng.gen_range(-jitter..jitter),
                    price_range_bps: base * 0.8 + rng.gen_range(-jitter..jitter),
                }
            })
            .collect()
    }

    fn mixed_regime_dataset() -> Vec<FeatureRow> {
        let mut rows = synthetic_features(60, 20.0, 5.0, 1);
        rows.extend(synthetic_features(60, 80.0, 10.0, 2));
        rows.extend(synthetic_features(60, 300.0, 30.0, 3));
        rows
    }

    #[test]
    fn insufficient_samples_is_rejected() {
        let mut classifier = RegimeClassifier::new(3);
        let rows = synthetic_features(4, 20.0, 2.0, 1);
        let err = classifier.fit(&rows, RegimeFitMethod::KMeans, 42).unwrap_err();
        assert!(matches!(err, CalibrationError::InsufficientData(_)));
    }

    #[test]
    fn classify_before_fit_is_not_fitted() {
        let classifier = RegimeClassifier::new(3);
        let row = FeatureRow {
            volatility_bps: 1.0,
            max_drawdown_bps: 1.0,
            peg_deviation_bps: 1.0,
            price_range_bps: 1.0,
        };
        let err = classifier.classify(row).unwrap_err();
        assert!(matches!(err, CalibrationError::NotFitted(_)));
    }

    #[test]
    fn kmeans_separates_calm_and_crisis() {
        let rows = mixed_regime_dataset();
        let mut classifier = RegimeClassifier::new(3);
        classifier.fit(&rows, RegimeFitMethod::KMeans, 7).unwrap();

        let calm = classifier.classify(rows[0]).unwrap();
        let crisis = classifier.classify(rows[rows.len() - 1]).unwrap();
        assert!(calm.regime < crisis.regime);
    }

    #[test]
    fn hmm_separates_calm_and_crisis() {
        let rows = mixed_regime_dataset();
        let mut classifier = RegimeClassifier::new(3);
        classifier.fit(&rows, RegimeFitMethod::Hmm, 7).unwrap();

        let calm = classifier.classify(rows[0]).unwrap();
        let crisis = classifier.classify(rows[rows.len() - 1]).unwrap();
        assert!(calm.regime <= crisis.regime);
    }

    #[test]
    fn classify_sequence_matches_length() {
        let rows = mixed_regime_dataset();
        let mut classifier = RegimeClassifier::new(3);
        classifier.fit(&rows, RegimeFitMethod::Hmm, 7).unwrap();
        let (sequence, probs) = classifier.classify_sequence(&rows).unwrap();
        assert_eq!(sequence.len(), rows.len());
        assert_eq!(probs.len(), rows.len());
        for row in &probs {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn transition_probabilities_sum_to_one() {
        let rows = mixed_regime_dataset();
        let mut classifier = RegimeClassifier::new(3);
        classifier.fit(&rows, RegimeFitMethod::KMeans, 7).unwrap();
        let total: f64 = Regime::ALL
            .iter()
            .map(|&to| classifier.transition_probability(Regime::Calm, to).unwrap())
            .sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn regime_statistics_are_risk_ordered() {
        let rows = mixed_regime_dataset();
        let mut classifier = RegimeClassifier::new(3);
        classifier.fit(&rows, RegimeFitMethod::KMeans, 7).unwrap();
        let stats = classifier.regime_statistics().unwrap();
        assert_eq!(stats.len(), 3);
        assert!(stats[0].mean.volatility_bps < stats[2].mean.volatility_bps);
    }
}

//! Gaussian-emission Hidden Markov Model machinery: emission density,
//! forward-backward (for Baum-Welch re-estimation) and Viterbi decoding.
//! Every step is normalized per-timestep to avoid the underflow a naive
//! product-of-probabilities forward pass would hit over long sequences.

use crate::DIM;
use nalgebra::{SMatrix, SVector};
use std::f64::consts::PI;

/// A single regime's emission distribution: full 4x4 covariance, with its
/// inverse and log-determinant cached so `pdf` avoids refactoring the
/// matrix on every call.
#[derive(Debug, Clone)]
pub struct GaussianEmission {
    pub mean: [f64; DIM],
    cov_inv: SMatrix<f64, DIM, DIM>,
    log_norm_const: f64,
}

impl GaussianEmission {
    pub fn new(mean: [f64; DIM], cov: [[f64; DIM]; DIM]) -> Self {
        let mut cov_matrix = SMatrix::<f64, DIM, DIM>::zeros();
        for i in 0..DIM {
            for j in 0..DIM {
                cov_matrix[(i, j)] = cov[i][j];
            }
        }
        // Regularize: covariance estimated from few points can be singular.
        for i in 0..DIM {
            cov_matrix[(i, i)] += 1e-6;
        }

        let det = cov_matrix.determinant();
        let (cov_inv, log_norm_const) = if det > 1e-300 {
            let inv = cov_matrix.try_inverse().unwrap_or_else(|| SMatrix::identity());
            let log_norm = -0.5 * (DIM as f64 * (2.0 * PI).ln() + det.ln());
            (inv, log_norm)
        } else {
            (SMatrix::identity(), f64::NEG_INFINITY)
        };

        Self { mean, cov_inv, log_norm_const }
    }

    pub fn from_members(center: [f64; DIM], members: &[&[f64; DIM]]) -> Self {
        if members.len() < 2 {
            let mut cov = [[0.0; DIM]; DIM];
            for i in 0..DIM {
                cov[i][i] = 1.0;
            }
            return Self::new(center, cov);
        }

        let n = members.len() as f64;
        let mut mean = [0.0; DIM];
        for m in members {
            for d in 0..DIM {
                mean[d] += m[d] / n;
            }
        }

        let mut cov = [[0.0; DIM]; DIM];
        for m in members {
            for a in 0..DIM {
                for b in 0..DIM {
                    cov[a][b] += (m[a] - mean[a]) * (m[b] - mean[b]) / (n - 1.0);
                }
            }
        }

        Self::new(mean, cov)
    }

    pub fn pdf(&self, x: &[f64; DIM]) -> f64 {
        if self.log_norm_const.is_infinite() {
            return 1e-10;
        }
        let mut diff = SVector::<f64, DIM>::zeros();
        for d in 0..DIM {
            diff[d] = x[d] - self.mean[d];
        }
        let quad = (diff.transpose() * self.cov_inv * diff)[(0, 0)];
        (self.log_norm_const - 0.5 * quad).exp()
    }
}

fn emission_matrix(data: &[[f64; DIM]], emissions: &[GaussianEmission]) -> Vec<Vec<f64>> {
    data.iter()
        .map(|x| emissions.iter().map(|e| e.pdf(x)).collect())
        .collect()
}

/// Forward-backward (Baum-Welch E-step). Returns `gamma[t][k] = P(state_t=k
/// | all observations)` and `xi[t][i][j] = P(state_t=i, state_{t+1}=j |
/// all observations)`.
pub fn forward_backward(
    data: &[[f64; DIM]],
    emissions: &[GaussianEmission],
    transition: &[Vec<f64>],
    initial_probs: &[f64],
) -> (Vec<Vec<f64>>, Vec<Vec<Vec<f64>>>) {
    let n = data.len();
    let k = emissions.len();
    let b = emission_matrix(data, emissions);

    let mut alpha = vec![vec![0.0; k]; n];
    for s in 0..k {
        alpha[0][s] = initial_probs[s] * b[0][s];
    }
    normalize_row(&mut alpha[0]);

    for t in 1..n {
        for s in 0..k {
            alpha[t][s] = (0..k).map(|prev| alpha[t - 1][prev] * transition[prev][s]).sum::<f64>() * b[t][s];
        }
        normalize_row(&mut alpha[t]);
    }

    let mut beta = vec![vec![0.0; k]; n];
    beta[n - 1] = vec![1.0; k];
    for t in (0..n - 1).rev() {
        for s in 0..k {
            beta[t][s] = (0..k).map(|next| transition[s][next] * b[t + 1][next] * beta[t + 1][next]).sum();
        }
        normalize_row(&mut beta[t]);
    }

    let mut gamma = vec![vec![0.0; k]; n];
    for t in 0..n {
        for s in 0..k {
            gamma[t][s] = alpha[t][s] * beta[t][s];
        }
        normalize_row(&mut gamma[t]);
    }

    let mut xi = vec![vec![vec![0.0; k]; k]; n.saturating_sub(1)];
    for t in 0..n.saturating_sub(1) {
        let mut total = 0.0;
        for i in 0..k {
            for j in 0..k {
                let v = alpha[t][i] * transition[i][j] * b[t + 1][j] * beta[t + 1][j];
                xi[t][i][j] = v;
                total += v;
            }
        }
        if total > 0.0 {
            for i in 0..k {
                for j in 0..k {
                    xi[t][i][j] /= total;
                }
            }
        }
    }

    (gamma, xi)
}

/// Viterbi decoding in log-space; returns the most likely state path and a
/// softmax-normalized per-timestep score matrix for reporting confidence.
pub fn viterbi(
    data: &[[f64; DIM]],
    emissions: &[GaussianEmission],
    transition: &[Vec<f64>],
    initial_probs: &[f64],
) -> (Vec<usize>, Vec<Vec<f64>>) {
    let n = data.len();
    let k = emissions.len();
    let b = emission_matrix(data, emissions);

    let mut delta = vec![vec![0.0; k]; n];
    let mut psi = vec![vec![0usize; k]; n];

    for s in 0..k {
        delta[0][s] = (initial_probs[s] + 1e-10).ln() + (b[0][s] + 1e-10).ln();
    }

    for t in 1..n {
        for j in 0..k {
            let (best_prev, best_val) = (0..k)
                .map(|i| (i, delta[t - 1][i] + (transition[i][j] + 1e-10).ln()))
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
                .unwrap();
            psi[t][j] = best_prev;
            delta[t][j] = best_val + (b[t][j] + 1e-10).ln();
        }
    }

    let mut path = vec![0usize; n];
    path[n - 1] = (0..k)
        .max_by(|&a, &b| delta[n - 1][a].partial_cmp(&delta[n - 1][b]).unwrap())
        .unwrap_or(0);
    for t in (0..n - 1).rev() {
        path[t] = psi[t + 1][path[t + 1]];
    }

    let probs: Vec<Vec<f64>> = delta
        .iter()
        .map(|row| {
            let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let exp: Vec<f64> = row.iter().map(|&v| (v - max).exp()).collect();
            let sum: f64 = exp.iter().sum();
            if sum > 0.0 {
                exp.iter().map(|v| v / sum).collect()
            } else {
                vec![1.0 / k as f64; k]
            }
        })
        .collect();

    (path, probs)
}

fn normalize_row(row: &mut [f64]) {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaussian_pdf_peaks_at_the_mean() {
        let cov = [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0]];
        let emission = GaussianEmission::new([0.0, 0.0, 0.0, 0.0], cov);
        let at_mean = emission.pdf(&[0.0, 0.0, 0.0, 0.0]);
        let away = emission.pdf(&[3.0, 0.0, 0.0, 0.0]);
        assert!(at_mean > away);
    }

    #[test]
    fn gamma_rows_sum_to_one() {
        let cov = [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0]];
        let emissions = vec![
            GaussianEmission::new([0.0, 0.0, 0.0, 0.0], cov),
            GaussianEmission::new([5.0, 5.0, 5.0, 5.0], cov),
        ];
        let transition = vec![vec![0.9, 0.1], vec![0.1, 0.9]];
        let initial = vec![0.5, 0.5];
        let data = vec![[0.1, 0.0, 0.0, 0.0], [0.2, 0.1, 0.0, 0.0], [5.1, 4.9, 5.0, 5.1]];
        let (gamma, _) = forward_backward(&data, &emissions, &transition, &initial);
        for row in &gamma {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }
}

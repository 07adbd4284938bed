//! Per-feature z-score standardization, fitted once and reused for both
//! training-time scaling and inference-time transform/inverse-transform.

use crate::DIM;

#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    means: [f64; DIM],
    stds: [f64; DIM],
}

impl StandardScaler {
    pub fn fit(data: &[[f64; DIM]]) -> Self {
        let n = data.len() as f64;
        let mut means = [0.0; DIM];
        for row in data {
            for d in 0..DIM {
                means[d] += row[d] / n;
            }
        }

        let mut variances = [0.0; DIM];
        for row in data {
            for d in 0..DIM {
                variances[d] += (row[d] - means[d]).powi(2) / n;
            }
        }

        let mut stds = [0.0; DIM];
        for d in 0..DIM {
            stds[d] = variances[d].sqrt();
            if stds[d] < 1e-12 {
                stds[d] = 1.0;
            }
        }

        Self { means, stds }
    }

    pub fn transform(&self, x: &[f64; DIM]) -> [f64; DIM] {
        let mut out = [0.0; DIM];
        for d in 0..DIM {
            out[d] = (x[d] - self.means[d]) / self.stds[d];
        }
        out
    }

    pub fn inverse_transform(&self, x: &[f64; DIM]) -> [f64; DIM] {
        let mut out = [0.0; DIM];
        for d in 0..DIM {
            out[d] = x[d] * self.stds[d] + self.means[d];
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_recovers_original() {
        let data = vec![[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0], [9.0, 10.0, 11.0, 12.0]];
        let scaler = StandardScaler::fit(&data);
        for row in &data {
            let scaled = scaler.transform(row);
            let restored = scaler.inverse_transform(&scaled);
            for d in 0..DIM {
                assert!((restored[d] - row[d]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn constant_feature_does_not_divide_by_zero() {
        let data = vec![[5.0, 0.0, 0.0, 0.0]; 5];
        let scaler = StandardScaler::fit(&data);
        let scaled = scaler.transform(&[5.0, 0.0, 0.0, 0.0]);
        assert!(scaled.iter().all(|v| v.is_finite()));
    }
}

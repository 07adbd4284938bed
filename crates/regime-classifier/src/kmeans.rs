//! Plain Lloyd's-algorithm k-means with multiple random restarts, used both
//! as a standalone classifier and to seed the HMM's emission parameters.

use crate::DIM;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

pub struct KMeansResult {
    pub centers: Vec<[f64; DIM]>,
    pub labels: Vec<usize>,
    pub inertia: f64,
}

/// Runs `n_init` random restarts of Lloyd's algorithm and keeps the lowest-
/// inertia result, the same selection rule `sklearn.cluster.KMeans` uses.
pub fn fit(data: &[[f64; DIM]], k: usize, seed: u64, n_init: usize) -> KMeansResult {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut best: Option<KMeansResult> = None;

    for init in 0..n_init {
        let mut indices: Vec<usize> = (0..data.len()).collect();
        indices.shuffle(&mut rng);
        let mut centers: Vec<[f64; DIM]> = indices[..k].iter().map(|&i| data[i]).collect();

        let mut labels = vec![0usize; data.len()];
        for _ in 0..100 {
            let mut changed = false;
            for (i, x) in data.iter().enumerate() {
                let label = nearest(&centers, x);
                if label != labels[i] {
                    labels[i] = label;
                    changed = true;
                }
            }

            let mut sums = vec![[0.0; DIM]; k];
            let mut counts = vec![0usize; k];
            for (x, &label) in data.iter().zip(labels.iter()) {
                counts[label] += 1;
                for d in 0..DIM {
                    sums[label][d] += x[d];
                }
            }
            for c in 0..k {
                if counts[c] > 0 {
                    for d in 0..DIM {
                        centers[c][d] = sums[c][d] / counts[c] as f64;
                    }
                }
            }

            if !changed {
                break;
            }
        }

        let inertia: f64 = data
            .iter()
            .zip(labels.iter())
            .map(|(x, &label)| squared_distance(&centers[label], x))
            .sum();

        let candidate = KMeansResult { centers, labels, inertia };
        let is_better = best.as_ref().map(|b| candidate.inertia < b.inertia).unwrap_or(true);
        if is_better {
            best = Some(candidate);
        }
        let _ = init;
    }

    best.expect("n_init >= 1")
}

fn squared_distance(a: &[f64; DIM], b: &[f64; DIM]) -> f64 {
    (0..DIM).map(|i| (a[i] - b[i]).powi(2)).sum()
}

fn nearest(centers: &[[f64; DIM]], x: &[f64; DIM]) -> usize {
    centers
        .iter()
        .enumerate()
        .map(|(i, c)| (i, squared_distance(c, x)))
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(i, _)| i)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separates_two_well_spaced_clusters() {
        let mut data = vec![];
        for i in 0..20 {
            data.push([i as f64 * 0.01, 0.0, 0.0, 0.0]);
        }
        for i in 0..20 {
            data.push([100.0 + i as f64 * 0.01, 0.0, 0.0, 0.0]);
        }
        let result = fit(&data, 2, 1, 5);
        let first_label = result.labels[0];
        let last_label = result.labels[data.len() - 1];
        assert_ne!(first_label, last_label);
        assert!(result.labels[..20].iter().all(|&l| l == first_label));
        assert!(result.labels[20..].iter().all(|&l| l == last_label));
    }
}

//! Small shared numeric helpers used by every model crate, so the mean/
//! variance/percentile conventions (population vs. sample, interpolation
//! rule) agree everywhere instead of being redefined per crate.

/// Population mean.
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Population variance (divides by n, not n-1) — matches the method-of-moments
/// formulas used for GPD/Hawkes initial guesses, which are derived against
/// population moments.
pub fn variance(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let m = mean(data);
    data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / data.len() as f64
}

pub fn std_dev(data: &[f64]) -> f64 {
    variance(data).sqrt()
}

/// Empirical quantile using linear interpolation between order statistics,
/// matching `numpy.quantile`'s default `linear` method.
pub fn quantile(data: &[f64], q: f64) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = pos - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

/// Pearson correlation coefficient.
pub fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let ma = mean(&a[..n]);
    let mb = mean(&b[..n]);
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for i in 0..n {
        let da = a[i] - ma;
        let db = b[i] - mb;
        cov += da * db;
        va += da * da;
        vb += db * db;
    }
    if va <= 0.0 || vb <= 0.0 {
        0.0
    } else {
        cov / (va.sqrt() * vb.sqrt())
    }
}

/// Ordinary least squares slope of `y` regressed on `x`.
pub fn ols_slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let mx = mean(&x[..n]);
    let my = mean(&y[..n]);
    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..n {
        let dx = x[i] - mx;
        num += dx * (y[i] - my);
        den += dx * dx;
    }
    if den <= 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Nelder-Mead simplex minimisation. No gradient, no external solver crate —
/// just the classic reflect/expand/contract/shrink loop, which is all the
/// low-dimensional GPD/Hawkes MLE fits in this workspace need. `objective`
/// is expected to return a large sentinel (not NaN/inf) for infeasible
/// points so the simplex treats them as merely bad, not undefined.
pub fn nelder_mead(
    objective: impl Fn(&[f64]) -> f64,
    x0: &[f64],
    max_iter: usize,
) -> Vec<f64> {
    let n = x0.len();
    if n == 0 {
        return Vec::new();
    }

    let mut simplex: Vec<Vec<f64>> = vec![x0.to_vec()];
    for i in 0..n {
        let mut point = x0.to_vec();
        let step = if x0[i].abs() > 1e-8 { x0[i] * 0.1 } else { 0.1 };
        point[i] += step;
        simplex.push(point);
    }

    let mut values: Vec<f64> = simplex.iter().map(|p| objective(p)).collect();

    let (alpha, gamma, rho, sigma) = (1.0, 2.0, 0.5, 0.5);

    for _ in 0..max_iter {
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap());
        let simplex_sorted: Vec<Vec<f64>> = order.iter().map(|&i| simplex[i].clone()).collect();
        let values_sorted: Vec<f64> = order.iter().map(|&i| values[i]).collect();
        simplex = simplex_sorted;
        values = values_sorted;

        // Centroid of all but the worst point.
        let mut centroid = vec![0.0; n];
        for point in simplex.iter().take(n) {
            for j in 0..n {
                centroid[j] += point[j] / n as f64;
            }
        }

        let worst = simplex[n].clone();
        let worst_val = values[n];

        let reflected: Vec<f64> = (0..n)
            .map(|j| centroid[j] + alpha * (centroid[j] - worst[j]))
            .collect();
        let reflected_val = objective(&reflected);

        if reflected_val < values[0] {
            let expanded: Vec<f64> = (0..n)
                .map(|j| centroid[j] + gamma * (reflected[j] - centroid[j]))
                .collect();
            let expanded_val = objective(&expanded);
            if expanded_val < reflected_val {
                simplex[n] = expanded;
                values[n] = expanded_val;
            } else {
                simplex[n] = reflected;
                values[n] = reflected_val;
            }
            continue;
        }

        if reflected_val < values[n - 1] {
            simplex[n] = reflected;
            values[n] = reflected_val;
            continue;
        }

        let contracted: Vec<f64> = (0..n)
            .map(|j| centroid[j] + rho * (worst[j] - centroid[j]))
            .collect();
        let contracted_val = objective(&contracted);
        if contracted_val < worst_val {
            simplex[n] = contracted;
            values[n] = contracted_val;
            continue;
        }

        let best = simplex[0].clone();
        for i in 1..=n {
            for j in 0..n {
                simplex[i][j] = best[j] + sigma * (simplex[i][j] - best[j]);
            }
            values[i] = objective(&simplex[i]);
        }
    }

    let best_idx = (0..=n)
        .min_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap())
        .unwrap();
    simplex[best_idx].clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_std_of_constant_is_zero_variance() {
        let data = vec![3.0; 10];
        assert_eq!(mean(&data), 3.0);
        assert_eq!(std_dev(&data), 0.0);
    }

    #[test]
    fn quantile_matches_linear_interpolation() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        assert!((quantile(&data, 0.5) - 2.5).abs() < 1e-9);
        assert_eq!(quantile(&data, 0.0), 1.0);
        assert_eq!(quantile(&data, 1.0), 4.0);
    }

    #[test]
    fn correlation_of_identical_series_is_one() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((correlation(&data, &data) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn nelder_mead_finds_quadratic_minimum() {
        let f = |p: &[f64]| (p[0] - 3.0).powi(2) + (p[1] + 2.0).powi(2);
        let result = nelder_mead(f, &[0.0, 0.0], 500);
        assert!((result[0] - 3.0).abs() < 1e-2);
        assert!((result[1] + 2.0).abs() < 1e-2);
    }
}

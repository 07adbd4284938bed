//! Univariate Hawkes self-exciting point process with an exponential kernel
//! `λ(t) = λ0 + Σ_i α·exp(-β(t - ti))`, used to model clustering of depeg
//! events (one depeg raises the near-term odds of another).

use depeg_core::stats::{mean, nelder_mead, variance};
use depeg_core::{CalibrationError, CalibrationResult, HawkesParams};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Fitting method for `HawkesProcess::fit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HawkesFitMethod {
    Mle,
    Em,
}

/// Residual-based goodness-of-fit diagnostics. Under correct specification
/// the compensator-transformed inter-arrival times are i.i.d. Exponential(1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HawkesDiagnostics {
    pub ks_statistic: f64,
    pub ks_pvalue: f64,
    pub ljung_box_statistic: f64,
    pub ljung_box_pvalue: f64,
    pub mean_residual: f64,
    pub var_residual: f64,
}

/// Fitted Hawkes model bound to the event history it was fitted on.
#[derive(Debug, Clone, Default)]
pub struct HawkesProcess {
    params: Option<HawkesParams>,
    event_times: Vec<f64>,
    t_max: f64,
}

impl HawkesProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fit to sorted event times (days from window start). `t_max` is the
    /// observation horizon; if `None`, `1.1 * max(event_times)` is used, a
    /// 10% buffer so the last event isn't treated as the window boundary.
    pub fn fit(
        &mut self,
        event_times: &[f64],
        t_max: Option<f64>,
        method: HawkesFitMethod,
    ) -> CalibrationResult<HawkesParams> {
        if event_times.len() < 3 {
            return Err(CalibrationError::InsufficientData(format!(
                "{} events, need >= 3 for Hawkes fitting",
                event_times.len()
            )));
        }

        let mut sorted = event_times.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let t_max = t_max.unwrap_or_else(|| sorted[sorted.len() - 1] * 1.1);

        let params = match method {
            HawkesFitMethod::Mle => fit_mle(&sorted, t_max),
            HawkesFitMethod::Em => fit_em(&sorted, t_max),
        };

        if !params.is_stable() {
            return Err(CalibrationError::UnstableFit(format!(
                "branching ratio {:.3} >= 1, process is supercritical",
                params.branching_ratio()
            )));
        }

        self.event_times = sorted;
        self.t_max = t_max;
        self.params = Some(params);
        Ok(params)
    }

    /// `λ(t) = λ0 + Σ α·exp(-β(t-ti))` over past events. Uses the fitted
    /// history unless `event_times` is supplied (for out-of-sample queries).
    pub fn intensity(&self, t: f64, event_times: Option<&[f64]>) -> CalibrationResult<f64> {
        let params = self.require_fit()?;
        let history = event_times.unwrap_or(&self.event_times);
        let excitation: f64 = history
            .iter()
            .filter(|&&ti| ti < t)
            .map(|&ti| params.alpha * (-params.beta * (t - ti)).exp())
            .sum();
        Ok(params.lambda0 + excitation)
    }

    /// Compensator `Λ(t_start, t_end) = ∫ λ(s) ds`.
    pub fn integrated_intensity(
        &self,
        t_start: f64,
        t_end: f64,
        event_times: Option<&[f64]>,
    ) -> CalibrationResult<f64> {
        let params = self.require_fit()?;
        let history = event_times.unwrap_or(&self.event_times);

        let mut compensator = params.lambda0 * (t_end - t_start);
        for &ti in history.iter().filter(|&&ti| ti < t_end) {
            compensator += if ti >= t_start {
                (params.alpha / params.beta) * (1.0 - (-params.beta * (t_end - ti)).exp())
            } else {
                (params.alpha / params.beta)
                    * ((-params.beta * (t_start - ti)).exp() - (-params.beta * (t_end - ti)).exp())
            };
        }
        Ok(compensator)
    }

    /// `P(N(T) = 0) = exp(-Λ(0, T))`.
    pub fn probability_no_events(&self, t: f64, event_times: Option<&[f64]>) -> CalibrationResult<f64> {
        Ok((-self.integrated_intensity(0.0, t, event_times)?).exp())
    }

    /// `E[N(T)] = Λ(0, T)`.
    pub fn expected_events(&self, t: f64, event_times: Option<&[f64]>) -> CalibrationResult<f64> {
        self.integrated_intensity(0.0, t, event_times)
    }

    /// Simulate future events via Ogata's thinning algorithm over horizon
    /// `t` (days), optionally conditioned on `event_history` (times `< 0`
    /// relative to the simulation origin).
    pub fn simulate(
        &self,
        t_horizon: f64,
        seed: u64,
        event_history: Option<&[f64]>,
    ) -> CalibrationResult<Vec<f64>> {
        let params = self.require_fit()?;
        let mut rng = StdRng::seed_from_u64(seed);

        let mut events: Vec<f64> = event_history
            .map(|h| h.iter().cloned().filter(|&e| e < 0.0).collect())
            .unwrap_or_default();

        let mut t = 0.0;
        let mut lambda_bar = if params.is_stable() {
            params.lambda0 / (1.0 - params.branching_ratio())
        } else {
            100.0
        };

        while t < t_horizon {
            let u: f64 = rng.gen_range(1e-12..1.0);
            let dt = -u.ln() / lambda_bar;
            t += dt;
            if t >= t_horizon {
                break;
            }

            let lambda_t = params.lambda0
                + events
                    .iter()
                    .filter(|&&ti| ti < t)
                    .map(|&ti| params.alpha * (-params.beta * (t - ti)).exp())
                    .sum::<f64>();

            if rng.gen_range(0.0..1.0) < lambda_t / lambda_bar {
                events.push(t);
                lambda_bar = lambda_bar.max(lambda_t + params.alpha);
            }
        }

        Ok(events.into_iter().filter(|&e| e >= 0.0).collect())
    }

    /// KS test of compensator-transformed residuals against Exponential(1),
    /// plus a Ljung-Box test for residual autocorrelation at lag 10.
    pub fn residual_analysis(&self) -> CalibrationResult<HawkesDiagnostics> {
        self.require_fit()?;
        let n = self.event_times.len();
        if n < 2 {
            return Ok(HawkesDiagnostics {
                ks_statistic: 0.0,
                ks_pvalue: 1.0,
                ljung_box_statistic: 0.0,
                ljung_box_pvalue: 1.0,
                mean_residual: 0.0,
                var_residual: 0.0,
            });
        }

        let mut residuals = vec![0.0; n];
        residuals[0] = self.integrated_intensity(0.0, self.event_times[0], Some(&[]))?;
        for i in 1..n {
            residuals[i] = self.integrated_intensity(
                self.event_times[i - 1],
                self.event_times[i],
                Some(&self.event_times[..i]),
            )?;
        }

        let (ks_statistic, ks_pvalue) = ks_test_exponential(&residuals);
        let (ljung_box_statistic, ljung_box_pvalue) = ljung_box_test(&residuals, 10);

        Ok(HawkesDiagnostics {
            ks_statistic,
            ks_pvalue,
            ljung_box_statistic,
            ljung_box_pvalue,
            mean_residual: mean(&residuals),
            var_residual: variance(&residuals),
        })
    }

    pub fn params(&self) -> Option<HawkesParams> {
        self.params
    }

    fn require_fit(&self) -> CalibrationResult<HawkesParams> {
        self.params.ok_or_else(|| {
            CalibrationError::NotFitted("HawkesProcess::fit was not called".to_string())
        })
    }
}

fn fit_mle(event_times: &[f64], t_max: f64) -> HawkesParams {
    let n = event_times.len();
    let mean_rate = n as f64 / t_max;

    // Reparameterize as (log lambda0, logit(alpha/beta), log beta) so the
    // positivity and subcriticality (alpha < beta) constraints the original
    // enforced via a penalty term hold by construction instead.
    let neg_log_likelihood = |p: &[f64]| -> f64 {
        let lambda0 = p[0].exp();
        let beta = p[2].exp();
        let branching = 1.0 / (1.0 + (-p[1]).exp());
        let alpha = branching * beta;

        let mut ll = 0.0;
        let mut a_prev = 0.0;
        for i in 0..n {
            let a_i = if i > 0 {
                (-beta * (event_times[i] - event_times[i - 1])).exp() * (1.0 + a_prev)
            } else {
                0.0
            };
            ll += (lambda0 + alpha * a_i).ln();
            a_prev = a_i;
        }

        let mut compensator = lambda0 * t_max;
        for &ti in event_times {
            compensator += (alpha / beta) * (1.0 - (-beta * (t_max - ti)).exp());
        }
        ll -= compensator;

        -ll
    };

    let x0 = [
        (mean_rate * 0.5).max(1e-6).ln(),
        0.0_f64, // branching ratio ~0.5 at the logit midpoint
        1.0_f64.ln(),
    ];
    let solution = nelder_mead(neg_log_likelihood, &x0, 3000);

    let lambda0 = solution[0].exp();
    let beta = solution[2].exp();
    let branching = 1.0 / (1.0 + (-solution[1]).exp());
    let alpha = branching * beta;

    HawkesParams { lambda0, alpha, beta }
}

fn fit_em(event_times: &[f64], t_max: f64) -> HawkesParams {
    let n = event_times.len();
    let mean_rate = n as f64 / t_max;

    let mut lambda0 = mean_rate * 0.5;
    let mut alpha = mean_rate * 0.3;
    let mut beta = 1.0_f64;

    for _ in 0..100 {
        let mut p = vec![vec![0.0; n]; n];
        for i in 0..n {
            let mut denom = lambda0;
            for j in 0..i {
                let kernel = alpha * (-beta * (event_times[i] - event_times[j])).exp();
                p[i][j] = kernel;
                denom += kernel;
            }
            if denom > 0.0 {
                for j in 0..i {
                    p[i][j] /= denom;
                }
            }
        }

        let sum_p: f64 = p.iter().flatten().sum();
        let lambda0_new = (n as f64 - sum_p) / t_max;

        let (alpha_new, beta_new) = if sum_p > 0.0 {
            let mut weighted_sum = 0.0;
            for i in 0..n {
                for j in 0..i {
                    weighted_sum += p[i][j] * (event_times[i] - event_times[j]);
                }
            }
            let beta_new = if weighted_sum > 0.0 {
                sum_p / weighted_sum
            } else {
                beta
            };
            let alpha_new = sum_p / n as f64 * beta_new;
            (alpha_new, beta_new)
        } else {
            (alpha, beta)
        };

        let converged = (lambda0_new - lambda0).abs() < 1e-6
            && (alpha_new - alpha).abs() < 1e-6
            && (beta_new - beta).abs() < 1e-6;

        lambda0 = lambda0_new;
        alpha = alpha_new;
        beta = beta_new;

        if converged {
            break;
        }
    }

    HawkesParams { lambda0, alpha, beta }
}

/// One-sample Kolmogorov-Smirnov statistic against Exponential(rate=1), with
/// the Marsaglia-Tsang-Wang-style asymptotic p-value approximation.
fn ks_test_exponential(residuals: &[f64]) -> (f64, f64) {
    let n = residuals.len();
    let mut sorted = residuals.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mut d = 0.0_f64;
    for (i, &x) in sorted.iter().enumerate() {
        let cdf = if x <= 0.0 { 0.0 } else { 1.0 - (-x).exp() };
        let d_plus = (i + 1) as f64 / n as f64 - cdf;
        let d_minus = cdf - i as f64 / n as f64;
        d = d.max(d_plus).max(d_minus);
    }

    let sqrt_n = (n as f64).sqrt();
    let lambda = (sqrt_n + 0.12 + 0.11 / sqrt_n) * d;
    let mut q = 0.0;
    for k in 1..=100 {
        let term = (-2.0 * (k as f64).powi(2) * lambda.powi(2)).exp();
        q += if k % 2 == 1 { 2.0 * term } else { -2.0 * term };
    }
    (d, q.clamp(0.0, 1.0))
}

/// Ljung-Box portmanteau test for residual autocorrelation up to `max_lag`.
fn ljung_box_test(residuals: &[f64], max_lag: usize) -> (f64, f64) {
    let n = residuals.len();
    if n <= max_lag + 1 {
        return (0.0, 1.0);
    }
    let m = mean(residuals);
    let denom: f64 = residuals.iter().map(|x| (x - m).powi(2)).sum();
    if denom <= 0.0 {
        return (0.0, 1.0);
    }

    let autocorr = |k: usize| -> f64 {
        let numer: f64 = (0..n - k).map(|t| (residuals[t] - m) * (residuals[t + k] - m)).sum();
        numer / denom
    };

    let q: f64 = (1..=max_lag)
        .map(|k| {
            let rho_k = autocorr(k);
            rho_k.powi(2) / (n - k) as f64
        })
        .sum::<f64>()
        * n as f64
        * (n as f64 + 2.0);

    let chi2 = ChiSquared::new(max_lag as f64).expect("positive degrees of freedom");
    let p_value = 1.0 - chi2.cdf(q);
    (q, p_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_events_is_rejected() {
        let mut model = HawkesProcess::new();
        let err = model
            .fit(&[1.0, 2.0], None, HawkesFitMethod::Mle)
            .unwrap_err();
        assert!(matches!(err, CalibrationError::InsufficientData(_)));
    }

    #[test]
    fn query_before_fit_is_not_fitted() {
        let model = HawkesProcess::new();
        let err = model.intensity(1.0, None).unwrap_err();
        assert!(matches!(err, CalibrationError::NotFitted(_)));
    }

    #[test]
    fn fitted_process_is_subcritical() {
        let events = vec![1.0, 5.0, 5.5, 12.0, 30.0, 31.0, 45.0, 60.0, 61.0, 90.0];
        let mut model = HawkesProcess::new();
        let params = model
            .fit(&events, Some(100.0), HawkesFitMethod::Mle)
            .unwrap();
        assert!(params.is_stable());
        assert!(params.lambda0 > 0.0);
        assert!(params.alpha > 0.0);
        assert!(params.beta > 0.0);
    }

    #[test]
    fn intensity_jumps_right_after_an_event() {
        let events = vec![1.0, 5.0, 5.5, 12.0, 30.0, 31.0, 45.0, 60.0, 61.0, 90.0];
        let mut model = HawkesProcess::new();
        model
            .fit(&events, Some(100.0), HawkesFitMethod::Mle)
            .unwrap();
        let before = model.intensity(4.999, None).unwrap();
        let after = model.intensity(5.001, None).unwrap();
        assert!(after > before);
    }

    #[test]
    fn probability_no_events_decreases_with_horizon() {
        let events = vec![1.0, 5.0, 5.5, 12.0, 30.0, 31.0, 45.0, 60.0, 61.0, 90.0];
        let mut model = HawkesProcess::new();
        model
            .fit(&events, Some(100.0), HawkesFitMethod::Mle)
            .unwrap();
        let p_short = model.probability_no_events(10.0, None).unwrap();
        let p_long = model.probability_no_events(90.0, None).unwrap();
        assert!(p_long < p_short);
    }

    #[test]
    fn em_and_mle_agree_on_stability() {
        let events = vec![1.0, 5.0, 5.5, 12.0, 30.0, 31.0, 45.0, 60.0, 61.0, 90.0];
        let mut model = HawkesProcess::new();
        let params = model
            .fit(&events, Some(100.0), HawkesFitMethod::Em)
            .unwrap();
        assert!(params.is_stable());
    }

    #[test]
    fn simulated_events_land_within_horizon() {
        let events = vec![1.0, 5.0, 5.5, 12.0, 30.0, 31.0, 45.0, 60.0, 61.0, 90.0];
        let mut model = HawkesProcess::new();
        model
            .fit(&events, Some(100.0), HawkesFitMethod::Mle)
            .unwrap();
        let simulated = model.simulate(50.0, 99, None).unwrap();
        assert!(simulated.iter().all(|&t| (0.0..50.0).contains(&t)));
        assert!(simulated.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn residual_analysis_returns_finite_diagnostics() {
        let events = vec![1.0, 5.0, 5.5, 12.0, 30.0, 31.0, 45.0, 60.0, 61.0, 90.0];
        let mut model = HawkesProcess::new();
        model
            .fit(&events, Some(100.0), HawkesFitMethod::Mle)
            .unwrap();
        let diag = model.residual_analysis().unwrap();
        assert!(diag.ks_statistic.is_finite());
        assert!((0.0..=1.0).contains(&diag.ks_pvalue));
    }
}

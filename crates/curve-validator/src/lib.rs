//! Validates calibrated hazard curves against actuarial expectations:
//! monotonicity, Brier-score calibration quality against historical
//! triggers, and expected-loss drift against an external payout model.

use depeg_core::{Regime, RegimeCurveSet, HAZARD_SCALE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// The on-chain payout curve's shape parameters, needed to simulate expected
/// loss independently of the hazard curve under test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayoutCurveParams {
    pub max_deviation_bps: f64,
    pub threshold_hours: f64,
    pub severity_exponent: f64,
}

impl Default for PayoutCurveParams {
    fn default() -> Self {
        Self {
            max_deviation_bps: 3000.0,
            threshold_hours: 168.0,
            severity_exponent: 2.0,
        }
    }
}

/// Validation outcome for a single regime's curve.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub monotonicity_check: bool,
    pub brier_score: f64,
    pub calibration_drift: f64,
    pub expected_loss_ratio: f64,
    pub warnings: Vec<String>,
}

pub struct CurveValidator {
    payout_curve: PayoutCurveParams,
    tolerance: f64,
}

impl CurveValidator {
    pub fn new(payout_curve: PayoutCurveParams, tolerance: f64) -> Self {
        Self { payout_curve, tolerance }
    }

    /// Validate every regime's curve. `historical_event_tenors`, if given,
    /// are the day-offsets at which historical triggers actually occurred —
    /// used only to compute the Brier score, which stays `0.0` without them.
    pub fn validate(
        &self,
        curves: &RegimeCurveSet,
        historical_event_tenors: Option<&[f64]>,
        n_simulations: usize,
        seed: u64,
    ) -> BTreeMap<Regime, ValidationResult> {
        let mut results = BTreeMap::new();
        for &regime in Regime::ALL.iter() {
            let curve = curves.curve(regime);
            results.insert(
                regime,
                self.validate_single_curve(curve, historical_event_tenors, n_simulations, seed),
            );
        }
        results
    }

    fn validate_single_curve(
        &self,
        curve: &depeg_core::HazardCurve,
        historical_event_tenors: Option<&[f64]>,
        n_simulations: usize,
        seed: u64,
    ) -> ValidationResult {
        let mut warnings = Vec::new();

        let monotonic = curve.is_monotonic();
        if !monotonic {
            warnings.push("Hazard curve is not monotonically increasing".to_string());
            tracing::warn!(monotonic, "curve failed validation");
            // A non-monotone curve violates the invariant `interpolate` assumes
            // for its piecewise segments; the Brier/drift checks below depend
            // on `interpolate`, so skip them rather than report a number
            // derived from an invariant-violating curve.
            return ValidationResult {
                is_valid: false,
                monotonicity_check: false,
                brier_score: 0.0,
                calibration_drift: 0.0,
                expected_loss_ratio: 0.0,
                warnings,
            };
        }

        let brier_score = historical_event_tenors
            .map(|events| self.compute_brier_score(curve, events))
            .unwrap_or(0.0);
        if brier_score > 0.1 {
            warnings.push(format!("High Brier score: {brier_score:.4}"));
        }

        let (el_ratio, drift) = self.check_expected_loss(curve, n_simulations, seed);
        if drift > self.tolerance {
            warnings.push(format!(
                "Calibration drift {:.2}% exceeds tolerance {:.2}%",
                drift * 100.0,
                self.tolerance * 100.0
            ));
        }

        let is_valid = drift <= self.tolerance;
        if !is_valid {
            tracing::warn!(monotonic, drift, tolerance = self.tolerance, "curve failed validation");
        }

        ValidationResult {
            is_valid,
            monotonicity_check: monotonic,
            brier_score,
            calibration_drift: drift,
            expected_loss_ratio: el_ratio,
            warnings,
        }
    }

    fn compute_brier_score(&self, curve: &depeg_core::HazardCurve, historical_event_tenors: &[f64]) -> f64 {
        let mut errors = Vec::with_capacity(3);
        for &tenor in &[7, 30, 90] {
            let h = curve.interpolate(tenor) as f64 / HAZARD_SCALE;
            let predicted_prob = 1.0 - (-h).exp();

            let actual_rate = if historical_event_tenors.is_empty() {
                0.0
            } else {
                historical_event_tenors.iter().filter(|&&t| t <= tenor as f64).count() as f64
                    / historical_event_tenors.len() as f64
            };

            errors.push((predicted_prob - actual_rate).powi(2));
        }
        errors.iter().sum::<f64>() / errors.len() as f64
    }

    /// Compares the curve's implied 30-day expected loss against an
    /// independent Monte Carlo simulation of the payout model. Returns
    /// `(expected_loss_ratio, |ratio - 1|)`.
    fn check_expected_loss(&self, curve: &depeg_core::HazardCurve, n_simulations: usize, seed: u64) -> (f64, f64) {
        const POLICY_LIMIT: f64 = 100_000.0;
        const TENOR: i64 = 30;

        let h = curve.interpolate(TENOR) as f64 / HAZARD_SCALE;
        let curve_el = POLICY_LIMIT * h;
        let trigger_prob = 1.0 - (-h).exp();

        let mut rng = StdRng::seed_from_u64(seed);
        let mut total_payout = 0.0;
        for _ in 0..n_simulations {
            let u: f64 = rng.gen_range(0.0..1.0);
            if u < trigger_prob {
                let depeg_bps = (-rng.gen_range(1e-12..1.0_f64).ln() * 500.0).min(self.payout_curve.max_deviation_bps);
                let duration_hours =
                    (-rng.gen_range(1e-12..1.0_f64).ln() * 48.0).min(self.payout_curve.threshold_hours * 2.0);
                total_payout += self.calculate_payout(POLICY_LIMIT, depeg_bps, duration_hours);
            }
        }
        let simulated_el = total_payout / n_simulations as f64;

        if simulated_el > 0.0 {
            let el_ratio = curve_el / simulated_el;
            (el_ratio, (el_ratio - 1.0).abs())
        } else {
            (1.0, 0.0)
        }
    }

    /// `payout = limit * (min(depeg/max, 1)^exponent) * min(duration/threshold, 1)`
    /// — the on-chain payout curve formula.
    fn calculate_payout(&self, policy_limit: f64, depeg_bps: f64, duration_hours: f64) -> f64 {
        let pc = &self.payout_curve;
        let severity_factor = (depeg_bps / pc.max_deviation_bps).min(1.0).powf(pc.severity_exponent);
        let duration_factor = (duration_hours / pc.threshold_hours).min(1.0);
        policy_limit * severity_factor * duration_factor
    }

    /// Human-readable summary, in regime (risk) order.
    pub fn generate_report(&self, results: &BTreeMap<Regime, ValidationResult>) -> String {
        let mut lines = vec!["=".repeat(60), "HAZARD CURVE VALIDATION REPORT".to_string(), "=".repeat(60), String::new()];

        let mut all_valid = true;
        for &regime in Regime::ALL.iter() {
            let Some(result) = results.get(&regime) else { continue };
            all_valid &= result.is_valid;

            lines.push(format!("Regime: {}", regime.name()));
            lines.push(format!("  Status: {}", if result.is_valid { "PASS" } else { "FAIL" }));
            lines.push(format!("  Monotonicity: {}", if result.monotonicity_check { "OK" } else { "FAIL" }));
            lines.push(format!("  Brier Score: {:.4}", result.brier_score));
            lines.push(format!("  Calibration Drift: {:.2}%", result.calibration_drift * 100.0));
            lines.push(format!("  EL Ratio: {:.2}", result.expected_loss_ratio));

            if !result.warnings.is_empty() {
                lines.push("  Warnings:".to_string());
                for w in &result.warnings {
                    lines.push(format!("    - {w}"));
                }
            }
            lines.push(String::new());
        }

        lines.push("=".repeat(60));
        lines.push(format!("OVERALL: {}", if all_valid { "PASS" } else { "FAIL" }));
        lines.push("=".repeat(60));

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depeg_core::HazardCurve;

    fn monotonic_curve(regime: Regime) -> HazardCurve {
        HazardCurve {
            regime,
            h_7: 1_000_000_000_000_000,
            h_30: 5_000_000_000_000_000,
            h_90: 15_000_000_000_000_000,
            tail_slope: 100_000_000_000_000,
        }
    }

    fn non_monotonic_curve(regime: Regime) -> HazardCurve {
        HazardCurve {
            regime,
            h_7: 5_000_000_000_000_000,
            h_30: 1_000_000_000_000_000,
            h_90: 15_000_000_000_000_000,
            tail_slope: 100_000_000_000_000,
        }
    }

    fn curve_set(calm: HazardCurve, volatile: HazardCurve, crisis: HazardCurve) -> RegimeCurveSet {
        RegimeCurveSet {
            peril_id: "USDC_depeg".to_string(),
            calm,
            volatile,
            crisis,
            min_premium_bps: 25,
            max_multiplier_bps: 30_000,
        }
    }

    #[test]
    fn monotonic_curves_pass_the_monotonicity_check() {
        let validator = CurveValidator::new(PayoutCurveParams::default(), 0.05);
        let curves = curve_set(
            monotonic_curve(Regime::Calm),
            monotonic_curve(Regime::Volatile),
            monotonic_curve(Regime::Crisis),
        );
        let results = validator.validate(&curves, None, 500, 1);
        assert!(results[&Regime::Calm].monotonicity_check);
    }

    #[test]
    fn non_monotonic_curve_fails_and_warns() {
        let validator = CurveValidator::new(PayoutCurveParams::default(), 0.05);
        let curves = curve_set(
            non_monotonic_curve(Regime::Calm),
            monotonic_curve(Regime::Volatile),
            monotonic_curve(Regime::Crisis),
        );
        let results = validator.validate(&curves, None, 500, 1);
        let calm_result = &results[&Regime::Calm];
        assert!(!calm_result.monotonicity_check);
        assert!(!calm_result.is_valid);
        assert!(!calm_result.warnings.is_empty());
    }

    #[test]
    fn report_mentions_every_regime() {
        let validator = CurveValidator::new(PayoutCurveParams::default(), 0.05);
        let curves = curve_set(
            monotonic_curve(Regime::Calm),
            monotonic_curve(Regime::Volatile),
            monotonic_curve(Regime::Crisis),
        );
        let results = validator.validate(&curves, None, 200, 1);
        let report = validator.generate_report(&results);
        assert!(report.contains("CALM"));
        assert!(report.contains("VOLATILE"));
        assert!(report.contains("CRISIS"));
        assert!(report.contains("OVERALL"));
    }

    #[test]
    fn deterministic_for_fixed_seed() {
        let validator = CurveValidator::new(PayoutCurveParams::default(), 0.05);
        let curve = monotonic_curve(Regime::Calm);
        let a = validator.check_expected_loss(&curve, 500, 99);
        let b = validator.check_expected_loss(&curve, 500, 99);
        assert_eq!(a, b);
    }
}

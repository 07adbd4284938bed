use serde::{Deserialize, Serialize};

/// Latent market regime. Ordering is meaningful: rising numeric value is
/// rising risk, and downstream code (the calibrator, the classifier's risk
/// ordering) assumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Regime {
    Calm = 0,
    Volatile = 1,
    Crisis = 2,
}

impl Regime {
    pub const ALL: [Regime; 3] = [Regime::Calm, Regime::Volatile, Regime::Crisis];

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: usize) -> Option<Regime> {
        match code {
            0 => Some(Regime::Calm),
            1 => Some(Regime::Volatile),
            2 => Some(Regime::Crisis),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Regime::Calm => "CALM",
            Regime::Volatile => "VOLATILE",
            Regime::Crisis => "CRISIS",
        }
    }
}

/// Generalized Pareto Distribution parameters fitted over a Peaks-Over-Threshold
/// excess sample.
///
/// Invariants: `n_excesses <= n_total`, `beta > 0`. `xi == 0.0` is the
/// degenerate exponential branch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpdParams {
    pub xi: f64,
    pub beta: f64,
    pub threshold: f64,
    pub n_excesses: usize,
    pub n_total: usize,
}

impl GpdParams {
    pub fn is_heavy_tailed(&self) -> bool {
        self.xi > 0.0
    }
}

/// Generalized Extreme Value parameters fitted over block maxima.
///
/// `xi` follows the *negative* of the common statistics-library shape
/// convention (see `EvtModel::fit_block_maxima`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GevParams {
    pub xi: f64,
    pub mu: f64,
    pub sigma: f64,
    pub block_size: usize,
}

/// Hawkes self-exciting process parameters with exponential kernel
/// `λ(t) = λ0 + α * Σ exp(-β(t - ti))`.
///
/// Invariant: `alpha < beta` (branching ratio < 1, i.e. subcritical);
/// a fit violating this is rejected by `HawkesProcess::fit`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HawkesParams {
    pub lambda0: f64,
    pub alpha: f64,
    pub beta: f64,
}

impl HawkesParams {
    pub fn branching_ratio(&self) -> f64 {
        if self.beta > 0.0 {
            self.alpha / self.beta
        } else {
            f64::INFINITY
        }
    }

    pub fn is_stable(&self) -> bool {
        self.branching_ratio() < 1.0
    }

    pub fn mean_intensity(&self) -> f64 {
        let br = self.branching_ratio();
        if br >= 1.0 {
            f64::INFINITY
        } else {
            self.lambda0 / (1.0 - br)
        }
    }
}

/// A single depeg event: day offset from the start of the observation
/// window and the magnitude of the deviation from peg, in basis points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepegEvent {
    pub time_days: f64,
    pub magnitude_bps: f64,
}

/// One standardised feature row extracted from a sliding window of prices:
/// annualised volatility, max drawdown, peg deviation, price range — all in
/// basis points before standardisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub volatility_bps: f64,
    pub max_drawdown_bps: f64,
    pub peg_deviation_bps: f64,
    pub price_range_bps: f64,
}

impl FeatureRow {
    pub const DIM: usize = 4;

    pub fn as_array(&self) -> [f64; Self::DIM] {
        [
            self.volatility_bps,
            self.max_drawdown_bps,
            self.peg_deviation_bps,
            self.price_range_bps,
        ]
    }

    pub fn from_array(a: [f64; Self::DIM]) -> Self {
        Self {
            volatility_bps: a[0],
            max_drawdown_bps: a[1],
            peg_deviation_bps: a[2],
            price_range_bps: a[3],
        }
    }
}

/// Regime assignment for a single observation, with confidence and the
/// standardised feature values that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: Regime,
    pub confidence: f64,
    pub features: FeatureRow,
    pub transition_probs: Option<std::collections::BTreeMap<Regime, f64>>,
}

/// A single regime's cumulative hazard curve at the three fixed tenors,
/// integer-scaled by 1e18 for the on-chain consumer.
///
/// Invariants: `0 <= h_7 <= h_30 <= h_90`, `tail_slope >= 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HazardCurve {
    pub regime: Regime,
    pub h_7: u128,
    pub h_30: u128,
    pub h_90: u128,
    pub tail_slope: u128,
}

/// Scale factor applied to real-valued cumulative hazard before truncation
/// to an on-chain integer.
pub const HAZARD_SCALE: f64 = 1e18;

impl HazardCurve {
    /// Piecewise-linear interpolation matched bit-exactly (floor division
    /// on integers) by the consuming smart contract.
    ///
    /// Segment deltas (`h_30 - h_7`, `h_90 - h_30`) are computed in `i128`
    /// rather than on the unsigned fields directly: a non-monotone curve
    /// (an invariant violation the validator, not this method, is
    /// responsible for catching) would otherwise underflow the `u128`
    /// subtraction and panic or wrap. Division uses `div_euclid`, which
    /// floors towards negative infinity for a positive divisor — matching
    /// the original's signed floor (`//`) division — rather than Rust's
    /// default truncating division. The final result is clamped at 0
    /// before converting back to `u128`.
    pub fn interpolate(&self, tenor_days: i64) -> u128 {
        if tenor_days <= 0 {
            return 0;
        }

        let h7 = self.h_7 as i128;
        let h30 = self.h_30 as i128;
        let h90 = self.h_90 as i128;
        let slope = self.tail_slope as i128;
        let t = tenor_days as i128;

        let value = if tenor_days <= 7 {
            (h7 * t).div_euclid(7)
        } else if tenor_days <= 30 {
            h7 + ((h30 - h7) * (t - 7)).div_euclid(23)
        } else if tenor_days <= 90 {
            h30 + ((h90 - h30) * (t - 30)).div_euclid(60)
        } else {
            h90 + slope * (t - 90)
        };

        value.max(0) as u128
    }

    pub fn is_monotonic(&self) -> bool {
        self.h_7 <= self.h_30 && self.h_30 <= self.h_90
    }
}

/// Complete set of hazard curves for all three regimes, for one peril.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeCurveSet {
    pub peril_id: String,
    pub calm: HazardCurve,
    pub volatile: HazardCurve,
    pub crisis: HazardCurve,
    pub min_premium_bps: u32,
    pub max_multiplier_bps: u32,
}

impl RegimeCurveSet {
    pub fn curve(&self, regime: Regime) -> &HazardCurve {
        match regime {
            Regime::Calm => &self.calm,
            Regime::Volatile => &self.volatile,
            Regime::Crisis => &self.crisis,
        }
    }

    /// On-chain-facing JSON shape from the external interface contract:
    /// `regimeCurves` always in CALM, VOLATILE, CRISIS order.
    pub fn to_curve_config(&self) -> serde_json::Value {
        let tuple = |c: &HazardCurve| {
            serde_json::json!([
                [7, c.h_7.to_string()],
                [30, c.h_30.to_string()],
                [90, c.h_90.to_string()],
                c.tail_slope.to_string(),
            ])
        };

        serde_json::json!({
            "perilId": self.peril_id,
            "minPremiumBps": self.min_premium_bps,
            "maxMultiplierBps": self.max_multiplier_bps,
            "regime": 0,
            "regimeCurves": [tuple(&self.calm), tuple(&self.volatile), tuple(&self.crisis)],
        })
    }
}

/// The entire external configuration surface: trigger definition, tenors,
/// simulation budget, regime count, and validator tolerance. No file or env
/// parsing lives in this crate — callers build this in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub trigger_threshold: f64,
    pub trigger_duration_hours: f64,
    pub tenors_days: Vec<i64>,
    pub simulation_count: usize,
    pub n_regimes: usize,
    pub validator_tolerance: f64,
    pub base_seed: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            trigger_threshold: 0.97,
            trigger_duration_hours: 24.0,
            tenors_days: vec![7, 30, 90],
            simulation_count: 10_000,
            n_regimes: 3,
            validator_tolerance: 0.05,
            base_seed: 42,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolate_matches_pinned_points() {
        let curve = HazardCurve {
            regime: Regime::Crisis,
            h_7: 1_000_000_000_000_000,
            h_30: 5_000_000_000_000_000,
            h_90: 15_000_000_000_000_000,
            tail_slope: 100_000_000_000_000,
        };
        assert_eq!(curve.interpolate(7), curve.h_7);
        assert_eq!(curve.interpolate(30), curve.h_30);
        assert_eq!(curve.interpolate(90), curve.h_90);
        assert_eq!(curve.interpolate(0), 0);
        assert_eq!(curve.interpolate(-5), 0);
    }

    #[test]
    fn interpolate_on_non_monotone_curve_does_not_panic_or_wrap() {
        let curve = HazardCurve {
            regime: Regime::Calm,
            h_7: 5_000_000_000_000_000,
            h_30: 1_000_000_000_000_000,
            h_90: 15_000_000_000_000_000,
            tail_slope: 100_000_000_000_000,
        };
        assert!(!curve.is_monotonic());

        // h_30 < h_7, so the 7-30d segment has a negative slope; the
        // result must floor towards zero rather than wrap to a ~2^128
        // garbage value.
        let mid = curve.interpolate(15);
        assert!(mid < u128::MAX / 2);
    }
}

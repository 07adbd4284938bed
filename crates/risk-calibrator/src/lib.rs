//! Facade orchestrating the full calibration pipeline: load historical
//! prices, classify regimes, fit the hazard calibrator, validate the
//! result, and hand back a `RegimeCurveSet` ready for the on-chain
//! consumer. Generating the on-chain transaction itself, and the
//! oracle/hedging integrations `engine.py` also coordinated, are out of
//! scope here — this crate owns the calibration math only.

use curve_validator::{CurveValidator, PayoutCurveParams, ValidationResult};
use depeg_core::stats::std_dev;
use depeg_core::{CalibrationConfig, CalibrationError, CalibrationResult, DepegEvent, FeatureRow, Regime, RegimeCurveSet};
use hazard_calibrator::HazardCalibrator;
use regime_classifier::{RegimeClassifier, RegimeFitMethod};
use std::collections::BTreeMap;

/// Orchestrates regime classification, hazard calibration and validation
/// over a loaded price history.
pub struct RiskCalibrator {
    config: CalibrationConfig,
    regime_classifier: RegimeClassifier,
    regime_fitted: bool,
    validator: CurveValidator,

    prices: Option<Vec<f64>>,
    events: Option<Vec<DepegEvent>>,
    features: Option<Vec<FeatureRow>>,
    regimes: Option<Vec<Regime>>,
    curves: Option<RegimeCurveSet>,
}

impl RiskCalibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        let n_regimes = config.n_regimes;
        let tolerance = config.validator_tolerance;
        Self {
            config,
            regime_classifier: RegimeClassifier::new(n_regimes),
            regime_fitted: false,
            validator: CurveValidator::new(PayoutCurveParams::default(), tolerance),
            prices: None,
            events: None,
            features: None,
            regimes: None,
            curves: None,
        }
    }

    /// Load a daily price series. If `features` isn't supplied, it is
    /// extracted from `prices` via a sliding window of `min(30, n/3)` days.
    /// If `events` isn't supplied, `calibrate` extracts them automatically.
    pub fn load_data(
        &mut self,
        prices: &[f64],
        events: Option<&[DepegEvent]>,
        features: Option<&[FeatureRow]>,
    ) -> CalibrationResult<()> {
        if prices.len() < 10 {
            return Err(CalibrationError::InsufficientData(format!(
                "{} price points, need at least 10",
                prices.len()
            )));
        }

        self.prices = Some(prices.to_vec());
        self.events = events.map(|e| e.to_vec());
        self.features = Some(match features {
            Some(f) => f.to_vec(),
            None => extract_features(prices),
        });
        Ok(())
    }

    /// Classify a single observation (the latest loaded feature row if
    /// `features` is `None`), fitting the classifier on first use.
    pub fn classify_regime(&mut self, features: Option<FeatureRow>) -> CalibrationResult<Regime> {
        let target = match features {
            Some(f) => f,
            None => {
                let rows = self
                    .features
                    .as_ref()
                    .ok_or_else(|| CalibrationError::NotFitted("load_data was not called".to_string()))?;
                *rows
                    .last()
                    .ok_or_else(|| CalibrationError::InsufficientData("no feature rows available".to_string()))?
            }
        };

        self.ensure_classifier_fitted()?;
        let state = self.regime_classifier.classify(target)?;
        Ok(state.regime)
    }

    /// Run the full pipeline: classify historical regimes, fit the hazard
    /// calibrator per regime, Monte Carlo calibrate the curves, and
    /// validate the result (validation failures are logged, not fatal —
    /// the caller inspects `last_validation` to decide what to do).
    pub fn calibrate(&mut self, n_simulations: Option<usize>, peril_id: &str) -> CalibrationResult<RegimeCurveSet> {
        let prices = self
            .prices
            .clone()
            .ok_or_else(|| CalibrationError::NotFitted("load_data was not called".to_string()))?;
        let features = self
            .features
            .clone()
            .ok_or_else(|| CalibrationError::NotFitted("load_data was not called".to_string()))?;

        let n_sims = n_simulations.unwrap_or(self.config.simulation_count);

        self.ensure_classifier_fitted()?;
        let (regime_sequence, _) = self.regime_classifier.classify_sequence(&features)?;
        self.regimes = Some(regime_sequence.clone());

        let events = match &self.events {
            Some(e) => e.clone(),
            None => extract_events(&prices, 100.0),
        };

        let event_times: Vec<f64> = events.iter().map(|e| e.time_days).collect();
        let event_magnitudes: Vec<f64> = events.iter().map(|e| e.magnitude_bps).collect();
        let event_regimes: Vec<Regime> = event_times
            .iter()
            .map(|&t| {
                let idx = (t as usize).min(regime_sequence.len().saturating_sub(1));
                regime_sequence.get(idx).copied().unwrap_or(Regime::Calm)
            })
            .collect();

        let mut calibrator = HazardCalibrator::new(
            self.config.trigger_threshold,
            self.config.trigger_duration_hours,
            self.config.base_seed,
        );
        calibrator.fit(&event_magnitudes, &event_times, &event_regimes, prices.len() as f64)?;

        let curves = calibrator.calibrate(&self.config.tenors_days, n_sims, peril_id)?;

        let validation = self.validator.validate(&curves, Some(&event_times), n_sims.min(2000), self.config.base_seed + 1);
        for (regime, result) in &validation {
            if !result.is_valid {
                tracing::warn!(?regime, warnings = ?result.warnings, "curve validation failed");
            }
        }

        self.curves = Some(curves.clone());
        Ok(curves)
    }

    /// Validation results from the most recent `calibrate` call, one entry
    /// per regime. Empty if `calibrate` hasn't run.
    pub fn last_validation(&self) -> CalibrationResult<BTreeMap<Regime, ValidationResult>> {
        let curves = self
            .curves
            .as_ref()
            .ok_or_else(|| CalibrationError::NotFitted("calibrate was not called".to_string()))?;
        let event_times = self.events.as_ref().map(|e| e.iter().map(|ev| ev.time_days).collect::<Vec<_>>());
        Ok(self.validator.validate(curves, event_times.as_deref(), 2000, self.config.base_seed + 1))
    }

    pub fn curves(&self) -> Option<&RegimeCurveSet> {
        self.curves.as_ref()
    }

    fn ensure_classifier_fitted(&mut self) -> CalibrationResult<()> {
        if self.regime_fitted {
            return Ok(());
        }
        let features = self
            .features
            .clone()
            .ok_or_else(|| CalibrationError::NotFitted("load_data was not called".to_string()))?;
        self.regime_classifier.fit(&features, RegimeFitMethod::Hmm, self.config.base_seed)?;
        self.regime_fitted = true;
        Ok(())
    }
}

/// Sliding-window feature extraction: annualized realized volatility, max
/// drawdown, peg deviation and price range, each in basis points, over a
/// `min(30, n/3)`-day window.
fn extract_features(prices: &[f64]) -> Vec<FeatureRow> {
    let n = prices.len();
    let window = (30).min((n / 3).max(1));

    let mut features = Vec::with_capacity(n.saturating_sub(window));
    for i in window..n {
        let window_prices = &prices[i - window..i];

        let returns: Vec<f64> = window_prices.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
        let volatility_bps = std_dev(&returns) * 252.0_f64.sqrt() * 10_000.0;

        let mut cummax = f64::MIN;
        let mut max_drawdown = 0.0_f64;
        for &p in window_prices {
            cummax = cummax.max(p);
            max_drawdown = max_drawdown.max((cummax - p) / cummax);
        }

        let peg_deviation_bps = (1.0 - window_prices[window_prices.len() - 1]).abs() * 10_000.0;
        let hi = window_prices.iter().cloned().fold(f64::MIN, f64::max);
        let lo = window_prices.iter().cloned().fold(f64::MAX, f64::min);

        features.push(FeatureRow {
            volatility_bps,
            max_drawdown_bps: max_drawdown * 10_000.0,
            peg_deviation_bps,
            price_range_bps: (hi - lo) * 10_000.0,
        });
    }
    features
}

/// Groups consecutive days with peg deviation over `threshold_bps` into a
/// single event, keyed by the day the event started and its peak severity.
fn extract_events(prices: &[f64], threshold_bps: f64) -> Vec<DepegEvent> {
    let deviations: Vec<f64> = prices.iter().map(|&p| (1.0 - p).abs() * 10_000.0).collect();

    let mut events = Vec::new();
    let mut in_event = false;
    let mut event_start = 0usize;
    let mut event_max = 0.0_f64;

    for (i, &d) in deviations.iter().enumerate() {
        let is_depeg = d > threshold_bps;
        if is_depeg && !in_event {
            in_event = true;
            event_start = i;
            event_max = d;
        } else if is_depeg && in_event {
            event_max = event_max.max(d);
        } else if !is_depeg && in_event {
            in_event = false;
            events.push(DepegEvent { time_days: event_start as f64, magnitude_bps: event_max });
        }
    }
    if in_event {
        events.push(DepegEvent { time_days: event_start as f64, magnitude_bps: event_max });
    }

    if events.is_empty() {
        events.push(DepegEvent { time_days: 0.0, magnitude_bps: 0.0 });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pure_peg_series(n: usize) -> Vec<f64> {
        vec![1.0; n]
    }

    fn noisy_peg_series(n: usize, seed: u64) -> Vec<f64> {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| 1.0 + rng.gen_range(-0.0005..0.0005)).collect()
    }

    fn crisis_series(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| if (150..160).contains(&i) { 0.90 } else { 1.0 })
            .collect()
    }

    #[test]
    fn load_data_rejects_too_few_prices() {
        let mut calibrator = RiskCalibrator::new(CalibrationConfig::default());
        let err = calibrator.load_data(&[1.0, 1.0, 1.0], None, None).unwrap_err();
        assert!(matches!(err, CalibrationError::InsufficientData(_)));
    }

    #[test]
    fn calibrate_before_load_data_is_not_fitted() {
        let mut calibrator = RiskCalibrator::new(CalibrationConfig::default());
        let err = calibrator.calibrate(Some(100), "USDC_depeg").unwrap_err();
        assert!(matches!(err, CalibrationError::NotFitted(_)));
    }

    #[test]
    fn pure_peg_series_yields_low_calm_hazard() {
        let prices = pure_peg_series(400);
        let mut calibrator = RiskCalibrator::new(CalibrationConfig::default());
        calibrator.load_data(&prices, None, None).unwrap();
        let curves = calibrator.calibrate(Some(200), "USDC_depeg").unwrap();
        assert!(curves.calm.h_90 < 50_000_000_000_000_000);
    }

    #[test]
    fn noisy_peg_with_no_depegs_stays_calm() {
        let prices = noisy_peg_series(400, 11);
        let mut calibrator = RiskCalibrator::new(CalibrationConfig::default());
        calibrator.load_data(&prices, None, None).unwrap();
        let curves = calibrator.calibrate(Some(200), "USDC_depeg").unwrap();
        assert!(curves.calm.is_monotonic());
    }

    #[test]
    fn crisis_event_is_detected_in_extracted_events() {
        let prices = crisis_series(400);
        let events = extract_events(&prices, 100.0);
        assert!(events.iter().any(|e| e.magnitude_bps > 500.0));
    }

    #[test]
    fn full_pipeline_produces_monotonic_curves_for_all_regimes() {
        let prices = crisis_series(400);
        let mut calibrator = RiskCalibrator::new(CalibrationConfig::default());
        calibrator.load_data(&prices, None, None).unwrap();
        let curves = calibrator.calibrate(Some(150), "USDC_depeg").unwrap();
        assert!(curves.calm.is_monotonic());
        assert!(curves.volatile.is_monotonic());
        assert!(curves.crisis.is_monotonic());
    }
}

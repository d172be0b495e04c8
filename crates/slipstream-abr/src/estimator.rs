//! Throughput estimators.
//!
//! Four interchangeable filters sit behind the ABR policies. They all ingest
//! samples as `(value, milliseconds)` pairs and report kilobits per second.
//! Estimators that work on cumulative counters tolerate zero-duration deltas
//! by flooring the interval to one millisecond.

use std::collections::VecDeque;

/// Dual half-life moving average used by the BOLA transport adapter.
///
/// Two exponential averages with different half-lives are maintained and the
/// more conservative of the two is reported. Both are divided by a zero
/// factor so the estimate is not biased low while the average warms up.
#[derive(Debug, Default, Clone)]
pub struct MovingAverage {
    throughput_slow: f64,
    throughput_fast: f64,
    cumulative_time: f64,
}

impl MovingAverage {
    const HALF_LIFE_SLOW_MS: f64 = 8000.0;
    const HALF_LIFE_FAST_MS: f64 = 3000.0;

    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one `(throughput kbps, duration ms)` sample into both averages.
    pub fn add_measurement(&mut self, throughput: f64, time_ms: f64) {
        let time_ms = time_ms.max(1.0);
        let alpha = 0.5_f64.powf(time_ms / Self::HALF_LIFE_SLOW_MS);
        self.throughput_slow = alpha * self.throughput_slow + (1.0 - alpha) * throughput;
        let alpha = 0.5_f64.powf(time_ms / Self::HALF_LIFE_FAST_MS);
        self.throughput_fast = alpha * self.throughput_fast + (1.0 - alpha) * throughput;
        self.cumulative_time += time_ms;
    }

    pub fn throughput(&self) -> f64 {
        if self.cumulative_time <= 0.0 {
            return 0.0;
        }
        // zero factor avoids low estimates until the average warms up
        let zero_factor = 1.0 - 0.5_f64.powf(self.cumulative_time / Self::HALF_LIFE_SLOW_MS);
        let slow = self.throughput_slow / zero_factor;
        let zero_factor = 1.0 - 0.5_f64.powf(self.cumulative_time / Self::HALF_LIFE_FAST_MS);
        let fast = self.throughput_fast / zero_factor;
        slow.min(fast)
    }
}

/// Harmonic mean over the last few samples, used by the MPC adapter.
#[derive(Debug, Default, Clone)]
pub struct HarmonicMean {
    throughputs: VecDeque<f64>,
}

impl HarmonicMean {
    const WINDOW: usize = 5;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, throughput: f64) {
        if self.throughputs.len() >= Self::WINDOW {
            self.throughputs.pop_front();
        }
        self.throughputs.push_back(throughput);
    }

    /// The samples currently in the window, oldest first.
    pub fn window(&self) -> impl Iterator<Item = f64> + '_ {
        self.throughputs.iter().copied()
    }

    pub fn throughput(&self) -> f64 {
        if self.throughputs.is_empty() {
            return 0.0;
        }
        let reciprocal: f64 = self.throughputs.iter().map(|tp| 1.0 / tp).sum();
        self.throughputs.len() as f64 / reciprocal
    }
}

/// Plain α-smoothed EWMA used by the throughput policy adapter.
///
/// With `alpha == 0` the estimator tracks the most recent sample exactly.
#[derive(Debug, Default, Clone)]
pub struct Ewma {
    alpha: f64,
    throughput: f64,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            throughput: 0.0,
        }
    }

    pub fn add_sample(&mut self, throughput: f64) {
        self.throughput = self.alpha * self.throughput + (1.0 - self.alpha) * throughput;
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn throughput(&self) -> f64 {
        self.throughput
    }
}

/// Per-measurement moving average driving the in-flight abandonment check.
///
/// Samples arrive as cumulative `(received bytes, elapsed ms)` counters taken
/// mid-download; the filter differentiates them itself. A two-step warm-up
/// swallows a leading all-zero sample and seeds the average with the first
/// real one, and negative time deltas are rejected outright.
#[derive(Debug, Default, Clone)]
pub struct BppMovingAverage {
    throughput: f64,
    cumulative_time: f64,
    cumulative_size: u64,
    warmed_up_once: bool,
    warmed_up_twice: bool,
}

impl BppMovingAverage {
    const HALF_LIFE_MS: f64 = 500.0;
    const ALPHA: f64 = 0.9;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold in one cumulative `(received bytes, elapsed ms)` observation.
    pub fn add_measurement(&mut self, received_bytes: u64, time_ms: f64) {
        let time_diff = time_ms - self.cumulative_time;
        if time_diff < 0.0 {
            tracing::warn!(time_ms, "rejecting sample with negative time delta");
            return;
        }
        let size_diff = received_bytes.saturating_sub(self.cumulative_size);
        let throughput = (size_diff * 8) as f64 / time_diff.max(1.0);
        if !self.warmed_up_once && throughput == 0.0 {
            self.warmed_up_once = true;
            return;
        }
        self.warmed_up_once = true;
        self.throughput = Self::ALPHA * self.throughput + (1.0 - Self::ALPHA) * throughput;
        if !self.warmed_up_twice {
            self.throughput = throughput;
            self.warmed_up_twice = true;
        }
        self.cumulative_time = time_ms;
        self.cumulative_size = received_bytes;
    }

    pub fn throughput(&self) -> f64 {
        if self.cumulative_time <= 0.0 {
            return 0.0;
        }
        // zero factor avoids low estimates until the average warms up
        let zero_factor = 1.0 - 0.5_f64.powf(self.cumulative_time / Self::HALF_LIFE_MS);
        self.throughput / zero_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_single_sample_reports_sample() {
        let mut ma = MovingAverage::new();
        ma.add_measurement(1500.0, 1333.0);
        // The zero factor cancels the warm-up bias exactly for one sample.
        assert!((ma.throughput() - 1500.0).abs() < 1e-6);
    }

    #[test]
    fn moving_average_reports_min_of_slow_and_fast() {
        let mut ma = MovingAverage::new();
        ma.add_measurement(2000.0, 4000.0);
        ma.add_measurement(500.0, 1000.0);
        // The fast average reacts harder to the drop, so it is the minimum.
        let reported = ma.throughput();
        assert!(reported < 2000.0);
        assert!(reported > 500.0);
    }

    #[test]
    fn moving_average_empty_reports_zero() {
        assert_eq!(MovingAverage::new().throughput(), 0.0);
    }

    #[test]
    fn harmonic_mean_matches_formula_and_bounds_window() {
        let mut hm = HarmonicMean::new();
        for tp in [800.0, 400.0] {
            hm.add_sample(tp);
        }
        let expected = 2.0 / (1.0 / 800.0 + 1.0 / 400.0);
        assert!((hm.throughput() - expected).abs() < 1e-9);

        for tp in [100.0, 100.0, 100.0, 100.0, 100.0] {
            hm.add_sample(tp);
        }
        // Window holds five samples, the early ones are gone.
        assert!((hm.throughput() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn ewma_with_zero_alpha_tracks_latest() {
        let mut e = Ewma::new(0.0);
        e.add_sample(1000.0);
        e.add_sample(300.0);
        assert_eq!(e.throughput(), 300.0);
    }

    #[test]
    fn ewma_smooths_with_alpha() {
        let mut e = Ewma::new(0.5);
        e.add_sample(1000.0);
        e.add_sample(500.0);
        assert!((e.throughput() - 750.0).abs() < 1e-9);
    }

    #[test]
    fn bpp_average_seeds_with_first_real_sample() {
        let mut est = BppMovingAverage::new();
        est.add_measurement(0, 50.0);
        assert_eq!(est.throughput(), 0.0);
        est.add_measurement(1250, 100.0);
        // 1250 bytes in 100 ms → 100 kbps, inflated by the warm-up zero factor.
        let zero_factor = 1.0 - 0.5_f64.powf(100.0 / 500.0);
        assert!((est.throughput() - 100.0 / zero_factor).abs() < 1e-6);
    }

    #[test]
    fn bpp_average_rejects_negative_time() {
        let mut est = BppMovingAverage::new();
        est.add_measurement(1000, 100.0);
        let before = est.throughput();
        est.add_measurement(2000, 50.0);
        assert_eq!(est.throughput(), before);
    }

    #[test]
    fn bpp_average_reset_clears_state() {
        let mut est = BppMovingAverage::new();
        est.add_measurement(1000, 100.0);
        est.reset();
        assert_eq!(est.throughput(), 0.0);
    }
}

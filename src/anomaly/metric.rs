use crate::monitor::config::MIN_VARIANCE;

/// Exponentially weighted mean and variance of one signal.
///
/// Each observation is scored against the state *before* it is folded in,
/// so a spike is measured against the history it broke from.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveMetric {
    alpha:    f64,
    mean:     f64,
    variance: f64,
    count:    u32,
}

impl AdaptiveMetric {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            mean: 0.0,
            variance: MIN_VARIANCE,
            count: 0,
        }
    }

    /// Scores `value` as a z-score and then absorbs it.
    ///
    /// The first observation only seeds the mean and returns 0. Scores stay 0
    /// until the metric has seen more than `warmup` observations.
    pub fn update_and_score(&mut self, value: f64, warmup: u32) -> f64 {
        if self.count == 0 {
            self.mean = value;
            self.variance = MIN_VARIANCE;
            self.count = 1;
            return 0.0;
        }

        let stddev = self.variance.max(MIN_VARIANCE).sqrt();
        let score = (value - self.mean) / stddev;

        let delta = value - self.mean;
        self.mean += self.alpha * delta;
        self.variance = (1.0 - self.alpha) * (self.variance + self.alpha * delta * delta);
        self.count = self.count.saturating_add(1);

        if self.count <= warmup {
            return 0.0;
        }
        score
    }

    pub fn reset(&mut self) {
        self.mean = 0.0;
        self.variance = MIN_VARIANCE;
        self.count = 0;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Current variance, never below the floor.
    pub fn variance(&self) -> f64 {
        self.variance.max(MIN_VARIANCE)
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

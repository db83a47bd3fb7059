//! Robust loss functions for outlier-aware fusion
//!
//! Bounded-influence weight functions used by the iteratively reweighted
//! fusion accumulator, plus the weighted median that seeds it.

/// Robust loss with a bounded influence function.
#[derive(Debug, Clone, Copy)]
pub enum RobustLoss {
    /// Huber: quadratic near zero, linear beyond `delta`. Mild rejection.
    Huber { delta: f32 },
    /// Tukey biweight: outliers beyond `c` get zero weight. Aggressive.
    Tukey { c: f32 },
    /// Cauchy: smoothly decaying weight, never exactly zero.
    Cauchy { c: f32 },
}

impl RobustLoss {
    /// Evaluate the loss rho(r).
    pub fn evaluate(&self, residual: f32) -> f32 {
        let r = residual.abs();
        match self {
            RobustLoss::Huber { delta } => {
                if r <= *delta {
                    0.5 * r * r
                } else {
                    delta * (r - 0.5 * delta)
                }
            }
            RobustLoss::Tukey { c } => {
                if r <= *c {
                    let t = 1.0 - (r / c).powi(2);
                    (c * c / 6.0) * (1.0 - t.powi(3))
                } else {
                    c * c / 6.0
                }
            }
            RobustLoss::Cauchy { c } => (c * c / 2.0) * (1.0 + (r / c).powi(2)).ln(),
        }
    }

    /// Weight for reweighted least squares: rho'(r) / r, 1 at r ~ 0.
    pub fn weight(&self, residual: f32) -> f32 {
        let r = residual.abs();
        if r < 1e-6 {
            return 1.0;
        }

        match self {
            RobustLoss::Huber { delta } => {
                if r <= *delta {
                    1.0
                } else {
                    delta / r
                }
            }
            RobustLoss::Tukey { c } => {
                if r <= *c {
                    let t = 1.0 - (r / c).powi(2);
                    t * t
                } else {
                    0.0
                }
            }
            RobustLoss::Cauchy { c } => 1.0 / (1.0 + (r / c).powi(2)),
        }
    }
}

impl Default for RobustLoss {
    fn default() -> Self {
        RobustLoss::Tukey { c: 3.0 }
    }
}

/// Weighted median of `(value, weight)` samples.
///
/// Sorts in place. Returns 0.0 for an empty or zero-weight slice.
pub fn weighted_median(samples: &mut [(f32, f32)]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    samples.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let total: f32 = samples.iter().map(|(_, w)| w.max(0.0)).sum();
    if total <= 0.0 {
        return 0.0;
    }

    let half = total / 2.0;
    let mut acc = 0.0;
    for &(v, w) in samples.iter() {
        acc += w.max(0.0);
        if acc >= half {
            return v;
        }
    }
    samples[samples.len() - 1].0
}

//! Vector norms and the collective reductions behind them.
//!
//! Every norm the Newton driver and the step controller compare against a
//! tolerance is formed from a process-local partial value passed through a
//! [`Reduction`], so all partitions observe the same accept/reject decision.

use std::fmt::Debug;

use nalgebra::DVector;

/// Collective reduction over all partitions of a distributed vector.
pub trait Reduction: Debug + Send + Sync {
    fn sum(&self, local: f64) -> f64;
    fn max(&self, local: f64) -> f64;
    /// Logical AND across partitions.
    fn all(&self, local: bool) -> bool;
}

/// Single-process reduction: the local value is the global value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialReduction;

impl Reduction for SerialReduction {
    fn sum(&self, local: f64) -> f64 {
        local
    }

    fn max(&self, local: f64) -> f64 {
        local
    }

    fn all(&self, local: bool) -> bool {
        local
    }
}

/// Euclidean norm.
pub fn two_norm(v: &DVector<f64>, reduction: &dyn Reduction) -> f64 {
    reduction.sum(v.norm_squared()).sqrt()
}

/// Largest absolute entry.
pub fn max_norm(v: &DVector<f64>, reduction: &dyn Reduction) -> f64 {
    reduction.max(v.amax())
}

/// Weighted root-mean-square norm `sqrt(sum((v_i / w_i)^2) / n)`.
pub fn weighted_rms(v: &DVector<f64>, weights: &DVector<f64>, reduction: &dyn Reduction) -> f64 {
    let local: f64 = v
        .iter()
        .zip(weights.iter())
        .map(|(x, w)| (x / w) * (x / w))
        .sum();
    let n = reduction.sum(v.len() as f64);
    if n == 0.0 {
        return 0.0;
    }
    (reduction.sum(local) / n).sqrt()
}

/// Per-unknown weights `rel_tol * max(|x_i|, |y_i|) + abs_tol`.
pub fn update_weights(
    x: &DVector<f64>,
    y: &DVector<f64>,
    rel_tol: f64,
    abs_tol: f64,
) -> DVector<f64> {
    x.zip_map(y, |a, b| rel_tol * a.abs().max(b.abs()) + abs_tol)
}

/// True if any entry is NaN or infinite.
pub fn has_non_finite(v: &DVector<f64>, reduction: &dyn Reduction) -> bool {
    !reduction.all(v.iter().all(|x| x.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn test_norms() {
        let r = SerialReduction;
        let v = dvector![3.0, -4.0];
        assert_eq!(two_norm(&v, &r), 5.0);
        assert_eq!(max_norm(&v, &r), 4.0);
    }

    #[test]
    fn test_weighted_rms() {
        let r = SerialReduction;
        let v = dvector![1.0, 1.0];
        let w = dvector![0.5, 0.5];
        assert!((weighted_rms(&v, &w, &r) - 2.0).abs() < 1e-15);
        let empty = DVector::<f64>::zeros(0);
        assert_eq!(weighted_rms(&empty, &empty, &r), 0.0);
    }

    #[test]
    fn test_update_weights_use_larger_magnitude() {
        let w = update_weights(&dvector![1.0, -3.0], &dvector![-2.0, 0.0], 0.5, 1.0);
        assert_eq!(w, dvector![2.0, 2.5]);
    }

    #[test]
    fn test_non_finite_detection() {
        let r = SerialReduction;
        assert!(!has_non_finite(&dvector![1.0, 2.0], &r));
        assert!(has_non_finite(&dvector![1.0, f64::NAN], &r));
        assert!(has_non_finite(&dvector![f64::INFINITY], &r));
    }
}

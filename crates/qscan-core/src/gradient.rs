// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Residual Jacobians
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Jacobian providers for beam matrix reconstruction.
//!
//! The forward model maps fit parameters `(λ1, λ2, c)` to predicted squared
//! beam sizes at each scan step:
//!   σ = (λ1², λ1·λ2·c, λ2²)
//!   m_i = A_i · σ
//! Residuals are `m_i - y_i`. Every candidate σ is positive-semidefinite
//! for |c| ≤ 1.

#[cfg(feature = "autodiff")]
use hyperdual::Hyperdual;
use ndarray::{Array1, Array2};
use num_traits::{Float, NumCast};
use qscan_types::config::GradientMode;
use qscan_types::error::{EmitError, EmitResult};

/// Value slot followed by one tangent slot per fit parameter.
#[cfg(feature = "autodiff")]
type Tangent3 = Hyperdual<f64, 4>;

/// Beam matrix triplet `(σ11, σ12, σ22)` from fit parameters `(λ1, λ2, c)`.
pub fn beam_matrix_from_params<T: Float>(params: &[T; 3]) -> [T; 3] {
    let [l1, l2, c] = *params;
    [l1 * l1, l1 * l2 * c, l2 * l2]
}

/// One scan's linear design matrix and measured squared sizes.
#[derive(Debug, Clone)]
pub struct ScanProblem {
    /// Rows `[r11², 2·r11·r12, r12²]`, shape (n_steps, 3).
    pub amat: Array2<f64>,
    /// Measured squared beam sizes, length n_steps.
    pub target: Array1<f64>,
}

impl ScanProblem {
    pub fn new(amat: Array2<f64>, target: Array1<f64>) -> EmitResult<Self> {
        if amat.ncols() != 3 || amat.nrows() != target.len() {
            return Err(EmitError::ShapeMismatch(format!(
                "design matrix {:?} does not match {} measurements",
                amat.dim(),
                target.len()
            )));
        }
        Ok(ScanProblem { amat, target })
    }

    pub fn n_steps(&self) -> usize {
        self.target.len()
    }

    /// Residuals `A·σ(params) - y`, generic so dual numbers flow through.
    pub fn residuals<T: Float>(&self, params: &[T; 3]) -> Vec<T> {
        let sigma = beam_matrix_from_params(params);
        self.amat
            .rows()
            .into_iter()
            .zip(self.target.iter())
            .map(|(row, &y)| {
                let model = lift::<T>(row[0]) * sigma[0]
                    + lift::<T>(row[1]) * sigma[1]
                    + lift::<T>(row[2]) * sigma[2];
                model - lift(y)
            })
            .collect()
    }
}

fn lift<T: Float>(value: f64) -> T {
    <T as NumCast>::from(value).unwrap_or_else(T::nan)
}

/// Capability interface for residual Jacobians, shape (n_steps, 3).
///
/// Implementations must agree up to solver tolerance: swapping one for the
/// other may change iteration counts but not the fitted beam matrix.
pub trait GradientProvider: Send + Sync {
    fn jacobian(&self, problem: &ScanProblem, params: &[f64; 3]) -> Array2<f64>;

    fn name(&self) -> &'static str;
}

/// Central finite differences with step `fd_step · max(|p|, 1)`.
#[derive(Debug, Clone, Copy)]
pub struct NumericGradient {
    pub fd_step: f64,
}

impl NumericGradient {
    pub fn new(fd_step: f64) -> EmitResult<Self> {
        if !fd_step.is_finite() || fd_step <= 0.0 {
            return Err(EmitError::ConfigError(
                "jacobian fd_step must be finite and > 0".to_string(),
            ));
        }
        Ok(NumericGradient { fd_step })
    }
}

impl GradientProvider for NumericGradient {
    fn jacobian(&self, problem: &ScanProblem, params: &[f64; 3]) -> Array2<f64> {
        let mut jac = Array2::zeros((problem.n_steps(), 3));
        for col in 0..3 {
            let h = self.fd_step * params[col].abs().max(1.0);
            let mut plus = *params;
            let mut minus = *params;
            plus[col] += h;
            minus[col] -= h;
            let f_plus = problem.residuals(&plus);
            let f_minus = problem.residuals(&minus);
            for (row, (fp, fm)) in f_plus.iter().zip(f_minus.iter()).enumerate() {
                jac[[row, col]] = (fp - fm) / (2.0 * h);
            }
        }
        jac
    }

    fn name(&self) -> &'static str {
        "numeric"
    }
}

/// Exact Jacobian from one forward-mode pass with three seeded tangents.
#[cfg(feature = "autodiff")]
#[derive(Debug, Clone, Copy, Default)]
pub struct AutodiffGradient;

#[cfg(feature = "autodiff")]
impl GradientProvider for AutodiffGradient {
    fn jacobian(&self, problem: &ScanProblem, params: &[f64; 3]) -> Array2<f64> {
        let seeded: [Tangent3; 3] = std::array::from_fn(|i| {
            let mut slots = [0.0; 4];
            slots[0] = params[i];
            slots[i + 1] = 1.0;
            Tangent3::from_slice(&slots)
        });
        let residuals = problem.residuals(&seeded);
        let mut jac = Array2::zeros((residuals.len(), 3));
        for (row, r) in residuals.iter().enumerate() {
            for col in 0..3 {
                jac[[row, col]] = r[col + 1];
            }
        }
        jac
    }

    fn name(&self) -> &'static str {
        "autodiff"
    }
}

/// Provider for `mode`. Without the `autodiff` feature an autodiff request
/// falls back to finite differences.
pub fn gradient_provider(
    mode: GradientMode,
    fd_step: f64,
) -> EmitResult<Box<dyn GradientProvider>> {
    match mode {
        GradientMode::Numeric => Ok(Box::new(NumericGradient::new(fd_step)?)),
        #[cfg(feature = "autodiff")]
        GradientMode::Autodiff => Ok(Box::new(AutodiffGradient)),
        #[cfg(not(feature = "autodiff"))]
        GradientMode::Autodiff => {
            tracing::warn!("autodiff backend not compiled in, using numeric gradients");
            Ok(Box::new(NumericGradient::new(fd_step)?))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Beam Matrix Reconstruction
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Quadrupole-scan reconstruction of the beam matrix at the quad entrance.
//!
//! Squared beam size at the screen is linear in the upstream beam matrix:
//!   y_i ≈ [r11², 2·r11·r12, r12²]_i · (σ11, σ12, σ22)
//! where r is the first row of `rmat_downstream @ quad_rmat(k_i)`.
//! The fit runs over `(λ1, λ2, c)` with σ = (λ1², λ1·λ2·c, λ2²) so every
//! candidate is a physical (positive-semidefinite) beam matrix.

use crate::gradient::{
    beam_matrix_from_params, gradient_provider, GradientProvider, ScanProblem,
};
use crate::shape::{broadcast_to, check_trailing, from_mat2s, from_triplets, to_mat2s};
use crate::transport::quad_rmat;
use ndarray::{s, Array1, Array2, ArrayD, ArrayView1, ArrayViewD};
use qscan_math::linalg::{lstsq_pinv, matmul_2x2, pinv_svd, Mat2};
use qscan_types::batch::BatchShape;
use qscan_types::config::FitConfig;
use qscan_types::constants::CORRELATION_EPS;
use qscan_types::error::{EmitError, EmitResult};
use rayon::prelude::*;
use serde::Serialize;

const PINV_RCOND: f64 = 1e-15;
const DAMPING_DECREASE: f64 = 0.3;
const DAMPING_INCREASE: f64 = 10.0;
const MIN_DAMPING: f64 = 1e-15;
const MAX_DAMPING: f64 = 1e32;
const MAX_SADDLE_ESCAPES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    /// A tolerance in `FitConfig` was met.
    Converged,
    /// `max_iter` ran out first. Parameters are the best found.
    MaxIterations,
    /// No further decrease possible (damping blew up or the cost is not finite).
    Stalled,
}

/// Optimizer outcome for one scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScanFit {
    /// `(λ1, λ2, c)`
    pub params: [f64; 3],
    pub status: FitStatus,
    pub iterations: usize,
    /// Sum of squared residuals at the initial guess.
    pub initial_cost: f64,
    /// Sum of squared residuals at `params`.
    pub cost: f64,
}

impl ScanFit {
    pub fn beam_matrix(&self) -> [f64; 3] {
        beam_matrix_from_params(&self.params)
    }

    pub fn converged(&self) -> bool {
        self.status == FitStatus::Converged
    }
}

#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub batch: BatchShape,
    /// Column vectors `(σ11, σ12, σ22)`, shape `(*batch, 3, 1)`.
    pub beam_matrix: ArrayD<f64>,
    /// Quad entrance to screen, shape `(*batch, n_steps, 2, 2)`.
    pub total_rmat: ArrayD<f64>,
    /// One entry per scan in row-major batch order.
    pub fits: Vec<ScanFit>,
}

impl Reconstruction {
    pub fn all_converged(&self) -> bool {
        self.fits.iter().all(ScanFit::converged)
    }
}

/// Row of the design matrix for a total R matrix.
pub fn design_row(r: &Mat2) -> [f64; 3] {
    let (r11, r12) = (r[0][0], r[0][1]);
    [r11 * r11, 2.0 * r11 * r12, r12 * r12]
}

/// Map a beam matrix triplet onto `(λ1, λ2, c)`.
///
/// Positive diagonals are kept as they are. A non-positive one is lifted to
/// `CORRELATION_EPS` times the larger diagonal magnitude, so the floor scales
/// with the units of the data. The implied correlation is clipped into the
/// open interval.
pub fn params_from_beam_matrix(sigma: &[f64; 3]) -> [f64; 3] {
    let scale = sigma[0].abs().max(sigma[2].abs());
    let floor = if scale.is_finite() && scale > 0.0 {
        CORRELATION_EPS * scale
    } else {
        f64::MIN_POSITIVE
    };
    let lift = |v: f64| if v > 0.0 { v } else { floor };
    let l1 = lift(sigma[0]).sqrt();
    let l2 = lift(sigma[2]).sqrt();
    let c = (sigma[1] / (l1 * l2)).clamp(-1.0 + CORRELATION_EPS, 1.0 - CORRELATION_EPS);
    [l1, l2, c]
}

/// Pseudo-inverse solution mapped onto `(λ1, λ2, c)`. Always physical, even
/// when the linear solution is not.
pub fn initial_params(problem: &ScanProblem) -> [f64; 3] {
    let sigma = lstsq_pinv(&problem.amat, &problem.target, PINV_RCOND);
    params_from_beam_matrix(&[sigma[0], sigma[1], sigma[2]])
}

fn sum_squares(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum()
}

fn norm3(v: &[f64; 3]) -> f64 {
    sum_squares(v).sqrt()
}

/// Descent step off a stationary point of the `(λ1, λ2, c)` map that is not
/// a minimum over positive-semidefinite beam matrices.
///
/// With `R_i` the symmetric matrix of design row i, the cost gradient in
/// beam matrix space is `G = Σ r_i·R_i`. At a constrained minimum `G` is
/// positive-semidefinite. Otherwise its lowest eigenvector `v` gives the
/// physical direction `σ + t·vvᵀ`, along which the cost is quadratic in `t`.
/// Returns `None` when the achievable reduction is at rounding level.
fn escape_saddle(
    problem: &ScanProblem,
    params: &[f64; 3],
    residuals: &[f64],
    cost: f64,
    config: &FitConfig,
) -> Option<[f64; 3]> {
    let g = problem.amat.t().dot(&ArrayView1::from(residuals));
    let (g11, g12, g22) = (g[0], 0.5 * g[1], g[2]);
    let radius = (0.25 * (g11 - g22) * (g11 - g22) + g12 * g12).sqrt();
    let lowest = 0.5 * (g11 + g22) - radius;
    if lowest.is_nan() || lowest >= 0.0 {
        return None;
    }

    let (v0, v1) = if g12 != 0.0 {
        (g12, lowest - g11)
    } else if g11 <= g22 {
        (1.0, 0.0)
    } else {
        (0.0, 1.0)
    };
    let norm_sq = v0 * v0 + v1 * v1;
    let direction = [v0 * v0 / norm_sq, v0 * v1 / norm_sq, v1 * v1 / norm_sq];
    let d = problem.amat.dot(&ArrayView1::from(&direction[..]));
    let dd = d.dot(&d);
    let slope = d.dot(&ArrayView1::from(residuals));
    if dd <= 0.0 || slope >= 0.0 {
        return None;
    }

    let reduction = slope * slope / dd;
    let target_sq = problem.target.dot(&problem.target);
    if reduction <= config.ftol * cost || reduction <= f64::EPSILON * target_sq {
        return None;
    }
    let t = -slope / dd;
    let sigma = beam_matrix_from_params(params);
    Some(params_from_beam_matrix(&[
        sigma[0] + t * direction[0],
        sigma[1] + t * direction[1],
        sigma[2] + t * direction[2],
    ]))
}

/// Projected Levenberg-Marquardt on one scan.
///
/// `c` stays in `[-1+ε, 1-ε]`; while it sits on a bound with the gradient
/// pointing outward its column is frozen. λ1 and λ2 are free. A stationary
/// point is only reported as `Converged` once no descent direction into the
/// positive-semidefinite cone remains (see `escape_saddle`). The best
/// parameters found are returned whatever the status.
pub fn fit_scan(
    problem: &ScanProblem,
    init: [f64; 3],
    provider: &dyn GradientProvider,
    config: &FitConfig,
) -> ScanFit {
    let lower = -1.0 + CORRELATION_EPS;
    let upper = 1.0 - CORRELATION_EPS;
    let n = problem.n_steps();

    let mut x = init;
    let mut residuals = problem.residuals(&x);
    let mut cost = sum_squares(&residuals);
    let initial_cost = cost;
    let mut jac = provider.jacobian(problem, &x);
    let mut damping = config.initial_damping;
    let mut iterations = 0usize;
    let mut escapes = 0usize;

    let status = loop {
        if !cost.is_finite() {
            break FitStatus::Stalled;
        }
        if cost == 0.0 {
            break FitStatus::Converged;
        }
        if config.max_iter.is_some_and(|max| iterations >= max) {
            break FitStatus::MaxIterations;
        }
        iterations += 1;

        let mut j = jac.clone();
        let mut grad = j.t().dot(&ArrayView1::from(&residuals[..]));
        let frozen = (x[2] <= lower && grad[2] > 0.0) || (x[2] >= upper && grad[2] < 0.0);
        if frozen {
            j.column_mut(2).fill(0.0);
            grad[2] = 0.0;
        }

        let col_norms: [f64; 3] = std::array::from_fn(|c| j.column(c).dot(&j.column(c)).sqrt());
        let r_norm = cost.sqrt();
        let grad_cos = (0..3)
            .filter(|&c| col_norms[c] > 0.0)
            .map(|c| grad[c].abs() / (col_norms[c] * r_norm))
            .fold(0.0, f64::max);

        let stationary = if grad_cos <= config.gtol {
            true
        } else {
            // [J; sqrt(μ·D)] δ = -[r; 0] with Marquardt scaling D = diag(JᵀJ).
            let mut aug = Array2::<f64>::zeros((n + 3, 3));
            aug.slice_mut(s![..n, ..]).assign(&j);
            for c in 0..3 {
                let d = if col_norms[c] > 0.0 {
                    col_norms[c] * col_norms[c]
                } else {
                    1.0
                };
                aug[[n + c, c]] = (damping * d).sqrt();
            }
            let mut r_aug = Array1::<f64>::zeros(n + 3);
            r_aug
                .slice_mut(s![..n])
                .assign(&ArrayView1::from(&residuals[..]));
            let delta = pinv_svd(&aug, PINV_RCOND).dot(&r_aug);

            let trial = [
                x[0] - delta[0],
                x[1] - delta[1],
                if frozen {
                    x[2]
                } else {
                    (x[2] - delta[2]).clamp(lower, upper)
                },
            ];
            let step = norm3(&[trial[0] - x[0], trial[1] - x[1], trial[2] - x[2]]);
            let small_step = step <= config.xtol * (norm3(&x) + config.xtol);

            let trial_residuals = problem.residuals(&trial);
            let trial_cost = sum_squares(&trial_residuals);
            tracing::trace!(iteration = iterations, cost, trial_cost, damping, "lm step");

            if trial_cost < cost {
                let reduction = (cost - trial_cost) / cost;
                x = trial;
                residuals = trial_residuals;
                cost = trial_cost;
                jac = provider.jacobian(problem, &x);
                damping = (damping * DAMPING_DECREASE).max(MIN_DAMPING);
                reduction <= config.ftol || small_step
            } else if small_step {
                true
            } else {
                damping *= DAMPING_INCREASE;
                if damping > MAX_DAMPING {
                    break FitStatus::Stalled;
                }
                false
            }
        };
        if !stationary {
            continue;
        }

        // A collapsed λ column also looks stationary; only a constrained
        // minimum counts as converged.
        let escape = (escapes < MAX_SADDLE_ESCAPES)
            .then(|| escape_saddle(problem, &x, &residuals, cost, config))
            .flatten();
        let Some(next) = escape else {
            break FitStatus::Converged;
        };
        let next_residuals = problem.residuals(&next);
        let next_cost = sum_squares(&next_residuals);
        if next_cost >= cost || next_cost.is_nan() {
            break FitStatus::Converged;
        }
        tracing::debug!(iteration = iterations, cost, next_cost, "leaving beam matrix saddle");
        escapes += 1;
        x = next;
        residuals = next_residuals;
        cost = next_cost;
        jac = provider.jacobian(problem, &x);
        damping = config.initial_damping;
    };

    tracing::debug!(
        iterations,
        initial_cost,
        cost,
        status = ?status,
        provider = provider.name(),
        "scan fit finished"
    );

    ScanFit {
        params: x,
        status,
        iterations,
        initial_cost,
        cost,
    }
}

/// Reconstruct the beam matrix at the quad entrance for every scan.
///
/// Shapes: `beamsize_sq` is `(*batch, n_steps)`; `k` broadcasts to it;
/// `rmat_downstream` (quad exit to screen) broadcasts to `(*batch, 2, 2)`.
///
/// Non-convergence is not an error: inspect `Reconstruction::fits`.
/// Rank-deficient scans (fewer than three independent steps) return a
/// finite, physical but ill-determined beam matrix.
pub fn reconstruct_beam_matrix(
    k: &ArrayViewD<'_, f64>,
    beamsize_sq: &ArrayViewD<'_, f64>,
    q_len: f64,
    rmat_downstream: &ArrayViewD<'_, f64>,
    config: &FitConfig,
) -> EmitResult<Reconstruction> {
    config.validate()?;
    let batch = BatchShape::from_leading(beamsize_sq.shape(), 1)?;
    let n_steps = beamsize_sq.shape()[batch.ndim()];
    if n_steps == 0 {
        return Err(EmitError::ShapeMismatch(
            "beamsize_sq must contain at least one scan step".to_string(),
        ));
    }
    let k = broadcast_to(k, beamsize_sq.shape(), "k")?;
    check_trailing(rmat_downstream.shape(), &[2, 2], "rmat")?;
    let downstream = to_mat2s(&broadcast_to(
        rmat_downstream,
        &batch.with_trailing(&[2, 2]),
        "rmat",
    )?);
    let provider = gradient_provider(config.gradient, config.fd_step)?;

    let ks: Vec<f64> = k.iter().copied().collect();
    let ys: Vec<f64> = beamsize_sq.iter().copied().collect();
    let mut total = Vec::with_capacity(ks.len());
    for (b, r_down) in downstream.iter().enumerate() {
        for &ki in &ks[b * n_steps..(b + 1) * n_steps] {
            total.push(matmul_2x2(r_down, &quad_rmat(ki, q_len, config.thin_lens)));
        }
    }

    let solve = |b: usize| -> EmitResult<ScanFit> {
        let steps = b * n_steps..(b + 1) * n_steps;
        let rows = &total[steps.clone()];
        let amat = Array2::from_shape_fn((n_steps, 3), |(i, j)| design_row(&rows[i])[j]);
        let problem = ScanProblem::new(amat, Array1::from(ys[steps].to_vec()))?;
        Ok(fit_scan(
            &problem,
            initial_params(&problem),
            provider.as_ref(),
            config,
        ))
    };
    let fits: Vec<ScanFit> = if config.parallel {
        (0..batch.len())
            .into_par_iter()
            .map(&solve)
            .collect::<EmitResult<Vec<_>>>()?
    } else {
        (0..batch.len())
            .map(&solve)
            .collect::<EmitResult<Vec<_>>>()?
    };

    let unconverged = fits.iter().filter(|f| !f.converged()).count();
    if unconverged > 0 {
        tracing::warn!(
            unconverged,
            scans = fits.len(),
            "beam matrix fit did not converge for some scans; returning best-found parameters"
        );
    }

    let sigmas: Vec<[f64; 3]> = fits.iter().map(ScanFit::beam_matrix).collect();
    Ok(Reconstruction {
        beam_matrix: from_triplets(batch.dims(), &[3, 1], &sigmas)?,
        total_rmat: from_mat2s(&batch.with_trailing(&[n_steps]), &total)?,
        batch,
        fits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradient::NumericGradient;
    use ndarray::{arr1, arr2, Array};
    use qscan_types::config::GradientMode;

    const TRUTH: [f64; 3] = [4e-6, 1e-6, 9e-6];

    fn synthesize(k: &[f64], q_len: f64, rmat: &Mat2, thin: bool, sigma: &[f64; 3]) -> Vec<f64> {
        k.iter()
            .map(|&ki| {
                let row = design_row(&matmul_2x2(rmat, &quad_rmat(ki, q_len, thin)));
                row[0] * sigma[0] + row[1] * sigma[1] + row[2] * sigma[2]
            })
            .collect()
    }

    fn reconstruct_single(
        k: &[f64],
        y: &[f64],
        q_len: f64,
        rmat: &Mat2,
        config: &FitConfig,
    ) -> Reconstruction {
        let k = arr1(k).into_dyn();
        let y = arr1(y).into_dyn();
        let r = arr2(rmat).into_dyn();
        reconstruct_beam_matrix(&k.view(), &y.view(), q_len, &r.view(), config).unwrap()
    }

    fn assert_close_rel(got: f64, want: f64, tol: f64) {
        assert!(
            ((got - want) / want).abs() < tol,
            "got {got}, want {want} (tol {tol})"
        );
    }

    fn assert_psd(sigma: &[f64]) {
        assert!(sigma[0] >= 0.0 && sigma[2] >= 0.0, "negative diagonal {sigma:?}");
        assert!(
            sigma[0] * sigma[2] - sigma[1] * sigma[1] >= 0.0,
            "not positive-semidefinite: {sigma:?}"
        );
    }

    #[test]
    fn test_design_row() {
        assert_eq!(design_row(&[[2.0, 3.0], [0.0, 0.5]]), [4.0, 12.0, 9.0]);
    }

    #[test]
    fn test_initial_params_are_physical_for_unphysical_linear_solution() {
        // Exactly determined system whose solution has σ11 < 0.
        let amat = arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        let problem = ScanProblem::new(amat, arr1(&[-1.0, 5.0, 2.0])).unwrap();
        let [l1, l2, c] = initial_params(&problem);
        // Floor is relative to the larger diagonal (2.0).
        assert!((l1 - (2.0 * CORRELATION_EPS).sqrt()).abs() < 1e-15);
        assert!((l2 - 2.0_f64.sqrt()).abs() < 1e-12);
        assert_eq!(c, 1.0 - CORRELATION_EPS);
    }

    #[test]
    fn test_initial_params_keep_small_positive_diagonals() {
        let amat = arr2(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        let problem = ScanProblem::new(amat, arr1(&[4e-10, 1e-10, 9e-10])).unwrap();
        let sigma = beam_matrix_from_params(&initial_params(&problem));
        for (got, want) in sigma.iter().zip([4e-10, 1e-10, 9e-10]) {
            assert_close_rel(*got, want, 1e-12);
        }
    }

    #[test]
    fn test_params_from_degenerate_beam_matrix_stay_finite() {
        let [l1, l2, c] = params_from_beam_matrix(&[0.0, 0.0, 0.0]);
        assert!(l1 > 0.0 && l2 > 0.0);
        assert_eq!(c, 0.0);
        let [l1, l2, _] = params_from_beam_matrix(&[-3e-12, 1e-12, 5e-12]);
        assert!((l1 * l1 - CORRELATION_EPS * 5e-12).abs() < 1e-30);
        assert!((l2 * l2 - 5e-12).abs() < 1e-27);
    }

    #[test]
    fn test_fit_scan_leaves_collapsed_beam_matrix() {
        // Start where λ2 = c = 0 and σ11 is already optimal on its own: the
        // λ2 and c Jacobian columns vanish and the cost is stationary.
        let k = [-5.0, -2.5, 0.0, 2.5, 5.0];
        let drift = [[1.0, 6.0], [0.0, 1.0]];
        let rows: Vec<[f64; 3]> = k
            .iter()
            .map(|&ki| design_row(&matmul_2x2(&drift, &quad_rmat(ki, 0.1, false))))
            .collect();
        let amat = Array2::from_shape_fn((k.len(), 3), |(i, j)| rows[i][j]);
        let target = amat.dot(&arr1(&TRUTH));
        let a0 = amat.column(0);
        let s11 = a0.dot(&target) / a0.dot(&a0);
        let problem = ScanProblem::new(amat, target).unwrap();
        let provider = gradient_provider(GradientMode::Autodiff, 1e-7).unwrap();

        let fit = fit_scan(
            &problem,
            [s11.sqrt(), 0.0, 0.0],
            provider.as_ref(),
            &FitConfig::default(),
        );
        assert!(fit.converged(), "{fit:?}");
        assert!(fit.cost < 1e-6 * fit.initial_cost, "{fit:?}");
        let sigma = fit.beam_matrix();
        for i in 0..3 {
            assert_close_rel(sigma[i], TRUTH[i], 1e-5);
        }
    }

    #[test]
    fn test_weak_quad_scan_round_trip() {
        let k = [-2.0, -1.0, 0.0, 1.0, 2.0];
        let id = [[1.0, 0.0], [0.0, 1.0]];
        let y = synthesize(&k, 0.1, &id, false, &TRUTH);
        let rec = reconstruct_single(&k, &y, 0.1, &id, &FitConfig::default());

        assert_eq!(rec.beam_matrix.shape(), &[3, 1]);
        assert_eq!(rec.total_rmat.shape(), &[5, 2, 2]);
        for i in 0..3 {
            assert_close_rel(rec.beam_matrix[[i, 0]], TRUTH[i], 1e-6);
        }
        assert!(rec.all_converged(), "{:?}", rec.fits);
    }

    #[test]
    fn test_round_trip_thick_thin_and_both_providers() {
        let k: Vec<f64> = (0..7).map(|i| -6.0 + 2.0 * i as f64).collect();
        let drift = [[1.0, 8.0], [0.0, 1.0]];
        for thin in [false, true] {
            for gradient in [GradientMode::Autodiff, GradientMode::Numeric] {
                let config = FitConfig {
                    thin_lens: thin,
                    gradient,
                    ..Default::default()
                };
                let y = synthesize(&k, 0.1, &drift, thin, &TRUTH);
                let rec = reconstruct_single(&k, &y, 0.1, &drift, &config);
                for i in 0..3 {
                    assert_close_rel(rec.beam_matrix[[i, 0]], TRUTH[i], 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_total_rmat_composes_downstream_after_quad() {
        let k = [1.5];
        let drift = [[1.0, 2.0], [0.0, 1.0]];
        let rec = reconstruct_single(&k, &[1e-6], 0.2, &drift, &FitConfig::default());
        let expected = matmul_2x2(&drift, &quad_rmat(1.5, 0.2, false));
        for i in 0..2 {
            for j in 0..2 {
                assert_eq!(rec.total_rmat[[0, i, j]], expected[i][j]);
            }
        }
    }

    #[test]
    fn test_batched_broadcast_inputs() {
        let k = [-4.0, -2.0, 0.0, 2.0, 4.0];
        let drift = [[1.0, 5.0], [0.0, 1.0]];
        let truths = [
            [4e-6, 1e-6, 9e-6],
            [1e-6, -0.5e-6, 2e-6],
            [9e-6, 2e-6, 1e-6],
            [2e-6, 0.0, 2e-6],
            [5e-6, -4e-6, 4e-6],
            [3e-6, 1.5e-6, 3e-6],
        ];
        let mut y = Array::<f64, _>::zeros((2, 3, 5));
        for (b, truth) in truths.iter().enumerate() {
            let ys = synthesize(&k, 0.1, &drift, false, truth);
            for (s, v) in ys.into_iter().enumerate() {
                y[[b / 3, b % 3, s]] = v;
            }
        }
        let k_arr = arr1(&k).into_dyn();
        let y = y.into_dyn();
        let r = arr2(&drift).into_dyn();
        let rec = reconstruct_beam_matrix(
            &k_arr.view(),
            &y.view(),
            0.1,
            &r.view(),
            &FitConfig::default(),
        )
        .unwrap();

        assert_eq!(rec.batch.dims(), &[2, 3]);
        assert_eq!(rec.beam_matrix.shape(), &[2, 3, 3, 1]);
        assert_eq!(rec.total_rmat.shape(), &[2, 3, 5, 2, 2]);
        assert_eq!(rec.fits.len(), 6);
        for (b, truth) in truths.iter().enumerate() {
            for i in 0..3 {
                let got = rec.beam_matrix[[b / 3, b % 3, i, 0]];
                assert!(
                    (got - truth[i]).abs() < 1e-6 * truth[0].max(truth[2]),
                    "scan {b}, component {i}: {got} vs {}",
                    truth[i]
                );
            }
        }
    }

    #[test]
    fn test_parallel_and_sequential_are_identical() {
        let k = [-3.0, -1.0, 1.0, 3.0];
        let drift = [[1.0, 4.0], [0.0, 1.0]];
        let mut y = Array::<f64, _>::zeros((4, 4));
        for b in 0..4 {
            let noise = [1.1, 0.93, 1.05, 0.97];
            let ys = synthesize(&k, 0.1, &drift, false, &TRUTH);
            for s in 0..4 {
                y[[b, s]] = ys[s] * noise[(s + b) % 4];
            }
        }
        let k_arr = arr1(&k).into_dyn();
        let y = y.into_dyn();
        let r = arr2(&drift).into_dyn();
        let run = |parallel: bool| {
            let config = FitConfig {
                parallel,
                ..Default::default()
            };
            reconstruct_beam_matrix(&k_arr.view(), &y.view(), 0.1, &r.view(), &config).unwrap()
        };
        let (par, seq) = (run(true), run(false));
        assert_eq!(par.beam_matrix, seq.beam_matrix);
        assert_eq!(par.fits, seq.fits);
    }

    #[test]
    fn test_rank_deficient_scan_is_finite_and_physical() {
        // Repeated strength: one independent row.
        let k = [1.0, 1.0, 1.0];
        let drift = [[1.0, 10.0], [0.0, 1.0]];
        let y = synthesize(&k, 0.1, &drift, false, &TRUTH);
        let rec = reconstruct_single(&k, &y, 0.1, &drift, &FitConfig::default());
        let sigma: Vec<f64> = rec.beam_matrix.iter().copied().collect();
        assert!(sigma.iter().all(|v| v.is_finite()));
        assert_psd(&sigma);
    }

    #[test]
    fn test_two_step_scan_is_finite_and_physical() {
        let k = [-1.0, 2.0];
        let drift = [[1.0, 3.0], [0.0, 1.0]];
        let y = synthesize(&k, 0.1, &drift, false, &TRUTH);
        let rec = reconstruct_single(&k, &y, 0.1, &drift, &FitConfig::default());
        let sigma: Vec<f64> = rec.beam_matrix.iter().copied().collect();
        assert!(sigma.iter().all(|v| v.is_finite()));
        assert_psd(&sigma);
        assert!(rec.fits[0].cost <= rec.fits[0].initial_cost);
    }

    #[test]
    fn test_noisy_scan_stays_physical_and_reduces_cost() {
        let k = [-5.0, -2.5, 0.0, 2.5, 5.0];
        let drift = [[1.0, 6.0], [0.0, 1.0]];
        // Nearly singular ground truth plus heavy noise pushes the linear
        // solution outside the physical cone.
        let truth = [4e-6, 3.99e-6, 4e-6];
        let noise = [1.3, 0.7, 1.25, 0.75, 1.3];
        let y: Vec<f64> = synthesize(&k, 0.1, &drift, false, &truth)
            .iter()
            .zip(noise)
            .map(|(v, n)| v * n)
            .collect();
        let rec = reconstruct_single(&k, &y, 0.1, &drift, &FitConfig::default());
        let sigma: Vec<f64> = rec.beam_matrix.iter().copied().collect();
        assert_psd(&sigma);
        let fit = rec.fits[0];
        assert!(fit.cost <= fit.initial_cost);
        assert!(fit.params[2].abs() <= 1.0 - CORRELATION_EPS);
    }

    #[test]
    fn test_max_iter_caps_iterations_and_returns_best_found() {
        let k = [-5.0, -2.5, 0.0, 2.5, 5.0];
        let drift = [[1.0, 6.0], [0.0, 1.0]];
        let y: Vec<f64> = synthesize(&k, 0.1, &drift, false, &TRUTH)
            .iter()
            .zip([1.4, 0.6, 1.3, 0.8, 1.2])
            .map(|(v, n)| v * n)
            .collect();
        let config = FitConfig {
            max_iter: Some(1),
            ..Default::default()
        };
        let rec = reconstruct_single(&k, &y, 0.1, &drift, &config);
        let fit = rec.fits[0];
        assert!(fit.iterations <= 1);
        assert!(fit.cost <= fit.initial_cost);
        assert_psd(&rec.beam_matrix.iter().copied().collect::<Vec<_>>());
    }

    #[test]
    fn test_nan_measurement_surfaces_as_nan_not_error() {
        let k = [-1.0, 0.0, 1.0];
        let id = [[1.0, 0.0], [0.0, 1.0]];
        let rec = reconstruct_single(&k, &[1e-6, f64::NAN, 2e-6], 0.1, &id, &FitConfig::default());
        assert_eq!(rec.fits[0].status, FitStatus::Stalled);
        assert!(rec.beam_matrix.iter().any(|v| v.is_nan()));
    }

    #[test]
    fn test_fit_scan_with_numeric_provider_directly() {
        let k = [-3.0, 0.0, 3.0, 6.0];
        let drift = [[1.0, 2.0], [0.0, 1.0]];
        let rows: Vec<[f64; 3]> = k
            .iter()
            .map(|&ki| design_row(&matmul_2x2(&drift, &quad_rmat(ki, 0.2, false))))
            .collect();
        let amat = Array2::from_shape_fn((4, 3), |(i, j)| rows[i][j]);
        let target = amat.dot(&arr1(&TRUTH));
        let problem = ScanProblem::new(amat, target).unwrap();
        let provider = NumericGradient::new(1e-7).unwrap();
        // Deliberately poor start.
        let fit = fit_scan(&problem, [1e-3, 1e-3, 0.0], &provider, &FitConfig::default());
        let sigma = fit.beam_matrix();
        for i in 0..3 {
            assert_close_rel(sigma[i], TRUTH[i], 1e-5);
        }
        assert!(fit.iterations >= 1);
    }

    #[test]
    fn test_shape_errors() {
        let config = FitConfig::default();
        let y = arr1(&[1e-6, 2e-6, 3e-6]).into_dyn();
        let id = arr2(&[[1.0, 0.0], [0.0, 1.0]]).into_dyn();

        let bad_k = arr1(&[1.0, 2.0]).into_dyn();
        let err = reconstruct_beam_matrix(&bad_k.view(), &y.view(), 0.1, &id.view(), &config);
        assert!(err.is_err());

        let k = arr1(&[1.0, 2.0, 3.0]).into_dyn();
        let bad_r = Array::<f64, _>::zeros(ndarray::IxDyn(&[3, 3]));
        let err = reconstruct_beam_matrix(&k.view(), &y.view(), 0.1, &bad_r.view(), &config);
        assert!(err.is_err());

        let empty = Array::<f64, _>::zeros(ndarray::IxDyn(&[0]));
        let err = reconstruct_beam_matrix(&empty.view(), &empty.view(), 0.1, &id.view(), &config);
        assert!(err.is_err());

        let bad_cfg = FitConfig {
            max_iter: Some(0),
            ..Default::default()
        };
        assert!(reconstruct_beam_matrix(&k.view(), &y.view(), 0.1, &id.view(), &bad_cfg).is_err());
    }
}

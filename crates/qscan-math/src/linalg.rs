// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Linear Algebra
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Linear algebra utilities.
//!
//! 2x2 transport helpers, one-sided Jacobi SVD, pseudoinverse with a
//! relative singular value cutoff.

use ndarray::{Array1, Array2};

/// Row-major 2x2 matrix `[[m11, m12], [m21, m22]]`.
pub type Mat2 = [[f64; 2]; 2];

pub const IDENTITY_2X2: Mat2 = [[1.0, 0.0], [0.0, 1.0]];

/// Matrix product `a @ b`.
pub fn matmul_2x2(a: &Mat2, b: &Mat2) -> Mat2 {
    [
        [
            a[0][0] * b[0][0] + a[0][1] * b[1][0],
            a[0][0] * b[0][1] + a[0][1] * b[1][1],
        ],
        [
            a[1][0] * b[0][0] + a[1][1] * b[1][0],
            a[1][0] * b[0][1] + a[1][1] * b[1][1],
        ],
    ]
}

pub fn det_2x2(a: &Mat2) -> f64 {
    a[0][0] * a[1][1] - a[0][1] * a[1][0]
}

const JACOBI_MAX_SWEEPS: usize = 60;
const JACOBI_ORTHO_TOL: f64 = 1e-15;

/// Thin SVD by one-sided (Hestenes) Jacobi rotations applied to the columns of A.
///
/// Works on A directly rather than A^T A, so small singular values keep
/// their relative accuracy. Intended for the tall, narrow matrices of a
/// quad scan (n_steps x 3) and the damped normal systems built from them.
///
/// Returns (U, sigma, Vt) with sigma descending, A ≈ U * diag(sigma) * Vt.
/// Shapes: U is m x k, sigma is k, Vt is k x n with k = min(m, n).
/// Matches `numpy.linalg.svd(A, full_matrices=False)` up to column signs.
pub fn svd_small(a: &Array2<f64>) -> (Array2<f64>, Array1<f64>, Array2<f64>) {
    let (m, n) = a.dim();
    let k = m.min(n);

    let mut w = a.to_owned();
    let mut v: Array2<f64> = Array2::eye(n);

    for _ in 0..JACOBI_MAX_SWEEPS {
        let mut rotated = false;
        for p in 0..n {
            for q in (p + 1)..n {
                let mut alpha = 0.0;
                let mut beta = 0.0;
                let mut gamma = 0.0;
                for r in 0..m {
                    alpha += w[[r, p]] * w[[r, p]];
                    beta += w[[r, q]] * w[[r, q]];
                    gamma += w[[r, p]] * w[[r, q]];
                }
                // NaN input never meets the tolerance; skip it instead of rotating forever.
                if !gamma.is_finite()
                    || gamma == 0.0
                    || gamma.abs() <= JACOBI_ORTHO_TOL * (alpha * beta).sqrt()
                {
                    continue;
                }
                rotated = true;

                let zeta = (beta - alpha) / (2.0 * gamma);
                let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let cos = 1.0 / (1.0 + t * t).sqrt();
                let sin = cos * t;

                for r in 0..m {
                    let wp = w[[r, p]];
                    let wq = w[[r, q]];
                    w[[r, p]] = cos * wp - sin * wq;
                    w[[r, q]] = sin * wp + cos * wq;
                }
                for r in 0..n {
                    let vp = v[[r, p]];
                    let vq = v[[r, q]];
                    v[[r, p]] = cos * vp - sin * vq;
                    v[[r, q]] = sin * vp + cos * vq;
                }
            }
        }
        if !rotated {
            break;
        }
    }

    // Column norms of the rotated matrix are the singular values.
    let norms: Vec<f64> = (0..n)
        .map(|j| w.column(j).iter().map(|x| x * x).sum::<f64>().sqrt())
        .collect();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| {
        norms[j]
            .partial_cmp(&norms[i])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut sigma = Array1::zeros(k);
    let mut u = Array2::zeros((m, k));
    let mut vt = Array2::zeros((k, n));
    for (idx, &col) in order.iter().take(k).enumerate() {
        let s = norms[col];
        sigma[idx] = s;
        if s > 0.0 {
            for i in 0..m {
                u[[i, idx]] = w[[i, col]] / s;
            }
        }
        for j in 0..n {
            vt[[idx, j]] = v[[j, col]];
        }
    }

    (u, sigma, vt)
}

/// Pseudoinverse with SVD and a relative singular value cutoff.
///
/// Singular values at or below `rcond * sigma_max` are treated as zero,
/// as `numpy.linalg.pinv(a, rcond)` does. Rank-deficient input yields the
/// minimum-norm least-squares inverse.
pub fn pinv_svd(a: &Array2<f64>, rcond: f64) -> Array2<f64> {
    let (u, sigma, vt) = svd_small(a);
    let (m, n) = a.dim();
    let mut result = Array2::zeros((n, m));

    let sigma_max = sigma.iter().cloned().fold(0.0_f64, f64::max);
    let cutoff = rcond * sigma_max;

    for idx in 0..sigma.len() {
        if sigma[idx] > cutoff && sigma[idx] > 0.0 {
            let inv_s = 1.0 / sigma[idx];
            for i in 0..n {
                for j in 0..m {
                    result[[i, j]] += vt[[idx, i]] * inv_s * u[[j, idx]];
                }
            }
        }
    }

    result
}

/// Minimum-norm least-squares solution of `a x = b` via the pseudoinverse.
pub fn lstsq_pinv(a: &Array2<f64>, b: &Array1<f64>, rcond: f64) -> Array1<f64> {
    pinv_svd(a, rcond).dot(b)
}

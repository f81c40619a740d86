// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Quadrupole Transport Matrices
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Linear transport (R) matrices of a quadrupole in one transverse plane.
//!
//! Thick model, with `√|k|·L = φ`:
//!   k > 0:  [[cos φ, sin φ/√k], [-√k sin φ, cos φ]]
//!   k < 0:  [[cosh φ, sinh φ/√|k|], [√|k| sinh φ, cosh φ]]
//!   k = 0:  [[1, L], [0, 1]]  (drift)
//! Thin model: [[1, 0], [-k·L, 1]] (impulse kick).

use crate::shape::from_mat2s;
use ndarray::{ArrayD, ArrayViewD};
use qscan_math::linalg::Mat2;
use qscan_types::error::EmitResult;

/// R matrix for a single focusing strength `k` [m⁻²] and length `q_len` [m].
///
/// NaN or infinite `k` propagates into the entries instead of being rejected.
pub fn quad_rmat(k: f64, q_len: f64, thin_lens: bool) -> Mat2 {
    if thin_lens {
        return [[1.0, 0.0], [-k * q_len, 1.0]];
    }

    let sqrt_k = k.abs().sqrt();
    let phi = sqrt_k * q_len;
    if k > 0.0 {
        let (sin, cos) = phi.sin_cos();
        [[cos, sin / sqrt_k], [-sqrt_k * sin, cos]]
    } else if k < 0.0 {
        let (sinh, cosh) = (phi.sinh(), phi.cosh());
        [[cosh, sinh / sqrt_k], [sqrt_k * sinh, cosh]]
    } else if k == 0.0 {
        [[1.0, q_len], [0.0, 1.0]]
    } else {
        [[f64::NAN; 2]; 2]
    }
}

/// R matrices for every entry of `k`, shape `(*k.shape, 2, 2)`.
pub fn build_transport_matrix(
    k: &ArrayViewD<'_, f64>,
    q_len: f64,
    thin_lens: bool,
) -> EmitResult<ArrayD<f64>> {
    let mats: Vec<Mat2> = k.iter().map(|&ki| quad_rmat(ki, q_len, thin_lens)).collect();
    from_mat2s(k.shape(), &mats)
}

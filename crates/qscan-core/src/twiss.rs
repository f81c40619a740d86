// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Twiss Transport
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Lift of a 2x2 R matrix to the 3x3 map acting on `(β, α, γ)`.

use crate::shape::{check_trailing, pack, to_mat2s};
use ndarray::{ArrayD, ArrayViewD};
use qscan_math::linalg::Mat2;
use qscan_types::error::EmitResult;

pub type Mat3 = [[f64; 3]; 3];

/// Twiss transport matrix for one R matrix `[[c, s], [cp, sp]]`.
pub fn twiss_transport(r: &Mat2) -> Mat3 {
    let [[c, s], [cp, sp]] = *r;
    [
        [c * c, -2.0 * c * s, s * s],
        [-c * cp, c * sp + cp * s, -s * sp],
        [cp * cp, -2.0 * cp * sp, sp * sp],
    ]
}

pub fn apply_3x3(t: &Mat3, v: &[f64; 3]) -> [f64; 3] {
    std::array::from_fn(|i| t[i][0] * v[0] + t[i][1] * v[1] + t[i][2] * v[2])
}

/// Twiss transport matrices for a batch of R matrices, shape `(*lead, 3, 3)`.
pub fn twiss_transport_from_rmat(rmat: &ArrayViewD<'_, f64>) -> EmitResult<ArrayD<f64>> {
    check_trailing(rmat.shape(), &[2, 2], "rmat")?;
    let lead = &rmat.shape()[..rmat.ndim() - 2];
    let data: Vec<f64> = to_mat2s(rmat)
        .iter()
        .flat_map(|r| twiss_transport(r).into_iter().flatten())
        .collect();
    let mut shape = lead.to_vec();
    shape.extend_from_slice(&[3, 3]);
    pack(&shape, data)
}

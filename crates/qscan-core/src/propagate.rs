// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Propagation & Mismatch
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Beam matrix propagation through R matrices and BMAG evaluation.
//!
//! The beam matrix and the Twiss triplet describe the same ellipse:
//!   (β, α, γ) = (σ11, -σ12, σ22) / ε,   ε = sqrt(σ11·σ22 - σ12²)
//! Propagation rescales to Twiss, applies the 3x3 Twiss map and rescales
//! back. A negative radicand gives ε = NaN and NaN downstream.

use crate::shape::{
    broadcast_shapes, broadcast_to, check_trailing, from_triplets, pack, to_mat2s, to_triplets,
};
use crate::twiss::{apply_3x3, twiss_transport};
use ndarray::{ArrayD, ArrayViewD};
use qscan_types::error::EmitResult;

/// Geometric emittance of `(σ11, σ12, σ22)`; NaN if the matrix is not
/// positive-semidefinite.
pub fn beam_emittance(sigma: &[f64; 3]) -> f64 {
    (sigma[0] * sigma[2] - sigma[1] * sigma[1]).sqrt()
}

pub fn twiss_from_beam_matrix(sigma: &[f64; 3], emit: f64) -> [f64; 3] {
    [sigma[0] / emit, -sigma[1] / emit, sigma[2] / emit]
}

pub fn beam_matrix_from_twiss(twiss: &[f64; 3], emit: f64) -> [f64; 3] {
    [twiss[0] * emit, -twiss[1] * emit, twiss[2] * emit]
}

/// BMAG of a propagated Twiss triplet `(β, α, γ)` against design `(β0, α0)`:
///   ½(β·γ0 - 2·α·α0 + γ·β0),  γ0 = (1 + α0²)/β0
pub fn bmag_from_twiss(twiss: &[f64; 3], beta0: f64, alpha0: f64) -> f64 {
    let [beta, alpha, gamma] = *twiss;
    let gamma0 = (1.0 + alpha0 * alpha0) / beta0;
    0.5 * (beta * gamma0 - 2.0 * alpha * alpha0 + gamma * beta0)
}

/// Mismatch between `(beta, alpha)` and a reference `(beta_ref, alpha_ref)`
/// using only β and α:
///   ½(βr/β + β/βr + β·βr·(α/β - αr/βr)²)
pub fn bmag_func(beta: f64, alpha: f64, beta_ref: f64, alpha_ref: f64) -> f64 {
    let shear = alpha / beta - alpha_ref / beta_ref;
    0.5 * (beta_ref / beta + beta / beta_ref + beta * beta_ref * shear * shear)
}

struct Propagated {
    lead: Vec<usize>,
    beam: Vec<[f64; 3]>,
    twiss: Vec<[f64; 3]>,
}

fn with_trailing(lead: &[usize], trailing: &[usize]) -> Vec<usize> {
    let mut shape = lead.to_vec();
    shape.extend_from_slice(trailing);
    shape
}

fn propagate(
    beam_matrix: &ArrayViewD<'_, f64>,
    rmat: &ArrayViewD<'_, f64>,
) -> EmitResult<Propagated> {
    check_trailing(beam_matrix.shape(), &[3, 1], "beam_matrix")?;
    check_trailing(rmat.shape(), &[2, 2], "rmat")?;
    let lead = broadcast_shapes(
        &beam_matrix.shape()[..beam_matrix.ndim() - 2],
        &rmat.shape()[..rmat.ndim() - 2],
    )?;
    let sigmas = to_triplets(&broadcast_to(
        beam_matrix,
        &with_trailing(&lead, &[3, 1]),
        "beam_matrix",
    )?);
    let rmats = to_mat2s(&broadcast_to(rmat, &with_trailing(&lead, &[2, 2]), "rmat")?);

    let mut beam = Vec::with_capacity(sigmas.len());
    let mut twiss = Vec::with_capacity(sigmas.len());
    for (sigma, r) in sigmas.iter().zip(&rmats) {
        let emit = beam_emittance(sigma);
        let t = apply_3x3(&twiss_transport(r), &twiss_from_beam_matrix(sigma, emit));
        beam.push(beam_matrix_from_twiss(&t, emit));
        twiss.push(t);
    }
    Ok(Propagated { lead, beam, twiss })
}

/// Propagate beam matrices `(..., 3, 1)` through R matrices `(..., 2, 2)`.
///
/// Leading dimensions broadcast. Returns the final beam matrices
/// `(*lead, 3, 1)` and Twiss triplets `(*lead, 3)`.
pub fn propagate_beam_matrix(
    beam_matrix: &ArrayViewD<'_, f64>,
    rmat: &ArrayViewD<'_, f64>,
) -> EmitResult<(ArrayD<f64>, ArrayD<f64>)> {
    let p = propagate(beam_matrix, rmat)?;
    Ok((
        from_triplets(&p.lead, &[3, 1], &p.beam)?,
        from_triplets(&p.lead, &[3], &p.twiss)?,
    ))
}

/// BMAG for Twiss triplets `(..., 3)`; `beta0` and `alpha0` broadcast to
/// the leading shape.
pub fn bmag_at(
    twiss: &ArrayViewD<'_, f64>,
    beta0: &ArrayViewD<'_, f64>,
    alpha0: &ArrayViewD<'_, f64>,
) -> EmitResult<ArrayD<f64>> {
    check_trailing(twiss.shape(), &[3], "twiss")?;
    let lead = &twiss.shape()[..twiss.ndim() - 1];
    let beta0 = broadcast_to(beta0, lead, "beta0")?;
    let alpha0 = broadcast_to(alpha0, lead, "alpha0")?;
    let values: Vec<f64> = to_triplets(twiss)
        .iter()
        .zip(beta0.iter().zip(alpha0.iter()))
        .map(|(t, (&b0, &a0))| bmag_from_twiss(t, b0, a0))
        .collect();
    pack(lead, values)
}

/// BMAG after propagating `beam_matrix` through `rmat`, shape `(*lead)`.
pub fn compute_bmag(
    beam_matrix: &ArrayViewD<'_, f64>,
    rmat: &ArrayViewD<'_, f64>,
    beta0: &ArrayViewD<'_, f64>,
    alpha0: &ArrayViewD<'_, f64>,
) -> EmitResult<ArrayD<f64>> {
    let (_, twiss) = propagate_beam_matrix(beam_matrix, rmat)?;
    bmag_at(&twiss.view(), beta0, alpha0)
}

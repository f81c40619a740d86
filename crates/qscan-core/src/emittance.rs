// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Emittance & BMAG Orchestrator
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Quadrupole scan → emittance, beam matrix, Twiss at screen and BMAG.

use crate::propagate::{beam_emittance, bmag_at, propagate_beam_matrix};
use crate::reconstruct::{reconstruct_beam_matrix, ScanFit};
use crate::shape::{broadcast_to, pack, to_triplets};
use ndarray::{ArrayD, ArrayViewD, Axis};
use qscan_types::batch::BatchShape;
use qscan_types::config::FitConfig;
use qscan_types::constants::ELECTRON_REST_ENERGY_GEV;
use qscan_types::error::{EmitError, EmitResult};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct EmitBmagResult {
    /// Geometric emittance, shape `(*batch, 1)`. NaN for an invalid fit.
    pub emittance: ArrayD<f64>,
    /// Mismatch per step, shape `(*batch, n_steps)`, when design Twiss was given.
    pub bmag: Option<ArrayD<f64>>,
    /// `(σ11, σ12, σ22)` at the quad entrance, shape `(*batch, 3, 1)`.
    pub beam_matrix: ArrayD<f64>,
    /// `(β, α, γ)` at the screen per step, shape `(*batch, n_steps, 3)`.
    pub twiss_at_screen: ArrayD<f64>,
    pub fits: Vec<ScanFit>,
}

type DesignTwiss<'a, 'b> = Option<(ArrayViewD<'a, f64>, ArrayViewD<'b, f64>)>;

/// Design Twiss must come as a pair, broadcastable to the batch shape.
fn design_twiss<'a, 'b>(
    beta0: Option<&'a ArrayViewD<'_, f64>>,
    alpha0: Option<&'b ArrayViewD<'_, f64>>,
    batch: &BatchShape,
) -> EmitResult<DesignTwiss<'a, 'b>> {
    match (beta0, alpha0) {
        (None, None) => Ok(None),
        (Some(_), None) => Err(EmitError::IncompleteDesignTwiss { missing: "alpha0" }),
        (None, Some(_)) => Err(EmitError::IncompleteDesignTwiss { missing: "beta0" }),
        (Some(b), Some(a)) => Ok(Some((
            broadcast_to(b, batch.dims(), "beta0")?,
            broadcast_to(a, batch.dims(), "alpha0")?,
        ))),
    }
}

/// Reconstruct the beam matrix from a quadrupole scan and evaluate
/// emittance, Twiss at the screen and (optionally) BMAG.
///
/// `beta0` and `alpha0` are both-or-neither: supplying exactly one is an
/// `IncompleteDesignTwiss` error raised before any fitting. A scan that
/// fails to converge is not an error; see `fits`.
pub fn compute_emit_bmag(
    k: &ArrayViewD<'_, f64>,
    beamsize_sq: &ArrayViewD<'_, f64>,
    q_len: f64,
    rmat: &ArrayViewD<'_, f64>,
    beta0: Option<&ArrayViewD<'_, f64>>,
    alpha0: Option<&ArrayViewD<'_, f64>>,
    config: &FitConfig,
) -> EmitResult<EmitBmagResult> {
    let batch = BatchShape::from_leading(beamsize_sq.shape(), 1)?;
    let design = design_twiss(beta0, alpha0, &batch)?;

    let rec = reconstruct_beam_matrix(k, beamsize_sq, q_len, rmat, config)?;
    let step_axis = Axis(rec.batch.ndim());

    // Same beam for every step of its scan.
    let beam_per_step = rec.beam_matrix.view().insert_axis(step_axis);
    let (_, twiss_at_screen) = propagate_beam_matrix(&beam_per_step, &rec.total_rmat.view())?;

    let emits: Vec<f64> = to_triplets(&rec.beam_matrix.view())
        .iter()
        .map(beam_emittance)
        .collect();
    let emittance = pack(&rec.batch.with_trailing(&[1]), emits)?;

    let bmag = match design {
        Some((beta0, alpha0)) => Some(bmag_at(
            &twiss_at_screen.view(),
            &beta0.insert_axis(step_axis),
            &alpha0.insert_axis(step_axis),
        )?),
        None => None,
    };

    tracing::debug!(
        scans = rec.fits.len(),
        converged = rec.all_converged(),
        with_bmag = bmag.is_some(),
        "emittance computed"
    );

    Ok(EmitBmagResult {
        emittance,
        bmag,
        beam_matrix: rec.beam_matrix,
        twiss_at_screen,
        fits: rec.fits,
    })
}

/// Normalized emittance `γ·β·ε` with `γ = E / m_e c²` (E in GeV) and
/// `β = sqrt(1 - 1/(2γ²))`.
///
/// The β expression is the high-energy expansion, not `sqrt(1 - 1/γ²)`.
/// It is kept as is so results match existing measurements.
pub fn normalize_emittance(emit: f64, energy_gev: f64) -> f64 {
    let gamma = energy_gev / ELECTRON_REST_ENERGY_GEV;
    let beta = (1.0 - 1.0 / (2.0 * gamma * gamma)).sqrt();
    gamma * beta * emit
}

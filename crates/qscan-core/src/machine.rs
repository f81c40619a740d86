// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Machine Units Front End
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Two-plane quadrupole scans in control-system units.
//!
//! Quad settings arrive as integrated gradient BDES [kG], beam sizes as RMS
//! values [m], one series per transverse plane. The same magnet focuses in
//! x and defocuses in y, so k is negated for the y plane.

use crate::emittance::{compute_emit_bmag, EmitBmagResult};
use ndarray::{arr0, Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis};
use qscan_math::linalg::lstsq_pinv;
use qscan_types::config::FitConfig;
use qscan_types::constants::SPEED_OF_LIGHT_MM_PER_NS;
use qscan_types::error::{EmitError, EmitResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Grid resolution for the geometric-mean BMAG search.
const BMAG_GRID_POINTS: usize = 100;

/// Magnetic rigidity Bρ [kG·m] of a particle with total energy `e_tot_ev`.
pub fn magnetic_rigidity(e_tot_ev: f64) -> f64 {
    e_tot_ev / 1e9 / SPEED_OF_LIGHT_MM_PER_NS * 1e4
}

/// Geometric focusing strength k [m⁻²] from BDES [kG].
pub fn bdes_to_kmod(e_tot_ev: f64, l_eff: f64, bdes: f64) -> f64 {
    bdes / l_eff / magnetic_rigidity(e_tot_ev)
}

/// BDES [kG] from focusing strength k [m⁻²].
pub fn kmod_to_bdes(e_tot_ev: f64, l_eff: f64, k: f64) -> f64 {
    k * magnetic_rigidity(e_tot_ev) * l_eff
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Plane {
    X,
    Y,
}

impl Plane {
    pub fn index(self) -> usize {
        match self {
            Plane::X => 0,
            Plane::Y => 1,
        }
    }

    fn k_sign(self) -> f64 {
        match self {
            Plane::X => 1.0,
            Plane::Y => -1.0,
        }
    }
}

/// One plane's scan after dropping NaN beam sizes and converting units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaneInputs {
    pub plane: Plane,
    /// Focusing strengths k [m⁻²], sign already applied for the plane.
    pub kmod: Array1<f64>,
    /// Squared beam sizes [mm²].
    pub beamsize_sq: Array1<f64>,
    /// Kept BDES values [kG].
    pub quad_values: Array1<f64>,
    /// Kept RMS beam sizes [m].
    pub rms_beamsizes: Array1<f64>,
}

fn plane_inputs(
    plane: Plane,
    quad_vals: ArrayView1<'_, f64>,
    beamsizes: ArrayView1<'_, f64>,
    energy_ev: f64,
    q_len: f64,
) -> EmitResult<PlaneInputs> {
    if quad_vals.len() != beamsizes.len() {
        return Err(EmitError::ShapeMismatch(format!(
            "plane {plane:?}: {} quad values but {} beam sizes",
            quad_vals.len(),
            beamsizes.len()
        )));
    }
    let (quad_values, rms_beamsizes): (Vec<f64>, Vec<f64>) = quad_vals
        .iter()
        .zip(beamsizes.iter())
        .filter(|(_, b)| !b.is_nan())
        .map(|(&q, &b)| (q, b))
        .unzip();
    let dropped = quad_vals.len() - quad_values.len();
    if dropped > 0 {
        tracing::debug!(plane = ?plane, dropped, "dropping steps with NaN beam size");
    }

    let kmod = quad_values
        .iter()
        .map(|&q| plane.k_sign() * bdes_to_kmod(energy_ev, q_len, q))
        .collect();
    let beamsize_sq = rms_beamsizes.iter().map(|&b| (b * 1e3) * (b * 1e3)).collect();
    Ok(PlaneInputs {
        plane,
        kmod,
        beamsize_sq,
        quad_values: Array1::from(quad_values),
        rms_beamsizes: Array1::from(rms_beamsizes),
    })
}

/// Filter and convert both planes, given in `[x, y]` order. NaN filtering
/// is independent per plane.
pub fn preprocess_inputs(
    quad_vals: [ArrayView1<'_, f64>; 2],
    beamsizes: [ArrayView1<'_, f64>; 2],
    energy_ev: f64,
    q_len: f64,
) -> EmitResult<[PlaneInputs; 2]> {
    let [qx, qy] = quad_vals;
    let [bx, by] = beamsizes;
    Ok([
        plane_inputs(Plane::X, qx, bx, energy_ev, q_len)?,
        plane_inputs(Plane::Y, qy, by, energy_ev, q_len)?,
    ])
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaneResult {
    pub inputs: PlaneInputs,
    pub result: EmitBmagResult,
}

/// Emittance and BMAG for both planes of a scan in machine units.
///
/// `rmat` has shape `(2, 2, 2)`: one quad-exit → screen R matrix per plane.
/// `twiss_design`, when given, has shape `(2, 2)` with rows `[β0, α0]` per
/// plane. A plane whose beam sizes are all NaN is a `ShapeMismatch`.
pub fn compute_emit_bmag_machine_units(
    quad_vals: [ArrayView1<'_, f64>; 2],
    beamsizes: [ArrayView1<'_, f64>; 2],
    q_len: f64,
    rmat: &ArrayView3<'_, f64>,
    energy_ev: f64,
    twiss_design: Option<&ArrayView2<'_, f64>>,
    config: &FitConfig,
) -> EmitResult<[PlaneResult; 2]> {
    if rmat.shape() != [2, 2, 2] {
        return Err(EmitError::ShapeMismatch(format!(
            "rmat must have shape [2, 2, 2], got {:?}",
            rmat.shape()
        )));
    }
    if let Some(design) = twiss_design {
        if design.shape() != [2, 2] {
            return Err(EmitError::ShapeMismatch(format!(
                "twiss_design must have shape [2, 2], got {:?}",
                design.shape()
            )));
        }
    }

    let [x, y] = preprocess_inputs(quad_vals, beamsizes, energy_ev, q_len)?;
    let solve = |inputs: PlaneInputs| -> EmitResult<PlaneResult> {
        let i = inputs.plane.index();
        let k = inputs.kmod.view().into_dyn();
        let sizes = inputs.beamsize_sq.view().into_dyn();
        let r = rmat.index_axis(Axis(0), i).into_dyn();
        let design = twiss_design.map(|d| {
            (
                arr0(d[[i, 0]]).into_dyn(),
                arr0(d[[i, 1]]).into_dyn(),
            )
        });
        let (beta0, alpha0) = match &design {
            Some((b, a)) => (Some(b.view()), Some(a.view())),
            None => (None, None),
        };
        let result = compute_emit_bmag(
            &k,
            &sizes,
            q_len,
            &r,
            beta0.as_ref(),
            alpha0.as_ref(),
            config,
        )?;
        Ok(PlaneResult { inputs, result })
    };
    Ok([solve(x)?, solve(y)?])
}

/// Which mismatch `best_bmag` minimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BmagMode {
    X,
    Y,
    /// `sqrt(BMAG_x · BMAG_y)` from quadratic fits over the shared quad range.
    #[default]
    GeometricMean,
}

impl BmagMode {
    fn plane(self) -> Option<Plane> {
        match self {
            BmagMode::X => Some(Plane::X),
            BmagMode::Y => Some(Plane::Y),
            BmagMode::GeometricMean => None,
        }
    }
}

/// Case-insensitive name, or the plane index `0` / `1`.
impl FromStr for BmagMode {
    type Err = EmitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x" | "0" => Ok(BmagMode::X),
            "y" | "1" => Ok(BmagMode::Y),
            "geometric_mean" => Ok(BmagMode::GeometricMean),
            _ => Err(EmitError::ConfigError(format!(
                "invalid bmag mode {s:?}, must be one of: x, y, geometric_mean"
            ))),
        }
    }
}

/// Lowest BMAG of a two-plane scan and the quad setting [kG] where it occurs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BestBmag {
    pub bmag: f64,
    pub quad_value: f64,
}

/// `(quad value, bmag)` pairs of one plane with NaN mismatches dropped.
fn bmag_series(plane: &PlaneResult) -> EmitResult<(Vec<f64>, Vec<f64>)> {
    let bmag = plane.result.bmag.as_ref().ok_or(EmitError::BmagUnavailable)?;
    Ok(plane
        .inputs
        .quad_values
        .iter()
        .zip(bmag.iter())
        .filter(|(_, b)| !b.is_nan())
        .map(|(&q, &b)| (q, b))
        .unzip())
}

fn argmin(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
}

/// Least-squares parabola through `(q, b)`, fitted in `q` centred and scaled
/// to `[-1, 1]`.
fn quadratic_fit(q: &[f64], b: &[f64]) -> impl Fn(f64) -> f64 {
    let lo = q.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = q.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mid = 0.5 * (lo + hi);
    let half = if hi > lo { 0.5 * (hi - lo) } else { 1.0 };
    let vander = Array2::from_shape_fn((q.len(), 3), |(i, j)| {
        let t = (q[i] - mid) / half;
        t.powi(2 - j as i32)
    });
    let coeffs = lstsq_pinv(&vander, &Array1::from(b.to_vec()), 1e-15);
    move |x: f64| {
        let t = (x - mid) / half;
        (coeffs[0] * t + coeffs[1]) * t + coeffs[2]
    }
}

/// Best BMAG of a two-plane scan and the quad value that achieves it.
///
/// `X` and `Y` pick the lowest measured step of that plane. `GeometricMean`
/// fits BMAG against quad value with a parabola per plane and searches
/// `sqrt(fit_x · fit_y)` on a uniform grid spanning both planes' settings,
/// so the returned quad value need not be one of the scan steps.
pub fn best_bmag(planes: &[PlaneResult; 2], mode: BmagMode) -> EmitResult<BestBmag> {
    if let Some(plane) = mode.plane() {
        let (quads, bmag) = bmag_series(&planes[plane.index()])?;
        let i = argmin(&bmag).ok_or(EmitError::BmagUnavailable)?;
        return Ok(BestBmag {
            bmag: bmag[i],
            quad_value: quads[i],
        });
    }

    let (qx, bx) = bmag_series(&planes[Plane::X.index()])?;
    let (qy, by) = bmag_series(&planes[Plane::Y.index()])?;
    if qx.is_empty() || qy.is_empty() {
        return Err(EmitError::BmagUnavailable);
    }
    let lo = qx.iter().chain(&qy).copied().fold(f64::INFINITY, f64::min);
    let hi = qx.iter().chain(&qy).copied().fold(f64::NEG_INFINITY, f64::max);
    let (fit_x, fit_y) = (quadratic_fit(&qx, &bx), quadratic_fit(&qy, &by));
    let grid = Array1::linspace(lo, hi, BMAG_GRID_POINTS);
    let mean: Vec<f64> = grid.iter().map(|&q| (fit_x(q) * fit_y(q)).sqrt()).collect();
    let i = argmin(&mean).ok_or(EmitError::BmagUnavailable)?;
    tracing::debug!(bmag = mean[i], quad_value = grid[i], "best geometric-mean bmag");
    Ok(BestBmag {
        bmag: mean[i],
        quad_value: grid[i],
    })
}

// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Shape Helpers
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Broadcasting and packing helpers for batched 2x2 / 3-vector quantities.
//!
//! Broadcasting follows numpy: shapes are right-aligned, missing leading
//! dimensions are prepended and size-1 dimensions stretch.

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use qscan_math::linalg::Mat2;
use qscan_types::error::{EmitError, EmitResult};

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> EmitResult<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut out = vec![0; ndim];
    for i in 0..ndim {
        let da = if i < ndim - a.len() { 1 } else { a[i - (ndim - a.len())] };
        let db = if i < ndim - b.len() { 1 } else { b[i - (ndim - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(EmitError::ShapeMismatch(format!(
                    "shapes {a:?} and {b:?} cannot be broadcast together"
                )))
            }
        };
    }
    Ok(out)
}

/// View `array` with `shape`, or a `ShapeMismatch` naming `what`.
pub fn broadcast_to<'a>(
    array: &'a ArrayViewD<'_, f64>,
    shape: &[usize],
    what: &str,
) -> EmitResult<ArrayViewD<'a, f64>> {
    array.broadcast(IxDyn(shape)).ok_or_else(|| {
        EmitError::ShapeMismatch(format!(
            "{what} of shape {:?} cannot be broadcast to {shape:?}",
            array.shape()
        ))
    })
}

/// Require the last dimensions of `shape` to equal `trailing`.
pub fn check_trailing(shape: &[usize], trailing: &[usize], what: &str) -> EmitResult<()> {
    if shape.len() < trailing.len() || shape[shape.len() - trailing.len()..] != *trailing {
        return Err(EmitError::ShapeMismatch(format!(
            "{what} must have trailing dimensions {trailing:?}, got shape {shape:?}"
        )));
    }
    Ok(())
}

/// Unpack a `(..., 2, 2)` array into row-major 2x2 matrices.
pub fn to_mat2s(array: &ArrayViewD<'_, f64>) -> Vec<Mat2> {
    let flat: Vec<f64> = array.iter().copied().collect();
    flat.chunks_exact(4)
        .map(|m| [[m[0], m[1]], [m[2], m[3]]])
        .collect()
}

/// Pack 2x2 matrices into an array of shape `(*lead, 2, 2)`.
pub fn from_mat2s(lead: &[usize], mats: &[Mat2]) -> EmitResult<ArrayD<f64>> {
    let mut shape = lead.to_vec();
    shape.extend_from_slice(&[2, 2]);
    let data: Vec<f64> = mats
        .iter()
        .flat_map(|m| [m[0][0], m[0][1], m[1][0], m[1][1]])
        .collect();
    pack(&shape, data)
}

/// Unpack a `(..., 3, 1)` column-vector array (or `(..., 3)`) into triplets.
pub fn to_triplets(array: &ArrayViewD<'_, f64>) -> Vec<[f64; 3]> {
    let flat: Vec<f64> = array.iter().copied().collect();
    flat.chunks_exact(3).map(|v| [v[0], v[1], v[2]]).collect()
}

/// Pack triplets into an array of shape `(*lead, *trailing)` where
/// `trailing` is `[3]` or `[3, 1]`.
pub fn from_triplets(
    lead: &[usize],
    trailing: &[usize],
    values: &[[f64; 3]],
) -> EmitResult<ArrayD<f64>> {
    let mut shape = lead.to_vec();
    shape.extend_from_slice(trailing);
    let data: Vec<f64> = values.iter().flat_map(|v| v.iter().copied()).collect();
    pack(&shape, data)
}

/// Row-major array from flat data.
pub fn pack(shape: &[usize], data: Vec<f64>) -> EmitResult<ArrayD<f64>> {
    let len = data.len();
    ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|e| {
        EmitError::ShapeMismatch(format!("{len} values do not fill shape {shape:?}: {e}"))
    })
}

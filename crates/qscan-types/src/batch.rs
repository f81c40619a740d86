// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Batch Shape
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Leading "scan batch" dimensions shared by every array in a call.

use crate::error::{EmitError, EmitResult};

/// Independent scans laid out in row-major order.
///
/// An empty dimension list is a single unbatched scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchShape {
    dims: Vec<usize>,
}

impl BatchShape {
    pub fn new(dims: &[usize]) -> Self {
        BatchShape {
            dims: dims.to_vec(),
        }
    }

    /// Split `shape` into batch dimensions and `trailing` per-scan dimensions.
    pub fn from_leading(shape: &[usize], trailing: usize) -> EmitResult<Self> {
        if shape.len() < trailing {
            return Err(EmitError::ShapeMismatch(format!(
                "expected at least {trailing} dimensions, got shape {shape:?}"
            )));
        }
        Ok(Self::new(&shape[..shape.len() - trailing]))
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Number of independent scans.
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full shape of a per-scan quantity with the given trailing dimensions.
    pub fn with_trailing(&self, trailing: &[usize]) -> Vec<usize> {
        let mut shape = self.dims.clone();
        shape.extend_from_slice(trailing);
        shape
    }
}

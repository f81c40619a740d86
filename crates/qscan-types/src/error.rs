// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Errors
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use thiserror::Error;

/// Contract violations only. Noisy or degenerate scan data never lands
/// here: it shows up as non-finite numbers or a non-converged fit status.
#[derive(Error, Debug)]
pub enum EmitError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Design twiss must supply both beta0 and alpha0 (missing {missing})")]
    IncompleteDesignTwiss { missing: &'static str },

    #[error("BMAG values are not available for this measurement")]
    BmagUnavailable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type EmitResult<T> = Result<T, EmitError>;

// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Constants
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
/// Electron rest energy (GeV), as used for emittance normalization.
pub const ELECTRON_REST_ENERGY_GEV: f64 = 0.511e-3;

/// Speed of light (mm/ns). Rigidity Bρ[kG·m] = E[eV] / 1e9 / C * 1e4.
pub const SPEED_OF_LIGHT_MM_PER_NS: f64 = 299.792458;

/// Margin keeping the fitted correlation strictly inside (-1, 1) and the
/// initial λ guesses away from zero.
pub const CORRELATION_EPS: f64 = 1.0e-6;

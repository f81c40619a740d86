// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Core
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Quadrupole-scan emittance and BMAG reconstruction.
//!
//! transport → twiss → reconstruct → propagate → emittance,
//! with `machine` as the control-system-units front end.

pub mod emittance;
pub mod gradient;
pub mod machine;
pub mod propagate;
pub mod reconstruct;
pub mod shape;
pub mod transport;
pub mod twiss;

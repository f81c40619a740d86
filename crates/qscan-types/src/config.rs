// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Config
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use crate::error::{EmitError, EmitResult};
use serde::{Deserialize, Serialize};

/// How the reconstruction optimizer obtains the residual Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradientMode {
    #[default]
    /// Exact derivatives via forward-mode dual numbers.
    /// Falls back to `Numeric` when built without the `autodiff` feature.
    Autodiff,
    /// Central finite differences.
    Numeric,
}

/// Settings for one `compute_emit_bmag` / `reconstruct_beam_matrix` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    /// Thin-lens (impulse kick) quadrupole model instead of the thick model.
    #[serde(default)]
    pub thin_lens: bool,
    /// Optimizer iteration cap per scan. `None` runs to convergence.
    #[serde(default)]
    pub max_iter: Option<usize>,
    #[serde(default)]
    pub gradient: GradientMode,
    /// Relative step for the finite-difference Jacobian (default: 1e-7)
    #[serde(default = "default_fd_step")]
    pub fd_step: f64,
    /// Initial Levenberg-Marquardt damping (default: 1e-3)
    #[serde(default = "default_initial_damping")]
    pub initial_damping: f64,
    /// Relative cost reduction below which an accepted step ends the fit.
    #[serde(default = "default_tolerance")]
    pub ftol: f64,
    /// Relative step length below which the fit ends.
    #[serde(default = "default_tolerance")]
    pub xtol: f64,
    /// Cosine between residual and Jacobian columns below which the fit ends.
    #[serde(default = "default_tolerance")]
    pub gtol: f64,
    /// Solve batch elements on the rayon pool.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

fn default_fd_step() -> f64 {
    1e-7
}
fn default_initial_damping() -> f64 {
    1e-3
}
fn default_tolerance() -> f64 {
    1e-12
}
fn default_parallel() -> bool {
    true
}

impl Default for FitConfig {
    fn default() -> Self {
        FitConfig {
            thin_lens: false,
            max_iter: None,
            gradient: GradientMode::default(),
            fd_step: default_fd_step(),
            initial_damping: default_initial_damping(),
            ftol: default_tolerance(),
            xtol: default_tolerance(),
            gtol: default_tolerance(),
            parallel: default_parallel(),
        }
    }
}

impl FitConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &str) -> EmitResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EmitResult<()> {
        if self.max_iter == Some(0) {
            return Err(EmitError::ConfigError(
                "fit.max_iter must be >= 1 when set".to_string(),
            ));
        }
        let positive = [
            ("fit.fd_step", self.fd_step),
            ("fit.initial_damping", self.initial_damping),
            ("fit.ftol", self.ftol),
            ("fit.xtol", self.xtol),
            ("fit.gtol", self.gtol),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(EmitError::ConfigError(format!(
                    "{name} must be finite and > 0, got {value}"
                )));
            }
        }
        Ok(())
    }
}

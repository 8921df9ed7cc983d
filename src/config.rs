//! Optimizer configuration.
//!
//! `KfacConfig` is a plain struct with sensible defaults. It is validated once, when the
//! optimizer is constructed; every numeric field must be finite and non-negative.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "serde")]
use std::path::Path;

use crate::{Error, Result};

/// How the curvature factors are turned into a preconditioner.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Solver {
    /// Symmetric eigendecomposition of both factors; damping is added to the
    /// Kronecker product of the eigenvalues.
    #[default]
    Eigen,
    /// Factored Tikhonov damping (`pi`-scaled) followed by an explicit inverse of each factor.
    DampedInverse,
}

/// K-FAC hyperparameters.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KfacConfig {
    pub lr: f32,
    pub momentum: f32,
    /// Damping added to the curvature before inversion.
    pub damping: f32,
    /// Trust-region budget bounding the predicted quadratic change of the loss.
    pub kl_clip: f32,
    pub weight_decay: f32,
    /// Statistics are accumulated on steps where `steps % t_cov == 0`.
    pub t_cov: u64,
    /// Factors are re-inverted on steps where `steps % t_inv == 0`.
    pub t_inv: u64,
    /// Whether the loss gradient is already averaged over the batch.
    pub batch_averaged: bool,
    pub solver: Solver,
}

impl Default for KfacConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            momentum: 0.9,
            damping: 1e-3,
            kl_clip: 1e-3,
            weight_decay: 0.0,
            t_cov: 10,
            t_inv: 100,
            batch_averaged: true,
            solver: Solver::Eigen,
        }
    }
}

impl KfacConfig {
    /// Validate hyperparameters.
    pub fn validate(&self) -> Result<()> {
        let numeric = [
            ("learning rate", self.lr),
            ("momentum", self.momentum),
            ("damping", self.damping),
            ("kl_clip", self.kl_clip),
            ("weight_decay", self.weight_decay),
        ];
        for (name, value) in numeric {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be finite and >= 0, got {value}"
                )));
            }
        }
        if self.t_cov == 0 {
            return Err(Error::InvalidConfig("t_cov must be > 0".to_owned()));
        }
        if self.t_inv == 0 {
            return Err(Error::InvalidConfig("t_inv must be > 0".to_owned()));
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
impl KfacConfig {
    /// Serialize the config to a pretty-printed JSON string.
    pub fn to_json_string_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidData(format!("failed to serialize config: {e}")))
    }

    /// Parse and validate a config from JSON. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: KfacConfig = serde_json::from_str(s)
            .map_err(|e| Error::InvalidData(format!("failed to parse config json: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a config from a JSON file.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let s = std::fs::read_to_string(p)
            .map_err(|e| Error::InvalidData(format!("failed to read {}: {e}", p.display())))?;
        Self::from_json_str(&s)
    }
}

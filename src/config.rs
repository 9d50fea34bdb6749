//! Configuration of the domain decomposition.

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::constants::{
    DEFAULT_BUCKET_SIZE, DEFAULT_FOCUS_THETA, DEFAULT_HALO_FACTOR, DEFAULT_MAX_REBALANCE_ITERATIONS,
};
use crate::error::{DomainError, Result};
use crate::geometry::DomainBox;
use crate::sfc::CurveKind;

/// How the halo search radius is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaloRadius {
    /// The same radius for every particle.
    Fixed(f64),
    /// `factor` times the largest smoothing length over all ranks.
    PerParticle {
        /// Multiple of the smoothing length.
        factor: f64,
    },
}

impl Default for HaloRadius {
    fn default() -> Self {
        HaloRadius::PerParticle {
            factor: DEFAULT_HALO_FACTOR,
        }
    }
}

impl HaloRadius {
    /// The radius for a largest smoothing length of `max_h`.
    pub fn radius(&self, max_h: f64) -> f64 {
        match *self {
            HaloRadius::Fixed(radius) => radius,
            HaloRadius::PerParticle { factor } => factor * max_h,
        }
    }
}

/// Parameters of a [crate::domain::Domain].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Maximum number of particles in a leaf of the global tree.
    pub bucket_size: usize,
    /// Halo search radius.
    pub halo_radius: HaloRadius,
    /// Space filling curve of the keys.
    pub curve: CurveKind,
    /// Execution backend. Must match the backend type of the domain.
    pub backend: BackendKind,
    /// Opening angle of the focused tree.
    pub focus_theta: f64,
    /// Bound on the rebalance iterations of the global tree per step.
    pub max_rebalance_iterations: usize,
    /// Initial domain box. Open axes are recomputed from the particles.
    pub domain_box: DomainBox,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            halo_radius: HaloRadius::default(),
            curve: CurveKind::default(),
            backend: BackendKind::default(),
            focus_theta: DEFAULT_FOCUS_THETA,
            max_rebalance_iterations: DEFAULT_MAX_REBALANCE_ITERATIONS,
            domain_box: DomainBox::default(),
        }
    }
}

impl DomainConfig {
    /// Default configuration on the given box.
    pub fn new(domain_box: DomainBox) -> Self {
        Self {
            domain_box,
            ..Self::default()
        }
    }

    /// Parse and validate a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: DomainConfig = serde_json::from_str(json)
            .map_err(|e| DomainError::Config(format!("failed to parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DomainError::Config(format!("failed to serialize configuration: {e}")))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_size == 0 {
            return Err(DomainError::Config("bucket size must be positive".to_string()));
        }

        match self.halo_radius {
            HaloRadius::Fixed(radius) if !(radius.is_finite() && radius >= 0.0) => {
                return Err(DomainError::Config(format!(
                    "fixed halo radius must be finite and non-negative, got {radius}"
                )));
            }
            HaloRadius::PerParticle { factor } if !(factor.is_finite() && factor >= 0.0) => {
                return Err(DomainError::Config(format!(
                    "halo radius factor must be finite and non-negative, got {factor}"
                )));
            }
            _ => {}
        }

        if !(self.focus_theta.is_finite() && self.focus_theta > 0.0) {
            return Err(DomainError::Config(format!(
                "focus opening angle must be positive, got {}",
                self.focus_theta
            )));
        }

        if self.max_rebalance_iterations == 0 {
            return Err(DomainError::Config(
                "at least one rebalance iteration is required".to_string(),
            ));
        }

        self.domain_box.validate()
    }
}

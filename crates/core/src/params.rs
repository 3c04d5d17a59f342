//! Generation parameters, their defaults, limits, and validation.
//!
//! [`EditParams`] is the strongly-typed job specification carried by every
//! job. The backend-specific document is built from it later by the
//! workflow builder; nothing here knows about node ids or JSON layout.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Seed value meaning "let the system pick a random seed".
pub const RANDOM_SEED: u64 = 0;

/// Parameter values applied when a request leaves a field unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDefaults {
    pub steps: u32,
    pub cfg: f64,
    pub sampler: String,
    pub scheduler: String,
    pub seed: u64,
    pub strength: f64,
    pub eta: f64,
    pub denoise: f64,
    pub negative_prompt: String,
}

impl Default for ParamDefaults {
    fn default() -> Self {
        Self {
            steps: 8,
            cfg: 1.0,
            sampler: "linear/euler".to_string(),
            scheduler: "simple".to_string(),
            seed: RANDOM_SEED,
            strength: 0.5,
            eta: 0.5,
            denoise: 1.0,
            negative_prompt: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Inclusive bounds enforced before a job is admitted to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamLimits {
    pub min_steps: u32,
    pub max_steps: u32,
    pub min_cfg: f64,
    pub max_cfg: f64,
    pub min_strength: f64,
    pub max_strength: f64,
}

impl Default for ParamLimits {
    fn default() -> Self {
        Self {
            min_steps: 1,
            max_steps: 50,
            min_cfg: 0.1,
            max_cfg: 20.0,
            min_strength: 0.0,
            max_strength: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// EditParams
// ---------------------------------------------------------------------------

/// User-facing generation parameters for one image edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditParams {
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub cfg: f64,
    pub sampler: String,
    pub scheduler: String,
    /// `0` requests a random seed at build time.
    pub seed: u64,
    pub strength: f64,
    pub eta: f64,
    pub denoise: f64,
}

impl EditParams {
    /// Build parameters for `prompt` with every other field taken from
    /// `defaults`.
    pub fn with_defaults(prompt: impl Into<String>, defaults: &ParamDefaults) -> Self {
        Self {
            positive_prompt: prompt.into(),
            negative_prompt: defaults.negative_prompt.clone(),
            steps: defaults.steps,
            cfg: defaults.cfg,
            sampler: defaults.sampler.clone(),
            scheduler: defaults.scheduler.clone(),
            seed: defaults.seed,
            strength: defaults.strength,
            eta: defaults.eta,
            denoise: defaults.denoise,
        }
    }

    /// Check steps, cfg, and strength against the configured bounds.
    pub fn validate(&self, limits: &ParamLimits) -> Result<(), CoreError> {
        if !(limits.min_steps..=limits.max_steps).contains(&self.steps) {
            return Err(CoreError::Validation(format!(
                "Steps must be between {} and {}",
                limits.min_steps, limits.max_steps
            )));
        }
        if !(limits.min_cfg..=limits.max_cfg).contains(&self.cfg) {
            return Err(CoreError::Validation(format!(
                "CFG must be between {} and {}",
                limits.min_cfg, limits.max_cfg
            )));
        }
        if !(limits.min_strength..=limits.max_strength).contains(&self.strength) {
            return Err(CoreError::Validation(format!(
                "Strength must be between {} and {}",
                limits.min_strength, limits.max_strength
            )));
        }
        Ok(())
    }
}

/// Return `seed` unchanged, or a fresh random value in `0..=u32::MAX` when
/// the caller asked for a random seed.
pub fn resolve_seed(seed: u64) -> u64 {
    if seed == RANDOM_SEED {
        u64::from(rand::random::<u32>())
    } else {
        seed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

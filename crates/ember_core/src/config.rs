//! Renderer configuration.
//!
//! The defaults are the fixed constants of the pipeline; a JSON file can
//! override them for experiments (e.g. `bounce_count = 0`).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, PreconditionError};

/// Random pairs per ring slot. Fixed by the kernel contract (16x16 tile).
pub const RANDOM_TABLE_LEN: usize = 256;

/// Threads per work-group along each axis for every compute stage.
pub const WORKGROUP_SIZE: u32 = 8;

/// Tile edge used for random-table indexing (`blocks_wide = ceil(width / 16)`).
pub const RANDOM_TILE_SIZE: u32 = 16;

/// Upper bound on `max_frames_in_flight`.
pub const MAX_FRAMES_IN_FLIGHT: usize = 16;

/// Upper bound on `uniform_alignment` in bytes.
pub const MAX_UNIFORM_ALIGNMENT: u64 = 65_536;

/// Largest accepted viewport width or height.
pub const MAX_VIEWPORT_EXTENT: u32 = 16_384;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Vertical field of view in degrees
    pub field_of_view_degrees: f32,
    /// Frames whose GPU work may be outstanding at once (ring slot count)
    pub max_frames_in_flight: usize,
    /// Fixed number of bounce iterations per frame
    pub bounce_count: u32,
    /// Random pairs per slot; must equal [`RANDOM_TABLE_LEN`]
    pub random_table_len: usize,
    /// Uniform slot alignment in bytes (device `min_uniform_buffer_offset_alignment`)
    pub uniform_alignment: u64,
    /// Seed for the random tables; `None` draws from OS entropy
    pub seed: Option<u64>,
    /// Log frame statistics every N submitted frames (0 disables)
    pub log_interval_frames: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            field_of_view_degrees: 45.0,
            max_frames_in_flight: 3,
            bounce_count: 3,
            random_table_len: RANDOM_TABLE_LEN,
            uniform_alignment: 256,
            seed: None,
            log_interval_frames: 120,
        }
    }
}

impl RendererConfig {
    /// Load a config from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        log::info!("Loaded renderer config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_bounce_count(mut self, bounce_count: u32) -> Self {
        self.bounce_count = bounce_count;
        self
    }

    pub fn with_uniform_alignment(mut self, alignment: u64) -> Self {
        self.uniform_alignment = alignment;
        self
    }

    /// Field of view in radians.
    pub fn field_of_view(&self) -> f32 {
        self.field_of_view_degrees.to_radians()
    }

    /// Reject values the kernels and ring cannot honour.
    pub fn validate(&self) -> Result<(), PreconditionError> {
        if self.max_frames_in_flight == 0 || self.max_frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(PreconditionError::InvalidConfig(format!(
                "max_frames_in_flight must be in 1..={} (got {})",
                MAX_FRAMES_IN_FLIGHT, self.max_frames_in_flight
            )));
        }
        if self.random_table_len != RANDOM_TABLE_LEN {
            return Err(PreconditionError::InvalidConfig(format!(
                "random_table_len must be {} (got {})",
                RANDOM_TABLE_LEN, self.random_table_len
            )));
        }
        if !self.uniform_alignment.is_power_of_two() || self.uniform_alignment > MAX_UNIFORM_ALIGNMENT {
            return Err(PreconditionError::InvalidConfig(format!(
                "uniform_alignment must be a power of two no larger than {} (got {})",
                MAX_UNIFORM_ALIGNMENT, self.uniform_alignment
            )));
        }
        if !(self.field_of_view_degrees > 0.0 && self.field_of_view_degrees < 180.0) {
            return Err(PreconditionError::InvalidConfig(format!(
                "field_of_view_degrees must be in (0, 180) (got {})",
                self.field_of_view_degrees
            )));
        }
        Ok(())
    }
}

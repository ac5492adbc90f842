//! Runtime configuration for the reduction engine.
//!
//! # Usage
//!
//! ```ignore
//! use segsum::config::SegsumConfig;
//!
//! let config = SegsumConfig::default()
//!     .with_group_size(128)
//!     .with_num_groups(64)
//!     .clamp_to(&device.limits());
//! ```

use crate::kernels::backend::DeviceLimits;
use crate::kernels::dispatch::DispatchParams;
use crate::kernels::SCAN_BLOCK;
use std::path::PathBuf;

/// Default work-group size.
pub const DEFAULT_GROUP_SIZE: usize = 256;
/// Default hint for how many groups to spread one segment over.
pub const DEFAULT_NUM_GROUPS: usize = 128;
/// Default transpose tile edge.
pub const DEFAULT_TILE_SIZE: usize = 16;
/// Row count above which the reduction plans switch strategy.
pub const DEFAULT_LARGE_GRID_THRESHOLD: usize = 65536;

/// Tuning parameters for one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegsumConfig {
    /// Threads per work-group.
    pub group_size: usize,
    /// Group-count hint used when one segment spans several groups.
    pub num_groups: usize,
    /// Transpose tile edge.
    pub tile_size: usize,
    /// See [`DEFAULT_LARGE_GRID_THRESHOLD`].
    pub large_grid_threshold: usize,
    /// Log every allocation and release.
    pub detail_memory: bool,
    /// Synchronize and time every kernel launch.
    pub debug: bool,
}

impl Default for SegsumConfig {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_GROUP_SIZE,
            num_groups: DEFAULT_NUM_GROUPS,
            tile_size: DEFAULT_TILE_SIZE,
            large_grid_threshold: DEFAULT_LARGE_GRID_THRESHOLD,
            detail_memory: false,
            debug: false,
        }
    }
}

impl SegsumConfig {
    pub fn with_group_size(mut self, group_size: usize) -> Self {
        self.group_size = group_size;
        self
    }

    pub fn with_num_groups(mut self, num_groups: usize) -> Self {
        self.num_groups = num_groups;
        self
    }

    pub fn with_tile_size(mut self, tile_size: usize) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_large_grid_threshold(mut self, threshold: usize) -> Self {
        self.large_grid_threshold = threshold;
        self
    }

    pub fn with_detail_memory(mut self, enabled: bool) -> Self {
        self.detail_memory = enabled;
        self
    }

    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Clamp the configuration to what the device supports.
    ///
    /// The group size is capped by the device maximum and by what the
    /// two-level scan can cover; the tile by the square root of the device
    /// maximum, since a tile is launched as a `tile x tile` group. Each
    /// adjustment is reported as a warning.
    pub fn clamp_to(mut self, limits: &DeviceLimits) -> Self {
        let max_group = limits.max_group_size.clamp(1, SCAN_BLOCK * SCAN_BLOCK);
        if self.group_size > max_group {
            tracing::warn!(
                "Device limits group size to {} (setting was {})",
                max_group,
                self.group_size
            );
            self.group_size = max_group;
        }
        if self.group_size == 0 {
            tracing::warn!("Group size must be positive, using 1");
            self.group_size = 1;
        }

        let max_tile = integer_sqrt(limits.max_group_size).max(1);
        if self.tile_size > max_tile {
            tracing::warn!(
                "Device limits tile size to {} (setting was {})",
                max_tile,
                self.tile_size
            );
            self.tile_size = max_tile;
        }
        if self.tile_size == 0 {
            tracing::warn!("Tile size must be positive, using 1");
            self.tile_size = 1;
        }

        if self.num_groups == 0 {
            tracing::warn!("Group count hint must be positive, using 1");
            self.num_groups = 1;
        }
        self
    }

    pub fn dispatch_params(&self) -> DispatchParams {
        DispatchParams {
            group_size: self.group_size,
            num_groups_hint: self.num_groups,
            large_grid_threshold: self.large_grid_threshold,
        }
    }
}

fn integer_sqrt(n: usize) -> usize {
    let mut root = (n as f64).sqrt() as usize;
    while root * root > n {
        root -= 1;
    }
    while (root + 1) * (root + 1) <= n {
        root += 1;
    }
    root
}

/// Which physical device to open, and what to do with its program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSelector {
    /// Substring the platform name must contain.
    pub platform: Option<String>,
    /// Substring the device name must contain.
    pub device: Option<String>,
    /// Pick the n-th matching device.
    pub index: usize,
    /// Write the program source here after building.
    pub dump_program: Option<PathBuf>,
    /// Build the program from this file instead of the embedded source.
    pub load_program: Option<PathBuf>,
}

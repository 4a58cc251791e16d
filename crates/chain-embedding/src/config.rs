//! Search configuration
//!
//! Backtracking bounds and objective weights. Loaded from JSON with every
//! field optional, then validated before a search starts.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::info;

use crate::{EmbedError, Result};

pub const DEFAULT_BT_LIMIT: usize = 6;
pub const DEFAULT_BRANCHING_FACTOR: usize = 3;

/// Relative importance of node resources in the objective
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourcePriorities {
    pub cpu: f64,
    pub mem: f64,
    pub storage: f64,
}

impl Default for ResourcePriorities {
    fn default() -> Self {
        Self {
            cpu: 1.0 / 3.0,
            mem: 1.0 / 3.0,
            storage: 1.0 / 3.0,
        }
    }
}

impl ResourcePriorities {
    pub fn sum(&self) -> f64 {
        self.cpu + self.mem + self.storage
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Maximum number of subchain levels remembered for backtracking
    pub bt_limit: usize,
    /// Maximum number of alternatives remembered per level
    pub branching_factor: usize,
    pub resource_priorities: ResourcePriorities,
    /// Weight of link and switching utilisation
    pub bw_factor: f64,
    /// Weight of node resource utilisation
    pub res_factor: f64,
    /// Weight of spent latency
    pub lat_factor: f64,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            bt_limit: DEFAULT_BT_LIMIT,
            branching_factor: DEFAULT_BRANCHING_FACTOR,
            resource_priorities: ResourcePriorities::default(),
            bw_factor: 1.0,
            res_factor: 1.0,
            lat_factor: 1.0,
        }
    }
}

impl MappingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bt_limit(mut self, n: usize) -> Self {
        self.bt_limit = n;
        self
    }

    pub fn branching_factor(mut self, n: usize) -> Self {
        self.branching_factor = n;
        self
    }

    pub fn resource_priorities(mut self, cpu: f64, mem: f64, storage: f64) -> Self {
        self.resource_priorities = ResourcePriorities { cpu, mem, storage };
        self
    }

    pub fn factors(mut self, bw: f64, res: f64, lat: f64) -> Self {
        self.bw_factor = bw;
        self.res_factor = res;
        self.lat_factor = lat;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.bt_limit < 1 {
            return Err(EmbedError::bad_input("bt_limit >= 1", self.bt_limit.to_string()));
        }
        if self.branching_factor < 1 {
            return Err(EmbedError::bad_input(
                "branching_factor >= 1",
                self.branching_factor.to_string(),
            ));
        }
        let p = &self.resource_priorities;
        if [p.cpu, p.mem, p.storage].iter().any(|v| !v.is_finite() || *v < 0.0)
            || (p.sum() - 1.0).abs() > 1e-6
        {
            return Err(EmbedError::bad_input(
                "non-negative resource priorities summing to 1",
                format!("{:?}", p),
            ));
        }
        for (name, factor) in [
            ("bw_factor", self.bw_factor),
            ("res_factor", self.res_factor),
            ("lat_factor", self.lat_factor),
        ] {
            if !factor.is_finite() || factor < 0.0 {
                return Err(EmbedError::bad_input(
                    format!("non-negative {}", name),
                    factor.to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        info!("Loading mapping config from {:?}", path);
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: MappingConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }
}

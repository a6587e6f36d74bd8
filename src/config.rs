//! Index configuration: metric selection and HNSW construction parameters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Distance space an index is built over. Fixed for the lifetime of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Space {
    /// Squared Euclidean distance.
    L2,
    /// One minus cosine similarity.
    Cosine,
    /// Negated inner product.
    #[serde(rename = "ip")]
    InnerProduct,
}

impl Space {
    /// Tag used by the binary format.
    pub(crate) fn to_tag(self) -> u8 {
        match self {
            Space::L2 => 0,
            Space::Cosine => 1,
            Space::InnerProduct => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Space::L2),
            1 => Some(Space::Cosine),
            2 => Some(Space::InnerProduct),
            _ => None,
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Space::L2 => "l2",
            Space::Cosine => "cosine",
            Space::InnerProduct => "ip",
        };
        f.write_str(name)
    }
}

impl FromStr for Space {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "l2" => Ok(Space::L2),
            "cosine" => Ok(Space::Cosine),
            "ip" => Ok(Space::InnerProduct),
            other => Err(Error::Config(format!(
                "unknown space '{}', expected one of l2, cosine, ip",
                other
            ))),
        }
    }
}

/// Configuration for the HNSW index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Maximum number of connections per node above layer 0 (default: 16).
    pub m: usize,
    /// Maximum number of connections at layer 0 (default: 2 * m).
    pub m0: usize,
    /// Size of dynamic candidate list during construction (default: 100).
    pub ef_construction: usize,
    /// Size of dynamic candidate list during search (default: 10).
    pub ef_search: usize,
    /// Seed for level generation.
    pub seed: u64,
    /// Worker threads for batch operations; 0 uses the global rayon pool.
    pub num_threads: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let m = 16;
        Self {
            m,
            m0: m * 2,
            ef_construction: 100,
            ef_search: 10,
            seed: 100,
            num_threads: 0,
        }
    }
}

impl IndexConfig {
    /// Create a new configuration with custom M parameter.
    pub fn with_m(m: usize) -> Self {
        Self {
            m,
            m0: m * 2,
            ..Default::default()
        }
    }

    /// Set the layer-0 connection limit.
    pub fn m0(mut self, m0: usize) -> Self {
        self.m0 = m0;
        self
    }

    /// Set the ef_construction parameter.
    pub fn ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef;
        self
    }

    /// Set the ef_search parameter.
    pub fn ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }

    /// Set the level generation seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the batch parallelism hint.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Level normalization factor `1 / ln(m)`.
    pub fn ml(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }

    /// Check the parameters that shape the graph.
    pub fn validate(&self) -> Result<()> {
        if self.m < 2 {
            return Err(Error::Config(format!("m must be at least 2, got {}", self.m)));
        }
        if self.m0 < self.m {
            return Err(Error::Config(format!(
                "m0 ({}) must not be smaller than m ({})",
                self.m0, self.m
            )));
        }
        if self.m0 > u32::MAX as usize {
            return Err(Error::Config(format!("m0 too large: {}", self.m0)));
        }
        if self.ef_construction == 0 {
            return Err(Error::Config("ef_construction must be positive".to_string()));
        }
        Ok(())
    }
}

//! Chain Embedding - latency-aware service chain placement
//!
//! Places a request graph of virtual network functions (VNFs) and service
//! access points (SAPs) onto a resource-annotated substrate network:
//! - Resource ledger with exact, strictly ordered undo
//! - All-pairs latency oracle and weight-based single-source routing
//! - Chain/subchain latency budget tracking
//! - Bounded backtracking search with greedy candidate ranking
//!
//! # Usage
//!
//! ```rust,ignore
//! use chain_embedding::{map_request, MappingConfig};
//!
//! let result = map_request(substrate, request, MappingConfig::default())?;
//! for placement in &result.vnf_mapping {
//!     println!("{} -> {}", placement.vnf, placement.host);
//! }
//! ```

pub mod backtrack;
pub mod config;
pub mod latency;
pub mod ledger;
pub mod manager;
pub mod model;
pub mod preprocess;
pub mod scenario;
pub mod search;

pub use search::{map_request, CoreAlgorithm, MappingResult};
pub use config::MappingConfig;
pub use model::{Chain, RequestGraph, RequestNode, Resources, SgHop, SubstrateGraph, SubstrateLink, SubstrateNode};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    /// Malformed or contradictory input; never retryable
    #[error("Bad input: expected {expected}, given {given}")]
    BadInput { expected: String, given: String },

    /// A broken invariant inside the engine
    #[error("Internal algorithm error: {0}")]
    InternalAlgorithm(String),

    /// The request cannot be embedded, or the current branch is exhausted
    #[error("Mapping failed: {message}")]
    Mapping {
        message: String,
        backtrack_possible: bool,
        peak_vnf_cnt: Option<usize>,
        peak_sc_cnt: Option<usize>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EmbedError {
    pub fn bad_input(expected: impl Into<String>, given: impl Into<String>) -> Self {
        EmbedError::BadInput {
            expected: expected.into(),
            given: given.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        EmbedError::InternalAlgorithm(msg.into())
    }

    /// Terminal mapping failure with no backtrack left.
    pub fn mapping_failed(msg: impl Into<String>) -> Self {
        EmbedError::Mapping {
            message: msg.into(),
            backtrack_possible: false,
            peak_vnf_cnt: None,
            peak_sc_cnt: None,
        }
    }

    pub fn is_mapping_failure(&self) -> bool {
        matches!(self, EmbedError::Mapping { .. })
    }

    pub fn backtrack_possible(&self) -> bool {
        matches!(
            self,
            EmbedError::Mapping {
                backtrack_possible: true,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, EmbedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = EmbedError::mapping_failed("no host left");
        assert!(err.is_mapping_failure());
        assert!(!err.backtrack_possible());

        let err = EmbedError::bad_input("bt_limit >= 1", "0");
        assert!(!err.is_mapping_failure());
        assert_eq!(
            err.to_string(),
            "Bad input: expected bt_limit >= 1, given 0"
        );
    }
}

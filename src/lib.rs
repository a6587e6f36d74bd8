//! next-plaid-ann: incremental HNSW approximate nearest neighbor index
//!
//! This crate provides a Hierarchical Navigable Small World (HNSW) index over
//! labelled `f32` vectors, supporting:
//! - Concurrent insertion and search from many threads
//! - Squared L2, cosine and inner-product distance spaces
//! - Soft deletion (tombstones) that keeps the graph navigable
//! - Parallel batch insert and search
//! - Binary persistence with integrity checks
//!
//! # Example
//!
//! ```rust
//! use next_plaid_ann::{HnswIndex, IndexConfig, Space};
//! use ndarray::Array2;
//!
//! // Create an index for 1000 vectors of dimension 32
//! let index = HnswIndex::new(Space::L2, 32, 1000, IndexConfig::default()).unwrap();
//!
//! // Insert vectors under user-chosen labels
//! let vectors = Array2::from_shape_fn((1000, 32), |(i, j)| ((i * 32 + j) as f32).sin());
//! let labels: Vec<u64> = (0..1000).collect();
//! index.batch_insert(vectors.view(), &labels).unwrap();
//!
//! // Search for nearest neighbors
//! index.set_ef(64);
//! let results = index.search(vectors.row(3).as_slice().unwrap(), 5).unwrap();
//! assert_eq!(results[0].label, 3);
//!
//! // Deleted labels are no longer returned
//! index.mark_deleted(3).unwrap();
//! let results = index.search(vectors.row(3).as_slice().unwrap(), 5).unwrap();
//! assert!(results.iter().all(|r| r.label != 3));
//!
//! // Save and restore
//! let mut bytes = Vec::new();
//! index.save(&mut bytes).unwrap();
//! let restored = HnswIndex::new(Space::L2, 32, 1, IndexConfig::default()).unwrap();
//! restored.load(&bytes[..]).unwrap();
//! assert_eq!(restored.len(), 1000);
//! ```
//!
//! # Configuration
//!
//! The index can be configured using [`IndexConfig`]:
//!
//! ```rust
//! use next_plaid_ann::IndexConfig;
//!
//! // Default configuration (M=16, M0=32, ef_construction=100, ef_search=10)
//! let config = IndexConfig::default();
//!
//! // Custom configuration
//! let config = IndexConfig::with_m(32)
//!     .ef_construction(200)
//!     .ef_search(100)
//!     .num_threads(4);
//! ```

pub mod config;
pub mod distance;
pub mod error;
pub mod index;

mod graph;
mod persist;
mod store;
mod visited;

pub use config::{IndexConfig, Space};
pub use distance::Distance;
pub use error::{Error, Result};
pub use index::{ActiveLabels, HnswIndex, SearchResult};
pub use store::{Label, NodeId};

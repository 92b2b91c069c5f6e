//! xrmmap-io: HDF5 map containers for X-ray microprobe scans.
//!
//! This crate owns the on-disk container: creation and single-writer
//! ownership, schema layout, incremental row ingestion, region queries,
//! stored areas and work arrays.
//!

pub mod areas;
pub mod container;
mod error;
mod h5util;
pub mod ingest;
pub mod ownership;
pub mod query;
pub mod schema;
pub mod work;

pub use areas::{Area, AreaStore};
pub use container::{folder_identity, new_container_path, ContainerHandle, FORMAT_VERSION};
pub use error::{Error, Result};
pub use h5util::StorageOptions;
pub use ingest::{RetryPolicy, RowIngestor, RowSource};
pub use ownership::{ClaimMode, OwnerToken};
pub use query::{AggregationEngine, Detector, QueryOptions, Region};
pub use schema::{MapShape, SchemaBuilder, SchemaOptions, SUM_DETECTOR};
pub use work::{WorkArray, WorkStore};

//! xrmmap-core: Core types and row-processing math for X-ray microprobe maps.
//!
//! This crate is free of storage concerns. It provides the scan
//! configuration, validated row records, dead-time correction, row
//! alignment, ROI integration, region traversal and result types used by
//! `xrmmap-io`.
//!

pub mod align;
pub mod config;
pub mod deadtime;
pub mod error;
pub mod metadata;
pub mod region;
pub mod roi;
pub mod row;
pub mod spectrum;
pub mod stats;

pub use align::{prepare_row, AlignSettings, PreparedRow};
pub use config::{AxisRange, Calibration, RoiDefinition, ScanConfig, ScanSection};
pub use deadtime::{dtfactor, SumDetector};
pub use error::{Error, Result};
pub use metadata::{parse_environ, DiffractionCalibration, EnvironEntry};
pub use region::{bounding_rect, Rect, RegionChunks, DEFAULT_CHUNK_PIXELS};
pub use roi::{integrate_rois, RoiSums, RoiTable};
pub use row::{RowParts, RowRecord};
pub use spectrum::{FrameSum, LiveRealTime, Provenance, Spectrum, SpectrumRoi};
pub use stats::SummaryStats;

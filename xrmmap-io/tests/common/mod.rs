#![allow(dead_code)]

use ndarray::{Array2, Array3};
use std::collections::HashMap;
use std::path::PathBuf;
use tempfile::TempDir;
use xrmmap_core::{AxisRange, RoiDefinition, RowParts, RowRecord, ScanConfig};
use xrmmap_io::{ContainerHandle, Error, Result, RetryPolicy, RowIngestor, RowSource};

pub const ROWS: usize = 3;
pub const PIXELS: usize = 10;
pub const DETECTORS: usize = 2;
pub const CHANNELS: usize = 256;
pub const PEAK: usize = 20;

/// Raw count at `(row, det, pixel, channel)` before any serpentine flip.
pub fn raw_count(row: usize, det: usize, pixel: usize, channel: usize) -> u32 {
    let base = u32::try_from(1 + det + row).unwrap();
    if channel == PEAK {
        base + 10 * u32::try_from(pixel + 1).unwrap()
    } else {
        base
    }
}

pub fn synthetic_row(row: usize, ndet: usize) -> RowRecord {
    let counts = Array3::from_shape_fn((ndet, PIXELS, CHANNELS), |(d, p, c)| {
        raw_count(row, d, p, c)
    });
    let livetime = Array2::from_shape_fn((ndet, PIXELS), |(d, _)| 0.8 + 0.05 * d as f64);
    let input_counts = Array2::from_shape_fn((ndet, PIXELS), |(_, p)| 1000.0 + 10.0 * p as f64);
    RowRecord::new(RowParts {
        counts,
        realtime: Array2::from_elem((ndet, PIXELS), 1.0),
        livetime,
        input_counts,
        output_counts: Array2::from_elem((ndet, PIXELS), 900.0),
        gather: Array2::from_shape_fn((PIXELS, 2), |(p, c)| {
            if c == 0 {
                p as f64 * 0.1
            } else {
                5.0
            }
        }),
        y_value: row as f64 * 0.5,
        scaler_names: vec!["I0".to_string()],
        scalers: Array2::from_shape_fn((PIXELS, 1), |(p, _)| 100.0 + p as f64),
        frames: None,
    })
    .unwrap()
}

pub fn scan_config() -> ScanConfig {
    let mut config = ScanConfig::default();
    config.scan.dimension = 2;
    config.scan.fast_axis = AxisRange {
        name: "fine x".to_string(),
        start: 0.0,
        stop: 0.9,
        step: 0.1,
    };
    config.scan.slow_axis = Some(AxisRange {
        name: "fine y".to_string(),
        start: 0.0,
        stop: 1.0,
        step: 0.5,
    });
    config.scan.points_per_row = Some(PIXELS);
    config.rois = vec![RoiDefinition::new("Fe Ka", 10, 50)];
    config
}

/// In-memory scan folder. `failures` makes the given row fail that many
/// reads with `ReadFailed` before succeeding.
pub struct SyntheticSource {
    pub available: usize,
    pub failures: HashMap<usize, usize>,
    pub reads: usize,
}

impl SyntheticSource {
    pub fn new(available: usize) -> Self {
        Self {
            available,
            failures: HashMap::new(),
            reads: 0,
        }
    }
}

impl RowSource for SyntheticSource {
    fn rows_available(&mut self) -> Result<usize> {
        Ok(self.available)
    }

    fn read_row(&mut self, index: usize) -> Result<RowRecord> {
        self.reads += 1;
        if let Some(left) = self.failures.get_mut(&index) {
            if *left > 0 {
                *left -= 1;
                return Err(Error::ReadFailed {
                    row: index,
                    reason: "row file incomplete".to_string(),
                });
            }
        }
        Ok(synthetic_row(index, DETECTORS))
    }
}

pub fn ingestor() -> RowIngestor {
    RowIngestor::new(scan_config()).with_retry(RetryPolicy {
        timeout: std::time::Duration::from_secs(2),
        backoff: std::time::Duration::from_millis(1),
    })
}

/// A container with all synthetic rows ingested.
pub fn ingested() -> (TempDir, PathBuf, ContainerHandle) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("map_1.h5");
    let mut handle = ContainerHandle::create(&path, "scan_001", 2).unwrap();
    let n = ingestor()
        .process(&mut handle, &mut SyntheticSource::new(ROWS), None)
        .unwrap();
    assert_eq!(n, ROWS);
    (dir, path, handle)
}

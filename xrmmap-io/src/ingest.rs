//! Row ingestion: read, align, correct, append, commit.

use crate::container::ContainerHandle;
use crate::h5util::{resize_rows, row_extent};
use crate::schema::{self, scaler_dataset_name, MapShape, SchemaBuilder, SchemaOptions};
use crate::{Error, Result};
use hdf5::Group;
use log::{debug, info};
use ndarray::{s, Axis};
use std::thread;
use std::time::{Duration, Instant};
use xrmmap_core::{
    integrate_rois, prepare_row, AlignSettings, PreparedRow, RoiTable, RowRecord, ScanConfig,
};

/// Supplier of raw rows, typically backed by a scan folder that an
/// external process is still writing.
pub trait RowSource {
    /// Number of rows whose raw files have appeared so far.
    ///
    /// # Errors
    /// Returns an error if the source cannot be inspected.
    fn rows_available(&mut self) -> Result<usize>;

    /// Read row `index`.
    ///
    /// # Errors
    /// Returns `ReadFailed` while the row's files are incomplete; any other
    /// error is treated as fatal.
    fn read_row(&mut self, index: usize) -> Result<RowRecord>;
}

/// Waiting policy for rows whose files are still being written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Give up after this long.
    pub timeout: Duration,
    /// Sleep between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    #[must_use]
    pub fn none() -> Self {
        Self {
            timeout: Duration::ZERO,
            backoff: Duration::ZERO,
        }
    }
}

/// Geometry and ROI windows needed to write rows, loaded once per pass.
struct RowLayout {
    shape: MapShape,
    rois: RoiTable,
    serpentine: bool,
    dimension: u8,
}

impl RowLayout {
    fn load(handle: &ContainerHandle) -> Result<Self> {
        let shape = MapShape::from_container(handle)?;
        let config = handle.scan_config()?;
        let rois = RoiTable::resolve(&config.rois, shape.n_detectors, shape.channels)?;
        Ok(Self {
            shape,
            rois,
            serpentine: config.scan.serpentine,
            dimension: handle.dimension()?,
        })
    }

    fn check(&self, row: usize, record: &RowRecord) -> Result<()> {
        let mismatch = |detail: String| Error::ShapeMismatch { row, detail };
        if record.n_detectors() != self.shape.n_detectors {
            return Err(mismatch(format!(
                "{} detectors, schema has {}",
                record.n_detectors(),
                self.shape.n_detectors
            )));
        }
        if record.n_channels() != self.shape.channels {
            return Err(mismatch(format!(
                "{} channels, schema has {}",
                record.n_channels(),
                self.shape.channels
            )));
        }
        if record.frame_shape() != self.shape.frame_shape {
            return Err(mismatch(format!(
                "frame shape {:?}, schema has {:?}",
                record.frame_shape(),
                self.shape.frame_shape
            )));
        }
        if record.scaler_names() != self.shape.scaler_names.as_slice() {
            return Err(mismatch(format!(
                "scalers {:?}, schema has {:?}",
                record.scaler_names(),
                self.shape.scaler_names
            )));
        }
        Ok(())
    }
}

/// Drives rows from a [`RowSource`] into a container.
#[derive(Clone, Debug)]
pub struct RowIngestor {
    config: ScanConfig,
    retry: RetryPolicy,
    schema: SchemaOptions,
}

impl RowIngestor {
    /// Ingestor for a scan described by `config`.
    #[must_use]
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            retry: RetryPolicy::default(),
            schema: SchemaOptions::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Options used if this ingestor has to build the schema.
    #[must_use]
    pub fn with_schema_options(mut self, options: SchemaOptions) -> Self {
        self.schema = options;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Read a row, retrying `ReadFailed` until the policy's timeout.
    ///
    /// # Errors
    /// Returns the last `ReadFailed` after the timeout, or any other error
    /// immediately.
    pub fn read_with_retry<S: RowSource + ?Sized>(
        &self,
        source: &mut S,
        index: usize,
    ) -> Result<RowRecord> {
        let start = Instant::now();
        loop {
            match source.read_row(index) {
                Ok(record) => return Ok(record),
                Err(e) if e.is_retryable() && start.elapsed() < self.retry.timeout => {
                    debug!("row {index} not ready ({e}), retrying");
                    thread::sleep(self.retry.backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ingest every row the source has beyond `last_row`, up to `max_rows`.
    ///
    /// Builds the schema from row 0 if needed, and trims row datasets to
    /// the ingested extent at the end of the pass.
    ///
    /// # Errors
    /// Returns `NotOwner`, `ReadFailed` (after retries), `ShapeMismatch`, or
    /// a schema or HDF5 error. Rows committed before the error stay
    /// committed.
    pub fn process<S: RowSource + ?Sized>(
        &self,
        handle: &mut ContainerHandle,
        source: &mut S,
        max_rows: Option<usize>,
    ) -> Result<usize> {
        handle.ensure_owner()?;
        let available = source.rows_available()?;
        let mut next = handle.rows()?;
        let mut layout = if handle.schema_built() {
            Some(RowLayout::load(handle)?)
        } else {
            None
        };
        let mut count = 0;

        while next < available && max_rows.map_or(true, |m| count < m) {
            let record = self.read_with_retry(source, next)?;
            if layout.is_none() {
                SchemaBuilder::new(self.schema.clone()).build(handle, &record, &self.config)?;
                layout = Some(RowLayout::load(handle)?);
            }
            if let Some(current) = &layout {
                Self::write_row(handle, current, next, &record)?;
            }
            next += 1;
            count += 1;
        }

        if count > 0 {
            handle.compact()?;
        }
        info!("rows processed: {count}");
        Ok(count)
    }

    /// Ingest one row.
    ///
    /// Rows at or below `last_row` are skipped and return `false`.
    ///
    /// # Errors
    /// Returns `OutOfOrder` for a gap, `NotOwner`, `ShapeMismatch`, or a
    /// schema or HDF5 error.
    pub fn ingest_row(
        &self,
        handle: &mut ContainerHandle,
        index: usize,
        record: &RowRecord,
    ) -> Result<bool> {
        handle.ensure_owner()?;
        let expected = handle.rows()?;
        if index < expected {
            debug!("row {index} already ingested");
            return Ok(false);
        }
        if index != expected {
            return Err(Error::OutOfOrder {
                expected,
                got: index,
            });
        }
        if !handle.schema_built() {
            SchemaBuilder::new(self.schema.clone()).build(handle, record, &self.config)?;
        }
        let layout = RowLayout::load(handle)?;
        Self::write_row(handle, &layout, index, record)?;
        Ok(true)
    }

    fn write_row(
        handle: &mut ContainerHandle,
        layout: &RowLayout,
        row: usize,
        record: &RowRecord,
    ) -> Result<()> {
        layout.check(row, record)?;
        let prepared = prepare_row(
            record,
            &AlignSettings {
                pixel_count: layout.shape.pixels,
                row_index: row,
                serpentine: layout.serpentine,
                dimension: layout.dimension,
            },
        )?;

        let root = handle.root().clone();
        ensure_capacity(&root, &layout.shape, row)?;
        append_row(&root, layout, &prepared)?;
        handle.commit_row(row)?;
        debug!(
            "committed row {row}{}",
            if prepared.reversed { " (reversed)" } else { "" }
        );
        Ok(())
    }
}

fn ensure_capacity(root: &Group, shape: &MapShape, row: usize) -> Result<()> {
    let probe = root.group(schema::SUM_DETECTOR)?.dataset("counts")?;
    if row_extent(&probe) > row {
        return Ok(());
    }
    let needed = shape.capacity_for(row);
    debug!("growing row datasets to {needed} rows");
    for dataset in &schema::row_datasets(root)? {
        if row_extent(dataset) <= row {
            resize_rows(dataset, needed)?;
        }
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn to_f32(value: f64) -> f32 {
    value as f32
}

fn append_row(root: &Group, layout: &RowLayout, row: &PreparedRow) -> Result<()> {
    let r = row.row_index;
    let dtfactor = row.dtfactor.mapv(to_f32);

    for det in 0..layout.shape.n_detectors {
        let group = root.group(&format!("mca{}", det + 1))?;
        let counts = row.counts.index_axis(Axis(0), det);
        group
            .dataset("counts")?
            .write_slice(counts.insert_axis(Axis(0)), s![r..r + 1, .., ..])?;
        for (name, values) in [
            ("realtime", &row.realtime),
            ("livetime", &row.livetime),
            ("inputcounts", &row.input_counts),
            ("outputcounts", &row.output_counts),
        ] {
            group
                .dataset(name)?
                .write_slice(values.row(det).insert_axis(Axis(0)), s![r..r + 1, ..])?;
        }
        group
            .dataset("dtfactor")?
            .write_slice(dtfactor.row(det).insert_axis(Axis(0)), s![r..r + 1, ..])?;
    }

    let sum = root.group(schema::SUM_DETECTOR)?;
    sum.dataset("counts")?
        .write_slice(row.sum.counts.view().insert_axis(Axis(0)), s![r..r + 1, .., ..])?;
    for (name, values) in [
        ("realtime", &row.sum.realtime),
        ("livetime", &row.sum.livetime),
        ("inputcounts", &row.sum.input_counts),
        ("outputcounts", &row.sum.output_counts),
    ] {
        sum.dataset(name)?
            .write_slice(values.view().insert_axis(Axis(0)), s![r..r + 1, ..])?;
    }
    let sum_dtf = row.sum.dtfactor.mapv(to_f32);
    sum.dataset("dtfactor")?
        .write_slice(sum_dtf.view().insert_axis(Axis(0)), s![r..r + 1, ..])?;

    let positions = row.positions.mapv(to_f32);
    root.group("positions")?
        .dataset("pos")?
        .write_slice(positions.view().insert_axis(Axis(0)), s![r..r + 1, .., ..])?;

    let scalars = root.group("scalars")?;
    for (j, name) in layout.shape.scaler_names.iter().enumerate() {
        let values = row.scalers.column(j).mapv(to_f32);
        scalars
            .dataset(&scaler_dataset_name(name))?
            .write_slice(values.view().insert_axis(Axis(0)), s![r..r + 1, ..])?;
    }

    if !layout.rois.is_empty() {
        let sums = integrate_rois(row.counts.view(), row.dtfactor.view(), &layout.rois);
        let roimap = root.group("roimap")?;
        for (name, values) in [
            ("det_raw", &sums.det_raw),
            ("det_cor", &sums.det_cor),
            ("sum_raw", &sums.sum_raw),
            ("sum_cor", &sums.sum_cor),
        ] {
            roimap
                .dataset(name)?
                .write_slice(values.view().insert_axis(Axis(0)), s![r..r + 1, .., ..])?;
        }
    }

    if let Some(frames) = &row.frames {
        root.group("xrd2d")?
            .dataset("frames")?
            .write_slice(frames.view().insert_axis(Axis(0)), s![r..r + 1, .., .., ..])?;
    }
    Ok(())
}

//! Dataset layout, created once from the first row's geometry.
//!
//! ```text
//! /xrmmap
//!   config/           scan (json attr), rois/{name,limits}, mca_calib/{offset,slope,quad}
//!   mca1..mcaN/       counts[row,pixel,chan] realtime livetime inputcounts outputcounts dtfactor
//!                     energy[chan] roi_name roi_limits
//!   mcasum/           same layout, summed over detectors
//!   positions/        pos[row,pixel,axis] name
//!   scalars/          <scaler>[row,pixel]
//!   roimap/           det_raw det_cor[row,pixel,roi*det] sum_raw sum_cor[row,pixel,roi]
//!                     det_name sum_name
//!   xrd2d/            frames[row,pixel,h,w]      (only with diffraction frames)
//!   areas/ work/
//! ```

use crate::container::ContainerHandle;
use crate::h5util::{
    create_row_dataset, read_attr, read_attr_opt, read_strings, set_attr, set_attr_str,
    write_fixed, write_strings, StorageOptions,
};
use crate::{Error, Result};
use hdf5::{Dataset, Group};
use log::{info, warn};
use ndarray::{Array1, Array2, Array3};
use xrmmap_core::{Calibration, DiffractionCalibration, RoiTable, RowRecord, ScanConfig};

/// Name of the synthetic sum-detector group.
pub const SUM_DETECTOR: &str = "mcasum";

/// Per-row arrays stored in every detector group.
pub const DETECTOR_ARRAYS: [&str; 6] = [
    "counts",
    "realtime",
    "livetime",
    "inputcounts",
    "outputcounts",
    "dtfactor",
];

const ROIMAP_ARRAYS: [&str; 4] = ["det_raw", "det_cor", "sum_raw", "sum_cor"];

/// Options for schema creation.
#[derive(Clone, Debug)]
pub struct SchemaOptions {
    /// Rows allocated up front; growth happens in multiples of this.
    pub initial_rows: usize,
    pub storage: StorageOptions,
    /// Geometry attributes for the diffraction group.
    pub diffraction_calibration: Option<DiffractionCalibration>,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            initial_rows: 32,
            storage: StorageOptions::default(),
            diffraction_calibration: None,
        }
    }
}

impl SchemaOptions {
    /// Set the initial row capacity (clamped to at least 1).
    #[must_use]
    pub fn with_initial_rows(mut self, rows: usize) -> Self {
        self.initial_rows = rows.max(1);
        self
    }

    /// Set the deflate level, or disable compression with `None`.
    #[must_use]
    pub fn with_compression(mut self, level: Option<u8>) -> Self {
        self.storage.compression = level;
        self
    }

    /// Attach diffraction geometry.
    #[must_use]
    pub fn with_diffraction_calibration(mut self, cal: DiffractionCalibration) -> Self {
        self.diffraction_calibration = Some(cal);
        self
    }
}

/// Fixed geometry of a built container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapShape {
    pub n_detectors: usize,
    pub pixels: usize,
    pub channels: usize,
    pub frame_shape: Option<(usize, usize)>,
    pub scaler_names: Vec<String>,
    pub n_position_axes: usize,
    pub n_rois: usize,
    /// Row growth step.
    pub row_block: usize,
}

impl MapShape {
    /// Read the geometry recorded by [`SchemaBuilder::build`].
    ///
    /// # Errors
    /// Returns `SchemaMissing` before the schema exists.
    pub fn from_container(handle: &ContainerHandle) -> Result<Self> {
        if !handle.schema_built() {
            return Err(Error::SchemaMissing);
        }
        let root = handle.root();
        let to_usize = |v: i64| usize::try_from(v).unwrap_or(0);
        let frame_shape = if root.link_exists("xrd2d") {
            let shape = root.group("xrd2d")?.dataset("frames")?.shape();
            Some((shape[2], shape[3]))
        } else {
            None
        };
        let config = root.group("config")?;
        Ok(Self {
            n_detectors: to_usize(read_attr::<i32>(root, "n_detectors")?.into()),
            pixels: to_usize(read_attr::<i64>(root, "npts")?),
            channels: to_usize(read_attr::<i64>(root, "nchan")?),
            frame_shape,
            scaler_names: read_strings(&config, "scaler_names")?,
            n_position_axes: read_strings(&root.group("positions")?, "name")?.len(),
            n_rois: read_strings(&config.group("rois")?, "name")?.len(),
            row_block: to_usize(read_attr_opt::<i64>(root, "row_block")?.unwrap_or(32)).max(1),
        })
    }

    /// Capacity needed to hold `row`: the next multiple of the row block.
    #[must_use]
    pub fn capacity_for(&self, row: usize) -> usize {
        (row + 1).div_ceil(self.row_block) * self.row_block
    }
}

/// Validated inputs shared by the layout steps.
#[derive(Clone, Copy)]
struct Layout<'a> {
    config: &'a ScanConfig,
    rois: &'a RoiTable,
    calibrations: &'a [Calibration],
    npix: usize,
    ndet: usize,
    nchan: usize,
    rows: usize,
}

/// Remove whatever a failed build left behind so the build can be retried.
fn discard_partial(root: &Group) -> Result<()> {
    for member in root.member_names()? {
        if member.starts_with("mca") || member == "xrd2d" {
            root.unlink(&member)?;
        }
    }
    for name in ["config", "positions", "scalars", "roimap"] {
        let group = root.group(name)?;
        for member in group.member_names()? {
            group.unlink(&member)?;
        }
    }
    let config = root.group("config")?;
    if config.attr_names()?.iter().any(|n| n == "scan") {
        config.delete_attr("scan")?;
    }
    set_attr(root, "n_detectors", &0_i32)?;
    Ok(())
}

/// Creates the container layout.
#[derive(Clone, Debug, Default)]
pub struct SchemaBuilder {
    options: SchemaOptions,
}

fn shape_error(e: xrmmap_core::Error) -> Error {
    Error::InvalidShape(e.to_string())
}

fn to_i64(v: usize) -> Result<i64> {
    i64::try_from(v).map_err(|e| Error::InvalidShape(e.to_string()))
}

fn to_u64(v: usize) -> u64 {
    u64::try_from(v).unwrap_or(u64::MAX)
}

impl SchemaBuilder {
    #[must_use]
    pub fn new(options: SchemaOptions) -> Self {
        Self { options }
    }

    /// Create every dataset from the first row and the scan configuration.
    ///
    /// # Errors
    /// Returns `NotOwner`, `AlreadyBuilt`, `InvalidShape` (zero pixels,
    /// calibration or ROI windows inconsistent with the detectors), or an
    /// HDF5 error.
    pub fn build(
        &self,
        handle: &mut ContainerHandle,
        first_row: &RowRecord,
        config: &ScanConfig,
    ) -> Result<MapShape> {
        handle.ensure_owner()?;
        if handle.schema_built() {
            return Err(Error::AlreadyBuilt);
        }
        config.validate().map_err(shape_error)?;
        if config.scan.dimension != handle.dimension()? {
            return Err(Error::InvalidShape(format!(
                "scan dimension {} does not match container dimension {}",
                config.scan.dimension,
                handle.dimension()?
            )));
        }

        let npix = config.points_per_row();
        let ndet = first_row.n_detectors();
        let nchan = first_row.n_channels();
        if npix == 0 || ndet == 0 || nchan == 0 {
            return Err(Error::InvalidShape(format!(
                "pixels={npix}, detectors={ndet}, channels={nchan} must all be non-zero"
            )));
        }
        let calibrations = config.calibrations(ndet).map_err(shape_error)?;
        let rois = RoiTable::resolve(&config.rois, ndet, nchan).map_err(shape_error)?;
        let rows = self.options.initial_rows.max(1);
        let root = handle.root().clone();
        let layout = Layout {
            config,
            rois: &rois,
            calibrations: &calibrations,
            npix,
            ndet,
            nchan,
            rows,
        };
        if let Err(e) = self.create_layout(&root, first_row, &layout) {
            warn!("schema build failed, removing partial layout: {e}");
            discard_partial(&root)?;
            return Err(e);
        }
        handle.file().flush()?;

        info!(
            "built map schema: {ndet} detectors, {npix} pixels/row, {nchan} channels, {} ROIs{}",
            rois.len(),
            if first_row.frame_shape().is_some() {
                ", diffraction frames"
            } else {
                ""
            }
        );
        MapShape::from_container(handle)
    }

    /// Writes every group and dataset. The sum-detector group is created
    /// last, so a container only reports a built schema once the layout is
    /// complete.
    fn create_layout(
        &self,
        root: &Group,
        first_row: &RowRecord,
        layout: &Layout<'_>,
    ) -> Result<()> {
        let Layout {
            config,
            rois,
            calibrations,
            npix,
            ndet,
            nchan,
            rows,
        } = *layout;
        let storage = self.options.storage;
        let position_names = config.position_names();
        let scaler_names = first_row.scaler_names().to_vec();

        Self::write_config(root, config, rois, calibrations, &scaler_names, ndet)?;

        for det in 0..ndet {
            let windows: Vec<[usize; 2]> = rois.windows.iter().map(|w| w[det]).collect();
            let group = root.create_group(&format!("mca{}", det + 1))?;
            set_attr_str(&group, "type", "mca detector")?;
            self.create_detector(
                &group,
                rows,
                npix,
                nchan,
                &calibrations[det],
                &rois.names,
                &windows,
            )?;
        }

        let positions = root.group("positions")?;
        let naxes = position_names.len();
        create_row_dataset::<f32>(
            &positions,
            "pos",
            rows,
            &[npix, naxes],
            &[1, npix, naxes],
            storage,
        )?;
        write_strings(&positions, "name", &position_names)?;

        let scalars = root.group("scalars")?;
        for name in &scaler_names {
            let dataset_name = scaler_dataset_name(name);
            create_row_dataset::<f32>(&scalars, &dataset_name, rows, &[npix], &[1, npix], storage)?;
        }

        let roimap = root.group("roimap")?;
        write_strings(&roimap, "det_name", &rois.detector_column_names(ndet))?;
        write_strings(&roimap, "sum_name", &rois.names)?;
        if !rois.is_empty() {
            let ndcol = rois.len() * ndet;
            let nscol = rois.len();
            let columns = [ndcol, ndcol, nscol, nscol];
            for (name, ncol) in ROIMAP_ARRAYS.into_iter().zip(columns) {
                create_row_dataset::<f64>(
                    &roimap,
                    name,
                    rows,
                    &[npix, ncol],
                    &[1, npix, ncol],
                    storage,
                )?;
            }
        }

        if let Some((h, w)) = first_row.frame_shape() {
            let xrd = root.create_group("xrd2d")?;
            create_row_dataset::<u32>(
                &xrd,
                "frames",
                rows,
                &[npix, h, w],
                &[1, 1, h, w],
                storage,
            )?;
            if let Some(cal) = &self.options.diffraction_calibration {
                for (key, value) in cal.values() {
                    set_attr(&xrd, key, &value)?;
                }
            }
        }

        let n_detectors =
            i32::try_from(ndet).map_err(|e| Error::InvalidShape(e.to_string()))?;
        set_attr(root, "n_detectors", &n_detectors)?;
        set_attr(root, "npts", &to_i64(npix)?)?;
        set_attr(root, "nchan", &to_i64(nchan)?)?;
        set_attr(root, "row_block", &to_i64(rows)?)?;

        // Sum-detector ROI maps add each detector's own window; the
        // summed spectrum carries the first detector's windows.
        for (name, windows) in rois.names.iter().zip(&rois.windows) {
            if windows.iter().any(|w| *w != windows[0]) {
                warn!(
                    "ROI '{name}' windows differ between detectors; {SUM_DETECTOR} lists mca1's"
                );
            }
        }
        let sum_windows: Vec<[usize; 2]> = rois.windows.iter().map(|w| w[0]).collect();
        let sum = root.create_group(SUM_DETECTOR)?;
        set_attr_str(&sum, "type", "virtual mca detector")?;
        self.create_detector(
            &sum,
            rows,
            npix,
            nchan,
            &calibrations[0],
            &rois.names,
            &sum_windows,
        )
    }

    fn write_config(
        root: &Group,
        config: &ScanConfig,
        rois: &RoiTable,
        calibrations: &[Calibration],
        scaler_names: &[String],
        ndet: usize,
    ) -> Result<()> {
        let group = root.group("config")?;
        set_attr_str(&group, "scan", &serde_json::to_string(config)?)?;
        write_strings(&group, "scaler_names", scaler_names)?;

        let roi_group = group.create_group("rois")?;
        write_strings(&roi_group, "name", &rois.names)?;
        let limits = Array3::from_shape_fn((rois.len(), ndet, 2), |(r, d, k)| {
            to_u64(rois.windows[r][d][k])
        });
        write_fixed(&roi_group, "limits", limits.view())?;

        let cal_group = group.create_group("mca_calib")?;
        let offsets: Array1<f64> = calibrations.iter().map(|c| c.offset).collect();
        let slopes: Array1<f64> = calibrations.iter().map(|c| c.slope).collect();
        let quads: Array1<f64> = calibrations.iter().map(|c| c.quad).collect();
        write_fixed(&cal_group, "offset", offsets.view())?;
        write_fixed(&cal_group, "slope", slopes.view())?;
        write_fixed(&cal_group, "quad", quads.view())?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn create_detector(
        &self,
        group: &Group,
        rows: usize,
        npix: usize,
        nchan: usize,
        calibration: &Calibration,
        roi_names: &[String],
        windows: &[[usize; 2]],
    ) -> Result<()> {
        let storage = self.options.storage;
        create_row_dataset::<u32>(
            group,
            "counts",
            rows,
            &[npix, nchan],
            &[1, npix, nchan],
            storage,
        )?;
        for name in ["realtime", "livetime", "inputcounts", "outputcounts"] {
            create_row_dataset::<f64>(group, name, rows, &[npix], &[1, npix], storage)?;
        }
        create_row_dataset::<f32>(group, "dtfactor", rows, &[npix], &[1, npix], storage)?;

        let energy = write_fixed(group, "energy", calibration.energy(nchan).view())?;
        set_attr(&energy, "cal_offset", &calibration.offset)?;
        set_attr(&energy, "cal_slope", &calibration.slope)?;
        set_attr(&energy, "cal_quad", &calibration.quad)?;
        set_attr_str(&energy, "units", "keV")?;

        write_strings(group, "roi_name", roi_names)?;
        let limits = Array2::from_shape_fn((windows.len(), 2), |(r, k)| to_u64(windows[r][k]));
        write_fixed(group, "roi_limits", limits.view())?;
        Ok(())
    }
}

/// Dataset name for a scaler channel.
#[must_use]
pub fn scaler_dataset_name(name: &str) -> String {
    name.replace('/', "_")
}

/// Every dataset whose leading extent is the row axis.
///
/// # Errors
/// Returns an HDF5 error if a group listed in the layout cannot be opened.
pub(crate) fn row_datasets(root: &Group) -> Result<Vec<Dataset>> {
    let mut out = Vec::new();
    for member in root.member_names()? {
        if member.starts_with("mca") && member != "mca_calib" {
            let group = root.group(&member)?;
            for name in DETECTOR_ARRAYS {
                out.push(group.dataset(name)?);
            }
        }
    }
    out.push(root.group("positions")?.dataset("pos")?);
    let roimap = root.group("roimap")?;
    for name in ROIMAP_ARRAYS {
        if roimap.link_exists(name) {
            out.push(roimap.dataset(name)?);
        }
    }
    let scalars = root.group("scalars")?;
    for name in scalars.member_names()? {
        out.push(scalars.dataset(&name)?);
    }
    if root.link_exists("xrd2d") {
        out.push(root.group("xrd2d")?.dataset("frames")?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h5util::row_extent;
    use ndarray::Array2 as A2;
    use tempfile::TempDir;
    use xrmmap_core::{RoiDefinition, RowParts};

    fn config(npix: usize) -> ScanConfig {
        let mut config = ScanConfig::default();
        config.scan.dimension = 2;
        config.scan.points_per_row = Some(npix);
        config.scan.slow_axis = Some(xrmmap_core::AxisRange {
            name: "fine y".to_string(),
            start: 0.0,
            stop: 1.0,
            step: 0.5,
        });
        config.rois = vec![RoiDefinition::new("Fe Ka", 10, 50)];
        config
    }

    fn row(ndet: usize, npix: usize, nchan: usize, frames: bool) -> RowRecord {
        RowRecord::new(RowParts {
            counts: Array3::ones((ndet, npix, nchan)),
            realtime: A2::ones((ndet, npix)),
            livetime: A2::ones((ndet, npix)),
            input_counts: A2::ones((ndet, npix)),
            output_counts: A2::ones((ndet, npix)),
            gather: A2::ones((npix, 2)),
            y_value: 0.0,
            scaler_names: vec!["I0".to_string(), "i/1".to_string()],
            scalers: A2::ones((npix, 2)),
            frames: frames.then(|| Array3::zeros((npix, 4, 3))),
        })
        .unwrap()
    }

    #[test]
    fn test_build_creates_layout() {
        let dir = TempDir::new().unwrap();
        let mut handle = ContainerHandle::create(dir.path().join("m.h5"), "scan", 2).unwrap();
        let shape = SchemaBuilder::default()
            .build(&mut handle, &row(2, 10, 256, true), &config(10))
            .unwrap();
        assert_eq!(shape.n_detectors, 2);
        assert_eq!(shape.pixels, 10);
        assert_eq!(shape.channels, 256);
        assert_eq!(shape.frame_shape, Some((4, 3)));
        assert_eq!(shape.n_position_axes, 4);
        assert_eq!(shape.n_rois, 1);
        assert_eq!(shape.scaler_names, vec!["I0", "i/1"]);
        assert!(handle.schema_built());
        assert_eq!(handle.detector_names().unwrap(), vec!["mca1", "mca2"]);

        let root = handle.root();
        let counts = root.group("mca2").unwrap().dataset("counts").unwrap();
        assert_eq!(counts.shape(), vec![32, 10, 256]);
        assert_eq!(counts.chunk(), Some(vec![1, 10, 256]));
        let frames = root.group("xrd2d").unwrap().dataset("frames").unwrap();
        assert_eq!(frames.chunk(), Some(vec![1, 1, 4, 3]));
        assert!(root.group("scalars").unwrap().link_exists("i_1"));
        let det_raw = root.group("roimap").unwrap().dataset("det_raw").unwrap();
        assert_eq!(det_raw.shape(), vec![32, 10, 2]);
        // 6 arrays x 3 detector groups + pos + 4 roimap + 2 scalars + frames
        let datasets = row_datasets(root).unwrap();
        assert_eq!(datasets.len(), 18 + 1 + 4 + 2 + 1);
        assert!(datasets.iter().all(|d| row_extent(d) == 32));
        assert_eq!(handle.scan_config().unwrap(), config(10));
    }

    #[test]
    fn test_build_twice_is_already_built() {
        let dir = TempDir::new().unwrap();
        let mut handle = ContainerHandle::create(dir.path().join("m.h5"), "scan", 2).unwrap();
        let builder = SchemaBuilder::default();
        builder.build(&mut handle, &row(1, 5, 64, false), &config(5)).unwrap();
        let err = builder
            .build(&mut handle, &row(1, 5, 64, false), &config(5))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyBuilt));
    }

    #[test]
    fn test_build_rejects_invalid_shapes() {
        let dir = TempDir::new().unwrap();
        let mut handle = ContainerHandle::create(dir.path().join("m.h5"), "scan", 2).unwrap();
        let builder = SchemaBuilder::default();
        let err = builder
            .build(&mut handle, &row(1, 5, 64, false), &config(0))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidShape(_)));

        // ROI [10, 50) does not fit in 32 channels
        let err = builder
            .build(&mut handle, &row(1, 5, 32, false), &config(5))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidShape(_)));

        let mut cfg = config(5);
        cfg.calibration = vec![Calibration::default(); 3];
        let err = builder
            .build(&mut handle, &row(2, 5, 64, false), &cfg)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidShape(_)));
        assert!(!handle.schema_built());
    }

    #[test]
    fn test_failed_build_leaves_no_partial_layout() {
        let dir = TempDir::new().unwrap();
        let mut handle = ContainerHandle::create(dir.path().join("m.h5"), "scan", 2).unwrap();
        // Both scaler names map to the dataset "i_1".
        let mut parts = row(2, 5, 64, false).into_parts();
        parts.scaler_names = vec!["i/1".to_string(), "i_1".to_string()];
        let clashing = RowRecord::new(parts).unwrap();

        let builder = SchemaBuilder::default();
        assert!(builder.build(&mut handle, &clashing, &config(5)).is_err());
        assert!(!handle.schema_built());
        let root = handle.root();
        assert!(!root.link_exists("mca1"));
        let config_group = root.group("config").unwrap();
        assert!(!config_group.link_exists("rois"));
        assert!(!config_group.link_exists("mca_calib"));
        assert!(root.group("scalars").unwrap().member_names().unwrap().is_empty());

        let shape = builder
            .build(&mut handle, &row(2, 5, 64, false), &config(5))
            .unwrap();
        assert_eq!(shape.n_detectors, 2);
        assert!(handle.schema_built());
    }

    #[test]
    fn test_build_requires_owner() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.h5");
        ContainerHandle::create(&path, "scan", 2).unwrap().close().unwrap();
        let mut handle = ContainerHandle::open(&path, None).unwrap();
        let err = SchemaBuilder::default()
            .build(&mut handle, &row(1, 5, 64, false), &config(5))
            .unwrap_err();
        assert!(matches!(err, Error::NotOwner(_)));
    }

    #[test]
    fn test_capacity_rule() {
        let shape = MapShape {
            n_detectors: 1,
            pixels: 1,
            channels: 1,
            frame_shape: None,
            scaler_names: Vec::new(),
            n_position_axes: 3,
            n_rois: 0,
            row_block: 32,
        };
        assert_eq!(shape.capacity_for(0), 32);
        assert_eq!(shape.capacity_for(31), 32);
        assert_eq!(shape.capacity_for(32), 64);
        assert_eq!(shape.capacity_for(100), 128);
    }
}

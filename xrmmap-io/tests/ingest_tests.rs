#![allow(clippy::cast_precision_loss)]

mod common;

use approx::assert_relative_eq;
use common::{
    ingested, ingestor, synthetic_row, SyntheticSource, CHANNELS, DETECTORS, PEAK, PIXELS, ROWS,
};
use tempfile::TempDir;
use xrmmap_core::Rect;
use xrmmap_io::{
    AggregationEngine, ClaimMode, ContainerHandle, Detector, Error, RetryPolicy, RowIngestor,
};

#[test]
fn test_process_ingests_all_rows() {
    let (_dir, path, handle) = ingested();
    assert_eq!(handle.last_row().unwrap(), 2);
    assert_eq!(handle.rows().unwrap(), ROWS);
    assert_eq!(handle.n_detectors().unwrap(), DETECTORS);
    assert_eq!(
        handle.detector_names().unwrap(),
        vec!["mca1".to_string(), "mca2".to_string()]
    );
    handle.close().unwrap();

    let file = hdf5::File::open(&path).unwrap();
    let counts = file.dataset("xrmmap/mca1/counts").unwrap();
    assert_eq!(counts.shape(), vec![ROWS, PIXELS, CHANNELS]);
    let pos = file.dataset("xrmmap/positions/pos").unwrap();
    assert_eq!(pos.shape(), vec![ROWS, PIXELS, 4]);
    let det_raw = file.dataset("xrmmap/roimap/det_raw").unwrap();
    assert_eq!(det_raw.shape(), vec![ROWS, PIXELS, DETECTORS]);
}

#[test]
fn test_reprocessing_is_a_no_op() {
    let (_dir, _path, mut handle) = ingested();
    let ingestor = ingestor();
    let again = ingestor
        .process(&mut handle, &mut SyntheticSource::new(ROWS), None)
        .unwrap();
    assert_eq!(again, 0);
    assert!(!ingestor
        .ingest_row(&mut handle, 1, &synthetic_row(1, DETECTORS))
        .unwrap());
    assert_eq!(handle.last_row().unwrap(), 2);
}

#[test]
fn test_rows_must_arrive_in_order() {
    let (_dir, _path, mut handle) = ingested();
    let err = ingestor()
        .ingest_row(&mut handle, 5, &synthetic_row(5, DETECTORS))
        .unwrap_err();
    assert!(matches!(err, Error::OutOfOrder { expected: 3, got: 5 }));
    assert_eq!(handle.last_row().unwrap(), 2);
}

#[test]
fn test_detector_count_change_is_shape_mismatch() {
    let (_dir, _path, mut handle) = ingested();
    let err = ingestor()
        .ingest_row(&mut handle, 3, &synthetic_row(3, DETECTORS + 1))
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { row: 3, .. }));
    assert_eq!(handle.last_row().unwrap(), 2);
}

#[test]
fn test_odd_rows_are_reversed() {
    let (_dir, _path, handle) = ingested();
    let engine = AggregationEngine::new(&handle);

    // Row 0 keeps acquisition order, row 1 is flipped.
    let first = engine
        .spectrum_for_rect(Rect::new(0, 1, 0, 1), Detector::Index(0), false)
        .unwrap();
    assert_relative_eq!(first.counts[PEAK], f64::from(common::raw_count(0, 0, 0, PEAK)));
    let flipped = engine
        .spectrum_for_rect(Rect::new(1, 2, 0, 1), Detector::Index(0), false)
        .unwrap();
    assert_relative_eq!(
        flipped.counts[PEAK],
        f64::from(common::raw_count(1, 0, PIXELS - 1, PEAK))
    );

    let x = engine.positions("fine x").unwrap();
    assert_eq!(x.dim(), (ROWS, PIXELS));
    assert_relative_eq!(x[[0, 3]], 0.3, epsilon = 1e-6);
    assert_relative_eq!(x[[1, 0]], 0.9, epsilon = 1e-6);
    let y = engine.positions("fine y").unwrap();
    assert_relative_eq!(y[[2, 4]], 1.0, epsilon = 1e-6);
    assert!(matches!(engine.positions("z"), Err(Error::NotFound(_))));
}

#[test]
fn test_partial_pass_then_resume() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("map_1.h5");
    let ingestor = ingestor();
    {
        let mut handle = ContainerHandle::create(&path, "scan_001", 2).unwrap();
        let n = ingestor
            .process(&mut handle, &mut SyntheticSource::new(ROWS), Some(1))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(handle.last_row().unwrap(), 0);
        handle.close().unwrap();
    }

    let mut handle = ContainerHandle::open(&path, Some("scan_001")).unwrap();
    assert!(matches!(
        ingestor.process(&mut handle, &mut SyntheticSource::new(ROWS), None),
        Err(Error::NotOwner(_))
    ));
    handle.claim_ownership(ClaimMode::Defensive).unwrap();
    let n = ingestor
        .process(&mut handle, &mut SyntheticSource::new(ROWS), None)
        .unwrap();
    assert_eq!(n, 2);
    assert_eq!(handle.last_row().unwrap(), 2);

    let (_d, _p, reference) = ingested();
    let full = Rect::new(0, ROWS, 0, PIXELS);
    let resumed = AggregationEngine::new(&handle)
        .spectrum_for_rect(full, Detector::Sum, true)
        .unwrap();
    let straight = AggregationEngine::new(&reference)
        .spectrum_for_rect(full, Detector::Sum, true)
        .unwrap();
    assert_eq!(resumed.counts, straight.counts);
}

#[test]
fn test_incomplete_row_is_retried() {
    let dir = TempDir::new().unwrap();
    let mut handle = ContainerHandle::create(dir.path().join("m.h5"), "scan_001", 2).unwrap();
    let mut source = SyntheticSource::new(ROWS);
    source.failures.insert(2, 3);
    let n = ingestor().process(&mut handle, &mut source, None).unwrap();
    assert_eq!(n, ROWS);
    assert_eq!(source.reads, ROWS + 3);
}

#[test]
fn test_read_failure_surfaces_after_timeout() {
    let dir = TempDir::new().unwrap();
    let mut handle = ContainerHandle::create(dir.path().join("m.h5"), "scan_001", 2).unwrap();
    let mut source = SyntheticSource::new(ROWS);
    source.failures.insert(1, 100);
    let err = RowIngestor::new(common::scan_config())
        .with_retry(RetryPolicy::none())
        .process(&mut handle, &mut source, None)
        .unwrap_err();
    assert!(matches!(err, Error::ReadFailed { row: 1, .. }));
    assert!(err.is_retryable());
    // Row 0 stays committed.
    assert_eq!(handle.last_row().unwrap(), 0);
}

#[test]
fn test_growth_past_initial_block() {
    let dir = TempDir::new().unwrap();
    let mut handle = ContainerHandle::create(dir.path().join("m.h5"), "scan_001", 2).unwrap();
    let ingestor = RowIngestor::new(common::scan_config())
        .with_retry(RetryPolicy::none())
        .with_schema_options(xrmmap_io::SchemaOptions::default().with_initial_rows(2));
    let n = ingestor
        .process(&mut handle, &mut SyntheticSource::new(5), None)
        .unwrap();
    assert_eq!(n, 5);
    let spectrum = AggregationEngine::new(&handle)
        .spectrum_for_rect(Rect::new(4, 5, 0, 1), Detector::Index(1), false)
        .unwrap();
    assert_relative_eq!(spectrum.counts[0], f64::from(common::raw_count(4, 1, 0, 0)));
}

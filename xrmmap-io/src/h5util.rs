//! Small HDF5 helpers shared by the container modules.

use crate::{Error, Result};
use hdf5::types::{H5Type, VarLenUnicode};
use hdf5::{Dataset, Extent, Group, Location, SimpleExtents};
use ndarray::{Array1, ArrayD, ArrayView, Dimension};
use std::str::FromStr;

/// Chunking and compression for datasets that grow along rows.
#[derive(Clone, Copy, Debug)]
pub struct StorageOptions {
    /// Deflate level, `None` for no compression.
    pub compression: Option<u8>,
    pub shuffle: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            compression: Some(2),
            shuffle: true,
        }
    }
}

/// Create a dataset shaped `[rows, tail...]` with an unlimited row extent.
///
/// `chunk` must have the same rank as `[rows, tail...]`.
pub(crate) fn create_row_dataset<T: H5Type>(
    group: &Group,
    name: &str,
    rows: usize,
    tail: &[usize],
    chunk: &[usize],
    options: StorageOptions,
) -> Result<Dataset> {
    let mut extents = vec![Extent::resizable(rows)];
    extents.extend(tail.iter().map(|&d| Extent::fixed(d)));

    let mut builder = group
        .new_dataset::<T>()
        .shape(SimpleExtents::from_vec(extents))
        .chunk(chunk.to_vec());

    if let Some(level) = options.compression {
        builder = builder.deflate(level);
    }

    if options.shuffle {
        builder = builder.shuffle();
    }

    Ok(builder.create(name)?)
}

/// Create a fixed-shape dataset and write `data` into it.
pub(crate) fn write_fixed<T: H5Type, D: Dimension>(
    group: &Group,
    name: &str,
    data: ArrayView<'_, T, D>,
) -> Result<Dataset> {
    let dataset = group
        .new_dataset::<T>()
        .shape(SimpleExtents::fixed(data.shape().to_vec()))
        .create(name)?;
    if !data.is_empty() {
        dataset.write(data)?;
    }
    Ok(dataset)
}

/// Grow (or shrink) the leading extent of a row dataset.
pub(crate) fn resize_rows(dataset: &Dataset, rows: usize) -> Result<()> {
    let mut shape = dataset.shape();
    if shape.first() == Some(&rows) {
        return Ok(());
    }
    if let Some(first) = shape.first_mut() {
        *first = rows;
    }
    dataset.resize(shape)?;
    Ok(())
}

/// Number of rows currently allocated in a row dataset.
pub(crate) fn row_extent(dataset: &Dataset) -> usize {
    dataset.shape().first().copied().unwrap_or(0)
}

pub(crate) fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value)
        .map_err(|e| Error::Corrupt(format!("invalid utf-8 string: {e}")))
}

/// Write a scalar attribute, replacing any previous value.
pub(crate) fn set_attr<T: H5Type>(loc: &Location, name: &str, value: &T) -> Result<()> {
    if loc.attr_names()?.iter().any(|n| n == name) {
        loc.attr(name)?.write_scalar(value)?;
    } else {
        loc.new_attr::<T>().create(name)?.write_scalar(value)?;
    }
    Ok(())
}

/// Write a string attribute, replacing any previous value.
pub(crate) fn set_attr_str(loc: &Location, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    set_attr(loc, name, &value)
}

pub(crate) fn read_attr_opt<T: H5Type>(loc: &Location, name: &str) -> Result<Option<T>> {
    if !loc.attr_names()?.iter().any(|n| n == name) {
        return Ok(None);
    }
    Ok(Some(loc.attr(name)?.read_scalar::<T>()?))
}

pub(crate) fn read_attr_opt_string(loc: &Location, name: &str) -> Result<Option<String>> {
    Ok(read_attr_opt::<VarLenUnicode>(loc, name)?.map(|v| v.to_string()))
}

/// Required attribute; a missing one means the container is corrupt.
pub(crate) fn read_attr<T: H5Type>(loc: &Location, name: &str) -> Result<T> {
    read_attr_opt(loc, name)?.ok_or_else(|| Error::Corrupt(format!("missing attribute '{name}'")))
}

pub(crate) fn read_attr_string(loc: &Location, name: &str) -> Result<String> {
    read_attr_opt_string(loc, name)?
        .ok_or_else(|| Error::Corrupt(format!("missing attribute '{name}'")))
}

/// Store a list of strings as a 1-D variable-length string dataset.
pub(crate) fn write_strings(group: &Group, name: &str, values: &[String]) -> Result<Dataset> {
    let encoded = values
        .iter()
        .map(|v| to_var_len_unicode(v))
        .collect::<Result<Vec<_>>>()?;
    write_fixed(group, name, Array1::from(encoded).view())
}

pub(crate) fn read_strings(group: &Group, name: &str) -> Result<Vec<String>> {
    let dataset = group.dataset(name)?;
    if dataset.size() == 0 {
        return Ok(Vec::new());
    }
    let values = dataset.read_raw::<VarLenUnicode>()?;
    Ok(values.into_iter().map(|v| v.to_string()).collect())
}

/// Read a whole dataset of any rank.
pub(crate) fn read_dyn<T: H5Type>(group: &Group, name: &str) -> Result<ArrayD<T>> {
    Ok(group.dataset(name)?.read_dyn::<T>()?)
}

/// First `<prefix>_NNN` (from 001) not already a member of `group`.
pub(crate) fn next_free_name(group: &Group, prefix: &str) -> String {
    (1..)
        .map(|i| format!("{prefix}_{i:03}"))
        .find(|name| !group.link_exists(name))
        .unwrap_or_else(|| prefix.to_string())
}

/// Open a sub-group, reporting absence as `Corrupt`.
pub(crate) fn required_group(parent: &Group, name: &str) -> Result<Group> {
    if !parent.link_exists(name) {
        return Err(Error::Corrupt(format!("missing group '{name}'")));
    }
    Ok(parent.group(name)?)
}

//! Named pixel masks stored under `/xrmmap/areas`.

use crate::container::ContainerHandle;
use crate::h5util::{
    next_free_name, read_attr_opt_string, read_strings, required_group, set_attr_str,
    write_fixed,
};
use crate::schema::MapShape;
use crate::{Error, Result};
use hdf5::{File, Group};
use log::{debug, info};
use ndarray::{s, Array2, ArrayView2, Ix3, Zip};
use std::path::Path;
use xrmmap_core::{bounding_rect, Rect, SummaryStats};

/// A named boolean mask over the `(row, pixel)` grid.
#[derive(Clone, Debug, PartialEq)]
pub struct Area {
    pub name: String,
    pub description: String,
    pub mask: Array2<bool>,
}

impl Area {
    /// Mask restricted to the first `rows` rows.
    #[must_use]
    pub fn clipped(&self, rows: usize) -> ArrayView2<'_, bool> {
        let n = rows.min(self.mask.nrows());
        self.mask.slice(s![..n, ..])
    }

    /// Bounding rectangle of the selected pixels among the first `rows`
    /// rows.
    #[must_use]
    pub fn bounds(&self, rows: usize) -> Option<Rect> {
        bounding_rect(self.clipped(rows))
    }

    /// Number of selected pixels among the first `rows` rows.
    #[must_use]
    pub fn npixels(&self, rows: usize) -> usize {
        self.clipped(rows).iter().filter(|&&on| on).count()
    }
}

/// Area storage for one container.
///
/// Reads work on any handle; adding, deleting and importing require
/// ownership.
pub struct AreaStore<'a> {
    handle: &'a ContainerHandle,
}

impl<'a> AreaStore<'a> {
    #[must_use]
    pub fn new(handle: &'a ContainerHandle) -> Self {
        Self { handle }
    }

    fn group(&self) -> Result<Group> {
        required_group(self.handle.root(), "areas")
    }

    /// Names of all stored areas, sorted.
    ///
    /// # Errors
    /// Returns `Corrupt` if the areas group is missing.
    pub fn area_names(&self) -> Result<Vec<String>> {
        let mut names = self.group()?.member_names()?;
        names.sort();
        Ok(names)
    }

    /// Store a mask and return its name.
    ///
    /// Without a name the first free `area_NNN` is used; the description
    /// defaults to the name.
    ///
    /// # Errors
    /// Returns `NotOwner`, `SchemaMissing`, `AlreadyExists` for an explicit
    /// duplicate name, or `InvalidShape` when the mask width differs from
    /// the pixels per row.
    pub fn add_area(
        &self,
        mask: ArrayView2<'_, bool>,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<String> {
        self.handle.ensure_owner()?;
        let pixels = MapShape::from_container(self.handle)?.pixels;
        if mask.ncols() != pixels {
            return Err(Error::InvalidShape(format!(
                "mask has {} columns, map rows have {pixels} pixels",
                mask.ncols()
            )));
        }
        let group = self.group()?;
        let name = match name {
            Some(n) if group.link_exists(n) => {
                return Err(Error::AlreadyExists(format!("area '{n}'")))
            }
            Some(n) => n.to_string(),
            None => next_free_name(&group, "area"),
        };
        let mask = mask.as_standard_layout();
        let dataset = write_fixed(&group, &name, mask.view())?;
        set_attr_str(&dataset, "description", description.unwrap_or(&name))?;
        self.handle.file().flush()?;
        info!(
            "added area '{name}' ({} pixels)",
            mask.iter().filter(|&&on| on).count()
        );
        Ok(name)
    }

    /// Look an area up by name, falling back to its description.
    ///
    /// # Errors
    /// Returns `NotFound` when neither matches.
    pub fn get_area(&self, key: &str) -> Result<Area> {
        let group = self.group()?;
        if group.link_exists(key) {
            return read_area(&group, key);
        }
        for name in self.area_names()? {
            let dataset = group.dataset(&name)?;
            if read_attr_opt_string(&dataset, "description")?.as_deref() == Some(key) {
                return read_area(&group, &name);
            }
        }
        Err(Error::NotFound(format!("area '{key}'")))
    }

    /// Remove an area.
    ///
    /// # Errors
    /// Returns `NotOwner` or `NotFound`.
    pub fn delete_area(&self, name: &str) -> Result<()> {
        self.handle.ensure_owner()?;
        let group = self.group()?;
        if !group.link_exists(name) {
            return Err(Error::NotFound(format!("area '{name}'")));
        }
        group.unlink(name)?;
        self.handle.file().flush()?;
        info!("deleted area '{name}'");
        Ok(())
    }

    /// Write every area to a standalone HDF5 bundle, one bool dataset per
    /// area. Returns the number of areas written.
    ///
    /// # Errors
    /// Returns an HDF5 error if the bundle cannot be created.
    pub fn export_areas(&self, path: &Path) -> Result<usize> {
        let bundle = File::create(path)?;
        set_attr_str(&bundle, "map_file", &self.handle.filename())?;
        let names = self.area_names()?;
        for name in &names {
            let area = self.get_area(name)?;
            let dataset = write_fixed(&bundle, &area.name, area.mask.view())?;
            set_attr_str(&dataset, "description", &area.description)?;
        }
        bundle.flush()?;
        info!("exported {} areas to {}", names.len(), path.display());
        Ok(names.len())
    }

    /// Add every area from a bundle written by [`export_areas`].
    ///
    /// On a name collision the existing area is replaced when `overwrite`
    /// is set; otherwise the import is stored as `<name>_<bundle stem>`
    /// with description `<name> from <bundle stem>`. The whole bundle is
    /// checked before any stored area changes. Returns the stored names.
    ///
    /// [`export_areas`]: AreaStore::export_areas
    ///
    /// # Errors
    /// Returns `NotOwner`, `NotFound` for a missing bundle, `InvalidShape`
    /// for masks of the wrong width, or `AlreadyExists` when the renamed
    /// area also collides.
    pub fn import_areas(&self, path: &Path, overwrite: bool) -> Result<Vec<String>> {
        self.handle.ensure_owner()?;
        if !path.exists() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bundle = File::open(path)?;
        let group = self.group()?;
        let pixels = MapShape::from_container(self.handle)?.pixels;
        let mut names = bundle.member_names()?;
        names.sort();

        // Nothing is unlinked or written until every mask and target name
        // has been checked.
        let mut staged: Vec<(String, String, Area, bool)> = Vec::with_capacity(names.len());
        for name in names {
            let area = read_area(&bundle, &name)?;
            if area.mask.ncols() != pixels {
                return Err(Error::InvalidShape(format!(
                    "area '{name}' has {} columns, map rows have {pixels} pixels",
                    area.mask.ncols()
                )));
            }
            let exists = group.link_exists(&name);
            let (target, description) = if exists && !overwrite {
                (format!("{name}_{stem}"), format!("{name} from {stem}"))
            } else {
                (name.clone(), area.description.clone())
            };
            let replace = exists && overwrite;
            let taken = (!replace && group.link_exists(&target))
                || staged.iter().any(|(other, ..)| *other == target);
            if taken {
                return Err(Error::AlreadyExists(format!("area '{target}'")));
            }
            staged.push((target, description, area, replace));
        }

        let mut stored = Vec::with_capacity(staged.len());
        for (target, description, area, replace) in staged {
            if replace {
                group.unlink(&target)?;
            }
            debug!("importing area '{}' as '{target}'", area.name);
            stored.push(self.add_area(area.mask.view(), Some(&target), Some(&description))?);
        }
        info!("imported {} areas from {}", stored.len(), path.display());
        Ok(stored)
    }

    /// Count-rate statistics of every per-detector ROI map column inside
    /// an area.
    ///
    /// Rate is raw ROI counts divided by the detector's real time; pixels
    /// with non-positive real time contribute raw counts. The result is
    /// cached on the area as a JSON attribute when the handle owns the
    /// container.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown area, `EmptySelection` when the
    /// area covers no ingested pixel, or an HDF5 error.
    pub fn area_stats(&self, name: &str) -> Result<Vec<SummaryStats>> {
        let area = self.get_area(name)?;
        let group = self.group()?;
        let dataset = group.dataset(&area.name)?;
        if let Some(cached) = read_attr_opt_string(&dataset, "roistats")? {
            debug!("using cached statistics for area '{}'", area.name);
            return Ok(serde_json::from_str(&cached)?);
        }

        let root = self.handle.root();
        let rows = self.handle.rows()?;
        let rect = area
            .bounds(rows)
            .ok_or_else(|| Error::EmptySelection(format!("area '{}'", area.name)))?;
        let roimap = required_group(root, "roimap")?;
        let mut stats = Vec::new();

        if roimap.link_exists("det_raw") {
            let columns = read_strings(&roimap, "det_name")?;
            let ndet = self.handle.n_detectors()?.max(1);
            let raw = roimap.dataset("det_raw")?.read_slice::<f64, _, Ix3>(s![
                rect.y0..rect.y1,
                rect.x0..rect.x1,
                ..
            ])?;
            let mask = area.clipped(rows);
            let mask = mask.slice(s![rect.y0..rect.y1, rect.x0..rect.x1]);

            let mut realtimes = Vec::with_capacity(ndet);
            for det in 0..ndet {
                realtimes.push(
                    root.group(&format!("mca{}", det + 1))?
                        .dataset("realtime")?
                        .read_slice_2d::<f64, _>(s![rect.y0..rect.y1, rect.x0..rect.x1])?,
                );
            }

            for (col, column) in columns.iter().enumerate() {
                let rt = &realtimes[col % ndet];
                let mut values = Vec::new();
                Zip::from(mask)
                    .and(raw.slice(s![.., .., col]))
                    .and(rt)
                    .for_each(|&on, &counts, &time| {
                        if on {
                            values.push(if time > 0.0 { counts / time } else { counts });
                        }
                    });
                stats.push(SummaryStats::from_values(column.clone(), &values));
            }
        }

        if self.handle.is_writable() && self.handle.is_owner()? {
            set_attr_str(&dataset, "roistats", &serde_json::to_string(&stats)?)?;
            self.handle.file().flush()?;
        }
        Ok(stats)
    }
}

fn read_area(group: &Group, name: &str) -> Result<Area> {
    let dataset = group.dataset(name)?;
    let mask = if dataset.size() == 0 {
        let shape = dataset.shape();
        Array2::from_elem((shape[0], shape.get(1).copied().unwrap_or(0)), false)
    } else {
        dataset.read_2d::<bool>()?
    };
    let description =
        read_attr_opt_string(&dataset, "description")?.unwrap_or_else(|| name.to_string());
    Ok(Area {
        name: name.to_string(),
        description,
        mask,
    })
}

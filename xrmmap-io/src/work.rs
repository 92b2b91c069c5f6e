//! User-derived arrays stored under `/xrmmap/work`.

use crate::container::ContainerHandle;
use crate::h5util::{
    next_free_name, read_attr_opt_string, read_dyn, required_group, set_attr_str, write_fixed,
};
use crate::{Error, Result};
use hdf5::Group;
use log::info;
use ndarray::ArrayD;
use std::collections::BTreeMap;

/// A stored work array with its string attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkArray {
    pub name: String,
    pub data: ArrayD<f64>,
    pub attrs: BTreeMap<String, String>,
}

/// Work-array storage for one container.
pub struct WorkStore<'a> {
    handle: &'a ContainerHandle,
}

impl<'a> WorkStore<'a> {
    #[must_use]
    pub fn new(handle: &'a ContainerHandle) -> Self {
        Self { handle }
    }

    fn group(&self) -> Result<Group> {
        required_group(self.handle.root(), "work")
    }

    /// # Errors
    /// Returns `Corrupt` if the work group is missing.
    pub fn work_array_names(&self) -> Result<Vec<String>> {
        let mut names = self.group()?.member_names()?;
        names.sort();
        Ok(names)
    }

    /// Store an array and return its name (first free `array_NNN` when
    /// none is given).
    ///
    /// # Errors
    /// Returns `NotOwner` or `AlreadyExists`.
    pub fn add_work_array(
        &self,
        data: &ArrayD<f64>,
        name: Option<&str>,
        attrs: &BTreeMap<String, String>,
    ) -> Result<String> {
        self.handle.ensure_owner()?;
        let group = self.group()?;
        let name = match name {
            Some(n) if group.link_exists(n) => {
                return Err(Error::AlreadyExists(format!("work array '{n}'")));
            }
            Some(n) => n.to_string(),
            None => next_free_name(&group, "array"),
        };
        let data = data.as_standard_layout();
        let dataset = write_fixed(&group, &name, data.view())?;
        for (key, value) in attrs {
            set_attr_str(&dataset, key, value)?;
        }
        self.handle.file().flush()?;
        info!("added work array '{name}' {:?}", data.shape());
        Ok(name)
    }

    /// # Errors
    /// Returns `NotFound` when absent.
    pub fn get_work_array(&self, name: &str) -> Result<WorkArray> {
        let group = self.group()?;
        if !group.link_exists(name) {
            return Err(Error::NotFound(format!("work array '{name}'")));
        }
        let dataset = group.dataset(name)?;
        let data = if dataset.size() == 0 {
            ArrayD::zeros(dataset.shape())
        } else {
            read_dyn::<f64>(&group, name)?
        };
        let mut attrs = BTreeMap::new();
        for key in dataset.attr_names()? {
            if let Some(value) = read_attr_opt_string(&dataset, &key)? {
                attrs.insert(key, value);
            }
        }
        Ok(WorkArray {
            name: name.to_string(),
            data,
            attrs,
        })
    }

    /// # Errors
    /// Returns `NotOwner` or `NotFound`.
    pub fn delete_work_array(&self, name: &str) -> Result<()> {
        self.handle.ensure_owner()?;
        let group = self.group()?;
        if !group.link_exists(name) {
            return Err(Error::NotFound(format!("work array '{name}'")));
        }
        group.unlink(name)?;
        self.handle.file().flush()?;
        Ok(())
    }
}

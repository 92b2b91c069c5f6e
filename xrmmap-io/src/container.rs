//! The on-disk map container and its top-level attributes.

use crate::h5util::{
    read_attr, read_attr_opt, read_attr_opt_string, read_attr_string, read_strings,
    required_group, resize_rows, set_attr, set_attr_str, write_strings,
};
use crate::ownership::{ClaimMode, OwnerToken};
use crate::schema;
use crate::{Error, Result};
use hdf5::{File, Group};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use xrmmap_core::{parse_environ, EnvironEntry, ScanConfig};

/// Layout version written into new containers.
pub const FORMAT_VERSION: &str = "2.1.0";

const ROOT: &str = "xrmmap";
const SUBGROUPS: [&str; 6] = ["config", "positions", "roimap", "scalars", "areas", "work"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    ReadWrite,
    ReadOnly,
}

/// An open map container.
///
/// Dropping a writable handle releases ownership if it still holds it.
pub struct ContainerHandle {
    file: File,
    root: Group,
    path: PathBuf,
    access: Access,
    token: OwnerToken,
    closed: bool,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("path", &self.path)
            .field("access", &self.access)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Folder identity recorded in a container: the last path component.
#[must_use]
pub fn folder_identity(folder: &Path) -> String {
    folder
        .file_name()
        .map_or_else(|| folder.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// First unused `<stem>_<n>.<ext>` next to `path`, for a container whose
/// name is taken by another scan.
#[must_use]
pub fn new_container_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map_or_else(|| "map".to_string(), |s| s.to_string_lossy().into_owned());
    let ext = path
        .extension()
        .map_or_else(|| "h5".to_string(), |s| s.to_string_lossy().into_owned());
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    (1..)
        .map(|n| parent.join(format!("{stem}_{n}.{ext}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Lock conflicts mean another process has the file open for writing.
fn open_error(path: &Path, err: &hdf5::Error) -> Error {
    let message = err.to_string();
    if message.contains("unable to lock file") {
        Error::Busy(format!("another process holding {}", path.display()))
    } else {
        Error::Corrupt(format!("{}: {message}", path.display()))
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl ContainerHandle {
    /// Create a new, empty container owned by the calling process.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if `path` exists, `InvalidShape` for a
    /// dimension other than 1 or 2, or an HDF5 error.
    pub fn create<P: AsRef<Path>>(path: P, folder: &str, dimension: u8) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(Error::AlreadyExists(path.display().to_string()));
        }
        if !(1..=2).contains(&dimension) {
            return Err(Error::InvalidShape(format!(
                "dimension must be 1 or 2, got {dimension}"
            )));
        }
        let file = File::create(path)?;
        let root = file.create_group(ROOT)?;
        for name in SUBGROUPS {
            root.create_group(name)?;
        }
        set_attr_str(&root, "format_version", FORMAT_VERSION)?;
        set_attr_str(&root, "map_folder", folder)?;
        set_attr(&root, "dimension", &i32::from(dimension))?;
        set_attr_str(&root, "start_time", &timestamp())?;
        set_attr_str(&root, "stop_time", "")?;
        set_attr(&root, "last_row", &-1_i64)?;
        set_attr(&root, "n_detectors", &0_i32)?;
        set_attr_str(&root, "process_machine", "")?;
        set_attr(&root, "process_id", &0_i64)?;

        let mut handle = Self {
            file,
            root,
            path: path.to_path_buf(),
            access: Access::ReadWrite,
            token: OwnerToken::current(),
            closed: false,
        };
        handle.claim_ownership(ClaimMode::Override)?;
        info!("created map container {} for folder '{folder}'", path.display());
        Ok(handle)
    }

    /// Open an existing container for writing. Ownership is not claimed.
    ///
    /// # Errors
    /// Returns `NotFound` if `path` does not exist, `Busy` if another
    /// process has it open for writing, `Corrupt` if it is not a map
    /// container, or `WrongFolder` if `expected_folder` is given and
    /// differs from the recorded folder.
    pub fn open<P: AsRef<Path>>(path: P, expected_folder: Option<&str>) -> Result<Self> {
        let handle = Self::open_with(path.as_ref(), Access::ReadWrite)?;
        if let Some(expected) = expected_folder {
            let found = handle.folder()?;
            if found != expected {
                return Err(Error::WrongFolder {
                    expected: expected.to_string(),
                    found,
                });
            }
        }
        Ok(handle)
    }

    /// Open an existing container for queries only. Works while another
    /// process is writing the file.
    ///
    /// # Errors
    /// Returns `NotFound` or `Corrupt` as for [`Self::open`].
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path.as_ref(), Access::ReadOnly)
    }

    fn open_with(path: &Path, access: Access) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        // Readers skip HDF5 file locking so they can query while a writer
        // in another process holds the file.
        let opened = match access {
            Access::ReadWrite => File::open_rw(path),
            Access::ReadOnly => File::with_options()
                .with_fapl(|fapl| fapl.file_locking(false))
                .open(path),
        };
        let file = opened.map_err(|e| open_error(path, &e))?;
        let root = required_group(&file, ROOT)?;
        for name in ["map_folder", "format_version"] {
            read_attr_string(&root, name)?;
        }
        read_attr::<i64>(&root, "last_row")?;
        read_attr::<i32>(&root, "dimension")?;
        debug!("opened map container {} ({access:?})", path.display());
        Ok(Self {
            file,
            root,
            path: path.to_path_buf(),
            access,
            token: OwnerToken::current(),
            closed: false,
        })
    }

    /// Act under a different owner token than the calling process.
    #[must_use]
    pub fn with_owner_token(mut self, token: OwnerToken) -> Self {
        self.token = token;
        self
    }

    /// Token this handle claims with.
    #[must_use]
    pub fn token(&self) -> &OwnerToken {
        &self.token
    }

    /// Currently recorded owner, if any.
    ///
    /// # Errors
    /// Returns an error if the ownership attributes cannot be read.
    pub fn owner(&self) -> Result<Option<OwnerToken>> {
        let host = read_attr_opt_string(&self.root, "process_machine")?.unwrap_or_default();
        let pid = read_attr_opt::<i64>(&self.root, "process_id")?.unwrap_or(0);
        if host.is_empty() && pid == 0 {
            return Ok(None);
        }
        Ok(Some(OwnerToken {
            host,
            pid: u32::try_from(pid).unwrap_or(0),
        }))
    }

    /// Record this handle's token as the owner.
    ///
    /// With no owner, or this handle already the owner, the token is simply
    /// written. Another owner is replaced under [`ClaimMode::Override`]
    /// without checking whether it is alive; under
    /// [`ClaimMode::Defensive`] a possibly-live owner yields `Busy`.
    ///
    /// # Errors
    /// Returns `ReadOnly`, `Busy`, or an HDF5 error.
    pub fn claim_ownership(&mut self, mode: ClaimMode) -> Result<()> {
        self.ensure_writable()?;
        if let Some(current) = self.owner()? {
            if current != self.token {
                match mode {
                    ClaimMode::Defensive if current.is_alive() => {
                        return Err(Error::Busy(current.to_string()));
                    }
                    _ => warn!(
                        "taking ownership of {} from {current}",
                        self.path.display()
                    ),
                }
            }
        }
        set_attr_str(&self.root, "process_machine", &self.token.host)?;
        set_attr(&self.root, "process_id", &i64::from(self.token.pid))?;
        self.file.flush()?;
        Ok(())
    }

    /// Clear the owner fields if this handle is the owner.
    ///
    /// # Errors
    /// Returns `ReadOnly` or an HDF5 error.
    pub fn release_ownership(&mut self) -> Result<()> {
        self.ensure_writable()?;
        if self.is_owner()? {
            set_attr_str(&self.root, "process_machine", "")?;
            set_attr(&self.root, "process_id", &0_i64)?;
            self.file.flush()?;
        }
        Ok(())
    }

    /// Whether this handle's token is the recorded owner.
    ///
    /// # Errors
    /// Returns an error if the ownership attributes cannot be read.
    pub fn is_owner(&self) -> Result<bool> {
        Ok(self.owner()?.as_ref() == Some(&self.token))
    }

    /// Fail unless this handle may mutate the container.
    ///
    /// # Errors
    /// Returns `ReadOnly` or `NotOwner`.
    pub fn ensure_owner(&self) -> Result<()> {
        self.ensure_writable()?;
        if self.is_owner()? {
            return Ok(());
        }
        let owner = self
            .owner()?
            .map_or_else(|| "nobody".to_string(), |t| t.to_string());
        Err(Error::NotOwner(owner))
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.access {
            Access::ReadWrite => Ok(()),
            Access::ReadOnly => Err(Error::ReadOnly),
        }
    }

    /// Whether mutations are possible through this handle at all.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.access == Access::ReadWrite
    }

    /// Highest fully ingested row, -1 when empty.
    ///
    /// # Errors
    /// Returns an error if the attribute cannot be read.
    pub fn last_row(&self) -> Result<i64> {
        read_attr(&self.root, "last_row")
    }

    /// Number of ingested rows.
    ///
    /// # Errors
    /// Returns an error if the attribute cannot be read.
    pub fn rows(&self) -> Result<usize> {
        Ok(usize::try_from(self.last_row()? + 1).unwrap_or(0))
    }

    /// Advance `last_row` and flush. Called only after a row's data is
    /// fully written.
    pub(crate) fn commit_row(&mut self, row: usize) -> Result<()> {
        self.ensure_owner()?;
        let row = i64::try_from(row).map_err(|e| Error::InvalidShape(e.to_string()))?;
        if row <= self.last_row()? {
            return Ok(());
        }
        set_attr(&self.root, "last_row", &row)?;
        self.file.flush()?;
        Ok(())
    }

    /// Recorded source-folder identity.
    ///
    /// # Errors
    /// Returns `Corrupt` if the attribute is missing.
    pub fn folder(&self) -> Result<String> {
        read_attr_string(&self.root, "map_folder")
    }

    /// Scan dimension (1 or 2).
    ///
    /// # Errors
    /// Returns `Corrupt` if the attribute is missing or out of range.
    pub fn dimension(&self) -> Result<u8> {
        let dim = read_attr::<i32>(&self.root, "dimension")?;
        u8::try_from(dim).map_err(|_| Error::Corrupt(format!("bad dimension {dim}")))
    }

    /// Layout version string.
    ///
    /// # Errors
    /// Returns `Corrupt` if the attribute is missing.
    pub fn format_version(&self) -> Result<String> {
        read_attr_string(&self.root, "format_version")
    }

    /// `(start_time, stop_time)` as recorded.
    ///
    /// # Errors
    /// Returns `Corrupt` if the attributes are missing.
    pub fn times(&self) -> Result<(String, String)> {
        Ok((
            read_attr_string(&self.root, "start_time")?,
            read_attr_string(&self.root, "stop_time")?,
        ))
    }

    /// Physical detectors in the schema (0 before it is built).
    ///
    /// # Errors
    /// Returns an error if the attribute cannot be read.
    pub fn n_detectors(&self) -> Result<usize> {
        let n = read_attr_opt::<i32>(&self.root, "n_detectors")?.unwrap_or(0);
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Detector group names, `mca1..mcaN`, without the sum detector.
    ///
    /// # Errors
    /// Returns an error if the attribute cannot be read.
    pub fn detector_names(&self) -> Result<Vec<String>> {
        Ok((1..=self.n_detectors()?).map(|k| format!("mca{k}")).collect())
    }

    /// Whether the dataset layout exists.
    #[must_use]
    pub fn schema_built(&self) -> bool {
        self.root.link_exists(schema::SUM_DETECTOR)
    }

    /// Geometry recorded when the schema was built.
    ///
    /// # Errors
    /// Returns `SchemaMissing` before the first row has been ingested.
    pub fn shape(&self) -> Result<schema::MapShape> {
        schema::MapShape::from_container(self)
    }

    pub(crate) fn root(&self) -> &Group {
        &self.root
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name without directories, used for result provenance.
    #[must_use]
    pub fn filename(&self) -> String {
        folder_identity(&self.path)
    }

    /// Store the scan-start environment table under `config/environ`.
    ///
    /// # Errors
    /// Returns `NotOwner`, `ReadOnly`, or an HDF5 error.
    pub fn set_environ(&mut self, entries: &[EnvironEntry]) -> Result<()> {
        self.ensure_owner()?;
        let config = self.root.group("config")?;
        if config.link_exists("environ") {
            config.unlink("environ")?;
        }
        let env = config.create_group("environ")?;
        let names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        let addresses: Vec<String> = entries.iter().map(|e| e.address.clone()).collect();
        let values: Vec<String> = entries.iter().map(|e| e.value.clone()).collect();
        write_strings(&env, "name", &names)?;
        write_strings(&env, "address", &addresses)?;
        write_strings(&env, "value", &values)?;
        Ok(())
    }

    /// Parse an environment file and store it.
    ///
    /// # Errors
    /// Returns a parse error or any error of [`Self::set_environ`].
    pub fn import_environ(&mut self, text: &str) -> Result<usize> {
        let entries = parse_environ(text)?;
        self.set_environ(&entries)?;
        Ok(entries.len())
    }

    /// Stored environment table, empty if none was recorded.
    ///
    /// # Errors
    /// Returns an error if the table exists but cannot be read.
    pub fn environ(&self) -> Result<Vec<EnvironEntry>> {
        let config = self.root.group("config")?;
        if !config.link_exists("environ") {
            return Ok(Vec::new());
        }
        let env = config.group("environ")?;
        let names = read_strings(&env, "name")?;
        let addresses = read_strings(&env, "address")?;
        let values = read_strings(&env, "value")?;
        Ok(names
            .into_iter()
            .zip(addresses)
            .zip(values)
            .map(|((name, address), value)| EnvironEntry {
                name,
                address,
                value,
            })
            .collect())
    }

    /// Scan configuration stored when the schema was built.
    ///
    /// # Errors
    /// Returns `SchemaMissing` before the schema exists, or a decode error.
    pub fn scan_config(&self) -> Result<ScanConfig> {
        let config = self.root.group("config")?;
        let text = read_attr_opt_string(&config, "scan")?.ok_or(Error::SchemaMissing)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Shrink every row dataset to the number of ingested rows.
    ///
    /// # Errors
    /// Returns `NotOwner` or an HDF5 error.
    pub fn compact(&mut self) -> Result<()> {
        self.ensure_owner()?;
        if !self.schema_built() {
            return Ok(());
        }
        let rows = self.rows()?;
        for dataset in schema::row_datasets(&self.root)? {
            resize_rows(&dataset, rows)?;
        }
        self.file.flush()?;
        debug!("compacted {} to {rows} rows", self.path.display());
        Ok(())
    }

    /// Flush, compact, stamp the stop time and release ownership.
    ///
    /// A read-only handle or a handle that does not own the container is
    /// simply closed.
    ///
    /// # Errors
    /// Returns an HDF5 error from any of the final writes.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        if self.is_writable() && self.is_owner()? {
            self.compact()?;
            set_attr_str(&self.root, "stop_time", &timestamp())?;
            self.release_ownership()?;
        }
        if self.is_writable() {
            self.file.flush()?;
        }
        Ok(())
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.closed || !self.is_writable() {
            return;
        }
        if let Err(e) = self.release_ownership() {
            warn!(
                "failed to release ownership of {}: {e}",
                self.path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.h5");
        (dir, path)
    }

    #[test]
    fn test_create_sets_attributes_and_owner() {
        let (_dir, path) = scratch();
        let handle = ContainerHandle::create(&path, "scan_001", 2).unwrap();
        assert_eq!(handle.last_row().unwrap(), -1);
        assert_eq!(handle.rows().unwrap(), 0);
        assert_eq!(handle.folder().unwrap(), "scan_001");
        assert_eq!(handle.dimension().unwrap(), 2);
        assert_eq!(handle.format_version().unwrap(), FORMAT_VERSION);
        assert!(handle.is_owner().unwrap());
        assert!(!handle.schema_built());
        assert_eq!(handle.filename(), "map.h5");
    }

    #[test]
    fn test_create_refuses_existing_path() {
        let (_dir, path) = scratch();
        ContainerHandle::create(&path, "scan_001", 1).unwrap().close().unwrap();
        assert!(matches!(
            ContainerHandle::create(&path, "scan_001", 1),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_open_errors() {
        let (dir, path) = scratch();
        assert!(matches!(
            ContainerHandle::open(&path, None),
            Err(Error::NotFound(_))
        ));

        let junk = dir.path().join("junk.h5");
        std::fs::write(&junk, b"not an hdf5 file").unwrap();
        assert!(matches!(
            ContainerHandle::open(&junk, None),
            Err(Error::Corrupt(_))
        ));

        let bare = dir.path().join("bare.h5");
        File::create(&bare).unwrap();
        assert!(matches!(
            ContainerHandle::open(&bare, None),
            Err(Error::Corrupt(_))
        ));

        ContainerHandle::create(&path, "scan_001", 2).unwrap().close().unwrap();
        let err = ContainerHandle::open(&path, Some("scan_002")).unwrap_err();
        assert!(matches!(err, Error::WrongFolder { .. }));
        assert!(ContainerHandle::open(&path, Some("scan_001")).is_ok());
    }

    #[test]
    fn test_lock_conflicts_are_busy() {
        let path = Path::new("map_1.h5");
        let locked = hdf5::Error::Internal(
            "unable to open file: unable to lock file, errno = 11".to_string(),
        );
        assert!(matches!(open_error(path, &locked), Error::Busy(_)));
        let garbage = hdf5::Error::Internal(
            "unable to open file: file signature not found".to_string(),
        );
        assert!(matches!(open_error(path, &garbage), Error::Corrupt(_)));
    }

    #[test]
    fn test_close_releases_ownership() {
        let (_dir, path) = scratch();
        ContainerHandle::create(&path, "scan_001", 2).unwrap().close().unwrap();
        let handle = ContainerHandle::open(&path, None).unwrap();
        assert!(handle.owner().unwrap().is_none());
        assert!(!handle.is_owner().unwrap());
        assert!(matches!(handle.ensure_owner(), Err(Error::NotOwner(_))));
        let (_, stop) = handle.times().unwrap();
        assert!(!stop.is_empty());
    }

    #[test]
    fn test_drop_releases_ownership() {
        let (_dir, path) = scratch();
        {
            let _handle = ContainerHandle::create(&path, "scan_001", 2).unwrap();
        }
        let handle = ContainerHandle::open(&path, None).unwrap();
        assert!(handle.owner().unwrap().is_none());
    }

    #[test]
    fn test_override_claim_replaces_other_owner() {
        let (_dir, path) = scratch();
        let _first = ContainerHandle::create(&path, "scan_001", 2).unwrap();
        let mut second = ContainerHandle::open(&path, None).unwrap().with_owner_token(OwnerToken {
            host: OwnerToken::current().host,
            pid: u32::MAX - 11,
        });
        second.claim_ownership(ClaimMode::Override).unwrap();
        assert!(second.is_owner().unwrap());
        assert_eq!(second.owner().unwrap().unwrap().pid, u32::MAX - 11);
    }

    #[test]
    fn test_defensive_claim_is_busy_while_owner_alive() {
        let (_dir, path) = scratch();
        let first = ContainerHandle::create(&path, "scan_001", 2).unwrap();
        let mut second = ContainerHandle::open(&path, None).unwrap().with_owner_token(OwnerToken {
            host: OwnerToken::current().host,
            pid: u32::MAX - 11,
        });
        let err = second.claim_ownership(ClaimMode::Defensive).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        assert!(first.is_owner().unwrap());
    }

    #[test]
    fn test_defensive_claim_recovers_dead_owner() {
        let (_dir, path) = scratch();
        let mut ghost = ContainerHandle::create(&path, "scan_001", 2)
            .unwrap()
            .with_owner_token(OwnerToken {
                host: OwnerToken::current().host,
                pid: u32::MAX - 5,
            });
        ghost.claim_ownership(ClaimMode::Override).unwrap();
        ghost.closed = true;
        drop(ghost);

        let mut next = ContainerHandle::open(&path, None).unwrap();
        next.claim_ownership(ClaimMode::Defensive).unwrap();
        assert!(next.is_owner().unwrap());
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let (_dir, path) = scratch();
        ContainerHandle::create(&path, "scan_001", 1).unwrap().close().unwrap();
        let mut reader = ContainerHandle::open_read_only(&path).unwrap();
        assert!(matches!(
            reader.claim_ownership(ClaimMode::Override),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(reader.ensure_owner(), Err(Error::ReadOnly)));
        assert_eq!(reader.last_row().unwrap(), -1);
    }

    #[test]
    fn test_environ_roundtrip() {
        let (_dir, path) = scratch();
        let mut handle = ContainerHandle::create(&path, "scan_001", 2).unwrap();
        let n = handle
            .import_environ("; Ring Current (S:SRcurrentAI.VAL) = 102.3\nI0 gain = 1e8 (13IDE:A1)\n")
            .unwrap();
        assert_eq!(n, 2);
        let env = handle.environ().unwrap();
        assert_eq!(env[0].address, "S:SRcurrentAI.VAL");
        assert_eq!(env[1].value, "1e8");
    }

    #[test]
    fn test_new_container_path() {
        let (dir, path) = scratch();
        std::fs::write(dir.path().join("map_1.h5"), b"").unwrap();
        assert_eq!(new_container_path(&path), dir.path().join("map_2.h5"));
        assert_eq!(folder_identity(Path::new("/data/2024/scan_017")), "scan_017");
    }
}

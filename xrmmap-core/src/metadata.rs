//! Scan-folder metadata: the environment file and diffraction geometry.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// One beamline environment value recorded at scan start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironEntry {
    /// Human description, e.g. `Ring Current`.
    pub name: String,
    /// Process-variable address, empty when the line has none.
    pub address: String,
    pub value: String,
}

/// Parse an environment file.
///
/// Accepts `; Description (ADDR) = value` and `name = value (ADDR)` forms.
/// Blank lines and lines starting with `#` are skipped.
///
/// # Errors
/// Returns `Parse` for a non-blank line without `=`.
pub fn parse_environ(text: &str) -> Result<Vec<EnvironEntry>> {
    let mut entries = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.replace('\t', " ");
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix(';').unwrap_or(line).trim();
        let Some((lhs, rhs)) = line.split_once('=') else {
            return Err(Error::Parse {
                line: idx + 1,
                reason: format!("missing '=' in {line:?}"),
            });
        };
        let (name, lhs_addr) = split_address(lhs.trim());
        let (value, rhs_addr) = split_address(rhs.trim());
        entries.push(EnvironEntry {
            name: name.to_string(),
            address: lhs_addr.or(rhs_addr).unwrap_or_default().to_string(),
            value: value.to_string(),
        });
    }
    Ok(entries)
}

/// Split a trailing `(ADDR)` off `text`.
fn split_address(text: &str) -> (&str, Option<&str>) {
    if let Some(body) = text.strip_suffix(')') {
        if let Some(open) = body.rfind('(') {
            return (body[..open].trim_end(), Some(body[open + 1..].trim()));
        }
    }
    (text, None)
}

/// Detector geometry for 2-D diffraction frames, as written by a PONI file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffractionCalibration {
    pub pixel1: Option<f64>,
    pub pixel2: Option<f64>,
    pub distance: Option<f64>,
    pub poni1: Option<f64>,
    pub poni2: Option<f64>,
    pub rot1: Option<f64>,
    pub rot2: Option<f64>,
    pub rot3: Option<f64>,
    pub wavelength: Option<f64>,
}

impl DiffractionCalibration {
    /// Parse `key: value` lines of a PONI geometry file.
    ///
    /// Unknown keys are ignored.
    ///
    /// # Errors
    /// Returns `Parse` when a known key has a non-numeric value.
    pub fn from_poni_str(text: &str) -> Result<Self> {
        let mut cal = Self::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let slot = match key.trim().to_ascii_lowercase().as_str() {
                "pixelsize1" | "pixel1" => &mut cal.pixel1,
                "pixelsize2" | "pixel2" => &mut cal.pixel2,
                "distance" => &mut cal.distance,
                "poni1" => &mut cal.poni1,
                "poni2" => &mut cal.poni2,
                "rot1" => &mut cal.rot1,
                "rot2" => &mut cal.rot2,
                "rot3" => &mut cal.rot3,
                "wavelength" => &mut cal.wavelength,
                _ => continue,
            };
            let parsed = value.trim().parse::<f64>().map_err(|e| Error::Parse {
                line: idx + 1,
                reason: format!("{}: {e}", key.trim()),
            })?;
            *slot = Some(parsed);
        }
        Ok(cal)
    }

    /// Named values that are set, in attribute order.
    #[must_use]
    pub fn values(&self) -> Vec<(&'static str, f64)> {
        [
            ("pixel1", self.pixel1),
            ("pixel2", self.pixel2),
            ("distance", self.distance),
            ("poni1", self.poni1),
            ("poni2", self.poni2),
            ("rot1", self.rot1),
            ("rot2", self.rot2),
            ("rot3", self.rot3),
            ("wavelength", self.wavelength),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect()
    }
}

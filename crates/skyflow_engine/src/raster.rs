//! Multi-plane raster artifact of a pipeline run.
//!
//! The artifact is a single FITS primary HDU holding a 32-bit float cube,
//! one plane per product. Each plane is named by a `PLANEn` card whose
//! comment describes it, optionally starting with a bracketed unit
//! (`[mag] extinction`). Downloads extract one plane into a standalone
//! 2-D image.

use std::fs;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::{debug, info};

use crate::table::fits::{self, CardValue, FitsHeader};

/// Product planes, in cube order; `PLANEn` names the (n-1)-th entry.
pub const PLANES: [&str; 7] = [
    "ext_map",
    "ext_ivar",
    "weight",
    "density",
    "xext_map",
    "xext_ivar",
    "xweight",
];

/// Cube index of a downloadable artifact name (`ext_map.fits`, ...).
pub fn plane_index(artifact: &str) -> Option<usize> {
    let name = artifact.strip_suffix(".fits")?;
    PLANES.iter().position(|p| *p == name)
}

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("Artifact I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid artifact: {0}")]
    Format(String),

    #[error("Artifact has no plane {0}")]
    MissingPlane(String),

    #[error("Plane {name} has {found} values, expected {expected}")]
    Shape {
        name: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone)]
struct Plane {
    name: String,
    description: String,
    values: Vec<f32>,
}

/// Cube under construction by the pipeline stages.
#[derive(Debug, Clone)]
pub struct RasterCube {
    naxis1: usize,
    naxis2: usize,
    /// Cards written after the structural ones (WCS, provenance)
    extra: FitsHeader,
    planes: Vec<Plane>,
}

impl RasterCube {
    pub fn new(naxis1: usize, naxis2: usize) -> Self {
        Self {
            naxis1,
            naxis2,
            extra: FitsHeader::default(),
            planes: Vec::new(),
        }
    }

    pub fn header_mut(&mut self) -> &mut FitsHeader {
        &mut self.extra
    }

    /// Append a plane; `values` are row-major with `naxis1` values per row.
    pub fn add_plane(
        &mut self,
        name: &str,
        description: &str,
        values: Vec<f32>,
    ) -> Result<(), RasterError> {
        let expected = self.naxis1 * self.naxis2;
        if values.len() != expected {
            return Err(RasterError::Shape {
                name: name.to_string(),
                expected,
                found: values.len(),
            });
        }
        self.planes.push(Plane {
            name: name.to_string(),
            description: description.to_string(),
            values,
        });
        Ok(())
    }

    pub fn plane_names(&self) -> impl Iterator<Item = &str> {
        self.planes.iter().map(|p| p.name.as_str())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(fits::padded(
            self.planes.len() * self.naxis1 * self.naxis2 * 4,
        ));
        for plane in &self.planes {
            for value in &plane.values {
                let mut word = [0u8; 4];
                BigEndian::write_f32(&mut word, *value);
                data.extend_from_slice(&word);
            }
        }
        data.resize(fits::padded(data.len()), 0);

        let mut header = FitsHeader::default();
        header.set("SIMPLE", CardValue::Logical(true), Some("conforms to FITS standard"));
        header.set("BITPIX", CardValue::Int(-32), Some("array data type"));
        header.set("NAXIS", CardValue::Int(3), Some("number of array dimensions"));
        header.set("NAXIS1", CardValue::Int(self.naxis1 as i64), None);
        header.set("NAXIS2", CardValue::Int(self.naxis2 as i64), None);
        header.set("NAXIS3", CardValue::Int(self.planes.len() as i64), None);
        header.cards.extend(self.extra.cards.iter().cloned());
        for (i, plane) in self.planes.iter().enumerate() {
            header.set(
                &format!("PLANE{}", i + 1),
                CardValue::Str(plane.name.clone()),
                Some(&plane.description),
            );
        }
        header.set(
            "DATASUM",
            CardValue::Str(datasum(&data).to_string()),
            Some("data unit checksum"),
        );

        let mut bytes = header.to_bytes();
        bytes.extend_from_slice(&data);
        bytes
    }

    /// Write the cube, replacing any previous artifact atomically.
    pub fn write_to(&self, path: &Path) -> Result<(), RasterError> {
        let io = |source| RasterError::Io {
            path: path.to_path_buf(),
            source,
        };
        let tmp = path.with_extension("fits.tmp");
        fs::write(&tmp, self.to_bytes()).map_err(io)?;
        fs::rename(&tmp, path).map_err(io)?;
        info!(
            "Saved {} planes of {}x{} to {}",
            self.planes.len(),
            self.naxis1,
            self.naxis2,
            path.display()
        );
        Ok(())
    }
}

/// 32-bit ones' complement sum of the data words.
fn datasum(data: &[u8]) -> u32 {
    let mut sum: u64 = data
        .chunks(4)
        .map(|word| {
            let mut buf = [0u8; 4];
            buf[..word.len()].copy_from_slice(word);
            u64::from(BigEndian::read_u32(&buf))
        })
        .sum();
    while sum >> 32 != 0 {
        sum = (sum & 0xffff_ffff) + (sum >> 32);
    }
    sum as u32
}

/// Unit at the start of a plane description: `[mag] extinction` gives `mag`.
fn bracketed_unit(description: &str) -> Option<&str> {
    let rest = description.strip_prefix('[')?;
    let close = rest.rfind(']')?;
    Some(&rest[..close])
}

fn is_plane_card(keyword: &str) -> bool {
    keyword
        .strip_prefix("PLANE")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// Standalone 2-D image of plane `index` of a cube file.
///
/// The header keeps every card of the cube except the `PLANEn` cards,
/// `NAXIS3`, `CHECKSUM` and `DATASUM`; `NAXIS` becomes 2 and `BUNIT` is set
/// from the plane description when it names a unit.
pub fn extract_plane(cube: &[u8], index: usize) -> Result<Vec<u8>, RasterError> {
    let (header, data_start) = fits::parse_header(cube, 0)
        .ok_or_else(|| RasterError::Format("truncated header".to_string()))?;
    if header.int("BITPIX") != Some(-32) || header.int("NAXIS") != Some(3) {
        return Err(RasterError::Format(
            "expected a 3-axis 32-bit float cube".to_string(),
        ));
    }
    let dim = |key: &str| -> Result<usize, RasterError> {
        header
            .int(key)
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| RasterError::Format(format!("missing {}", key)))
    };
    let (naxis1, naxis2, naxis3) = (dim("NAXIS1")?, dim("NAXIS2")?, dim("NAXIS3")?);

    let name = PLANES
        .get(index)
        .map_or_else(|| format!("#{}", index + 1), |p| p.to_string());
    let card = header
        .get(&format!("PLANE{}", index + 1))
        .filter(|_| index < naxis3)
        .ok_or_else(|| RasterError::MissingPlane(name.clone()))?;
    let unit = card
        .comment
        .as_deref()
        .and_then(bracketed_unit)
        .map(str::to_string);

    let plane_len = naxis1 * naxis2 * 4;
    let start = data_start + index * plane_len;
    let values = cube
        .get(start..start + plane_len)
        .ok_or_else(|| RasterError::Format("truncated data".to_string()))?;

    let mut image = header;
    image.retain(|c| {
        !is_plane_card(&c.keyword) && !matches!(c.keyword.as_str(), "NAXIS3" | "CHECKSUM" | "DATASUM")
    });
    image.set("NAXIS", CardValue::Int(2), None);
    if let Some(unit) = unit {
        image.set("BUNIT", CardValue::Str(unit), None);
    }
    debug!("Extracted plane {} ({}x{})", name, naxis1, naxis2);

    let mut bytes = image.to_bytes();
    bytes.extend_from_slice(values);
    bytes.resize(bytes.len() + fits::padded(plane_len) - plane_len, 0);
    Ok(bytes)
}

/// Read and extract in one go.
pub fn extract_plane_from_file(path: &Path, index: usize) -> Result<Vec<u8>, RasterError> {
    let cube = fs::read(path).map_err(|source| RasterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    extract_plane(&cube, index)
}

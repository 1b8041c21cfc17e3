//! Object count estimates from all-sky density maps.
//!
//! A density map holds the expected number of catalog objects per HEALPix
//! pixel. The estimate for an area is the sum over the pixels whose center
//! falls inside it, which lets a client check a region before paying for
//! the query.

use std::f64::consts::{FRAC_PI_2, PI};
use std::fs;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use skyflow_protocol::defaults::{MAX_AREA_OBJECTS, MIN_AREA_OBJECTS};
use skyflow_protocol::{ControlMessage, Frame};
use thiserror::Error;

use crate::catalog::query::SkyRegion;
use crate::table::fits::{self, padded};

#[derive(Debug, Error)]
pub enum DensityError {
    #[error("Density map I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid density map: {0}")]
    Format(String),

    #[error("Density map is in the {map} frame, the area in the {area} frame")]
    FrameMismatch { map: Frame, area: Frame },
}

/// Area to estimate, in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Area {
    Box(SkyRegion),
    Disk {
        frame: Frame,
        lon: f64,
        lat: f64,
        radius: f64,
    },
}

impl Area {
    pub fn frame(&self) -> Frame {
        match self {
            Area::Box(region) => region.frame,
            Area::Disk { frame, .. } => *frame,
        }
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        match self {
            Area::Box(region) => {
                let lon_in = if region.wraps() {
                    lon >= region.lon_min || lon <= region.lon_max
                } else {
                    lon >= region.lon_min && lon <= region.lon_max
                };
                lon_in && lat >= region.lat_min && lat <= region.lat_max
            }
            Area::Disk {
                lon: lon0,
                lat: lat0,
                radius,
                ..
            } => angular_distance(*lon0, *lat0, lon, lat) <= *radius,
        }
    }
}

/// Great-circle distance in degrees (haversine).
fn angular_distance(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (lon2 - lon1).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    (2.0 * h.sqrt().min(1.0).asin()).to_degrees()
}

/// Source of object count estimates.
pub trait DensityMap: Send + Sync {
    /// Expected number of objects inside `area`.
    fn estimate(&self, area: &Area) -> Result<f64, DensityError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelOrdering {
    Ring,
    Nested,
}

/// HEALPix map of objects per pixel.
#[derive(Debug, Clone)]
pub struct HealpixMap {
    nside: u64,
    ordering: PixelOrdering,
    frame: Frame,
    values: Vec<f64>,
}

impl HealpixMap {
    pub fn new(
        nside: u64,
        ordering: PixelOrdering,
        frame: Frame,
        values: Vec<f64>,
    ) -> Result<Self, DensityError> {
        if nside == 0 || (ordering == PixelOrdering::Nested && !nside.is_power_of_two()) {
            return Err(DensityError::Format(format!("invalid NSIDE {}", nside)));
        }
        let npix = 12 * nside * nside;
        if values.len() as u64 != npix {
            return Err(DensityError::Format(format!(
                "{} values for NSIDE {}, expected {}",
                values.len(),
                nside,
                npix
            )));
        }
        Ok(Self {
            nside,
            ordering,
            frame,
            values,
        })
    }

    /// Map `<dir>/<dataset>.hpx`.
    pub fn open_dataset(dir: &Path, dataset: &str) -> Result<Self, DensityError> {
        if dataset.is_empty() || dataset.contains(['/', '\\']) || dataset.starts_with('.') {
            return Err(DensityError::Format(format!("invalid dataset name {:?}", dataset)));
        }
        Self::open(&dir.join(format!("{}.hpx", dataset)))
    }

    pub fn open(path: &Path) -> Result<Self, DensityError> {
        let bytes = fs::read(path).map_err(|source| DensityError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_fits(&bytes)
    }

    /// Decode a HEALPix FITS file: the first column of the first BINTABLE,
    /// `E` or `D` cells of any repeat count, read row by row.
    pub fn from_fits(bytes: &[u8]) -> Result<Self, DensityError> {
        let format = |m: &str| DensityError::Format(m.to_string());
        let (primary, primary_data) =
            fits::parse_header(bytes, 0).ok_or_else(|| format("truncated primary header"))?;
        let mut offset = primary_data + padded(primary.data_len());
        let (header, data_start) = loop {
            let (header, data_start) =
                fits::parse_header(bytes, offset).ok_or_else(|| format("no BINTABLE extension"))?;
            if header.string("XTENSION").map(str::trim) == Some("BINTABLE") {
                break (header, data_start);
            }
            offset = data_start + padded(header.data_len());
        };

        let nside = header
            .int("NSIDE")
            .filter(|n| *n > 0)
            .ok_or_else(|| format("missing NSIDE"))? as u64;
        let ordering = match header.string("ORDERING").map(str::trim) {
            Some("NESTED") => PixelOrdering::Nested,
            Some("RING") | None => PixelOrdering::Ring,
            Some(other) => return Err(format(&format!("unknown ORDERING {}", other))),
        };
        let frame = match header.string("COORDSYS").map(str::trim) {
            Some("C") | Some("E") => Frame::Icrs,
            Some("G") | None => Frame::Galactic,
            Some(other) => return Err(format(&format!("unsupported COORDSYS {}", other))),
        };

        let tform = header
            .string("TFORM1")
            .map(str::trim)
            .ok_or_else(|| format("missing TFORM1"))?;
        let split = tform.find(|c: char| !c.is_ascii_digit()).unwrap_or(tform.len());
        let repeat: usize = match &tform[..split] {
            "" => 1,
            digits => digits.parse().map_err(|_| format("bad TFORM1"))?,
        };
        let width = match &tform[split..] {
            "E" => 4,
            "D" => 8,
            other => return Err(format(&format!("unsupported TFORM1 code {}", other))),
        };
        let row_len = header.int("NAXIS1").unwrap_or(0).max(0) as usize;
        let rows = header.int("NAXIS2").unwrap_or(0).max(0) as usize;
        if row_len < repeat * width {
            return Err(format("row shorter than its first column"));
        }
        if bytes.len() < data_start + row_len * rows {
            return Err(format("truncated table data"));
        }

        let mut values = Vec::with_capacity(rows * repeat);
        for row in 0..rows {
            let start = data_start + row * row_len;
            for cell in bytes[start..start + repeat * width].chunks_exact(width) {
                let value = if width == 4 {
                    f64::from(BigEndian::read_f32(cell))
                } else {
                    BigEndian::read_f64(cell)
                };
                // Unseen pixels are stored as NaN or the HEALPix bad value
                values.push(if value.is_finite() && value > -1.6e30 { value } else { 0.0 });
            }
        }
        Self::new(nside, ordering, frame, values)
    }

    pub fn nside(&self) -> u64 {
        self.nside
    }

    /// Center of pixel `pix` as (lon, lat) in degrees.
    pub fn center(&self, pix: u64) -> (f64, f64) {
        let (z, phi) = match self.ordering {
            PixelOrdering::Ring => ring_center(self.nside, pix),
            PixelOrdering::Nested => nested_center(self.nside, pix),
        };
        let lat = 90.0 - z.clamp(-1.0, 1.0).acos().to_degrees();
        (phi.to_degrees().rem_euclid(360.0), lat)
    }
}

impl DensityMap for HealpixMap {
    fn estimate(&self, area: &Area) -> Result<f64, DensityError> {
        if area.frame() != self.frame {
            return Err(DensityError::FrameMismatch {
                map: self.frame,
                area: area.frame(),
            });
        }
        Ok(self
            .values
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0.0)
            .filter(|(pix, _)| {
                let (lon, lat) = self.center(*pix as u64);
                area.contains(lon, lat)
            })
            .map(|(_, v)| v)
            .sum())
    }
}

/// (cos colatitude, longitude in radians) of a RING pixel center.
fn ring_center(nside: u64, pix: u64) -> (f64, f64) {
    let n = nside as f64;
    let npix = 12 * nside * nside;
    let ncap = 2 * nside * (nside - 1);
    if pix < ncap {
        let iring = (1 + isqrt(1 + 2 * pix)) / 2;
        let iphi = pix + 1 - 2 * iring * (iring - 1);
        let r = iring as f64;
        (1.0 - r * r / (3.0 * n * n), (iphi as f64 - 0.5) * FRAC_PI_2 / r)
    } else if pix < npix - ncap {
        let ip = pix - ncap;
        let iring = ip / (4 * nside) + nside;
        let iphi = ip % (4 * nside) + 1;
        let fodd = if (iring + nside) & 1 == 1 { 1.0 } else { 0.5 };
        (
            (2.0 * n - iring as f64) * 2.0 / (3.0 * n),
            (iphi as f64 - fodd) * PI / (2.0 * n),
        )
    } else {
        let ip = npix - pix;
        let iring = (1 + isqrt(2 * ip - 1)) / 2;
        let iphi = 4 * iring + 1 - (ip - 2 * iring * (iring - 1));
        let r = iring as f64;
        (r * r / (3.0 * n * n) - 1.0, (iphi as f64 - 0.5) * FRAC_PI_2 / r)
    }
}

/// Face row and column offsets of the twelve base pixels
const JRLL: [u64; 12] = [2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4];
const JPLL: [u64; 12] = [1, 3, 5, 7, 0, 2, 4, 6, 1, 3, 5, 7];

/// (cos colatitude, longitude in radians) of a NESTED pixel center.
fn nested_center(nside: u64, pix: u64) -> (f64, f64) {
    let n = nside as f64;
    let npface = nside * nside;
    let face = (pix / npface) as usize;
    let ipf = pix % npface;
    let ix = compact_bits(ipf);
    let iy = compact_bits(ipf >> 1);

    let nl4 = 4 * nside as i64;
    let jr = (JRLL[face] * nside) as i64 - ix as i64 - iy as i64 - 1;
    let (nr, z, kshift) = if jr < nside as i64 {
        let nr = jr as f64;
        (jr, 1.0 - nr * nr / (3.0 * n * n), 0)
    } else if jr > 3 * nside as i64 {
        let nr = nl4 - jr;
        let r = nr as f64;
        (nr, r * r / (3.0 * n * n) - 1.0, 0)
    } else {
        (
            nside as i64,
            (2.0 * n - jr as f64) * 2.0 / (3.0 * n),
            (jr - nside as i64) & 1,
        )
    };
    let mut jp = (JPLL[face] as i64 * nr + ix as i64 - iy as i64 + 1 + kshift) / 2;
    if jp > nl4 {
        jp -= nl4;
    }
    if jp < 1 {
        jp += nl4;
    }
    let phi = (jp as f64 - (kshift + 1) as f64 * 0.5) * (FRAC_PI_2 / nr as f64);
    (z, phi)
}

/// Even bits of `v`, packed.
fn compact_bits(v: u64) -> u64 {
    let mut v = v & 0x5555_5555_5555_5555;
    v = (v | (v >> 1)) & 0x3333_3333_3333_3333;
    v = (v | (v >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    v = (v | (v >> 4)) & 0x00ff_00ff_00ff_00ff;
    v = (v | (v >> 8)) & 0x0000_ffff_0000_ffff;
    (v | (v >> 16)) & 0x0000_0000_ffff_ffff
}

fn isqrt(v: u64) -> u64 {
    let mut r = (v as f64).sqrt() as u64;
    while r * r > v {
        r -= 1;
    }
    while (r + 1) * (r + 1) <= v {
        r += 1;
    }
    r
}

/// Rounded count for humans, e.g. `~45.6 thousands`.
pub fn format_count(count: f64) -> String {
    let count = count.max(0.0);
    if count < 200.0 {
        format!("~{}", count as u64)
    } else if count < 2_000.0 {
        format!("~{:.1} hundreds", (count / 10.0).floor() / 10.0)
    } else if count < 200_000.0 {
        format!("~{:.1} thousands", (count / 100.0).floor() / 10.0)
    } else {
        format!("~{:.1} millions", (count / 100_000.0).floor() / 10.0)
    }
}

/// "Area checked" verdict for an estimated object count.
pub fn area_verdict(count: f64) -> ControlMessage {
    let rounded = format_count(count);
    if count > MAX_AREA_OBJECTS {
        ControlMessage::error(
            "Area checked",
            format!(
                "The area contains too many stars ({}): try reducing the boundaries.",
                rounded
            ),
        )
    } else if count < MIN_AREA_OBJECTS {
        ControlMessage::error(
            "Area checked",
            format!(
                "The area contains too few stars ({}): try enlarging the boundaries.",
                rounded
            ),
        )
    } else {
        ControlMessage::success(
            "Area checked",
            format!("The area contains an appropriate number of stars ({}).", rounded),
        )
    }
}

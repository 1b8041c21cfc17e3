//! Computation stages driven by the supervisor.
//!
//! A pipeline is an ordered list of named stages, each with the coarse
//! progress figure it starts at. Stages pull their inputs through the
//! [`StageContext`] and leave the output cube there; the supervisor saves
//! it once every stage has run.
//!
//! The bundled [`StarCountPipeline`] is a star-count density map: objects
//! of the science field are binned on the map grid and compared with the
//! mean density of the control field.

use std::collections::HashMap;

use anyhow::{bail, Context};
use arrow::array::AsArray;
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type};
use skyflow_protocol::{Checkpoint, CoordColumns, Frame, MapGeometry, PipelineParams, SessionId, Step};
use tracing::debug;

use crate::cancel::{CancellationToken, Cancelled};
use crate::error::RetrieveError;
use crate::raster::RasterCube;
use crate::retriever::{ProgressSink, Retriever};
use crate::table::fits::CardValue;
use crate::table::Table;

/// One named step of a pipeline.
pub trait Stage: Send {
    fn name(&self) -> &str;

    /// Coarse progress (0..=100) reported while the stage runs
    fn progress(&self) -> u8;

    fn run(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<()>;
}

/// Builds the stage list of a run from its parameters.
pub trait PipelineStages: Send + Sync {
    fn stages(&self, params: &PipelineParams) -> Vec<Box<dyn Stage>>;
}

/// What a stage can see and do during a run.
pub struct StageContext<'a> {
    session: &'a SessionId,
    checkpoint: &'a Checkpoint,
    retriever: &'a Retriever,
    sink: &'a dyn ProgressSink,
    cancel: &'a CancellationToken,
    tables: HashMap<Step, Table>,
    artifact: Option<RasterCube>,
}

impl<'a> StageContext<'a> {
    pub fn new(
        session: &'a SessionId,
        checkpoint: &'a Checkpoint,
        retriever: &'a Retriever,
        sink: &'a dyn ProgressSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            session,
            checkpoint,
            retriever,
            sink,
            cancel,
            tables: HashMap::new(),
            artifact: None,
        }
    }

    pub fn params(&self) -> &PipelineParams {
        &self.checkpoint.params
    }

    pub fn report(&self, message: &str) -> Result<(), Cancelled> {
        self.sink.report(message)
    }

    pub fn set_percent(&self, percent: u8) {
        self.sink.set_percent(percent);
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        self.cancel.check()
    }

    /// Retrieve a step's table through the cache and the checkpoint's job
    /// handles. Returns the number of rows.
    pub fn fetch(&mut self, step: Step) -> Result<usize, RetrieveError> {
        let expected = self.checkpoint.params.expected(step);
        match expected {
            Some(n) => self.report(&format!(
                "Retrieving {} data: expecting {} objects",
                step.label(),
                thousands(n)
            ))?,
            None => self.report(&format!("Retrieving {} data", step.label()))?,
        }
        let table = self.retriever.retrieve(
            self.session,
            step,
            self.checkpoint.jobs(step),
            expected,
            self.sink,
            self.cancel,
        )?;
        let rows = table.num_rows();
        self.tables.insert(step, table);
        Ok(rows)
    }

    pub fn table(&self, step: Step) -> Option<&Table> {
        self.tables.get(&step)
    }

    pub fn set_artifact(&mut self, cube: RasterCube) {
        self.artifact = Some(cube);
    }

    pub fn take_artifact(&mut self) -> Option<RasterCube> {
        self.artifact.take()
    }
}

/// `1234567` as `1,234,567`.
pub fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

// ============================================================================
// Star-count density map
// ============================================================================

/// Bundled pipeline: fetch the control field, fetch the science field, bin
/// the science field on the map grid.
#[derive(Debug, Clone, Copy, Default)]
pub struct StarCountPipeline;

impl PipelineStages for StarCountPipeline {
    fn stages(&self, params: &PipelineParams) -> Vec<Box<dyn Stage>> {
        let extended = params
            .products
            .iter()
            .any(|p| p.to_ascii_uppercase().starts_with("XNICEST"));
        vec![
            Box::new(FetchStep {
                step: Step::Reference,
                progress: 2,
                found: 8,
            }),
            Box::new(FetchStep {
                step: Step::Primary,
                progress: 68,
                found: 74,
            }),
            Box::new(MapMaking { extended }),
        ]
    }
}

struct FetchStep {
    step: Step,
    progress: u8,
    /// Progress once the table is in
    found: u8,
}

impl Stage for FetchStep {
    fn name(&self) -> &str {
        match self.step {
            Step::Primary => "science field retrieval",
            Step::Reference => "control field retrieval",
        }
    }

    fn progress(&self) -> u8 {
        self.progress
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<()> {
        let rows = ctx.fetch(self.step)?;
        ctx.set_percent(self.found);
        ctx.report(&format!("{} objects found", thousands(rows as u64)))?;
        Ok(())
    }
}

struct MapMaking {
    extended: bool,
}

/// Magnitudes per dex of star-count ratio
const COUNT_SLOPE: f64 = 2.5;

impl Stage for MapMaking {
    fn name(&self) -> &str {
        "map making"
    }

    fn progress(&self) -> u8 {
        85
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<()> {
        let params = ctx.params().clone();
        let (frame, columns) = params
            .coords_for_map()
            .context("no coordinate columns were given")?;
        if frame != params.map.frame {
            bail!("the catalog has no {} coordinates for the map", params.map.frame);
        }
        ctx.report(&format!("Using coordinates in the {} frame", frame))?;

        let reference = ctx
            .table(Step::Reference)
            .context("control field table is missing")?;
        let (ref_lon, ref_lat) = coordinates(reference, columns)?;
        let reference_density = mean_density(&ref_lon, &ref_lat)
            .context("the control field covers no area")?;
        ctx.report(&format!(
            "Control field density = {:.3} objects per square degree",
            reference_density
        ))?;
        ctx.check()?;

        ctx.report("Map making")?;
        let science = ctx
            .table(Step::Primary)
            .context("science field table is missing")?;
        let (lon, lat) = coordinates(science, columns)?;
        let grid = Grid::new(&params.map);
        let counts = grid.bin(&lon, &lat);
        let binned: f64 = counts.iter().sum();
        debug!("Binned {} of {} objects", binned, lon.len());

        let cube = build_cube(&params.map, &grid, &counts, reference_density, self.extended)?;
        ctx.set_artifact(cube);
        Ok(())
    }
}

/// Non-null coordinate pairs of a table, in degrees.
fn coordinates(table: &Table, columns: &CoordColumns) -> anyhow::Result<(Vec<f64>, Vec<f64>)> {
    let lon = float_column(table, &columns.lon)?;
    let lat = float_column(table, &columns.lat)?;
    let (lon, lat) = lon
        .into_iter()
        .zip(lat)
        .filter_map(|pair| match pair {
            (Some(l), Some(b)) if l.is_finite() && b.is_finite() => Some((l, b)),
            _ => None,
        })
        .unzip();
    Ok((lon, lat))
}

fn float_column(table: &Table, name: &str) -> anyhow::Result<Vec<Option<f64>>> {
    let column = table
        .column_by_name(name)
        .with_context(|| format!("column {} not found", name))?;
    let values = cast(column, &DataType::Float64)
        .with_context(|| format!("column {} is not numeric", name))?;
    Ok(values.as_primitive::<Float64Type>().iter().collect())
}

/// Longitude difference folded into [-180, 180).
fn wrap_degrees(delta: f64) -> f64 {
    (delta + 180.0).rem_euclid(360.0) - 180.0
}

/// Objects per square degree over the bounding box of the positions.
fn mean_density(lon: &[f64], lat: &[f64]) -> Option<f64> {
    let center = *lon.first()?;
    let (mut lo, mut hi) = (0.0f64, 0.0f64);
    for l in lon {
        let d = wrap_degrees(l - center);
        lo = lo.min(d);
        hi = hi.max(d);
    }
    let (b_lo, b_hi) = lat
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(a, b), v| (a.min(*v), b.max(*v)));
    let mid = ((b_lo + b_hi) / 2.0).to_radians().cos();
    let area = (hi - lo) * mid * (b_hi - b_lo);
    (area > 0.0).then(|| lon.len() as f64 / area)
}

/// Linear pixel grid of the map: longitude grows to the left.
struct Grid {
    naxis1: usize,
    naxis2: usize,
    crpix1: f64,
    crpix2: f64,
    crval1: f64,
    crval2: f64,
    /// Degrees per pixel
    cdelt: f64,
}

impl Grid {
    fn new(map: &MapGeometry) -> Self {
        Self {
            naxis1: map.naxis1 as usize,
            naxis2: map.naxis2 as usize,
            crpix1: map.crpix1,
            crpix2: map.crpix2,
            crval1: map.crval1,
            crval2: map.crval2,
            cdelt: map.scale / 3600.0,
        }
    }

    fn len(&self) -> usize {
        self.naxis1 * self.naxis2
    }

    /// Zero-based pixel index of a position, if it falls on the map.
    fn pixel(&self, lon: f64, lat: f64) -> Option<usize> {
        let x = self.crpix1 - 1.0 - wrap_degrees(lon - self.crval1) / self.cdelt;
        let y = self.crpix2 - 1.0 + (lat - self.crval2) / self.cdelt;
        let (x, y) = (x.round(), y.round());
        if x < 0.0 || y < 0.0 || x >= self.naxis1 as f64 || y >= self.naxis2 as f64 {
            return None;
        }
        Some(y as usize * self.naxis1 + x as usize)
    }

    fn bin(&self, lon: &[f64], lat: &[f64]) -> Vec<f64> {
        let mut counts = vec![0.0; self.len()];
        for (l, b) in lon.iter().zip(lat) {
            if let Some(i) = self.pixel(*l, *b) {
                counts[i] += 1.0;
            }
        }
        counts
    }

    fn pixel_area(&self) -> f64 {
        self.cdelt * self.cdelt
    }
}

fn build_cube(
    map: &MapGeometry,
    grid: &Grid,
    counts: &[f64],
    reference_density: f64,
    extended: bool,
) -> anyhow::Result<RasterCube> {
    // Variance of 2.5 log10(N) for Poisson N is (2.5 / ln 10)^2 / N
    let slope = COUNT_SLOPE / std::f64::consts::LN_10;
    let mut ext = Vec::with_capacity(counts.len());
    let mut ivar = Vec::with_capacity(counts.len());
    let mut density = Vec::with_capacity(counts.len());
    for n in counts {
        let d = n / grid.pixel_area();
        density.push(d as f32);
        if *n > 0.0 {
            ext.push((COUNT_SLOPE * (reference_density / d).log10()) as f32);
            ivar.push((n / (slope * slope)) as f32);
        } else {
            ext.push(f32::NAN);
            ivar.push(0.0);
        }
    }
    let weight: Vec<f32> = counts.iter().map(|n| *n as f32).collect();

    let mut cube = RasterCube::new(grid.naxis1, grid.naxis2);
    write_wcs(&mut cube, map);
    cube.add_plane("ext_map", "[mag] extinction map", ext.clone())?;
    cube.add_plane("ext_ivar", "[mag^-2] inverse variance", ivar.clone())?;
    cube.add_plane("weight", "number of objects per pixel", weight.clone())?;
    cube.add_plane("density", "[deg^-2] object density", density)?;
    if extended {
        cube.add_plane("xext_map", "[mag] extinction map, extended", ext)?;
        cube.add_plane("xext_ivar", "[mag^-2] inverse variance, extended", ivar)?;
        cube.add_plane("xweight", "number of objects per pixel, extended", weight)?;
    }
    Ok(cube)
}

fn write_wcs(cube: &mut RasterCube, map: &MapGeometry) {
    let (lon, lat) = match map.frame {
        Frame::Galactic => ("GLON", "GLAT"),
        Frame::Icrs => ("RA--", "DEC-"),
    };
    let header = cube.header_mut();
    header.set(
        "CTYPE1",
        CardValue::Str(format!("{}-{}", lon, map.projection)),
        None,
    );
    header.set(
        "CTYPE2",
        CardValue::Str(format!("{}-{}", lat, map.projection)),
        None,
    );
    header.set("CRPIX1", CardValue::Float(map.crpix1), None);
    header.set("CRPIX2", CardValue::Float(map.crpix2), None);
    header.set("CRVAL1", CardValue::Float(map.crval1), None);
    header.set("CRVAL2", CardValue::Float(map.crval2), None);
    header.set("CDELT1", CardValue::Float(-map.scale / 3600.0), None);
    header.set("CDELT2", CardValue::Float(map.scale / 3600.0), None);
}

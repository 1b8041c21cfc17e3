//! Query text for the catalog backends.
//!
//! A sky region plus column conditions becomes either an ADQL/SQL boolean
//! expression (remote-async and local backends) or a column → condition map
//! (remote-sync backend, VizieR constraint syntax).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use skyflow_protocol::{BackendKind, Constraints, CoordColumns, Frame};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("The catalog has no coordinate columns in the {0} frame")]
    MissingColumns(Frame),

    #[error("The catalog has no coordinate columns")]
    NoCoordinates,

    #[error("{0} backends cannot select a region in a frame the catalog does not provide")]
    BoxUnsupported(&'static str),

    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("Expression constraints cannot be sent to a {0} backend")]
    ExpressionUnsupported(&'static str),
}

/// One column condition, e.g. `phot_g_mean_mag < 19`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub operator: String,
    pub value: String,
}

impl Condition {
    pub fn new(column: &str, operator: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            operator: operator.to_string(),
            value: value.to_string(),
        }
    }
}

/// Longitude/latitude bounds in degrees. `lon_min > lon_max` wraps through 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkyRegion {
    pub frame: Frame,
    pub lon_min: f64,
    pub lon_max: f64,
    pub lat_min: f64,
    pub lat_max: f64,
}

impl SkyRegion {
    pub fn wraps(&self) -> bool {
        self.lon_min > self.lon_max
    }

    pub fn lon_width(&self) -> f64 {
        if self.wraps() {
            self.lon_max + 360.0 - self.lon_min
        } else {
            self.lon_max - self.lon_min
        }
    }

    pub fn lat_width(&self) -> f64 {
        self.lat_max - self.lat_min
    }

    /// Box center, longitude normalized to `[0, 360)`.
    pub fn center(&self) -> (f64, f64) {
        let lon = (self.lon_min + self.lon_width() / 2.0).rem_euclid(360.0);
        (lon, (self.lat_min + self.lat_max) / 2.0)
    }
}

/// `col op value` terms joined with AND, as ADQL/SQL.
pub fn condition_expression(conditions: &[Condition]) -> String {
    conditions
        .iter()
        .map(|c| format!("{}{}{}", c.column, c.operator, c.value))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Conditions merged per column with ` & `.
pub fn condition_map(conditions: &[Condition]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    add_conditions(&mut map, conditions);
    map
}

fn add_conditions(map: &mut BTreeMap<String, String>, conditions: &[Condition]) {
    for c in conditions {
        let term = format!("{}{}", c.operator, c.value);
        map.entry(c.column.clone())
            .and_modify(|existing: &mut String| {
                existing.push_str(" & ");
                existing.push_str(&term);
            })
            .or_insert(term);
    }
}

fn range_expression(columns: &CoordColumns, region: &SkyRegion) -> String {
    let lon = &columns.lon;
    let lat = &columns.lat;
    let lon_part = if region.wraps() {
        format!(
            "({lon}>={} OR {lon}<={})",
            region.lon_min, region.lon_max
        )
    } else {
        format!("{lon}>={} AND {lon}<={}", region.lon_min, region.lon_max)
    };
    format!(
        "{} AND {lat}>={} AND {lat}<={}",
        lon_part, region.lat_min, region.lat_max
    )
}

fn box_expression(
    coords: &BTreeMap<Frame, CoordColumns>,
    region: &SkyRegion,
) -> Result<String, QueryError> {
    let (frame, columns) = coords
        .get_key_value(&Frame::Icrs)
        .or_else(|| coords.iter().next())
        .ok_or(QueryError::NoCoordinates)?;
    let (lon_ctr, lat_ctr) = region.center();
    Ok(format!(
        "1=CONTAINS(POINT('{}', {}, {}), BOX('{}', {}, {}, {}, {}))",
        frame.as_str(),
        columns.lon,
        columns.lat,
        region.frame.as_str(),
        lon_ctr,
        lat_ctr,
        region.lon_width(),
        region.lat_width()
    ))
}

/// Build backend constraints selecting `region` plus `conditions`.
pub fn region_constraints(
    backend: BackendKind,
    region: &SkyRegion,
    coords: &BTreeMap<Frame, CoordColumns>,
    conditions: &[Condition],
) -> Result<Constraints, QueryError> {
    let native = coords.get(&region.frame);
    match backend {
        BackendKind::RemoteSync => {
            let columns = native.ok_or(QueryError::MissingColumns(region.frame))?;
            let mut map = BTreeMap::new();
            let lon = if region.wraps() {
                format!(">={} | <={}", region.lon_min, region.lon_max)
            } else {
                format!(">={} & <={}", region.lon_min, region.lon_max)
            };
            map.insert(columns.lon.clone(), lon);
            map.insert(
                columns.lat.clone(),
                format!(">={} & <={}", region.lat_min, region.lat_max),
            );
            add_conditions(&mut map, conditions);
            Ok(Constraints::Columns(map))
        }
        BackendKind::RemoteAsync | BackendKind::Local => {
            let mut expression = match native {
                Some(columns) => range_expression(columns, region),
                None if backend == BackendKind::Local => {
                    return Err(QueryError::BoxUnsupported(backend.as_str()))
                }
                None => box_expression(coords, region)?,
            };
            if !conditions.is_empty() {
                expression.push_str(" AND ");
                expression.push_str(&condition_expression(conditions));
            }
            Ok(Constraints::Expression(expression))
        }
    }
}

/// ADQL query of a remote-async job.
pub fn adql_select(catalog: &str, fields: &[String], filter: Option<&str>, top: Option<u64>) -> String {
    let columns = if fields.is_empty() {
        "*".to_string()
    } else {
        fields.join(", ")
    };
    let mut query = match top {
        Some(n) => format!("SELECT TOP {} {}\nFROM {}", n, columns, catalog),
        None => format!("SELECT {}\nFROM {}", columns, catalog),
    };
    if let Some(filter) = filter.filter(|f| !f.trim().is_empty()) {
        query.push_str("\nWHERE ");
        query.push_str(filter);
    }
    query
}

fn check_identifier(name: &str) -> Result<&str, QueryError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(name)
    } else {
        Err(QueryError::InvalidIdentifier(name.to_string()))
    }
}

const OPERATORS: [&str; 6] = [">=", "<=", "!=", "=", "<", ">"];

fn column_term(column: &str, term: &str) -> String {
    let term = term.trim();
    if OPERATORS.iter().any(|op| term.starts_with(op)) {
        format!("{} {}", column, term)
    } else {
        format!("{} = {}", column, term)
    }
}

/// Translate a column → condition map (`>=a & <=b`, `>=a | <=b`) into SQL.
pub fn columns_to_sql(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(column, condition)| {
            let alternatives: Vec<String> = condition
                .split('|')
                .map(|alt| {
                    let terms: Vec<String> =
                        alt.split('&').map(|t| column_term(column, t)).collect();
                    if terms.len() > 1 {
                        format!("({})", terms.join(" AND "))
                    } else {
                        terms.join("")
                    }
                })
                .collect();
            if alternatives.len() > 1 {
                format!("({})", alternatives.join(" OR "))
            } else {
                alternatives.join("")
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// SQL statement for the local engine; the table name is the catalog name.
pub fn sql_select(
    catalog: &str,
    fields: &[String],
    constraints: &Constraints,
    limit: Option<u64>,
) -> Result<String, QueryError> {
    let table = check_identifier(catalog)?;
    let columns = if fields.is_empty() {
        "*".to_string()
    } else {
        fields.join(", ")
    };
    let mut sql = format!("SELECT {} FROM {}", columns, table);
    let filter = match constraints {
        Constraints::Expression(expression) => expression.trim().to_string(),
        Constraints::Columns(map) => columns_to_sql(map),
    };
    if !filter.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&filter);
    }
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }
    Ok(sql)
}

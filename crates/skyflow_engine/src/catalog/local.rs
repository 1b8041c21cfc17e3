//! Local query engine over a SQLite database.
//!
//! Each catalog is a table of the same name. Column types are inferred from
//! the values returned: any text makes a text column, otherwise any real
//! makes a float column, otherwise integer.

use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use super::LocalQueryEngine;
use crate::error::CatalogError;
use crate::table::{ColumnKind, Table, TableBuilder};

pub struct SqliteEngine {
    path: PathBuf,
}

#[derive(Debug, Clone)]
enum Cell {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl SqliteEngine {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(CatalogError::Local(format!(
                "database {} does not exist",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    fn connect(&self) -> Result<Connection, CatalogError> {
        Ok(Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?)
    }
}

impl LocalQueryEngine for SqliteEngine {
    fn execute(&self, sql: &str) -> Result<Table, CatalogError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = names.len();

        let mut columns: Vec<Vec<Cell>> = vec![Vec::new(); width];
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for (i, column) in columns.iter_mut().enumerate() {
                let cell = match row.get_ref(i)? {
                    ValueRef::Null | ValueRef::Blob(_) => Cell::Null,
                    ValueRef::Integer(v) => Cell::Int(v),
                    ValueRef::Real(v) => Cell::Real(v),
                    ValueRef::Text(bytes) => Cell::Text(String::from_utf8_lossy(bytes).into_owned()),
                };
                column.push(cell);
            }
        }

        let kinds: Vec<ColumnKind> = columns.iter().map(|c| infer_kind(c)).collect();
        let row_count = columns.first().map_or(0, Vec::len);
        let mut builder = TableBuilder::new(names.into_iter().zip(kinds).collect());
        for r in 0..row_count {
            for (i, column) in columns.iter().enumerate() {
                match &column[r] {
                    Cell::Null => builder.push_text(i, None),
                    Cell::Int(v) => builder.push_int(i, Some(*v)),
                    Cell::Real(v) => builder.push_float(i, Some(*v)),
                    Cell::Text(v) => builder.push_text(i, Some(v.clone())),
                }
            }
            builder.end_row();
        }
        debug!("Local query returned {} rows", row_count);
        Ok(builder.finish()?)
    }
}

fn infer_kind(cells: &[Cell]) -> ColumnKind {
    if cells.iter().any(|c| matches!(c, Cell::Text(_))) {
        ColumnKind::Text
    } else if cells.iter().any(|c| matches!(c, Cell::Real(_))) {
        ColumnKind::Float
    } else if cells.iter().any(|c| matches!(c, Cell::Int(_))) {
        ColumnKind::Int
    } else {
        ColumnKind::Float
    }
}

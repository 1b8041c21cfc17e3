//! VOTable TABLEDATA decoding.
//!
//! Only the serialization catalog services use for query results is read:
//! `FIELD` declarations, an optional `QUERY_STATUS` info, and `TR`/`TD` rows.

use regex::Regex;

use super::{ColumnKind, Table, TableBuilder, TableError};

/// Element patterns of the TABLEDATA serialization.
struct Patterns {
    field: Regex,
    attr: Regex,
    info: Regex,
    row: Regex,
    cell: Regex,
    description: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            field: Regex::new(r"(?s)<FIELD\b([^>]*)>")?,
            attr: Regex::new(r#"([A-Za-z_:][\w:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)?,
            info: Regex::new(r"(?s)<INFO\b([^>]*?)(?:/>|>(.*?)</INFO>)")?,
            row: Regex::new(r"(?s)<TR\b[^>]*>(.*?)</TR>")?,
            cell: Regex::new(r"(?s)<TD\b[^>]*/>|<TD\b[^>]*>(.*?)</TD>")?,
            description: Regex::new(r"(?s)<DESCRIPTION>(.*?)</DESCRIPTION>")?,
        })
    }

    fn attribute<'a>(&self, attrs: &'a str, name: &str) -> Option<&'a str> {
        self.attr.captures_iter(attrs).find_map(|c| {
            if c.get(1)?.as_str() == name {
                c.get(2).or_else(|| c.get(3)).map(|m| m.as_str())
            } else {
                None
            }
        })
    }
}

/// Replace the predefined XML entities and numeric character references.
pub fn unescape(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        match tail.find(';') {
            Some(end) => {
                let entity = &tail[1..end];
                let decoded = match entity {
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "amp" => Some('&'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    _ if entity.starts_with("#x") => u32::from_str_radix(&entity[2..], 16)
                        .ok()
                        .and_then(char::from_u32),
                    _ if entity.starts_with('#') => {
                        entity[1..].parse().ok().and_then(char::from_u32)
                    }
                    _ => None,
                };
                match decoded {
                    Some(c) => out.push(c),
                    None => out.push_str(&tail[..=end]),
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn column_kind(datatype: Option<&str>, arraysize: Option<&str>) -> ColumnKind {
    match (datatype.unwrap_or("char"), arraysize) {
        ("double" | "float", None) => ColumnKind::Float,
        ("long" | "int" | "short" | "unsignedByte", None) => ColumnKind::Int,
        _ => ColumnKind::Text,
    }
}

/// Decode a complete VOTable document into a table.
pub fn decode(bytes: &[u8]) -> Result<Table, TableError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| TableError::votable(format!("invalid UTF-8: {}", e)))?;
    let re = Patterns::compile().map_err(|e| TableError::votable(e.to_string()))?;

    for info in re.info.captures_iter(text) {
        let attrs = info.get(1).map_or("", |m| m.as_str());
        if re.attribute(attrs, "name") == Some("QUERY_STATUS")
            && re.attribute(attrs, "value") == Some("ERROR")
        {
            let message = info.get(2).map_or("", |m| m.as_str()).trim();
            return Err(TableError::Service(unescape(message)));
        }
    }

    let mut fields = Vec::new();
    for field in re.field.captures_iter(text) {
        let attrs = field.get(1).map_or("", |m| m.as_str());
        let name = re
            .attribute(attrs, "name")
            .or_else(|| re.attribute(attrs, "ID"))
            .ok_or_else(|| TableError::votable("FIELD without a name"))?;
        let kind = column_kind(
            re.attribute(attrs, "datatype"),
            re.attribute(attrs, "arraysize"),
        );
        fields.push((unescape(name), kind));
    }
    if fields.is_empty() {
        return Err(TableError::votable("no FIELD declarations"));
    }

    let data = match (text.find("<TABLEDATA"), text.rfind("</TABLEDATA>")) {
        (Some(start), Some(end)) if start < end => &text[start..end],
        (Some(_), _) => return Err(TableError::votable("truncated TABLEDATA")),
        (None, _) if text.contains("<BINARY") || text.contains("<FITS") => {
            return Err(TableError::Unsupported(
                "only TABLEDATA serialization is supported".to_string(),
            ))
        }
        (None, _) => "",
    };

    let mut builder = TableBuilder::new(fields);
    if let Some(description) = re.description.captures(text).and_then(|c| c.get(1)) {
        builder.set_metadata("description", unescape(description.as_str().trim()));
    }

    let width = builder.width();
    for row in re.row.captures_iter(data) {
        let body = row.get(1).map_or("", |m| m.as_str());
        let mut column = 0;
        for cell in re.cell.captures_iter(body) {
            if column >= width {
                return Err(TableError::votable(format!(
                    "row has more than {} cells",
                    width
                )));
            }
            let value = cell.get(1).map(|m| unescape(m.as_str()));
            builder.push_cell(column, value.as_deref())?;
            column += 1;
        }
        while column < width {
            builder.push_cell(column, None)?;
            column += 1;
        }
        builder.end_row();
    }
    builder.finish()
}

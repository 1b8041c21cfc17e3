//! FITS headers and BINTABLE decoding.
//!
//! A FITS file is a sequence of HDUs, each an ASCII header of 80-byte cards
//! padded to 2880-byte blocks followed by big-endian data padded the same way.

use byteorder::{BigEndian, ByteOrder};

use super::{ColumnKind, Table, TableBuilder, TableError};

/// FITS block size in bytes
pub const BLOCK: usize = 2880;

/// Header card size in bytes
pub const CARD: usize = 80;

/// Round `len` up to a whole number of blocks.
pub fn padded(len: usize) -> usize {
    len.div_ceil(BLOCK) * BLOCK
}

/// Value of a header card.
#[derive(Debug, Clone, PartialEq)]
pub enum CardValue {
    Str(String),
    Logical(bool),
    Int(i64),
    Float(f64),
}

impl CardValue {
    fn parse(text: &str) -> Option<CardValue> {
        let text = text.trim();
        match text {
            "" => None,
            "T" => Some(CardValue::Logical(true)),
            "F" => Some(CardValue::Logical(false)),
            _ => {
                if let Ok(v) = text.parse::<i64>() {
                    Some(CardValue::Int(v))
                } else if let Ok(v) = text.replace(['D', 'd'], "E").parse::<f64>() {
                    Some(CardValue::Float(v))
                } else {
                    Some(CardValue::Str(text.to_string()))
                }
            }
        }
    }

    fn render(&self) -> String {
        match self {
            CardValue::Str(s) => {
                let quoted = format!("'{:<8}'", s.replace('\'', "''"));
                format!("{:<20}", quoted)
            }
            CardValue::Logical(b) => format!("{:>20}", if *b { "T" } else { "F" }),
            CardValue::Int(v) => format!("{:>20}", v),
            CardValue::Float(v) => format!("{:>20}", render_float(*v)),
        }
    }
}

fn render_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        format!("{:?}", v).replace('e', "E")
    }
}

/// One 80-byte header card.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub keyword: String,
    pub value: Option<CardValue>,
    pub comment: Option<String>,
}

impl Card {
    pub fn new(keyword: &str, value: CardValue, comment: Option<&str>) -> Self {
        Self {
            keyword: keyword.to_ascii_uppercase(),
            value: Some(value),
            comment: comment.map(str::to_string),
        }
    }

    pub fn parse(raw: &[u8]) -> Card {
        let text: String = raw
            .iter()
            .map(|b| if b.is_ascii() { *b as char } else { '?' })
            .collect();
        let keyword = text.get(..8).unwrap_or(text.as_str()).trim().to_string();
        let body = text.get(8..).unwrap_or("");

        if !body.starts_with("= ") {
            let comment = body.trim();
            return Card {
                keyword,
                value: None,
                comment: (!comment.is_empty()).then(|| comment.to_string()),
            };
        }

        let field = &body[2..];
        let trimmed = field.trim_start();
        let (value, rest) = if let Some(quoted) = trimmed.strip_prefix('\'') {
            let mut value = String::new();
            let mut chars = quoted.char_indices().peekable();
            let mut end = quoted.len();
            while let Some((i, c)) = chars.next() {
                if c == '\'' {
                    if matches!(chars.peek(), Some((_, '\''))) {
                        value.push('\'');
                        chars.next();
                    } else {
                        end = i + 1;
                        break;
                    }
                } else {
                    value.push(c);
                }
            }
            (
                Some(CardValue::Str(value.trim_end().to_string())),
                &quoted[end.min(quoted.len())..],
            )
        } else {
            match trimmed.find('/') {
                Some(slash) => (CardValue::parse(&trimmed[..slash]), &trimmed[slash..]),
                None => (CardValue::parse(trimmed), ""),
            }
        };
        let comment = rest
            .trim()
            .strip_prefix('/')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        Card {
            keyword,
            value,
            comment,
        }
    }

    /// Fixed-format 80-byte rendering.
    pub fn render(&self) -> Vec<u8> {
        let mut line = format!("{:<8}", self.keyword);
        match &self.value {
            Some(value) => {
                line.push_str("= ");
                line.push_str(&value.render());
                if let Some(comment) = &self.comment {
                    line.push_str(" / ");
                    line.push_str(comment);
                }
            }
            None => {
                if let Some(comment) = &self.comment {
                    line.push_str(comment);
                }
            }
        }
        let mut bytes: Vec<u8> = line
            .chars()
            .map(|c| if c.is_ascii() && !c.is_ascii_control() { c as u8 } else { b'?' })
            .take(CARD)
            .collect();
        bytes.resize(CARD, b' ');
        bytes
    }
}

/// Ordered header cards of one HDU, without the END card.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitsHeader {
    pub cards: Vec<Card>,
}

impl FitsHeader {
    pub fn get(&self, keyword: &str) -> Option<&Card> {
        self.cards.iter().find(|c| c.keyword == keyword)
    }

    pub fn int(&self, keyword: &str) -> Option<i64> {
        match self.get(keyword)?.value.as_ref()? {
            CardValue::Int(v) => Some(*v),
            CardValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn float(&self, keyword: &str) -> Option<f64> {
        match self.get(keyword)?.value.as_ref()? {
            CardValue::Int(v) => Some(*v as f64),
            CardValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn string(&self, keyword: &str) -> Option<&str> {
        match self.get(keyword)?.value.as_ref()? {
            CardValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Replace the value of `keyword`, or append a new card.
    pub fn set(&mut self, keyword: &str, value: CardValue, comment: Option<&str>) {
        let card = Card::new(keyword, value, comment);
        match self.cards.iter_mut().find(|c| c.keyword == card.keyword) {
            Some(existing) => {
                existing.value = card.value;
                if card.comment.is_some() {
                    existing.comment = card.comment;
                }
            }
            None => self.cards.push(card),
        }
    }

    pub fn retain(&mut self, keep: impl FnMut(&Card) -> bool) {
        self.cards.retain(keep);
    }

    /// Header bytes including END, padded with blanks to whole blocks.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(padded((self.cards.len() + 1) * CARD));
        for card in &self.cards {
            bytes.extend_from_slice(&card.render());
        }
        bytes.extend_from_slice(&Card {
            keyword: "END".to_string(),
            value: None,
            comment: None,
        }
        .render());
        bytes.resize(padded(bytes.len()), b' ');
        bytes
    }

    /// Data bytes declared by the header, before padding.
    pub fn data_len(&self) -> usize {
        let naxis = self.int("NAXIS").unwrap_or(0);
        if naxis <= 0 {
            return 0;
        }
        let bytes_per_value = (self.int("BITPIX").unwrap_or(8).unsigned_abs() / 8) as usize;
        let elements: usize = (1..=naxis)
            .map(|i| self.int(&format!("NAXIS{}", i)).unwrap_or(0).max(0) as usize)
            .product();
        let pcount = self.int("PCOUNT").unwrap_or(0).max(0) as usize;
        let gcount = self.int("GCOUNT").unwrap_or(1).max(1) as usize;
        bytes_per_value * (pcount + elements) * gcount
    }
}

/// Parse the header starting at `offset`.
///
/// Returns the header and the offset of its data, or `None` when `bytes`
/// ends before the END card.
pub fn parse_header(bytes: &[u8], offset: usize) -> Option<(FitsHeader, usize)> {
    let mut cards = Vec::new();
    let mut pos = offset;
    while pos + CARD <= bytes.len() {
        let card = Card::parse(&bytes[pos..pos + CARD]);
        pos += CARD;
        if card.keyword == "END" {
            let data_start = offset + padded(pos - offset);
            return Some((FitsHeader { cards }, data_start));
        }
        if card.keyword.is_empty() && card.value.is_none() && card.comment.is_none() {
            continue;
        }
        cards.push(card);
    }
    None
}

/// Total file size once the first extension header is readable.
pub fn bintable_extent(prefix: &[u8]) -> Option<u64> {
    let (primary, primary_data) = parse_header(prefix, 0)?;
    let ext_offset = primary_data + padded(primary.data_len());
    let (extension, ext_data) = parse_header(prefix, ext_offset)?;
    Some((ext_data + padded(extension.data_len())) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Code {
    Logical,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Chars,
}

impl Code {
    fn width(self) -> usize {
        match self {
            Code::Logical | Code::Byte | Code::Chars => 1,
            Code::Short => 2,
            Code::Int | Code::Float => 4,
            Code::Long | Code::Double => 8,
        }
    }
}

#[derive(Debug)]
struct BinColumn {
    code: Code,
    repeat: usize,
    offset: usize,
    null: Option<i64>,
    scale: Option<(f64, f64)>,
}

fn parse_tform(tform: &str) -> Result<(usize, Code), TableError> {
    let tform = tform.trim();
    let digits = tform.chars().take_while(char::is_ascii_digit).count();
    let repeat = if digits == 0 {
        1
    } else {
        tform[..digits]
            .parse()
            .map_err(|_| TableError::fits(format!("bad TFORM {}", tform)))?
    };
    let code = match tform[digits..].chars().next() {
        Some('L') => Code::Logical,
        Some('B') => Code::Byte,
        Some('I') => Code::Short,
        Some('J') => Code::Int,
        Some('K') => Code::Long,
        Some('E') => Code::Float,
        Some('D') => Code::Double,
        Some('A') => Code::Chars,
        _ => {
            return Err(TableError::Unsupported(format!(
                "BINTABLE column format {}",
                tform
            )))
        }
    };
    if repeat != 1 && code != Code::Chars {
        return Err(TableError::Unsupported(format!(
            "vector BINTABLE column {}",
            tform
        )));
    }
    Ok((repeat, code))
}

/// Decode the first BINTABLE extension of a FITS document.
pub fn decode_bintable(bytes: &[u8]) -> Result<Table, TableError> {
    let (primary, primary_data) =
        parse_header(bytes, 0).ok_or_else(|| TableError::fits("truncated primary header"))?;
    let mut offset = primary_data + padded(primary.data_len());

    let (header, data_start) = loop {
        let (header, data_start) = parse_header(bytes, offset)
            .ok_or_else(|| TableError::fits("no BINTABLE extension"))?;
        if header.string("XTENSION").map(str::trim) == Some("BINTABLE") {
            break (header, data_start);
        }
        offset = data_start + padded(header.data_len());
    };

    let row_len = header.int("NAXIS1").unwrap_or(0).max(0) as usize;
    let rows = header.int("NAXIS2").unwrap_or(0).max(0) as usize;
    let tfields = header.int("TFIELDS").unwrap_or(0).max(0) as usize;

    let mut fields = Vec::with_capacity(tfields);
    let mut columns = Vec::with_capacity(tfields);
    let mut cursor = 0;
    for i in 1..=tfields {
        let tform = header
            .string(&format!("TFORM{}", i))
            .ok_or_else(|| TableError::fits(format!("missing TFORM{}", i)))?;
        let (repeat, code) = parse_tform(tform)?;
        let name = header
            .string(&format!("TTYPE{}", i))
            .map(str::to_string)
            .unwrap_or_else(|| format!("col{}", i));
        let scale = match (
            header.float(&format!("TSCAL{}", i)),
            header.float(&format!("TZERO{}", i)),
        ) {
            (None, None) => None,
            (s, z) => Some((s.unwrap_or(1.0), z.unwrap_or(0.0))),
        };
        let kind = match code {
            Code::Float | Code::Double => ColumnKind::Float,
            Code::Chars => ColumnKind::Text,
            _ if scale.is_some() => ColumnKind::Float,
            _ => ColumnKind::Int,
        };
        fields.push((name, kind));
        columns.push(BinColumn {
            code,
            repeat,
            offset: cursor,
            null: header.int(&format!("TNULL{}", i)),
            scale,
        });
        cursor += repeat * code.width();
    }
    if cursor != row_len {
        return Err(TableError::fits(format!(
            "columns span {} bytes but NAXIS1 is {}",
            cursor, row_len
        )));
    }
    let data_end = data_start + row_len * rows;
    if bytes.len() < data_end {
        return Err(TableError::fits(format!(
            "truncated data: {} of {} bytes",
            bytes.len().saturating_sub(data_start),
            row_len * rows
        )));
    }

    let mut builder = TableBuilder::new(fields);
    if let Some(extname) = header.string("EXTNAME") {
        builder.set_metadata("extname", extname.trim());
    }
    for row in bytes[data_start..data_end].chunks_exact(row_len.max(1)).take(rows) {
        for (index, column) in columns.iter().enumerate() {
            let cell = &row[column.offset..column.offset + column.repeat * column.code.width()];
            let integer = match column.code {
                Code::Logical => match cell[0] {
                    b'T' => Some(1),
                    b'F' => Some(0),
                    _ => None,
                },
                Code::Byte => Some(i64::from(cell[0])),
                Code::Short => Some(i64::from(BigEndian::read_i16(cell))),
                Code::Int => Some(i64::from(BigEndian::read_i32(cell))),
                Code::Long => Some(BigEndian::read_i64(cell)),
                Code::Float => {
                    builder.push_float(index, Some(f64::from(BigEndian::read_f32(cell))));
                    continue;
                }
                Code::Double => {
                    builder.push_float(index, Some(BigEndian::read_f64(cell)));
                    continue;
                }
                Code::Chars => {
                    let text = String::from_utf8_lossy(cell);
                    let text = text.trim_end_matches(['\0', ' ']);
                    builder.push_text(index, (!text.is_empty()).then(|| text.to_string()));
                    continue;
                }
            };
            let integer = integer.filter(|v| Some(*v) != column.null);
            match column.scale {
                Some((scale, zero)) => {
                    builder.push_float(index, integer.map(|v| v as f64 * scale + zero))
                }
                None => builder.push_int(index, integer),
            }
        }
        builder.end_row();
    }
    builder.finish()
}

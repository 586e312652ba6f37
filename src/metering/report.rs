//! Missing-reading detection over the daily archive workbook
//!
//! The first worksheet carries a few title rows, then a header row naming the
//! columns, then one row per meter. A row is "missing" when its reading cell
//! does not hold a number.

use super::RawReport;
use crate::config::ReportConfig;
use crate::error::ParseError;
use calamine::{Data, Range, Reader, Xlsx};
use std::io::Cursor;

/// Where the interesting columns live
#[derive(Debug, Clone)]
pub struct ReportLayout {
    /// Zero-based sheet row of the column titles
    pub header_row: u32,
    pub id_column: String,
    pub reading_column: String,
}

impl From<&ReportConfig> for ReportLayout {
    fn from(config: &ReportConfig) -> Self {
        Self {
            header_row: config.header_row,
            id_column: config.id_column.clone(),
            reading_column: config.reading_column.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub entity_id: String,
    pub reading_present: bool,
}

/// Entity ids without a reading, in report order, duplicates kept
pub fn find_missing(report: &RawReport, layout: &ReportLayout) -> Result<Vec<String>, ParseError> {
    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(report.as_bytes()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(ParseError::NoWorksheet)??;

    Ok(parse_rows(&range, layout)?
        .into_iter()
        .filter(|row| !row.reading_present)
        .map(|row| row.entity_id)
        .collect())
}

/// Project the sheet into rows, skipping rows without an identifier
pub fn parse_rows(range: &Range<Data>, layout: &ReportLayout) -> Result<Vec<ReportRow>, ParseError> {
    let missing_header = || ParseError::MissingHeader(layout.header_row);

    // Range coordinates start at the first used cell, not at A1.
    let (first_row, _) = range.start().ok_or_else(missing_header)?;
    let offset = layout
        .header_row
        .checked_sub(first_row)
        .ok_or_else(missing_header)?;

    let mut rows = range.rows().skip(offset as usize);
    let header = rows.next().ok_or_else(missing_header)?;
    let id_idx = column_index(header, &layout.id_column)?;
    let reading_idx = column_index(header, &layout.reading_column)?;

    Ok(rows
        .filter_map(|row| {
            let entity_id = row.get(id_idx).and_then(entity_id)?;
            Some(ReportRow {
                entity_id,
                reading_present: row.get(reading_idx).is_some_and(is_reading),
            })
        })
        .collect())
}

fn column_index(header: &[Data], title: &str) -> Result<usize, ParseError> {
    header
        .iter()
        .position(|cell| matches!(cell, Data::String(s) if s.trim() == title))
        .ok_or_else(|| ParseError::MissingColumn(title.to_string()))
}

fn entity_id(cell: &Data) -> Option<String> {
    match cell {
        Data::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Data::Int(i) => Some(i.to_string()),
        // Serial numbers typed into a numeric cell come back as floats
        Data::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
            Some(format!("{}", *f as i64))
        }
        Data::Float(f) if f.is_finite() => Some(f.to_string()),
        _ => None,
    }
}

fn is_reading(cell: &Data) -> bool {
    match cell {
        Data::Int(_) => true,
        Data::Float(f) => f.is_finite(),
        Data::String(s) => s
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .is_ok_and(f64::is_finite),
        _ => false,
    }
}

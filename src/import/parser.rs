//! Turns an uploaded file into header-keyed rows.
//!
//! Delimited text (CSV and friends) goes through `csv`; XLSX workbooks are
//! detected by their zip signature and read with `calamine` (first sheet
//! only). The whole file is scanned once up front, which gives the exact
//! record count and surfaces every structural error before a single job is
//! created. Rows are then handed out lazily from any offset, so a resumed
//! import can skip straight past the rows it already accounted for.

use calamine::{Data, DataType, Reader, Xlsx};
use chrono::NaiveDate;
use std::borrow::Cow;
use std::io::Cursor;
use tracing::debug;

use super::config::{ParsingOptions, DEFAULT_DATE_FORMAT};
use super::error::ParseError;

const XLSX_SIGNATURE: &[u8] = b"PK\x03\x04";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// One cell as read from the file.
///
/// Delimited text only ever yields `Text`. Spreadsheets keep real date cells
/// typed, since their stored value is a day serial, not the text a user sees.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Date(NaiveDate),
}

impl Cell {
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            Cell::Text(text) => Cow::Borrowed(text.as_str()),
            Cell::Date(date) => Cow::Owned(date.format(DEFAULT_DATE_FORMAT).to_string()),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Text(text) => text.trim().is_empty(),
            Cell::Date(_) => false,
        }
    }
}

impl From<&str> for Cell {
    fn from(text: &str) -> Self {
        Cell::Text(text.to_string())
    }
}

/// One data row of the uploaded file. Never mutated after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 0-based position among the data rows (header excluded).
    pub row_index: u64,
    cells: Vec<Cell>,
}

impl RawRow {
    pub fn new(row_index: u64, cells: Vec<Cell>) -> Self {
        Self { row_index, cells }
    }

    pub fn cell(&self, column: usize) -> Option<&Cell> {
        self.cells.get(column)
    }
}

/// A fully scanned table: header names plus data rows padded to header width.
#[derive(Debug, Clone)]
pub struct ParsedSheet {
    headers: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl ParsedSheet {
    /// Scan `bytes` as a table. The first non-empty row is the header.
    pub fn parse(bytes: &[u8], options: &ParsingOptions) -> Result<Self, ParseError> {
        let table = if bytes.starts_with(XLSX_SIGNATURE) {
            read_xlsx(bytes)?
        } else {
            read_delimited(bytes, options.delimiter)?
        };
        Self::from_table(table, options)
    }

    fn from_table(table: Vec<Vec<Cell>>, options: &ParsingOptions) -> Result<Self, ParseError> {
        let mut lines = table.into_iter();
        let mut headers: Vec<String> = lines
            .next()
            .ok_or(ParseError::EmptyHeader)?
            .iter()
            .map(|h| h.text().trim().to_string())
            .collect();
        let header_width = trimmed_width(&headers);
        if header_width == 0 {
            return Err(ParseError::EmptyHeader);
        }
        headers.truncate(header_width);

        let mut rows = Vec::new();
        for mut cells in lines {
            if cells.iter().all(Cell::is_blank) {
                continue;
            }
            let row_index = rows.len() as u64;
            if cells.len() > header_width {
                let extra = &cells[header_width..];
                let too_many = options
                    .ragged_tolerance
                    .map_or(false, |tolerance| extra.len() > tolerance);
                if too_many || extra.iter().any(|c| !c.is_blank()) {
                    return Err(ParseError::RaggedRow {
                        row_index,
                        width: cells.len(),
                        header_width,
                    });
                }
                cells.truncate(header_width);
            }
            cells.resize(header_width, Cell::Text(String::new()));
            rows.push(cells);
        }

        debug!("Parsed sheet: {} columns, {} records", header_width, rows.len());
        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn total_records(&self) -> u64 {
        self.rows.len() as u64
    }

    /// Rows starting at `offset`, built on demand.
    pub fn rows_from(&self, offset: u64) -> impl Iterator<Item = RawRow> + '_ {
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        self.rows
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(i, cells)| RawRow::new(i as u64, cells.clone()))
    }
}

/// Width of the header ignoring trailing blank header cells.
fn trimmed_width(headers: &[String]) -> usize {
    headers
        .iter()
        .rposition(|h| !h.is_empty())
        .map_or(0, |last| last + 1)
}

fn read_delimited(bytes: &[u8], delimiter: u8) -> Result<Vec<Vec<Cell>>, ParseError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    if std::str::from_utf8(bytes).is_err() {
        return Err(ParseError::Encoding);
    }
    if bytes.contains(&0) {
        return Err(ParseError::Malformed("file contains binary data".to_string()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(bytes);

    let mut table = Vec::new();
    for record in reader.records() {
        let record = record?;
        table.push(record.iter().map(Cell::from).collect::<Vec<Cell>>());
    }
    Ok(table)
}

fn read_xlsx(bytes: &[u8]) -> Result<Vec<Vec<Cell>>, ParseError> {
    let mut workbook = Xlsx::new(Cursor::new(bytes))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ParseError::Malformed("workbook has no sheets".to_string()))??;

    Ok(range
        .rows()
        .map(|row| row.iter().map(xlsx_cell).collect::<Vec<Cell>>())
        .collect())
}

fn xlsx_cell(data: &Data) -> Cell {
    match data {
        Data::DateTime(_) | Data::DateTimeIso(_) => match data.as_date() {
            Some(date) => Cell::Date(date),
            None => Cell::Text(data.to_string()),
        },
        other => Cell::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_xlsxwriter::{ExcelDateTime, Format, Workbook};

    fn parse(text: &str) -> Result<ParsedSheet, ParseError> {
        ParsedSheet::parse(text.as_bytes(), &ParsingOptions::default())
    }

    #[test]
    fn first_row_is_header() {
        let sheet = parse("Title,Location\nEngineer,Berlin\nDesigner,Paris\n").unwrap();
        assert_eq!(sheet.headers(), ["Title", "Location"]);
        assert_eq!(sheet.total_records(), 2);

        let rows: Vec<_> = sheet.rows_from(0).collect();
        assert_eq!(rows[1].row_index, 1);
        assert_eq!(rows[1].cell(1), Some(&Cell::from("Paris")));
    }

    #[test]
    fn resumes_from_offset() {
        let sheet = parse("Title\na\nb\nc\nd\n").unwrap();
        let rest: Vec<_> = sheet.rows_from(2).map(|r| (r.row_index, r.cell(0).unwrap().text().into_owned())).collect();
        assert_eq!(rest, vec![(2, "c".to_string()), (3, "d".to_string())]);
        assert_eq!(sheet.rows_from(10).count(), 0);
    }

    #[test]
    fn strips_bom_and_skips_blank_rows() {
        let sheet = parse("\u{feff}Title,Location\nEngineer,Berlin\n,\n\nDesigner,\n").unwrap();
        assert_eq!(sheet.headers()[0], "Title");
        assert_eq!(sheet.total_records(), 2);
        let last = sheet.rows_from(1).next().unwrap();
        assert_eq!(last.cell(1), Some(&Cell::from("")));
    }

    #[test]
    fn pads_short_rows_and_tolerates_trailing_blanks() {
        let sheet = parse("Title,Location,Department\nEngineer\nDesigner,Paris,Design,,\n").unwrap();
        let rows: Vec<_> = sheet.rows_from(0).collect();
        assert_eq!(rows[0].cell(2), Some(&Cell::from("")));
        assert_eq!(rows[1].cell(2), Some(&Cell::from("Design")));
        assert_eq!(rows[1].cell(3), None);
    }

    #[test]
    fn rejects_wide_rows_with_content() {
        let err = parse("Title,Location\nEngineer,Berlin,surprise\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::RaggedRow {
                row_index: 0,
                width: 3,
                header_width: 2
            }
        );
    }

    #[test]
    fn ragged_tolerance_limits_blank_tail() {
        let options = ParsingOptions {
            ragged_tolerance: Some(1),
            ..ParsingOptions::default()
        };
        assert!(ParsedSheet::parse(b"Title\nEngineer,\n", &options).is_ok());
        assert_matches!(
            ParsedSheet::parse(b"Title\nEngineer,,\n", &options),
            Err(ParseError::RaggedRow { .. })
        );
    }

    #[test]
    fn rejects_empty_header() {
        assert_eq!(parse("").unwrap_err(), ParseError::EmptyHeader);
        assert_eq!(parse(" , ,\nEngineer,Berlin\n").unwrap_err(), ParseError::EmptyHeader);
    }

    #[test]
    fn rejects_undecodable_input() {
        let err = ParsedSheet::parse(&[0x54, 0x69, 0xff, 0xfe, 0x0a], &ParsingOptions::default()).unwrap_err();
        assert_eq!(err, ParseError::Encoding);
    }

    #[test]
    fn honours_delimiter() {
        let options = ParsingOptions {
            delimiter: b';',
            ..ParsingOptions::default()
        };
        let sheet = ParsedSheet::parse(b"Title;Salary\nEngineer;50000,5\n", &options).unwrap();
        assert_eq!(sheet.rows_from(0).next().unwrap().cell(1), Some(&Cell::from("50000,5")));
    }

    fn workbook(rows: &[(&str, Option<(u16, u8, u8)>)]) -> Vec<u8> {
        let mut workbook = Workbook::new();
        let date_format = Format::new().set_num_format("yyyy-mm-dd");
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Title").unwrap();
        sheet.write_string(0, 1, "Deadline").unwrap();
        for (i, (title, deadline)) in rows.iter().enumerate() {
            let row = i as u32 + 1;
            sheet.write_string(row, 0, *title).unwrap();
            if let Some((y, m, d)) = deadline {
                let date = ExcelDateTime::from_ymd(*y, *m, *d).unwrap();
                sheet.write_datetime_with_format(row, 1, &date, &date_format).unwrap();
            }
        }
        workbook.save_to_buffer().unwrap()
    }

    #[test]
    fn reads_xlsx_with_typed_dates() {
        let bytes = workbook(&[("Engineer", Some((2030, 1, 31))), ("Designer", None)]);
        let sheet = ParsedSheet::parse(&bytes, &ParsingOptions::default()).unwrap();

        assert_eq!(sheet.headers(), ["Title", "Deadline"]);
        assert_eq!(sheet.total_records(), 2);
        let rows: Vec<_> = sheet.rows_from(0).collect();
        assert_eq!(rows[0].cell(0), Some(&Cell::from("Engineer")));
        assert_eq!(
            rows[0].cell(1),
            Some(&Cell::Date(NaiveDate::from_ymd_opt(2030, 1, 31).unwrap()))
        );
        assert!(rows[1].cell(1).unwrap().is_blank());
    }

    #[test]
    fn date_cells_render_as_iso_text() {
        let cell = Cell::Date(NaiveDate::from_ymd_opt(2030, 1, 31).unwrap());
        assert_eq!(cell.text(), "2030-01-31");
        assert!(!cell.is_blank());
    }
}

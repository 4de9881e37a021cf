//! Keyword CSV decoding.
//!
//! Uploaded files come from many keyword tools, so nothing about them is
//! assumed: the text encoding is detected from a fixed list, the delimiter
//! is sniffed from a sample, and columns are found by fuzzy header names.

use std::borrow::Cow;

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, WINDOWS_1252};
use tracing::warn;

use kwgroup_core::defaults::{DELIMITER_CANDIDATES, DELIMITER_SAMPLE_BYTES};
use kwgroup_core::{Error, Result};

/// Column positions resolved from the header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    pub keyword: usize,
    pub volume: Option<usize>,
    pub difficulty: Option<usize>,
    pub serp_features: Option<usize>,
}

/// One data row with defensively parsed values.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvKeywordRow {
    /// Raw keyword cell, trimmed. May be empty.
    pub keyword: String,
    pub volume: i64,
    pub difficulty: Option<f64>,
    pub serp_features: Vec<String>,
}

/// Streaming reader over a decoded keyword file.
///
/// Rows come out in batches straight from the CSV parser; the file is never
/// materialized as a row list.
pub struct KeywordCsvReader<'a> {
    text: &'a str,
    delimiter: u8,
    columns: ColumnMap,
    reader: csv::Reader<&'a [u8]>,
    record: csv::StringRecord,
    line: u64,
    malformed_rows: i64,
}

impl<'a> KeywordCsvReader<'a> {
    /// Open decoded text: sniff the delimiter and resolve the header.
    ///
    /// A missing keyword column or an empty file is a [`Error::Parse`].
    pub fn new(text: &'a str) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(Error::Parse("file is empty".to_string()));
        }
        let delimiter = sniff_delimiter(text);
        let mut reader = csv_reader(text, delimiter);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| Error::Parse(format!("unreadable header row: {e}")))?
            .iter()
            .map(str::to_string)
            .collect();
        let columns = resolve_columns(&headers).ok_or_else(|| {
            Error::Parse(format!(
                "no keyword column found in header: {}",
                headers.join(", ")
            ))
        })?;

        Ok(Self {
            text,
            delimiter,
            columns,
            reader,
            record: csv::StringRecord::new(),
            line: 1,
            malformed_rows: 0,
        })
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn columns(&self) -> ColumnMap {
        self.columns
    }

    /// Records the CSV parser could not read so far.
    pub fn malformed_rows(&self) -> i64 {
        self.malformed_rows
    }

    /// Number of data records in the file, readable or not.
    ///
    /// Runs a separate pass over the text with a reused record buffer.
    pub fn count_records(&self) -> i64 {
        let mut reader = csv_reader(self.text, self.delimiter);
        let mut record = csv::ByteRecord::new();
        let mut count = 0i64;
        loop {
            match reader.read_byte_record(&mut record) {
                Ok(true) => count += 1,
                Ok(false) => break,
                Err(e) if is_fatal(&e) => break,
                Err(_) => count += 1,
            }
        }
        count
    }

    /// Read up to `max` rows. An empty batch means the file is exhausted.
    ///
    /// Unreadable records are skipped and counted in
    /// [`malformed_rows`](Self::malformed_rows).
    pub fn next_batch(&mut self, max: usize) -> Vec<CsvKeywordRow> {
        let mut rows = Vec::with_capacity(max.min(1024));
        while rows.len() < max {
            self.line += 1;
            match self.reader.read_record(&mut self.record) {
                Ok(true) => rows.push(self.parse_record()),
                Ok(false) => break,
                Err(e) => {
                    if is_fatal(&e) {
                        break;
                    }
                    self.malformed_rows += 1;
                    warn!(
                        subsystem = "ingestion",
                        component = "csv",
                        line = self.line,
                        error = %e,
                        "Skipping unreadable CSV record"
                    );
                }
            }
        }
        rows
    }

    fn parse_record(&self) -> CsvKeywordRow {
        let record = &self.record;
        let cell = |idx: Option<usize>| idx.and_then(|i| record.get(i)).unwrap_or("");
        CsvKeywordRow {
            keyword: cell(Some(self.columns.keyword)).trim().to_string(),
            volume: parse_volume(cell(self.columns.volume)),
            difficulty: parse_difficulty(cell(self.columns.difficulty)),
            serp_features: parse_serp_features(cell(self.columns.serp_features)),
        }
    }
}

fn csv_reader(text: &str, delimiter: u8) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .from_reader(text.as_bytes())
}

/// Errors after which the reader cannot make progress.
fn is_fatal(err: &csv::Error) -> bool {
    matches!(err.kind(), csv::ErrorKind::Io(_) | csv::ErrorKind::Seek)
}

/// Decode bytes trying UTF-8, UTF-16, then windows-1252.
///
/// Returns the text and the name of the encoding that succeeded.
pub fn decode(bytes: &[u8]) -> (Cow<'_, str>, &'static str) {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        if let Some(text) =
            encoding.decode_without_bom_handling_and_without_replacement(&bytes[bom_len..])
        {
            return (text, encoding.name());
        }
    }

    if let Some(encoding) = utf16_without_bom(bytes) {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            return (text, encoding.name());
        }
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        return (Cow::Borrowed(text), "UTF-8");
    }

    // windows-1252 maps every byte, so this is the final fallback.
    let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
    (text, WINDOWS_1252.name())
}

/// Guess BOM-less UTF-16 from NUL bytes in ASCII-heavy text.
fn utf16_without_bom(bytes: &[u8]) -> Option<&'static Encoding> {
    if bytes.len() < 2 || bytes.len() % 2 != 0 {
        return None;
    }
    let sample = &bytes[..bytes.len().min(DELIMITER_SAMPLE_BYTES)];
    let pairs = sample.len() / 2;
    let even_nuls = sample.iter().step_by(2).filter(|&&b| b == 0).count();
    let odd_nuls = sample.iter().skip(1).step_by(2).filter(|&&b| b == 0).count();

    if odd_nuls * 2 > pairs && even_nuls == 0 {
        Some(UTF_16LE)
    } else if even_nuls * 2 > pairs && odd_nuls == 0 {
        Some(UTF_16BE)
    } else {
        None
    }
}

/// Pick the candidate delimiter that splits the header line the most.
///
/// Counts ignore quoted sections. Ties go to the earlier candidate; a
/// single-column file falls back to a comma.
pub fn sniff_delimiter(text: &str) -> u8 {
    let mut end = text.len().min(DELIMITER_SAMPLE_BYTES);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let sample = &text[..end];
    let Some(header) = sample.lines().find(|line| !line.trim().is_empty()) else {
        return b',';
    };

    let mut best = (b',', 0usize);
    for candidate in DELIMITER_CANDIDATES {
        let count = count_unquoted(header, candidate as char);
        if count > best.1 {
            best = (candidate, count);
        }
    }
    best.0
}

fn count_unquoted(line: &str, delimiter: char) -> usize {
    let mut quoted = false;
    let mut count = 0;
    for c in line.chars() {
        if c == '"' {
            quoted = !quoted;
        } else if c == delimiter && !quoted {
            count += 1;
        }
    }
    count
}

fn normalize_header(header: &str) -> String {
    header
        .trim_start_matches('\u{feff}')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Resolve columns by fuzzy header names.
///
/// The first header containing "keyword" or "phrase" is the keyword column.
/// Other columns are matched only among the remaining headers.
pub fn resolve_columns(headers: &[String]) -> Option<ColumnMap> {
    let names: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
    let keyword = names
        .iter()
        .position(|h| h.contains("keyword") || h.contains("phrase"))?;

    let find = |pred: &dyn Fn(&str) -> bool| {
        names
            .iter()
            .enumerate()
            .find(|(i, h)| *i != keyword && pred(h))
            .map(|(i, _)| i)
    };

    Some(ColumnMap {
        keyword,
        volume: find(&|h| h.contains("volume") || h == "sv" || h == "searches"),
        difficulty: find(&|h| h.contains("difficulty") || h == "kd" || h == "kdpercent"),
        serp_features: find(&|h| h.contains("serp") || h.contains("features")),
    })
}

/// Parse a search volume. Thousands separators are stripped; anything
/// unparsable is zero.
pub fn parse_volume(raw: &str) -> i64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return 0;
    }
    cleaned
        .parse::<i64>()
        .ok()
        .or_else(|| cleaned.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v.round() as i64))
        .unwrap_or(0)
        .max(0)
}

/// Parse a keyword difficulty. Empty cells have no difficulty; unparsable
/// ones count as zero.
pub fn parse_difficulty(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().trim_end_matches('%').trim();
    if cleaned.is_empty() {
        return None;
    }
    Some(
        cleaned
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .unwrap_or(0.0),
    )
}

/// Split a SERP features cell into trimmed feature names.
pub fn parse_serp_features(raw: &str) -> Vec<String> {
    raw.split([',', ';', '|'])
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

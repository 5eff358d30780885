//! CSV source with encoding and delimiter auto-detection.
//!
//! The file is decoded up front (detection needs the whole byte buffer);
//! records are then parsed lazily, one per pull. Cells are strings, empty
//! cells become null, missing trailing cells become null and extra cells
//! are ignored.

use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter, Trim};
use log::{debug, info};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::{CsvError, CsvResult};
use crate::models::{Row, StageRef, Value};
use crate::sequence::{Sequence, StageCore};

/// Delimiters tried by [`detect_delimiter`], in order of preference.
pub const DELIMITERS: [char; 4] = [';', ',', '\t', '|'];

/// Detects the encoding of raw bytes using chardet.
pub fn detect_encoding(bytes: &[u8]) -> String {
    let charset = chardet::detect(bytes).0;

    match charset.to_lowercase().as_str() {
        "ascii" | "utf-8" | "utf8" | "" => "utf-8".to_string(),
        "iso-8859-1" | "iso-8859-15" | "latin-1" | "latin1" => "iso-8859-1".to_string(),
        "windows-1252" | "cp1252" => "windows-1252".to_string(),
        other => other.to_string(),
    }
}

/// Decodes bytes with the named encoding.
///
/// A byte order mark is stripped. Malformed sequences are replaced rather
/// than rejected; only an unknown encoding label is an error.
pub fn decode_content(bytes: &[u8], encoding: &str) -> CsvResult<String> {
    let label = encoding.trim().to_lowercase();
    if matches!(label.as_str(), "utf-8" | "utf8" | "ascii") {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        return Ok(String::from_utf8_lossy(bytes).into_owned());
    }
    let codec = encoding_rs::Encoding::for_label(label.as_bytes())
        .ok_or_else(|| CsvError::EncodingError(format!("unknown encoding '{}'", encoding)))?;
    let (decoded, _, had_errors) = codec.decode(bytes);
    if had_errors {
        debug!("Malformed {} sequences replaced while decoding", codec.name());
    }
    Ok(decoded.into_owned())
}

/// Picks the delimiter occurring most often in the header line.
/// Falls back to `;` when none occurs.
pub fn detect_delimiter(content: &str) -> char {
    let first_line = content.lines().next().unwrap_or("");

    let mut best_sep = DELIMITERS[0];
    let mut best_count = 0;
    for &sep in &DELIMITERS {
        let count = first_line.matches(sep).count();
        if count > best_count {
            best_count = count;
            best_sep = sep;
        }
    }
    best_sep
}

/// Overrides for the auto-detected settings.
#[derive(Debug, Clone, Default)]
pub struct CsvOptions {
    pub encoding: Option<String>,
    pub delimiter: Option<char>,
}

/// Sequence of rows read from a CSV document.
pub struct CsvSource {
    core: StageCore,
    headers: Vec<String>,
    records: StringRecordsIntoIter<Cursor<Vec<u8>>>,
    encoding: String,
    delimiter: char,
    done: bool,
}

impl std::fmt::Debug for CsvSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvSource")
            .field("stage", self.core.stage())
            .field("headers", &self.headers)
            .field("encoding", &self.encoding)
            .field("delimiter", &self.delimiter)
            .finish()
    }
}

impl CsvSource {
    /// Opens a CSV file. The stage is named after the file.
    pub fn open(ctx: &Arc<ExecutionContext>, path: impl AsRef<Path>, options: CsvOptions) -> CsvResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "csv".to_string());
        Self::from_bytes(ctx, &name, &bytes, options)
    }

    pub fn from_bytes(
        ctx: &Arc<ExecutionContext>,
        name: &str,
        bytes: &[u8],
        options: CsvOptions,
    ) -> CsvResult<Self> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(CsvError::EmptyFile);
        }
        let encoding = options.encoding.unwrap_or_else(|| detect_encoding(bytes));
        let content = decode_content(bytes, &encoding)?;
        let delimiter = options.delimiter.unwrap_or_else(|| detect_delimiter(&content));
        if !delimiter.is_ascii() {
            return Err(CsvError::ParseError {
                line: 1,
                message: format!("delimiter '{}' is not a single byte", delimiter),
            });
        }

        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter as u8)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(Cursor::new(content.into_bytes()));
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| parse_error(&e))?
            .iter()
            .map(|h| h.to_string())
            .collect();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(CsvError::NoHeaders);
        }

        let core = StageCore::new(ctx, &format!("Csv[{}]", name));
        info!(
            "{}: {} column(s), encoding {}, delimiter {:?}",
            core.stage(),
            headers.len(),
            encoding,
            delimiter
        );
        Ok(Self {
            core,
            headers,
            records: reader.into_records(),
            encoding,
            delimiter,
            done: false,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    fn to_row(&self, record: &StringRecord) -> Row {
        let values = self.headers.iter().enumerate().map(|(i, header)| {
            let value = match record.get(i) {
                Some(cell) if !cell.is_empty() => Value::from(cell),
                _ => Value::Null,
            };
            (header.as_str(), value)
        });
        self.core.ctx().create_row_with(self.core.stage(), values)
    }
}

fn parse_error(err: &csv::Error) -> CsvError {
    CsvError::ParseError {
        line: err.position().map(|p| p.line()).unwrap_or(0),
        message: err.to_string(),
    }
}

impl Sequence for CsvSource {
    fn stage(&self) -> &StageRef {
        self.core.stage()
    }

    fn pull(&mut self) -> Option<Row> {
        if self.done || self.core.is_cancelled() {
            return None;
        }
        match self.records.next() {
            Some(Ok(record)) => Some(self.to_row(&record)),
            Some(Err(e)) => {
                self.done = true;
                self.core.fail(parse_error(&e));
                None
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::sequence::collect_rows;
    use std::io::Write;

    fn ctx() -> Arc<ExecutionContext> {
        ExecutionContext::new(EngineConfig::default())
    }

    fn parse(csv: &str) -> Vec<Row> {
        let ctx = ctx();
        let mut source = CsvSource::from_bytes(&ctx, "test", csv.as_bytes(), CsvOptions::default()).unwrap();
        collect_rows(&ctx, &mut source).unwrap()
    }

    #[test]
    fn test_simple_csv() {
        let rows = parse("name;age\nAlice;30\nBob;25");

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("name"), &Value::from("Alice"));
        assert_eq!(rows[0].get("age"), &Value::from("30"));
        assert_eq!(rows[1].get("name"), &Value::from("Bob"));
    }

    #[test]
    fn test_quoted_values_keep_delimiters() {
        let rows = parse("name,value\n\"Alice\",\"Hello, World\"");
        assert_eq!(rows[0].get("value"), &Value::from("Hello, World"));
    }

    #[test]
    fn test_empty_lines_skipped() {
        let rows = parse("a;b\n1;2\n\n3;4\n");
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_missing_and_empty_cells_are_null() {
        let rows = parse("a;b;c\n1;;3\n4");
        assert_eq!(rows[0].get("b"), &Value::Null);
        assert_eq!(rows[0].get("c"), &Value::from("3"));
        assert_eq!(rows[1].get("a"), &Value::from("4"));
        assert_eq!(rows[1].get("c"), &Value::Null);
    }

    #[test]
    fn test_extra_columns_ignored() {
        let rows = parse("a;b\n1;2;3;4");
        assert_eq!(rows[0].column_count(), 2);
        assert_eq!(rows[0].get("b"), &Value::from("2"));
    }

    #[test]
    fn test_empty_input_is_an_error() {
        let ctx = ctx();
        let err = CsvSource::from_bytes(&ctx, "empty", b"", CsvOptions::default()).unwrap_err();
        assert!(matches!(err, CsvError::EmptyFile));
    }

    #[test]
    fn test_detect_delimiter() {
        assert_eq!(detect_delimiter("a;b;c\n1;2;3"), ';');
        assert_eq!(detect_delimiter("a,b,c\n1,2,3"), ',');
        assert_eq!(detect_delimiter("a\tb\tc\n1\t2\t3"), '\t');
        assert_eq!(detect_delimiter("a|b|c\n1|2|3"), '|');
        assert_eq!(detect_delimiter("single"), ';');
    }

    #[test]
    fn test_latin1_decoding() {
        // "Société" in ISO-8859-1
        let bytes: &[u8] = &[0x53, 0x6F, 0x63, 0x69, 0xE9, 0x74, 0xE9];
        assert_eq!(decode_content(bytes, "iso-8859-1").unwrap(), "Société");
    }

    #[test]
    fn test_unknown_encoding_label() {
        let err = decode_content(b"abc", "no-such-charset").unwrap_err();
        assert!(err.to_string().contains("no-such-charset"));
    }

    #[test]
    fn test_explicit_options_override_detection() {
        let ctx = ctx();
        let bytes: &[u8] = b"city,name\nLyon,Soci\xE9t\xE9\n";
        let options = CsvOptions {
            encoding: Some("windows-1252".into()),
            delimiter: Some(','),
        };
        let mut source = CsvSource::from_bytes(&ctx, "latin", bytes, options).unwrap();
        assert_eq!(source.headers(), &["city".to_string(), "name".to_string()]);
        let rows = collect_rows(&ctx, &mut source).unwrap();
        assert_eq!(rows[0].get("name"), &Value::from("Société"));
    }

    #[test]
    fn test_open_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id,amount").unwrap();
        writeln!(file, "1,10.5").unwrap();
        writeln!(file, "2,").unwrap();
        file.flush().unwrap();

        let ctx = ctx();
        let mut source = CsvSource::open(&ctx, file.path(), CsvOptions::default()).unwrap();
        assert_eq!(source.delimiter(), ',');
        assert_eq!(source.encoding(), "utf-8");
        assert!(source.stage().name().starts_with("Csv["));
        let rows = collect_rows(&ctx, &mut source).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("amount"), &Value::Null);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let ctx = ctx();
        let err = CsvSource::open(&ctx, "/definitely/not/here.csv", CsvOptions::default()).unwrap_err();
        assert!(matches!(err, CsvError::IoError(_)));
    }
}

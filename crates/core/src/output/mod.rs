//! Call-graph output: one CSV row per resolved call edge.

use std::io::Write;

use serde::Serialize;
use thiserror::Error;

/// Error type for output-sink operations.
#[derive(Debug, Error)]
pub enum OutputError {
    /// Underlying CSV/IO failure.
    #[error("CSV output error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the callee of a row is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    Direct,
    Indirect,
    Virtual,
}

impl CallType {
    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Direct => "direct",
            CallType::Indirect => "indirect",
            CallType::Virtual => "virtual",
        }
    }
}

/// Which resolver produced an indirect row (empty for direct/virtual rows).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoundWith {
    None,
    Ta,
    Mlta,
}

impl FoundWith {
    pub fn as_str(self) -> &'static str {
        match self {
            FoundWith::None => "",
            FoundWith::Ta => "TA",
            FoundWith::Mlta => "MLTA",
        }
    }
}

/// One output row. Field order matches the emitted header; empty strings
/// stand for information the debug info did not provide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRow {
    pub caller_filename: String,
    pub caller_function: String,
    pub caller_def_line: String,
    pub caller_line: String,
    pub callee_filename: String,
    pub callee_function: String,
    pub callee_line: String,
    pub callee_calltype: String,
    pub callee_inlined_from_file: String,
    pub callee_inlined_from_line: String,
    pub indirect_found_with: String,
}

const HEADER: [&str; 11] = [
    "caller_filename",
    "caller_function",
    "caller_def_line",
    "caller_line",
    "callee_filename",
    "callee_function",
    "callee_line",
    "callee_calltype",
    "callee_inlined_from_file",
    "callee_inlined_from_line",
    "indirect_found_with",
];

/// CSV writer with the header emitted up front (so an empty analysis still
/// produces a well-formed file) and every field double-quoted.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvSink<W> {
    pub fn new(out: W) -> Result<Self, OutputError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .quote_style(csv::QuoteStyle::Always)
            .from_writer(out);
        writer.write_record(HEADER)?;
        Ok(Self { writer })
    }

    pub fn write(&mut self, row: &CallRow) -> Result<(), OutputError> {
        self.writer.serialize(row)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> CallRow {
        CallRow {
            caller_filename: "a.c".into(),
            caller_function: "main".into(),
            caller_def_line: "10".into(),
            caller_line: "12".into(),
            callee_filename: "b.c".into(),
            callee_function: "helper".into(),
            callee_line: "3".into(),
            callee_calltype: CallType::Indirect.as_str().into(),
            callee_inlined_from_file: String::new(),
            callee_inlined_from_line: String::new(),
            indirect_found_with: FoundWith::Mlta.as_str().into(),
        }
    }

    #[test]
    fn header_precedes_rows_and_everything_is_quoted() {
        let mut buf = Vec::new();
        let mut sink = CsvSink::new(&mut buf).expect("sink");
        sink.write(&row()).expect("row");
        sink.flush().expect("flush");
        drop(sink);

        let text = String::from_utf8(buf).expect("utf8");
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some(
                "\"caller_filename\",\"caller_function\",\"caller_def_line\",\"caller_line\",\
                 \"callee_filename\",\"callee_function\",\"callee_line\",\"callee_calltype\",\
                 \"callee_inlined_from_file\",\"callee_inlined_from_line\",\"indirect_found_with\""
            )
        );
        assert_eq!(
            lines.next(),
            Some(
                "\"a.c\",\"main\",\"10\",\"12\",\"b.c\",\"helper\",\"3\",\"indirect\",\"\",\"\",\"MLTA\""
            )
        );
    }

    #[test]
    fn empty_analysis_still_emits_the_header() {
        let mut buf = Vec::new();
        let mut sink = CsvSink::new(&mut buf).expect("sink");
        sink.flush().expect("flush");
        drop(sink);
        let text = String::from_utf8(buf).expect("utf8");
        assert_eq!(text.lines().count(), 1);
    }
}

//! `prom-nomnomnom` is a Prometheus text exposition parser
//!
//! It reads a single forward-only byte stream and hands back every metric family, in the order
//! the families were first referenced, with histogram and summary samples folded into typed
//! records.
//!
//! ```
//! use prom_nomnomnom::parser::MetricValue;
//!
//! let families = prom_nomnomnom::parse_str(
//!     "# TYPE http_requests_total counter\nhttp_requests_total{method=\"GET\"} 1027\n",
//! )?;
//!
//! let family = families.get("http_requests_total").expect("family");
//! assert!(matches!(family.metrics[0].value, MetricValue::Counter(n) if n == 1027.));
//! # Ok::<(), prom_nomnomnom::ParseError>(())
//! ```

#[allow(unused)]
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

use std::io::{self, BufRead};

/// Tokenizes an exposition stream
pub mod lexer;

/// Groups the tokens into typed metric families and performs additional validation.
pub mod parser;


pub use lexer::Position;
pub use parser::MetricFamilies;

/// Indicates that an exposition could not be parsed.  Parsing stops at the first error and no
/// families are returned.
#[derive(thiserror::Error, Debug)]
#[error("line {line} (byte {offset}): {kind}")]
pub struct ParseError {
    kind: ErrorKind,
    line: usize,
    offset: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum ErrorKind {
    #[error("unexpected {}, expected {expected}", describe_byte(.found))]
    UnexpectedByte {
        found: Option<u8>,
        expected: &'static str,
    },

    #[error("unterminated or badly escaped value for label «{0}»")]
    UnterminatedLabelValue(String),

    #[error("unknown metric type «{0}»")]
    UnknownMetricType(String),

    #[error("«{family}» is already a {declared}, can't redeclare it as a {requested}")]
    DuplicateTypeDeclaration {
        family: String,
        declared: parser::MetricType,
        requested: parser::MetricType,
    },

    #[error("label «{0}» appears more than once")]
    DuplicateLabelName(String),

    #[error("invalid number «{0}»")]
    InvalidNumberLiteral(String),

    #[error("invalid timestamp «{0}»")]
    InvalidTimestamp(String),

    #[error("invalid utf-8")]
    InvalidUtf8,

    #[error("sample «{sample}» doesn't fit the «{family}» family")]
    BadSuffix { sample: String, family: String },

    #[error("«{0}» needs an «le» label holding a number other than NaN")]
    BadBucket(String),

    #[error("«{0}» needs a «quantile» label between 0 and 1")]
    BadQuantile(String),

    #[error("«{sample}» must be a finite, non-negative count, got {value}")]
    InvalidCount { sample: String, value: f64 },

    #[error("histogram «{0}» has no «+Inf» bucket")]
    MissingInfBucket(String),

    #[cfg(feature = "validate_histogram_count")]
    #[error("histogram «{family}» has a count of {count} but its «+Inf» bucket holds {inf_bucket}")]
    HistogramCountMismatch {
        family: String,
        count: u64,
        inf_bucket: u64,
    },

    #[error("read failed: {0}")]
    IoFailure(#[source] io::Error),

    #[error("read cancelled: {0}")]
    Cancelled(#[source] io::Error),
}

impl ParseError {
    pub fn new(kind: ErrorKind, position: Position) -> Self {
        Self {
            kind,
            line: position.line,
            offset: position.offset,
        }
    }

    /// Wraps a read error.  Timeouts are how cancellable streams report cancellation.
    pub(crate) fn io(err: io::Error, position: Position) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Cancelled(err),
            _ => ErrorKind::IoFailure(err),
        };
        Self::new(kind, position)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    /// 1-based line the error was detected on
    pub fn line(&self) -> usize {
        self.line
    }

    /// Bytes consumed from the stream when the error was detected
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn position(&self) -> Position {
        Position {
            line: self.line,
            offset: self.offset,
        }
    }
}

impl ErrorKind {
    /// The variant name, handy for matching errors against fixtures.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UnexpectedByte { .. } => "UnexpectedByte",
            Self::UnterminatedLabelValue(_) => "UnterminatedLabelValue",
            Self::UnknownMetricType(_) => "UnknownMetricType",
            Self::DuplicateTypeDeclaration { .. } => "DuplicateTypeDeclaration",
            Self::DuplicateLabelName(_) => "DuplicateLabelName",
            Self::InvalidNumberLiteral(_) => "InvalidNumberLiteral",
            Self::InvalidTimestamp(_) => "InvalidTimestamp",
            Self::InvalidUtf8 => "InvalidUtf8",
            Self::BadSuffix { .. } => "BadSuffix",
            Self::BadBucket(_) => "BadBucket",
            Self::BadQuantile(_) => "BadQuantile",
            Self::InvalidCount { .. } => "InvalidCount",
            Self::MissingInfBucket(_) => "MissingInfBucket",
            #[cfg(feature = "validate_histogram_count")]
            Self::HistogramCountMismatch { .. } => "HistogramCountMismatch",
            Self::IoFailure(_) => "IoFailure",
            Self::Cancelled(_) => "Cancelled",
        }
    }
}

fn describe_byte(found: &Option<u8>) -> String {
    match found {
        None => "end of stream".to_string(),
        Some(b'\n') => "end of line".to_string(),
        Some(b) if b.is_ascii_graphic() || *b == b' ' => format!("«{}»", *b as char),
        Some(b) => format!("byte 0x{:02x}", b),
    }
}

/// Parses an exposition stream into [`MetricFamilies`], keyed by family name in the order each
/// family was first referenced.
///
/// The stream is read until it ends.  Any error aborts the whole parse.
pub fn parse<R: BufRead>(reader: R) -> Result<MetricFamilies, ParseError> {
    parser::parse(lexer::Lexer::new(reader))
}

/// Parses an exposition that is already in memory.
pub fn parse_str(data: &str) -> Result<MetricFamilies, ParseError> {
    parse(data.as_bytes())
}

#[allow(unused)]
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

use std::{borrow::Cow, fmt, io::BufRead, str::FromStr};

use serde_derive::Serialize;

use crate::{ErrorKind, ParseError};

mod scanner;
mod types;

pub use scanner::{Position, Scanner};
pub(crate) use types::{parse_number, serialize_float};
use types::*;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// One sample line, exactly as written
#[derive(Clone, Debug, Serialize)]
pub struct Sample {
    pub name: String,
    pub labels: Vec<Label>,
    #[serde(serialize_with = "serialize_float")]
    pub number: f64,
    /// Milliseconds since the epoch
    pub timestamp: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub enum MetricDescriptor {
    Type {
        metric_name: String,
        metric_type: MetricType,
    },
    Help {
        metric_name: String,
        help_text: String,
    },
}

#[derive(Clone, Debug, Serialize)]
pub enum MetricToken {
    Descriptor(MetricDescriptor),
    Metric(Sample),
    /// A comment that isn't a HELP or TYPE directive
    Comment,
    Empty,
}

/// [`MetricFamily`](crate::parser::MetricFamily) type.  The default is `Untyped`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum MetricType {
    /// Counters measure discrete events and only ever go up.
    Counter,
    /// Gauges are current measurements, such as bytes of memory currently used or the number of items in a queue.
    Gauge,
    /// Histograms sample observations into cumulative buckets.
    Histogram,
    /// Info metrics describe the target, the value is conventionally 1.
    Info,
    /// Summaries report streaming quantiles along with a count and a sum.
    Summary,
    /// Untyped is used when the exposition doesn't say.
    Untyped,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Info => "info",
            Self::Summary => "summary",
            Self::Untyped => "untyped",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = ErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            "histogram" => Ok(Self::Histogram),
            "info" => Ok(Self::Info),
            "summary" => Ok(Self::Summary),
            "untyped" => Ok(Self::Untyped),
            _ => Err(ErrorKind::UnknownMetricType(s.to_string())),
        }
    }
}

/// Pulls one [`MetricToken`] per line out of an exposition stream.
///
/// Yields the position each line started at along with the token.  Iteration stops after the
/// first error.
pub struct Lexer<R> {
    scanner: Scanner<R>,
    done: bool,
}

impl<R: BufRead> Lexer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            scanner: Scanner::new(reader),
            done: false,
        }
    }

    /// Routes on the first byte of the line after any leading blanks and tabs.
    pub fn next_token(&mut self) -> Result<Option<(Position, MetricToken)>, ParseError> {
        let position = self.scanner.position();
        self.scanner.read_while(|b| b == b' ' || b == b'\t')?;

        let token = match self.scanner.peek()? {
            None => return Ok(None),
            Some(b'\n') => {
                self.scanner.next_byte()?;
                MetricToken::Empty
            }
            Some(b'#') => self.comment_line()?,
            Some(_) => MetricToken::Metric(self.sample_line()?),
        };

        debug!(line = position.line, ?token);
        Ok(Some((position, token)))
    }

    /// ```abnf
    /// comment-line = HASH [SP (help-directive / type-directive / *char)] (LF / EOF)
    /// help-directive = %d72.69.76.80 SP metricname [SP *char]
    /// type-directive = %d84.89.80.69 SP metricname SP metric-type
    /// ```
    fn comment_line(&mut self) -> Result<MetricToken, ParseError> {
        self.scanner.expect(b'#', "«#»")?;

        match self.scanner.peek()? {
            None => return Ok(MetricToken::Comment),
            Some(b'\n') => {
                self.scanner.next_byte()?;
                return Ok(MetricToken::Comment);
            }
            Some(b' ') => {
                self.scanner.next_byte()?;
            }
            found => return Err(self.scanner.unexpected(found, "space after «#»")),
        }

        let prefix = self.scanner.read_while(is_name_char)?;
        let is_help = match prefix.as_slice() {
            b"HELP" => true,
            b"TYPE" => false,
            _ => {
                self.scanner.skip_line()?;
                return Ok(MetricToken::Comment);
            }
        };

        self.scanner.expect(b' ', "space after directive")?;
        let metric_name = self.identifier("metric name")?;

        let descriptor = if is_help {
            MetricDescriptor::Help {
                help_text: self.help_text()?,
                metric_name,
            }
        } else {
            MetricDescriptor::Type {
                metric_type: self.metric_type()?,
                metric_name,
            }
        };

        Ok(MetricToken::Descriptor(descriptor))
    }

    /// Everything after the name up to the end of the line, verbatim.  May be empty.
    fn help_text(&mut self) -> Result<String, ParseError> {
        match self.scanner.peek()? {
            None | Some(b'\n') => {
                self.end_of_line()?;
                return Ok(String::new());
            }
            Some(b' ') => {
                self.scanner.next_byte()?;
            }
            found => return Err(self.scanner.unexpected(found, "space before help text")),
        }

        let position = self.scanner.position();
        let text = self.scanner.read_until(b"\n")?;
        self.end_of_line()?;

        String::from_utf8(text).map_err(|_| ParseError::new(ErrorKind::InvalidUtf8, position))
    }

    fn metric_type(&mut self) -> Result<MetricType, ParseError> {
        self.scanner.expect(b' ', "space before metric type")?;

        let position = self.scanner.position();
        let word = self.scanner.read_until(b" \n")?;
        let metric_type = String::from_utf8_lossy(&word)
            .parse::<MetricType>()
            .map_err(|kind| ParseError::new(kind, position))?;

        self.end_of_line()?;
        Ok(metric_type)
    }

    /// ```abnf
    /// sample = metricname [labels] SP number [SP timestamp] (LF / EOF)
    /// ```
    fn sample_line(&mut self) -> Result<Sample, ParseError> {
        let name = self.identifier("metric name")?;

        let labels = match self.scanner.peek()? {
            Some(b'{') => {
                self.scanner.next_byte()?;
                self.labels()?
            }
            _ => vec![],
        };

        self.scanner.expect(b' ', "space before sample value")?;

        let position = self.scanner.position();
        let token = self.scanner.read_until(b" \n")?;
        let token = String::from_utf8_lossy(&token);
        let number = parse_number(&token).ok_or_else(|| {
            ParseError::new(ErrorKind::InvalidNumberLiteral(token.to_string()), position)
        })?;

        let timestamp = match self.scanner.peek()? {
            Some(b' ') => {
                self.scanner.next_byte()?;

                let position = self.scanner.position();
                let token = self.scanner.read_until(b" \n")?;
                let token = String::from_utf8_lossy(&token);
                let timestamp = parse_timestamp(&token).ok_or_else(|| {
                    ParseError::new(ErrorKind::InvalidTimestamp(token.to_string()), position)
                })?;
                Some(timestamp)
            }
            _ => None,
        };

        self.end_of_line()?;

        Ok(Sample {
            name,
            labels,
            number,
            timestamp,
        })
    }

    /// ```abnf
    /// labels = "{" [label *("," label)] "}"
    /// ```
    fn labels(&mut self) -> Result<Vec<Label>, ParseError> {
        let mut labels: Vec<Label> = vec![];

        if self.scanner.peek()? == Some(b'}') {
            self.scanner.next_byte()?;
            return Ok(labels);
        }

        loop {
            let position = self.scanner.position();
            let label = self.label()?;

            if labels.iter().any(|l| l.name == label.name) {
                return Err(ParseError::new(
                    ErrorKind::DuplicateLabelName(label.name),
                    position,
                ));
            }
            trace!(name = %label.name, value = %label.value);
            labels.push(label);

            match self.scanner.next_byte()? {
                Some(b',') => continue,
                Some(b'}') => return Ok(labels),
                found => Err(self.scanner.unexpected(found, "«,» or «}»"))?,
            }
        }
    }

    /// ```abnf
    /// label = label-name "=" DQUOTE escaped-string DQUOTE
    /// ```
    fn label(&mut self) -> Result<Label, ParseError> {
        let name = self.identifier("label name")?;
        self.scanner.expect(b'=', "«=» after label name")?;
        self.scanner.expect(b'"', "opening quote")?;
        let value = self.label_value(&name)?;

        Ok(Label { name, value })
    }

    /// Reads up to the closing quote, keeping escapes intact so `\"` doesn't end the value, then
    /// unescapes.
    fn label_value(&mut self, label_name: &str) -> Result<String, ParseError> {
        let position = self.scanner.position();
        let unterminated = || ErrorKind::UnterminatedLabelValue(label_name.to_string());
        let mut raw = vec![];

        loop {
            raw.extend(self.scanner.read_until(b"\\\"\n")?);

            match self.scanner.peek()? {
                Some(b'"') => {
                    self.scanner.next_byte()?;
                    break;
                }
                Some(b'\\') => {
                    self.scanner.next_byte()?;
                    raw.push(b'\\');
                    match self.scanner.peek()? {
                        None | Some(b'\n') => Err(self.scanner.error(unterminated()))?,
                        Some(b) => {
                            self.scanner.next_byte()?;
                            raw.push(b);
                        }
                    }
                }
                _ => Err(self.scanner.error(unterminated()))?,
            }
        }

        let raw =
            String::from_utf8(raw).map_err(|_| ParseError::new(ErrorKind::InvalidUtf8, position))?;

        unescape_label_value(&raw)
            .map(Cow::into_owned)
            .ok_or_else(|| ParseError::new(unterminated(), position))
    }

    /// ```abnf
    /// metricname = metricname-initial-char 0*metricname-char
    /// ```
    fn identifier(&mut self, expected: &'static str) -> Result<String, ParseError> {
        match self.scanner.peek()? {
            Some(b) if is_name_initial_char(b) => {}
            found => Err(self.scanner.unexpected(found, expected))?,
        }

        let name = self.scanner.read_while(is_name_char)?;
        Ok(name.into_iter().map(char::from).collect())
    }

    fn end_of_line(&mut self) -> Result<(), ParseError> {
        match self.scanner.peek()? {
            None => Ok(()),
            Some(b'\n') => {
                self.scanner.next_byte()?;
                Ok(())
            }
            found => Err(self.scanner.unexpected(found, "end of line")),
        }
    }
}

impl<R: BufRead> Iterator for Lexer<R> {
    type Item = Result<(Position, MetricToken), ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let token = self.next_token().transpose();
        if !matches!(token, Some(Ok(_))) {
            self.done = true;
        }
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    fn tokens(input: &str) -> Result<Vec<MetricToken>, ParseError> {
        Lexer::new(input.as_bytes())
            .map(|token| token.map(|(_, token)| token))
            .collect()
    }

    fn sample(input: &str) -> Sample {
        match tokens(input).expect("lexes").pop() {
            Some(MetricToken::Metric(sample)) => sample,
            other => panic!("expected a sample, got {:?}", other),
        }
    }

    fn error(input: &str) -> ParseError {
        tokens(input).expect_err("shouldn't lex")
    }

    #[test]
    fn classifies_lines() {
        let tokens = tokens(indoc! {r#"
            # HELP a some help
            # TYPE a gauge

            # just a comment
            #
            a 1
        "#})
        .expect("lexes");

        assert!(matches!(
            &tokens[0],
            MetricToken::Descriptor(MetricDescriptor::Help { metric_name, help_text })
                if metric_name == "a" && help_text == "some help"
        ));
        assert!(matches!(
            &tokens[1],
            MetricToken::Descriptor(MetricDescriptor::Type {
                metric_type: MetricType::Gauge,
                ..
            })
        ));
        assert!(matches!(tokens[2], MetricToken::Empty));
        assert!(matches!(tokens[3], MetricToken::Comment));
        assert!(matches!(tokens[4], MetricToken::Comment));
        assert!(matches!(tokens[5], MetricToken::Metric(_)));
        assert_eq!(6, tokens.len());
    }

    #[test]
    fn blank_and_tab_only_lines_are_empty() {
        let tokens = tokens("a 1\n   \n\t\n \t a 2\n  ").expect("lexes");

        assert!(matches!(tokens[0], MetricToken::Metric(_)));
        assert!(matches!(tokens[1], MetricToken::Empty));
        assert!(matches!(tokens[2], MetricToken::Empty));
        assert!(matches!(&tokens[3], MetricToken::Metric(sample) if sample.number == 2.));
        assert_eq!(4, tokens.len());
    }

    #[test]
    fn directive_lookalikes_are_comments() {
        let tokens = tokens("# TYPEWRITER\n# TYPE1 x\n# HELP_ME please\n# TYPE a gauge\n")
            .expect("lexes");

        assert!(matches!(tokens[0], MetricToken::Comment));
        assert!(matches!(tokens[1], MetricToken::Comment));
        assert!(matches!(tokens[2], MetricToken::Comment));
        assert!(matches!(tokens[3], MetricToken::Descriptor(_)));
    }

    #[test]
    fn help_text_is_verbatim() {
        let tokens = tokens("# HELP a  two  spaces \\n kept\n# HELP b\n").expect("lexes");

        assert!(matches!(
            &tokens[0],
            MetricToken::Descriptor(MetricDescriptor::Help { help_text, .. })
                if help_text == r" two  spaces \n kept"
        ));
        assert!(matches!(
            &tokens[1],
            MetricToken::Descriptor(MetricDescriptor::Help { help_text, .. }) if help_text.is_empty()
        ));
    }

    #[test]
    fn parses_a_full_sample() {
        let sample =
            sample(r#"http_requests_total{method="GET",code="200"} 1027 1395066363000"#);

        assert_eq!("http_requests_total", sample.name);
        assert_eq!(
            vec![
                Label {
                    name: "method".into(),
                    value: "GET".into()
                },
                Label {
                    name: "code".into(),
                    value: "200".into()
                },
            ],
            sample.labels
        );
        assert_eq!(1027., sample.number);
        assert_eq!(Some(1395066363000), sample.timestamp);
    }

    #[test]
    fn parses_bare_samples() {
        let bare = sample("up 1\n");
        assert!(bare.labels.is_empty());
        assert_eq!(None, bare.timestamp);

        let empty_braces = sample("up{} NaN");
        assert!(empty_braces.labels.is_empty());
        assert!(empty_braces.number.is_nan());
    }

    #[test]
    fn unescapes_label_values() {
        let sample = sample(r#"a{path="C:\\dir",quote="say \"hi\"",nl="x\ny",brace="}{,"} 1"#);

        let values = sample.labels.iter().map(|l| l.value.as_str()).collect::<Vec<_>>();
        assert_eq!(vec![r"C:\dir", r#"say "hi""#, "x\ny", "}{,"], values);
    }

    #[test]
    fn reports_where_errors_happen() {
        let err = error("a 1\nb{x=\"1\",x=\"2\"} 1\n");

        assert!(matches!(err.kind(), ErrorKind::DuplicateLabelName(name) if name == "x"));
        assert_eq!(2, err.line());
        assert_eq!(12, err.offset());
    }

    #[test]
    fn rejects_malformed_lines() {
        let tests = [
            ("#HELP a b", "UnexpectedByte"),
            ("# HELP\n", "UnexpectedByte"),
            ("# HELP 0a text", "UnexpectedByte"),
            ("# TYPE a", "UnexpectedByte"),
            ("# TYPE a Counter", "UnknownMetricType"),
            ("# TYPE a counter extra", "UnexpectedByte"),
            ("1a 1", "UnexpectedByte"),
            ("a", "UnexpectedByte"),
            ("a{b=\"c\" 1", "UnexpectedByte"),
            ("a{b=\"c\",} 1", "UnexpectedByte"),
            ("a{b=c} 1", "UnexpectedByte"),
            ("a{b=\"c\"}1", "UnexpectedByte"),
            ("a{b=\"c", "UnterminatedLabelValue"),
            ("a{b=\"c\n\"} 1", "UnterminatedLabelValue"),
            ("a{b=\"c\\", "UnterminatedLabelValue"),
            ("a{b=\"\\t\"} 1", "UnterminatedLabelValue"),
            ("a{b=\"1\",b=\"1\"} 1", "DuplicateLabelName"),
            ("a  1", "InvalidNumberLiteral"),
            ("a ", "InvalidNumberLiteral"),
            ("a one", "InvalidNumberLiteral"),
            ("a inf", "InvalidNumberLiteral"),
            ("a 1 1.5", "InvalidTimestamp"),
            ("a 1 ", "InvalidTimestamp"),
            ("a 1 2 3", "UnexpectedByte"),
            ("a 1 2\t", "InvalidTimestamp"),
        ];

        for (input, expected) in tests {
            assert_eq!(expected, error(input).kind().name(), "while lexing {:?}", input);
        }
    }

    #[test]
    fn rejects_invalid_utf8() {
        let err = Lexer::new(&b"a{b=\"\xff\"} 1"[..])
            .collect::<Result<Vec<_>, _>>()
            .expect_err("invalid utf-8");

        assert!(matches!(err.kind(), ErrorKind::InvalidUtf8));
    }

    #[test]
    fn stops_after_the_first_error() {
        let mut lexer = Lexer::new(&b"a{ 1\nb 2\n"[..]);

        assert!(matches!(lexer.next(), Some(Err(_))));
        assert!(lexer.next().is_none());
    }
}

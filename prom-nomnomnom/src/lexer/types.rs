#[allow(unused)]
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

use std::{borrow::Cow, str::FromStr};

use lazy_static::lazy_static;
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{digit0, digit1, one_of},
    combinator::{all_consuming, map_res, opt, recognize, value},
    sequence::{pair, preceded, tuple},
    IResult,
};
use regex::Regex;
use serde::Serializer;

lazy_static! {
    // A backslash and whatever follows it, if anything
    static ref ESCAPE_RE: Regex = Regex::new(r"(?s)\\.?").unwrap();
}

/// ```abnf
/// metricname-initial-char = ALPHA / "_" / ":"
/// ```
pub(super) fn is_name_initial_char(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':'
}

/// ```abnf
/// metricname-char = metricname-initial-char / DIGIT
/// ```
pub(super) fn is_name_char(b: u8) -> bool {
    is_name_initial_char(b) || b.is_ascii_digit()
}

/// ```abnf
/// decimal = [sign] (1*DIGIT ["." *DIGIT] / "." 1*DIGIT) [("e" / "E") [sign] 1*DIGIT]
/// ```
fn decimal(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        opt(one_of("+-")),
        alt((
            recognize(pair(digit1, opt(pair(tag("."), digit0)))),
            recognize(pair(tag("."), digit1)),
        )),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input)
}

/// ```abnf
/// value = decimal / ["+"] "Inf" / "-Inf" / "NaN"
/// ```
fn floatlike(input: &str) -> IResult<&str, f64> {
    alt((
        value(f64::NAN, tag("NaN")),
        value(f64::NEG_INFINITY, tag("-Inf")),
        value(f64::INFINITY, preceded(opt(tag("+")), tag("Inf"))),
        map_res(decimal, f64::from_str),
    ))(input)
}

fn integer(input: &str) -> IResult<&str, i64> {
    nom::character::complete::i64(input)
}

/// Decodes a whole token as a sample value.  The sentinels are case sensitive.
#[tracing::instrument(level = "trace")]
pub(crate) fn parse_number(token: &str) -> Option<f64> {
    all_consuming(floatlike)(token).ok().map(|(_, n)| n)
}

/// Decodes a whole token as a millisecond timestamp.
pub(super) fn parse_timestamp(token: &str) -> Option<i64> {
    all_consuming(integer)(token).ok().map(|(_, t)| t)
}

/// Decodes the text between a label value's quotes.  Only `\\`, `\"` and `\n` are understood,
/// anything else is rejected.
pub(super) fn unescape_label_value(raw: &str) -> Option<Cow<'_, str>> {
    if !raw.contains('\\') {
        return Some(Cow::Borrowed(raw));
    }

    let mut unescaped = String::with_capacity(raw.len());
    let mut last = 0;

    for escape in ESCAPE_RE.find_iter(raw) {
        unescaped.push_str(&raw[last..escape.start()]);
        match escape.as_str() {
            r"\\" => unescaped.push('\\'),
            r#"\""# => unescaped.push('"'),
            r"\n" => unescaped.push('\n'),
            other => {
                debug!(escape = other, "unknown escape");
                return None;
            }
        }
        last = escape.end();
    }
    unescaped.push_str(&raw[last..]);

    Some(Cow::Owned(unescaped))
}

/// Exposition style floats: non-finite values become the strings `NaN`, `+Inf` and `-Inf`.
pub(crate) fn serialize_float<S>(n: &f64, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if n.is_nan() {
        s.serialize_str("NaN")
    } else if n.is_infinite() && n.is_sign_positive() {
        s.serialize_str("+Inf")
    } else if n.is_infinite() && n.is_sign_negative() {
        s.serialize_str("-Inf")
    } else {
        s.serialize_f64(*n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_sentinels() {
        assert_eq!(Some(f64::INFINITY), parse_number("+Inf"));
        assert_eq!(Some(f64::INFINITY), parse_number("Inf"));
        assert_eq!(Some(f64::NEG_INFINITY), parse_number("-Inf"));
        assert!(parse_number("NaN").expect("NaN").is_nan());
    }

    #[test]
    fn decodes_decimals() {
        let tests = [
            ("0", 0.),
            ("1027", 1027.),
            ("-1", -1.),
            ("+1.5", 1.5),
            ("1.", 1.),
            (".5", 0.5),
            ("1e3", 1000.),
            ("1.5E-3", 0.0015),
            ("-2.5e+2", -250.),
            ("007", 7.),
            ("1e400", f64::INFINITY),
        ];

        for (input, expected) in tests {
            assert_eq!(Some(expected), parse_number(input), "while decoding {}", input);
        }
    }

    #[test]
    fn rejects_everything_else() {
        for input in [
            "", "inf", "+inf", "nan", "NAN", "Infinity", "-NaN", "+NaN", "1e", "1e+", ".", "+",
            "+-1", "0x10", "1_000", "1,5", "1.5.", " 1", "1 ",
        ] {
            assert_eq!(None, parse_number(input), "while decoding {:?}", input);
        }
    }

    #[test]
    fn decodes_timestamps() {
        assert_eq!(Some(1395066363000), parse_timestamp("1395066363000"));
        assert_eq!(Some(-5), parse_timestamp("-5"));
        assert_eq!(None, parse_timestamp("1.5"));
        assert_eq!(None, parse_timestamp("1e3"));
        assert_eq!(None, parse_timestamp("99999999999999999999"));
        assert_eq!(None, parse_timestamp(""));
    }

    #[test]
    fn unescapes_label_values() {
        assert_eq!(Some(Cow::Borrowed("plain")), unescape_label_value("plain"));
        assert_eq!(
            Some("a\\b\"c\nd".to_string()),
            unescape_label_value(r#"a\\b\"c\nd"#).map(Cow::into_owned)
        );
        assert_eq!(
            Some(r"\n".to_string()),
            unescape_label_value(r"\\n").map(Cow::into_owned)
        );
    }

    #[test]
    fn rejects_unknown_escapes() {
        assert_eq!(None, unescape_label_value(r"\t"));
        assert_eq!(None, unescape_label_value(r"trailing\"));
    }

    #[test]
    fn name_characters() {
        assert!(is_name_initial_char(b':'));
        assert!(is_name_initial_char(b'_'));
        assert!(!is_name_initial_char(b'1'));
        assert!(is_name_char(b'1'));
        assert!(!is_name_char(b'-'));
    }
}

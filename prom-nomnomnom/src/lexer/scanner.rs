#[allow(unused)]
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

use std::io::{self, BufRead};

use serde_derive::Serialize;

use crate::{ErrorKind, ParseError};

/// A spot in the exposition stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Position {
    /// 1-based line number
    pub line: usize,
    /// Bytes consumed before this spot
    pub offset: u64,
}

impl Default for Position {
    fn default() -> Self {
        Self { line: 1, offset: 0 }
    }
}

/// Forward-only reader over a [`BufRead`] with a single byte of lookahead.
///
/// Nothing is pulled from the underlying reader beyond what its own buffer already holds, and
/// the lexer never touches the reader except through this type.
pub struct Scanner<R> {
    inner: R,
    position: Position,
}

impl<R: BufRead> Scanner<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            position: Position::default(),
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    /// Builds an error located at the current position
    pub fn error(&self, kind: ErrorKind) -> ParseError {
        ParseError::new(kind, self.position)
    }

    pub fn unexpected(&self, found: Option<u8>, expected: &'static str) -> ParseError {
        self.error(ErrorKind::UnexpectedByte { found, expected })
    }

    // Interrupted reads are retried, same as std::io does.
    fn buffer(&mut self) -> Result<&[u8], ParseError> {
        let position = self.position;
        loop {
            match self.inner.fill_buf() {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ParseError::io(e, position)),
            }
        }

        self.inner
            .fill_buf()
            .map_err(|e| ParseError::io(e, position))
    }

    fn consume(&mut self, amount: usize, newlines: usize) {
        self.inner.consume(amount);
        self.position.offset += amount as u64;
        self.position.line += newlines;
    }

    pub fn peek(&mut self) -> Result<Option<u8>, ParseError> {
        Ok(self.buffer()?.first().copied())
    }

    pub fn next_byte(&mut self) -> Result<Option<u8>, ParseError> {
        let byte = self.peek()?;
        if let Some(b) = byte {
            self.consume(1, usize::from(b == b'\n'));
        }
        Ok(byte)
    }

    pub fn at_end(&mut self) -> Result<bool, ParseError> {
        Ok(self.buffer()?.is_empty())
    }

    /// Consumes `byte` or fails without consuming anything.
    pub fn expect(&mut self, byte: u8, expected: &'static str) -> Result<(), ParseError> {
        match self.peek()? {
            Some(b) if b == byte => {
                self.consume(1, usize::from(b == b'\n'));
                Ok(())
            }
            found => Err(self.unexpected(found, expected)),
        }
    }

    /// Consumes bytes for as long as `predicate` holds and returns them.
    pub fn read_while<P>(&mut self, mut predicate: P) -> Result<Vec<u8>, ParseError>
    where
        P: FnMut(u8) -> bool,
    {
        let mut out = Vec::new();

        loop {
            let (taken, newlines, exhausted) = {
                let buf = self.buffer()?;
                if buf.is_empty() {
                    break;
                }

                let taken = buf
                    .iter()
                    .position(|&b| !predicate(b))
                    .unwrap_or(buf.len());
                let newlines = buf[..taken].iter().filter(|&&b| b == b'\n').count();
                out.extend_from_slice(&buf[..taken]);

                (taken, newlines, taken == buf.len())
            };

            self.consume(taken, newlines);

            if !exhausted {
                break;
            }
        }

        trace!(len = out.len(), "read");
        Ok(out)
    }

    /// Consumes bytes up to, but not including, the first byte found in `stop`.
    pub fn read_until(&mut self, stop: &[u8]) -> Result<Vec<u8>, ParseError> {
        self.read_while(|b| !stop.contains(&b))
    }

    /// Throws away the rest of the current line, newline included.
    pub fn skip_line(&mut self) -> Result<(), ParseError> {
        self.read_until(b"\n")?;
        self.next_byte()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{BufReader, Read};

    /// Serves `data` one byte per read, after first failing with `kind` `failures` times.
    struct Flaky {
        data: &'static [u8],
        kind: io::ErrorKind,
        failures: usize,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::new(self.kind, "flaky"));
            }

            match self.data.split_first() {
                Some((first, rest)) if !buf.is_empty() => {
                    buf[0] = *first;
                    self.data = rest;
                    Ok(1)
                }
                _ => Ok(0),
            }
        }
    }

    #[test]
    fn peek_does_not_consume() -> Result<(), ParseError> {
        let mut scanner = Scanner::new(&b"ab"[..]);

        assert_eq!(Some(b'a'), scanner.peek()?);
        assert_eq!(Some(b'a'), scanner.peek()?);
        assert_eq!(Some(b'a'), scanner.next_byte()?);
        assert_eq!(Some(b'b'), scanner.next_byte()?);
        assert_eq!(None, scanner.next_byte()?);
        assert!(scanner.at_end()?);
        Ok(())
    }

    #[test]
    fn tracks_lines_and_offsets() -> Result<(), ParseError> {
        let mut scanner = Scanner::new(&b"one\ntwo\nthree"[..]);

        scanner.skip_line()?;
        assert_eq!(Position { line: 2, offset: 4 }, scanner.position());

        assert_eq!(b"tw".to_vec(), scanner.read_until(b"o")?);
        scanner.read_while(|_| true)?;
        assert_eq!(Position { line: 3, offset: 13 }, scanner.position());
        Ok(())
    }

    #[test]
    fn reads_across_buffer_boundaries() -> Result<(), ParseError> {
        let reader = BufReader::with_capacity(
            2,
            Flaky {
                data: b"metric_name{",
                kind: io::ErrorKind::Other,
                failures: 0,
            },
        );
        let mut scanner = Scanner::new(reader);

        assert_eq!(b"metric_name".to_vec(), scanner.read_until(b"{")?);
        assert_eq!(Some(b'{'), scanner.next_byte()?);
        assert!(scanner.at_end()?);
        Ok(())
    }

    #[test]
    fn expect_leaves_the_stream_alone_on_mismatch() -> Result<(), ParseError> {
        let mut scanner = Scanner::new(&b"x"[..]);

        let err = scanner.expect(b' ', "space").unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::UnexpectedByte {
                found: Some(b'x'),
                ..
            }
        ));
        assert_eq!(0, err.offset());
        assert_eq!(Some(b'x'), scanner.peek()?);
        Ok(())
    }

    #[test]
    fn retries_interrupted_reads() -> Result<(), ParseError> {
        let reader = BufReader::new(Flaky {
            data: b"a",
            kind: io::ErrorKind::Interrupted,
            failures: 3,
        });
        let mut scanner = Scanner::new(reader);

        assert_eq!(Some(b'a'), scanner.next_byte()?);
        Ok(())
    }

    #[test]
    fn passes_read_errors_through() {
        let reader = BufReader::new(Flaky {
            data: b"",
            kind: io::ErrorKind::BrokenPipe,
            failures: 1,
        });
        let mut scanner = Scanner::new(reader);

        match scanner.peek().unwrap_err().into_kind() {
            ErrorKind::IoFailure(e) => assert_eq!(io::ErrorKind::BrokenPipe, e.kind()),
            other => panic!("expected IoFailure, got {:?}", other),
        }
    }

    #[test]
    fn timeouts_are_cancellations() {
        let reader = BufReader::new(Flaky {
            data: b"",
            kind: io::ErrorKind::TimedOut,
            failures: 1,
        });
        let mut scanner = Scanner::new(reader);

        assert!(matches!(
            scanner.peek().unwrap_err().kind(),
            ErrorKind::Cancelled(_)
        ));
    }
}

//! implements a parser for beanstalkd responses, as seen by a client.
use std::fmt;

use crate::types::protocol::BeanstalkResponse;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownResponse,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownResponse => "unknown response",
        })
    }
}

impl std::error::Error for ParsingError {}

/// Provides a custom, minimal, zero-copy parser of byte slices.
struct ParseState<'a> {
    from: &'a [u8],
}

impl<'a> ParseState<'a> {
    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.from.is_empty() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&'a [u8], ParsingError> {
        match self.next_token() {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes from the input, expecting a space then a decimal number that
    /// fits in a `T`.
    fn expect_next_number<T: TryFrom<u64>>(&mut self) -> Result<T, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        let mut r = 0u64;
        for v in token {
            match v {
                b'0'..=b'9' => {
                    r = r
                        .checked_mul(10)
                        .and_then(|r| r.checked_add((*v - b'0') as u64))
                        .ok_or(ParsingError::BadFormat)?
                },
                _ => return Err(ParsingError::BadFormat),
            };
        }

        T::try_from(r).map_err(|_| ParsingError::BadFormat)
    }

    /// Consumes from the input, expecting a space then a tube name. The server
    /// is trusted to send valid names, so only emptiness is checked.
    fn expect_next_name(&mut self) -> Result<Vec<u8>, ParsingError> {
        self.expect_space()?;

        Ok(self.expect_next_token()?.to_vec())
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.first() {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes from this ParseState until reaching a space byte or the end of
    /// the input. It returns None at the end of the input. On consecutive space
    /// bytes, it returns a zero-length slice.
    fn next_token(&mut self) -> Option<&'a [u8]> {
        if self.from.is_empty() {
            return None;
        }

        let from = self.from;
        let idx = from.iter().position(|c| *c == b' ').unwrap_or(from.len());

        let (token, rest) = from.split_at(idx);
        self.from = rest;

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

// Parsing is implemented to fulfil the TryFrom trait. The input is a single
// response line without its CRLF.
impl TryFrom<&[u8]> for BeanstalkResponse {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use BeanstalkResponse::*;

        let mut ps: ParseState = value.into();

        let resp = match ps.expect_next_token()? {
            // <resp>
            b"OUT_OF_MEMORY" => OutOfMemory,
            b"INTERNAL_ERROR" => InternalError,
            b"BAD_FORMAT" => BadFormat,
            b"UNKNOWN_COMMAND" => UnknownCommand,
            b"EXPECTED_CRLF" => ExpectedCRLF,
            b"JOB_TOO_BIG" => JobTooBig,
            b"DRAINING" => Draining,
            b"DEADLINE_SOON" => DeadlineSoon,
            b"TIMED_OUT" => TimedOut,
            b"DELETED" => Deleted,
            b"NOT_FOUND" => NotFound,
            b"NOT_IGNORED" => NotIgnored,

            // BURIED is sent bare in reply to `bury`, and with an ID in reply
            // to `put`.
            b"BURIED" if ps.from.is_empty() => Buried,
            b"BURIED" => BuriedID {
                id: ps.expect_next_number()?,
            },

            // <resp> <id>
            b"INSERTED" => Inserted {
                id: ps.expect_next_number()?,
            },

            // <resp> <count>
            b"WATCHING" => Watching {
                count: ps.expect_next_number()?,
            },
            b"OK" => Ok {
                n_bytes: ps.expect_next_number()?,
            },

            // <resp> <tube>
            b"USING" => Using {
                tube: ps.expect_next_name()?,
            },

            // <resp> <id> <bytes>
            b"RESERVED" => Reserved {
                id: ps.expect_next_number()?,
                n_bytes: ps.expect_next_number()?,
            },

            _ => return Err(ParsingError::UnknownResponse),
        };

        ps.expect_done_and(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        use BeanstalkResponse::*;

        const U32_MAX_PLUS_1: u64 = 1 << 32;

        // Asserts the line parses into the given response successfully.
        #[track_caller]
        fn ok(line: &[u8], res: BeanstalkResponse) {
            assert_eq!(line.try_into(), Result::Ok(res));
        }

        // Asserts the line fails to parse with a BadFormat error.
        #[track_caller]
        fn bf(line: &[u8]) {
            assert_eq!(
                TryInto::<BeanstalkResponse>::try_into(line),
                Err(ParsingError::BadFormat)
            );
        }

        // Asserts the line fails to parse with an UnknownResponse error.
        #[track_caller]
        fn ur(line: &[u8]) {
            assert_eq!(
                TryInto::<BeanstalkResponse>::try_into(line),
                Err(ParsingError::UnknownResponse)
            );
        }

        bf(b"");
        bf(b" ");
        ur(b"HELLO");
        ur(b"inserted 1");

        ok(b"INSERTED 42", Inserted { id: 42 });
        bf(b"INSERTED");
        bf(b"INSERTED abc");
        bf(b"INSERTED 1 2");
        bf(b"INSERTED 99999999999999999999999");

        ok(b"BURIED", Buried);
        ok(b"BURIED 9", BuriedID { id: 9 });
        bf(b"BURIED ");

        ok(
            b"RESERVED 12 345",
            Reserved {
                id: 12,
                n_bytes: 345,
            },
        );
        bf(b"RESERVED 12");
        bf(format!("RESERVED 1 {U32_MAX_PLUS_1}").as_bytes());

        ok(b"OK 120", Ok { n_bytes: 120 });
        ok(b"WATCHING 2", Watching { count: 2 });
        ok(
            b"USING emails",
            Using {
                tube: b"emails".to_vec(),
            },
        );
        bf(b"USING");

        ok(b"TIMED_OUT", TimedOut);
        ok(b"DEADLINE_SOON", DeadlineSoon);
        ok(b"DELETED", Deleted);
        ok(b"NOT_FOUND", NotFound);
        ok(b"NOT_IGNORED", NotIgnored);
        ok(b"JOB_TOO_BIG", JobTooBig);
        ok(b"EXPECTED_CRLF", ExpectedCRLF);
        ok(b"DRAINING", Draining);
        ok(b"OUT_OF_MEMORY", OutOfMemory);
        ok(b"INTERNAL_ERROR", InternalError);
        ok(b"BAD_FORMAT", BadFormat);
        ok(b"UNKNOWN_COMMAND", UnknownCommand);
        bf(b"DELETED now");
    }
}

//! Request decoding.
//!
//! A request is a run of `TAG=value` fields separated by `,` and closed by
//! `;`. The decoder is a small state machine driven one byte at a time by
//! [`Decoder::step`]; [`read_request`] feeds it from a buffered reader.

use crate::codec::Unescaper;
use std::io::{self, BufRead};
use thiserror::Error;

/// Capacity of the value scratch buffer.
pub const SCRATCH_CAPACITY: usize = 8 * 1024;
pub const ID_CAPACITY: usize = 63;
pub const FINGERPRINT_CAPACITY: usize = 32;
pub const QUERY_CAPACITY: usize = SCRATCH_CAPACITY - 1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Request {
    pub id: Vec<u8>,
    pub fingerprint: Vec<u8>,
    pub query: Vec<u8>,
    pub compression: i32,
}

impl Request {
    /// A request built from a statement given on the command line.
    pub fn single_shot(query: &str) -> Self {
        Self {
            query: query.as_bytes().to_vec(),
            ..Self::default()
        }
    }

    pub fn compression_requested(&self) -> bool {
        self.compression != 0
    }

    /// The statement text with leading whitespace and control bytes removed.
    pub fn statement(&self) -> &[u8] {
        let start = self
            .query
            .iter()
            .position(|&b| b > b' ')
            .unwrap_or(self.query.len());
        &self.query[start..]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    Id,
    Fingerprint,
    Compression,
    Query,
}

impl Field {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'I' => Some(Field::Id),
            b'M' => Some(Field::Fingerprint),
            b'Z' => Some(Field::Compression),
            b'S' => Some(Field::Query),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown field tag {0:?}")]
    UnknownTag(char),
    #[error("empty field tag")]
    EmptyTag,
    #[error("value without a field tag")]
    MissingTag,
    #[error("field value exceeds the 8192 byte scratch buffer")]
    Overflow,
    #[error("input closed")]
    Closed,
    #[error("end of input before the request was terminated")]
    UnexpectedEof,
    #[error("failed to read request: {0}")]
    Io(#[from] io::Error),
}

impl DecodeError {
    /// Input closed between requests, which is how a client hangs up.
    /// Everything else, including input ending mid-request, is malformed.
    pub fn is_eof(&self) -> bool {
        matches!(self, DecodeError::Closed)
    }
}

/// Unquoted state the decoder returns to when a quoted run closes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unquoted {
    SeekTag,
    SeekValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Accumulating a field name up to `=`.
    SeekTag,
    /// Accumulating an unquoted value up to `,` or `;`.
    SeekValue,
    /// Inside `"..."`, unescaping `%XX`.
    InQuotedValue { resume: Unquoted, escape: Unescaper },
    Complete,
    Failed,
}

impl From<Unquoted> for State {
    fn from(state: Unquoted) -> Self {
        match state {
            Unquoted::SeekTag => State::SeekTag,
            Unquoted::SeekValue => State::SeekValue,
        }
    }
}

/// Outcome of feeding one byte.
#[derive(Debug)]
pub enum Step {
    Continue,
    Complete(Request),
    Failed(DecodeError),
}

#[derive(Debug)]
pub struct Decoder {
    state: State,
    field: Option<Field>,
    scratch: Vec<u8>,
    request: Request,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: State::SeekTag,
            field: None,
            scratch: Vec::with_capacity(256),
            request: Request::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The single transition function.
    pub fn step(&mut self, byte: u8) -> Step {
        match self.state {
            State::Complete | State::Failed => Step::Continue,
            State::InQuotedValue { resume, mut escape } => {
                if !escape.is_pending() && byte == b'"' {
                    self.state = resume.into();
                    return Step::Continue;
                }
                let decoded = escape.push(byte);
                self.state = State::InQuotedValue { resume, escape };
                match decoded {
                    Some(value) => self.accumulate(value),
                    None => Step::Continue,
                }
            }
            State::SeekTag | State::SeekValue => match byte {
                b'=' => self.begin_value(),
                b',' | b';' => self.end_field(byte == b';'),
                b'"' => {
                    let resume = if self.state == State::SeekTag {
                        Unquoted::SeekTag
                    } else {
                        Unquoted::SeekValue
                    };
                    self.state = State::InQuotedValue {
                        resume,
                        escape: Unescaper::Plain,
                    };
                    Step::Continue
                }
                b if b.is_ascii_alphanumeric() => self.accumulate(b),
                _ => Step::Continue,
            },
        }
    }

    /// Called when the input ends; any request still open is a failure.
    pub fn finish(&mut self) -> DecodeError {
        self.state = State::Failed;
        DecodeError::UnexpectedEof
    }

    fn fail(&mut self, err: DecodeError) -> Step {
        self.state = State::Failed;
        Step::Failed(err)
    }

    fn accumulate(&mut self, byte: u8) -> Step {
        if self.scratch.len() >= SCRATCH_CAPACITY {
            return self.fail(DecodeError::Overflow);
        }
        self.scratch.push(byte);
        Step::Continue
    }

    fn begin_value(&mut self) -> Step {
        let Some(&tag) = self.scratch.first() else {
            return self.fail(DecodeError::EmptyTag);
        };
        let Some(field) = Field::from_tag(tag) else {
            return self.fail(DecodeError::UnknownTag(char::from(tag)));
        };
        self.field = Some(field);
        self.scratch.clear();
        self.state = State::SeekValue;
        Step::Continue
    }

    fn end_field(&mut self, last: bool) -> Step {
        let Some(field) = self.field else {
            return self.fail(DecodeError::MissingTag);
        };
        let value = &self.scratch;
        match field {
            Field::Id => self.request.id = clamp(value, ID_CAPACITY),
            Field::Fingerprint => self.request.fingerprint = clamp(value, FINGERPRINT_CAPACITY),
            Field::Query => self.request.query = clamp(value, QUERY_CAPACITY),
            Field::Compression => self.request.compression = parse_int(value),
        }
        self.scratch.clear();
        if last {
            self.state = State::Complete;
            Step::Complete(std::mem::take(&mut self.request))
        } else {
            self.state = State::SeekTag;
            Step::Continue
        }
    }
}

fn clamp(value: &[u8], capacity: usize) -> Vec<u8> {
    value[..value.len().min(capacity)].to_vec()
}

/// Lenient integer parse: optional whitespace and sign, then leading digits.
/// Anything unparseable is 0; out-of-range values saturate.
pub fn parse_int(value: &[u8]) -> i32 {
    let mut bytes = value
        .iter()
        .copied()
        .skip_while(|b| b.is_ascii_whitespace())
        .peekable();
    let negative = match bytes.peek() {
        Some(b'-') => {
            bytes.next();
            true
        }
        Some(b'+') => {
            bytes.next();
            false
        }
        _ => false,
    };
    let mut total: i64 = 0;
    for digit in bytes.take_while(u8::is_ascii_digit) {
        total = (total * 10 + i64::from(digit - b'0')).min(i64::from(i32::MAX) + 1);
    }
    let signed = if negative { -total } else { total };
    signed.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Reads one request from `reader`.
///
/// Bytes after the terminating `;` stay in the reader for the next call.
pub fn read_request<R: BufRead>(reader: &mut R) -> Result<Request, DecodeError> {
    let mut decoder = Decoder::new();
    let mut started = false;
    loop {
        let available = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(DecodeError::Io(err)),
        };
        if available.is_empty() {
            if !started {
                return Err(DecodeError::Closed);
            }
            return Err(decoder.finish());
        }
        let mut consumed = 0;
        let mut outcome = None;
        for &byte in available {
            consumed += 1;
            started |= !byte.is_ascii_whitespace();
            match decoder.step(byte) {
                Step::Continue => {}
                Step::Complete(request) => {
                    outcome = Some(Ok(request));
                    break;
                }
                Step::Failed(err) => {
                    outcome = Some(Err(err));
                    break;
                }
            }
        }
        reader.consume(consumed);
        if let Some(outcome) = outcome {
            return outcome;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(input: &[u8]) -> Result<Request, DecodeError> {
        let mut reader = input;
        read_request(&mut reader)
    }

    #[test]
    fn decodes_quoted_and_unquoted_fields() {
        let request =
            decode(br#"I="req1",M=0123abcd,Z=1,S="select 1 as x";"#).expect("request");
        assert_eq!(request.id, b"req1");
        assert_eq!(request.fingerprint, b"0123abcd");
        assert_eq!(request.compression, 1);
        assert!(request.compression_requested());
        assert_eq!(request.query, b"select 1 as x");
    }

    #[test]
    fn fields_default_to_empty() {
        let request = decode(br#"S="select 1";"#).expect("request");
        assert!(request.id.is_empty());
        assert!(request.fingerprint.is_empty());
        assert_eq!(request.compression, 0);
        assert!(!request.compression_requested());
    }

    #[test]
    fn quoted_values_are_unescaped() {
        let request = decode(br#"S="select 'a%2Cb' %3B%22";"#).expect("request");
        assert_eq!(request.query, b"select 'a,b' ;\"");
    }

    #[test]
    fn invalid_escape_digits_decode_as_zero() {
        let request = decode(br#"I="%zz",S="x";"#).expect("request");
        assert_eq!(request.id, vec![0u8]);
    }

    #[test]
    fn unquoted_values_keep_only_alphanumerics() {
        let request = decode(b"I=ab-c d,S=q;").expect("request");
        assert_eq!(request.id, b"abcd");
    }

    #[test]
    fn missing_terminator_is_a_failure() {
        let err = decode(br#"S="select 1""#).expect_err("no terminator");
        assert!(matches!(err, DecodeError::UnexpectedEof));
        assert!(!err.is_eof());
    }

    #[test]
    fn unterminated_quote_is_a_failure() {
        let err = decode(br#"S="select 1;"#).expect_err("open quote");
        assert!(matches!(err, DecodeError::UnexpectedEof));
    }

    #[test]
    fn unknown_tag_fails() {
        let err = decode(br#"X="1";"#).expect_err("unknown tag");
        assert!(matches!(err, DecodeError::UnknownTag('X')));
    }

    #[test]
    fn tags_are_case_sensitive() {
        let err = decode(br#"s="select 1";"#).expect_err("lowercase tag");
        assert!(matches!(err, DecodeError::UnknownTag('s')));
    }

    #[test]
    fn empty_tag_fails() {
        assert!(matches!(decode(b"=1;"), Err(DecodeError::EmptyTag)));
    }

    #[test]
    fn separator_without_tag_fails() {
        assert!(matches!(decode(b";"), Err(DecodeError::MissingTag)));
        assert!(matches!(decode(b"abc,"), Err(DecodeError::MissingTag)));
    }

    #[test]
    fn tag_uses_first_character_only() {
        let request = decode(br#"SQL="select 2";"#).expect("request");
        assert_eq!(request.query, b"select 2");
    }

    #[test]
    fn bare_value_after_comma_goes_to_previous_field() {
        let request = decode(b"I=first,second;").expect("request");
        assert_eq!(request.id, b"second");
    }

    #[test]
    fn overflowing_scratch_buffer_fails() {
        let mut input = b"S=\"".to_vec();
        input.extend(std::iter::repeat_n(b'a', SCRATCH_CAPACITY + 1));
        input.extend_from_slice(b"\";");
        assert!(matches!(decode(&input), Err(DecodeError::Overflow)));
    }

    #[test]
    fn values_are_clamped_to_field_capacity() {
        let mut input = b"I=\"".to_vec();
        input.extend(std::iter::repeat_n(b'i', 100));
        input.extend_from_slice(b"\",M=\"");
        input.extend(std::iter::repeat_n(b'f', 40));
        input.extend_from_slice(b"\",S=\"");
        input.extend(std::iter::repeat_n(b'q', SCRATCH_CAPACITY));
        input.extend_from_slice(b"\";");
        let request = decode(&input).expect("request");
        assert_eq!(request.id.len(), ID_CAPACITY);
        assert_eq!(request.fingerprint.len(), FINGERPRINT_CAPACITY);
        assert_eq!(request.query.len(), QUERY_CAPACITY);
    }

    #[test]
    fn compression_hint_parses_like_atoi() {
        assert_eq!(parse_int(b"9"), 9);
        assert_eq!(parse_int(b"  -3x"), -3);
        assert_eq!(parse_int(b"+7"), 7);
        assert_eq!(parse_int(b"abc"), 0);
        assert_eq!(parse_int(b""), 0);
        assert_eq!(parse_int(b"99999999999"), i32::MAX);
        assert_eq!(parse_int(b"-99999999999"), i32::MIN);
    }

    #[test]
    fn consecutive_requests_share_a_reader() {
        let mut reader: &[u8] = br#"I=a,S="one";I=b,S="two";"#;
        let first = read_request(&mut reader).expect("first");
        let second = read_request(&mut reader).expect("second");
        assert_eq!(first.id, b"a");
        assert_eq!(second.query, b"two");
        assert!(read_request(&mut reader).expect_err("drained").is_eof());
    }

    #[test]
    fn trailing_whitespace_is_a_clean_close() {
        let mut reader: &[u8] = b"S=\"one\";\r\n";
        read_request(&mut reader).expect("request");
        assert!(read_request(&mut reader).expect_err("closed").is_eof());
    }

    #[test]
    fn step_walks_every_state() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.state(), State::SeekTag);
        assert!(matches!(decoder.step(b'S'), Step::Continue));
        assert!(matches!(decoder.step(b'='), Step::Continue));
        assert_eq!(decoder.state(), State::SeekValue);
        assert!(matches!(decoder.step(b'"'), Step::Continue));
        assert_eq!(
            decoder.state(),
            State::InQuotedValue {
                resume: Unquoted::SeekValue,
                escape: Unescaper::Plain
            }
        );
        assert!(matches!(decoder.step(b'%'), Step::Continue));
        assert!(matches!(decoder.step(b'"'), Step::Continue));
        assert!(matches!(
            decoder.state(),
            State::InQuotedValue {
                escape: Unescaper::Low(0),
                ..
            }
        ));
        assert!(matches!(decoder.step(b'1'), Step::Continue));
        assert!(matches!(decoder.step(b'"'), Step::Continue));
        assert_eq!(decoder.state(), State::SeekValue);
        match decoder.step(b';') {
            Step::Complete(request) => assert_eq!(request.query, vec![0x01]),
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(decoder.state(), State::Complete);
    }

    #[test]
    fn failed_decoder_stays_failed() {
        let mut decoder = Decoder::new();
        decoder.step(b'Q');
        assert!(matches!(decoder.step(b'='), Step::Failed(DecodeError::UnknownTag('Q'))));
        assert_eq!(decoder.state(), State::Failed);
        assert!(matches!(decoder.step(b';'), Step::Continue));
    }

    #[test]
    fn statement_skips_leading_whitespace() {
        let request = Request::single_shot("\n\t  select 1");
        assert_eq!(request.statement(), b"select 1");
        assert!(Request::single_shot(" \t").statement().is_empty());
    }
}

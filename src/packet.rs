//! Wire-format definitions for CoAP messages (RFC 7252 §3).
//!
//! Every datagram exchanged with the server is a [`Message`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header, token, options, payload).
//! - Serialising a request into a byte buffer no larger than
//!   [`MAX_MESSAGE_LEN`], failing with [`EncodeError::Overflow`] instead of
//!   truncating.
//! - Deserialising a raw datagram into a zero-copy [`Message`] view,
//!   returning [`DecodeError::Malformed`] for any structurally invalid input.
//!
//! No I/O happens here, only data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Each option starts with one byte holding a 4-bit *delta* (from the
//! previous option number) and a 4-bit *length*.  Nibble 13 means "one
//! extension byte follows, add 13", nibble 14 means "two extension bytes
//! follow, add 269", and nibble 15 is reserved for the payload marker.

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

use crate::token::{Token, MAX_TOKEN_LEN};

/// Protocol version carried in the top two header bits.
pub const VERSION: u8 = 1;

/// Fixed header: ver/type/TKL(1) + code(1) + message id(2).
pub const HEADER_LEN: usize = 4;

/// Largest datagram this endpoint will build or accept.
pub const MAX_MESSAGE_LEN: usize = 1280;

/// Separates options from payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// Longest single Uri-Path segment (RFC 7252 §5.10).
pub const MAX_PATH_SEGMENT_LEN: usize = 255;

/// Registered option numbers.
pub mod option {
    pub const IF_MATCH: u16 = 1;
    pub const URI_HOST: u16 = 3;
    pub const ETAG: u16 = 4;
    pub const IF_NONE_MATCH: u16 = 5;
    pub const OBSERVE: u16 = 6;
    pub const URI_PORT: u16 = 7;
    pub const LOCATION_PATH: u16 = 8;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const MAX_AGE: u16 = 14;
    pub const URI_QUERY: u16 = 15;
    pub const ACCEPT: u16 = 17;
    pub const LOCATION_QUERY: u16 = 20;
    pub const BLOCK2: u16 = 23;
    pub const BLOCK1: u16 = 27;
    pub const SIZE2: u16 = 28;
    pub const PROXY_URI: u16 = 35;
    pub const PROXY_SCHEME: u16 = 39;
    pub const SIZE1: u16 = 60;
    pub const NO_RESPONSE: u16 = 258;

    /// Odd option numbers are critical: a receiver must not ignore them.
    pub fn is_critical(number: u16) -> bool {
        number & 1 == 1
    }

    pub fn is_known(number: u16) -> bool {
        matches!(
            number,
            IF_MATCH
                | URI_HOST
                | ETAG
                | IF_NONE_MATCH
                | OBSERVE
                | URI_PORT
                | LOCATION_PATH
                | URI_PATH
                | CONTENT_FORMAT
                | MAX_AGE
                | URI_QUERY
                | ACCEPT
                | LOCATION_QUERY
                | BLOCK2
                | BLOCK1
                | SIZE2
                | PROXY_URI
                | PROXY_SCHEME
                | SIZE1
                | NO_RESPONSE
        )
    }
}

/// Registered Content-Format identifiers.
pub mod content_format {
    pub const TEXT_PLAIN: u16 = 0;
    pub const LINK_FORMAT: u16 = 40;
    pub const XML: u16 = 41;
    pub const OCTET_STREAM: u16 = 42;
    pub const EXI: u16 = 47;
    pub const JSON: u16 = 50;
    pub const CBOR: u16 = 60;
}

// ---------------------------------------------------------------------------
// Header fields
// ---------------------------------------------------------------------------

/// The 2-bit message type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

impl MessageType {
    /// Interpret the low two bits of `bits`.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Method or response code, `class.detail` packed as `ccc ddddd`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code::new(0, 0);
    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const PUT: Code = Code::new(0, 3);
    pub const DELETE: Code = Code::new(0, 4);

    pub const CREATED: Code = Code::new(2, 1);
    pub const DELETED: Code = Code::new(2, 2);
    pub const VALID: Code = Code::new(2, 3);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);

    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    pub const BAD_OPTION: Code = Code::new(4, 2);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const REQUEST_ENTITY_TOO_LARGE: Code = Code::new(4, 13);
    pub const UNSUPPORTED_CONTENT_FORMAT: Code = Code::new(4, 15);

    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);

    pub const fn new(class: u8, detail: u8) -> Self {
        Code((class << 5) | (detail & 0x1F))
    }

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    pub fn is_empty(self) -> bool {
        self == Code::EMPTY
    }

    /// Codes 0.01–0.31 are methods.
    pub fn is_request(self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    /// 2.xx codes.
    pub fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({self})")
    }
}

/// Request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn code(self) -> Code {
        match self {
            Method::Get => Code::GET,
            Method::Post => Code::POST,
            Method::Put => Code::PUT,
            Method::Delete => Code::DELETE,
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// One (number, value) option.  Decoded options borrow from the datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOption<'a> {
    pub number: u16,
    pub value: Cow<'a, [u8]>,
}

impl<'a> MessageOption<'a> {
    pub fn new(number: u16, value: &'a [u8]) -> Self {
        Self {
            number,
            value: Cow::Borrowed(value),
        }
    }

    /// An unsigned-integer option in its minimal big-endian form (0 is empty).
    pub fn uint(number: u16, value: u32) -> Self {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        Self {
            number,
            value: Cow::Owned(bytes[skip..].to_vec()),
        }
    }

    /// Read the value as an unsigned integer; `None` if wider than 4 bytes.
    pub fn as_uint(&self) -> Option<u32> {
        if self.value.len() > 4 {
            return None;
        }
        Some(self.value.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
    }

    /// Encoded size: option header, extensions and value.
    fn encoded_len(&self, delta: u16) -> usize {
        1 + extension_len(usize::from(delta)) + extension_len(self.value.len()) + self.value.len()
    }
}

fn extension_len(value: usize) -> usize {
    match value {
        0..=12 => 0,
        13..=268 => 1,
        _ => 2,
    }
}

/// Split `value` into its 4-bit nibble and extension bytes.
fn write_extended(value: usize, out: &mut Vec<u8>) -> u8 {
    match value {
        0..=12 => value as u8,
        13..=268 => {
            out.push((value - 13) as u8);
            13
        }
        _ => {
            out.extend_from_slice(&((value - 269) as u16).to_be_bytes());
            14
        }
    }
}

/// Read an extended delta/length given its nibble, advancing `cursor`.
fn read_extended(buf: &[u8], cursor: &mut usize, nibble: u8) -> Result<usize, DecodeError> {
    match nibble {
        0..=12 => Ok(usize::from(nibble)),
        13 => {
            let b = *buf
                .get(*cursor)
                .ok_or(DecodeError::Malformed("truncated option extension"))?;
            *cursor += 1;
            Ok(usize::from(b) + 13)
        }
        14 => {
            let b = buf
                .get(*cursor..*cursor + 2)
                .ok_or(DecodeError::Malformed("truncated option extension"))?;
            *cursor += 2;
            Ok(usize::from(u16::from_be_bytes([b[0], b[1]])) + 269)
        }
        _ => Err(DecodeError::Malformed("reserved option nibble")),
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A complete CoAP message.
///
/// Options need not be sorted; [`Message::encode`] orders them by number
/// (stable, so repeated options such as Uri-Path keep their order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<'a> {
    pub kind: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Token,
    pub options: Vec<MessageOption<'a>>,
    pub payload: &'a [u8],
}

impl<'a> Message<'a> {
    fn sorted_options(&self) -> Vec<&MessageOption<'a>> {
        let mut sorted: Vec<_> = self.options.iter().collect();
        sorted.sort_by_key(|o| o.number);
        sorted
    }

    /// Exact number of bytes [`Message::encode`] would produce.
    pub fn encoded_len(&self) -> usize {
        let mut len = HEADER_LEN + self.token.len();
        let mut prev = 0u16;
        for opt in self.sorted_options() {
            len += opt.encoded_len(opt.number - prev);
            prev = opt.number;
        }
        if !self.payload.is_empty() {
            len += 1 + self.payload.len();
        }
        len
    }

    /// Serialise into a newly allocated buffer of at most [`MAX_MESSAGE_LEN`].
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let len = self.encoded_len();
        if len > MAX_MESSAGE_LEN {
            return Err(EncodeError::Overflow {
                len,
                max: MAX_MESSAGE_LEN,
            });
        }

        let mut buf = Vec::with_capacity(len);
        buf.push((VERSION << 6) | ((self.kind as u8) << 4) | self.token.len() as u8);
        buf.push(self.code.0);
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(self.token.as_bytes());

        let mut prev = 0u16;
        for opt in self.sorted_options() {
            let header_pos = buf.len();
            buf.push(0); // rewritten once both nibbles are known
            let delta = write_extended(usize::from(opt.number - prev), &mut buf);
            let length = write_extended(opt.value.len(), &mut buf);
            buf[header_pos] = (delta << 4) | length;
            buf.extend_from_slice(&opt.value);
            prev = opt.number;
        }

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(self.payload);
        }

        debug_assert_eq!(buf.len(), len);
        Ok(buf)
    }

    /// Parse a datagram.  Options and payload borrow from `buf`.
    pub fn decode(buf: &'a [u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Malformed("truncated header"));
        }
        if buf[0] >> 6 != VERSION {
            return Err(DecodeError::Malformed("unsupported version"));
        }
        let kind = MessageType::from_bits(buf[0] >> 4);
        let tkl = usize::from(buf[0] & 0x0F);
        if tkl > MAX_TOKEN_LEN {
            return Err(DecodeError::Malformed("reserved token length"));
        }
        let code = Code(buf[1]);
        let message_id = u16::from_be_bytes([buf[2], buf[3]]);

        let token = buf
            .get(HEADER_LEN..HEADER_LEN + tkl)
            .and_then(Token::from_slice)
            .ok_or(DecodeError::Malformed("truncated token"))?;

        // An empty message is exactly the 4-byte header.
        if code.is_empty() && buf.len() != HEADER_LEN {
            return Err(DecodeError::Malformed("empty message with content"));
        }

        let mut cursor = HEADER_LEN + tkl;
        let mut number = 0usize;
        let mut options = Vec::new();
        let mut payload: &'a [u8] = &[];

        while cursor < buf.len() {
            let byte = buf[cursor];
            cursor += 1;

            if byte == PAYLOAD_MARKER {
                if cursor == buf.len() {
                    return Err(DecodeError::Malformed("payload marker without payload"));
                }
                payload = &buf[cursor..];
                break;
            }

            let delta = read_extended(buf, &mut cursor, byte >> 4)?;
            let length = read_extended(buf, &mut cursor, byte & 0x0F)?;

            number += delta;
            if number > usize::from(u16::MAX) {
                return Err(DecodeError::Malformed("option number overflow"));
            }
            let value = buf
                .get(cursor..cursor + length)
                .ok_or(DecodeError::Malformed("truncated option value"))?;
            cursor += length;

            options.push(MessageOption {
                number: number as u16,
                value: Cow::Borrowed(value),
            });
        }

        Ok(Message {
            kind,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }

    /// First option with `number`.
    pub fn option(&self, number: u16) -> Option<&MessageOption<'a>> {
        self.options.iter().find(|o| o.number == number)
    }

    pub fn content_format(&self) -> Option<u16> {
        self.option(option::CONTENT_FORMAT)
            .and_then(MessageOption::as_uint)
            .and_then(|v| u16::try_from(v).ok())
    }

    /// Uri-Path segments joined with `/`.
    pub fn uri_path(&self) -> String {
        self.options
            .iter()
            .filter(|o| o.number == option::URI_PATH)
            .map(|o| String::from_utf8_lossy(&o.value).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

// ---------------------------------------------------------------------------
// Requests and replies
// ---------------------------------------------------------------------------

/// What the exchange engine asks the codec to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub method: Method,
    /// Slash-delimited resource path, e.g. `api/v1/dev/telemetry`.
    pub path: &'a str,
    /// Body bytes; `None` or empty means no payload.
    pub payload: Option<&'a [u8]>,
    /// Content-Format announced when a payload is present.
    pub content_format: u16,
}

impl<'a> Request<'a> {
    /// A POST of a JSON body.
    pub fn post_json(path: &'a str, payload: &'a [u8]) -> Self {
        Self {
            method: Method::Post,
            path,
            payload: Some(payload),
            content_format: content_format::JSON,
        }
    }
}

/// Split `path` into Uri-Path segments; a single leading `/` is allowed.
pub fn path_segments(path: &str) -> Result<Vec<&str>, EncodeError> {
    let invalid = |reason| EncodeError::InvalidPath {
        path: path.to_string(),
        reason,
    };
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return Err(invalid("path is empty"));
    }
    trimmed
        .split('/')
        .map(|segment| match segment {
            "" => Err(invalid("empty path segment")),
            "." | ".." => Err(invalid("dot segments are not allowed")),
            s if s.len() > MAX_PATH_SEGMENT_LEN => Err(invalid("path segment too long")),
            s => Ok(s),
        })
        .collect()
}

/// Build a non-confirmable request carrying `token` and `message_id`.
pub fn encode_request(
    request: &Request<'_>,
    token: Token,
    message_id: u16,
) -> Result<Vec<u8>, EncodeError> {
    let mut options: Vec<MessageOption<'_>> = path_segments(request.path)?
        .into_iter()
        .map(|s| MessageOption::new(option::URI_PATH, s.as_bytes()))
        .collect();

    let payload = request.payload.unwrap_or_default();
    if !payload.is_empty() {
        options.push(MessageOption::uint(
            option::CONTENT_FORMAT,
            u32::from(request.content_format),
        ));
    }

    Message {
        kind: MessageType::NonConfirmable,
        code: request.method.code(),
        message_id,
        token,
        options,
        payload,
    }
    .encode()
}

/// Parse a reply datagram, failing closed on anything this client cannot
/// interpret: structural errors, request codes, unrecognised critical options.
pub fn decode_response(buf: &[u8]) -> Result<Message<'_>, DecodeError> {
    let message = Message::decode(buf)?;
    if message.code.is_request() {
        return Err(DecodeError::Malformed("request code in reply"));
    }
    if message
        .options
        .iter()
        .any(|o| option::is_critical(o.number) && !option::is_known(o.number))
    {
        return Err(DecodeError::Malformed("unrecognised critical option"));
    }
    Ok(message)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Local construction failures; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("encoded message is {len} bytes, exceeding the {max} byte limit")]
    Overflow { len: usize, max: usize },
    #[error("invalid resource path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

/// Any structurally invalid datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

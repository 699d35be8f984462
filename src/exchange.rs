//! Request-and-wait exchange engine.
//!
//! An [`ExchangeEngine`] drives exactly one exchange at a time through the
//! following states:
//!
//! ```text
//!  Idle ──begin──▶ TokenIssued ──send──▶ Sent ──▶ AwaitingReply
//!   ▲                  │                              │
//!   │        encode/send error              one receive attempt
//!   │                  ▼                              ▼
//!   └──── token cleared ◀── Failed | TimedOut | Completed
//! ```
//!
//! - Encode or send failures go straight to `Failed`; nothing is received.
//! - Exactly one receive is attempted.  A reply that fails to decode or
//!   carries a foreign token ends the exchange as `Failed`; the engine never
//!   waits for a second datagram.
//! - Every terminal state clears the expected token and returns to `Idle`.
//!
//! The engine owns its transport, correlator and receive buffer, so
//! independent engines never share state.

use std::fmt;

use thiserror::Error;

use crate::packet::{
    decode_response, encode_request, Code, DecodeError, EncodeError, MessageType, Request,
    MAX_MESSAGE_LEN,
};
use crate::socket::{Received, Transport, TransportError};
use crate::token::{Correlator, Outstanding, Token};

// ---------------------------------------------------------------------------
// States and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeState {
    #[default]
    Idle,
    TokenIssued,
    Sent,
    AwaitingReply,
    Completed,
    TimedOut,
    Failed,
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A reply that decoded cleanly and matched the outstanding token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Token,
    pub content_format: Option<u16>,
    /// Possibly empty.
    pub payload: Vec<u8>,
}

/// Why an exchange ended in `Failed`.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("could not encode request: {0}")]
    Encode(#[from] EncodeError),
    #[error("could not decode reply: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("reply token {received} does not match expected {expected}")]
    TokenMismatch { expected: Token, received: Token },
    #[error("another exchange is still outstanding")]
    Busy,
    /// Raised by the reporter before any exchange starts; the engine itself
    /// never produces it.
    #[error("could not serialise payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<Outstanding> for ExchangeError {
    fn from(_: Outstanding) -> Self {
        ExchangeError::Busy
    }
}

/// The single result of one exchange.
#[derive(Debug)]
pub enum ExchangeOutcome {
    /// A correlated reply arrived.
    Completed(Reply),
    /// A zero-length datagram arrived; there is nothing to correlate.
    EmptyDatagram,
    /// No datagram arrived before the deadline.
    TimedOut,
    Failed(ExchangeError),
}

impl ExchangeOutcome {
    /// Terminal state this outcome corresponds to.
    pub fn state(&self) -> ExchangeState {
        match self {
            ExchangeOutcome::Completed(_) | ExchangeOutcome::EmptyDatagram => {
                ExchangeState::Completed
            }
            ExchangeOutcome::TimedOut => ExchangeState::TimedOut,
            ExchangeOutcome::Failed(_) => ExchangeState::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ExchangeOutcome::Completed(_) | ExchangeOutcome::EmptyDatagram
        )
    }

    pub fn reply(&self) -> Option<&Reply> {
        match self {
            ExchangeOutcome::Completed(reply) => Some(reply),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ExchangeError> {
        match self {
            ExchangeOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ExchangeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeOutcome::Completed(reply) => write!(
                f,
                "completed {} ({} byte payload)",
                reply.code,
                reply.payload.len()
            ),
            ExchangeOutcome::EmptyDatagram => write!(f, "completed with empty datagram"),
            ExchangeOutcome::TimedOut => write!(f, "timed out"),
            ExchangeOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ExchangeEngine
// ---------------------------------------------------------------------------

/// One-shot, non-reentrant request/reply state machine over a [`Transport`].
#[derive(Debug)]
pub struct ExchangeEngine<T> {
    transport: T,
    correlator: Correlator,
    /// One byte larger than the limit so oversized datagrams are detectable.
    buf: Vec<u8>,
    state: ExchangeState,
}

impl<T: Transport> ExchangeEngine<T> {
    pub fn new(transport: T) -> Self {
        Self::with_correlator(transport, Correlator::new())
    }

    pub fn with_correlator(transport: T, correlator: Correlator) -> Self {
        Self {
            transport,
            correlator,
            buf: vec![0u8; MAX_MESSAGE_LEN + 1],
            state: ExchangeState::Idle,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Token of the exchange in progress, if any.
    pub fn outstanding(&self) -> Option<Token> {
        self.correlator.expected()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drop any correlation state left behind by an interrupted exchange.
    pub fn reset(&mut self) {
        if let Some(token) = self.correlator.finish() {
            log::warn!("[exchange] abandoning exchange token={token}");
        }
        self.state = ExchangeState::Idle;
    }

    fn transition(&mut self, next: ExchangeState) {
        log::trace!("[exchange] {} -> {}", self.state, next);
        self.state = next;
    }

    /// Run one full send → wait → correlate → decode cycle.
    ///
    /// Rejected with `Failed(Busy)` if a token is still outstanding; the
    /// outstanding exchange's correlation state is left untouched.
    pub fn exchange(&mut self, request: &Request<'_>) -> ExchangeOutcome {
        let token = match self.correlator.begin() {
            Ok(token) => token,
            Err(e) => {
                log::warn!("[exchange] rejected: {e}");
                return ExchangeOutcome::Failed(e.into());
            }
        };
        self.transition(ExchangeState::TokenIssued);

        let outcome = self.run(request, token);

        self.transition(outcome.state());
        self.correlator.finish();
        self.transition(ExchangeState::Idle);
        outcome
    }

    fn run(&mut self, request: &Request<'_>, token: Token) -> ExchangeOutcome {
        let message_id = self.correlator.next_message_id();
        let datagram = match encode_request(request, token, message_id) {
            Ok(d) => d,
            Err(e) => {
                log::error!("[exchange] failed to build request: {e}");
                return ExchangeOutcome::Failed(e.into());
            }
        };

        if let Err(e) = self.transport.send(&datagram) {
            log::error!("[exchange] failed to send request: {e}");
            return ExchangeOutcome::Failed(e.into());
        }
        self.transition(ExchangeState::Sent);
        log::info!(
            "[exchange] → {} /{} token={} mid={:#06x} len={}",
            request.method.code(),
            request.path.trim_start_matches('/'),
            token,
            message_id,
            datagram.len()
        );

        self.transition(ExchangeState::AwaitingReply);
        let len = match self.transport.receive(&mut self.buf) {
            Ok(Received::Datagram(0)) => {
                log::info!("[exchange] ← empty datagram");
                return ExchangeOutcome::EmptyDatagram;
            }
            Ok(Received::Datagram(n)) => n,
            Ok(Received::TimedOut) => {
                log::info!("[exchange] no reply within deadline (token={token})");
                return ExchangeOutcome::TimedOut;
            }
            Err(e) => {
                log::error!("[exchange] failed to receive reply: {e}");
                return ExchangeOutcome::Failed(e.into());
            }
        };

        self.handle_reply(len, token)
    }

    fn handle_reply(&self, len: usize, token: Token) -> ExchangeOutcome {
        if len > MAX_MESSAGE_LEN {
            log::error!("[exchange] ← oversized datagram ({len}+ bytes)");
            return ExchangeOutcome::Failed(
                DecodeError::Malformed("datagram exceeds maximum message size").into(),
            );
        }

        let message = match decode_response(&self.buf[..len]) {
            Ok(m) => m,
            Err(e) => {
                log::error!("[exchange] malformed reply received: {e}");
                return ExchangeOutcome::Failed(e.into());
            }
        };

        if !self.correlator.accepts(&message.token) {
            log::error!(
                "[exchange] invalid token received: {} (expected {token})",
                message.token
            );
            return ExchangeOutcome::Failed(ExchangeError::TokenMismatch {
                expected: token,
                received: message.token,
            });
        }

        if message.payload.is_empty() {
            log::info!("[exchange] ← {} payload: EMPTY", message.code);
        } else {
            log::info!(
                "[exchange] ← {} payload: {}",
                message.code,
                String::from_utf8_lossy(message.payload)
            );
        }

        ExchangeOutcome::Completed(Reply {
            kind: message.kind,
            code: message.code,
            message_id: message.message_id,
            token: message.token,
            content_format: message.content_format(),
            payload: message.payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Message, MessageOption, Method, PAYLOAD_MARKER};
    use std::collections::VecDeque;
    use std::io;

    /// What the scripted peer does with the next request.
    enum Step {
        /// Reply with the request's own token.
        Echo(Code, &'static [u8]),
        /// Reply with a token the client never issued.
        Foreign,
        Raw(Vec<u8>),
        Silence,
        RecvError(io::ErrorKind),
        SendError(io::ErrorKind),
    }

    #[derive(Default)]
    struct ScriptedTransport {
        steps: VecDeque<Step>,
        sent: Vec<Vec<u8>>,
        receives: usize,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                ..Default::default()
            }
        }

        fn reply_to(request: &[u8], token: Token, code: Code, payload: &[u8]) -> Vec<u8> {
            let req = Message::decode(request).unwrap();
            Message {
                kind: MessageType::NonConfirmable,
                code,
                message_id: req.message_id,
                token,
                options: vec![],
                payload,
            }
            .encode()
            .unwrap()
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError> {
            if let Some(Step::SendError(kind)) = self.steps.front() {
                let kind = *kind;
                self.steps.pop_front();
                return Err(io::Error::from(kind).into());
            }
            self.sent.push(datagram.to_vec());
            Ok(())
        }

        fn receive(&mut self, buf: &mut [u8]) -> Result<Received, TransportError> {
            self.receives += 1;
            let request = self.sent.last().expect("receive before send");
            let token = Message::decode(request).unwrap().token;
            let bytes = match self.steps.pop_front().expect("script exhausted") {
                Step::Echo(code, payload) => Self::reply_to(request, token, code, payload),
                Step::Foreign => {
                    let foreign = Token::from(u16::from_be_bytes([
                        token.as_bytes()[0] ^ 0xFF,
                        token.as_bytes()[1],
                    ]));
                    Self::reply_to(request, foreign, Code::CHANGED, b"")
                }
                Step::Raw(bytes) => bytes,
                Step::Silence => return Ok(Received::TimedOut),
                Step::RecvError(kind) => return Err(io::Error::from(kind).into()),
                Step::SendError(_) => unreachable!("send errors are consumed by send"),
            };
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            Ok(Received::Datagram(n))
        }
    }

    fn engine(steps: Vec<Step>) -> ExchangeEngine<ScriptedTransport> {
        ExchangeEngine::with_correlator(ScriptedTransport::new(steps), Correlator::seeded(11))
    }

    fn telemetry() -> Request<'static> {
        Request::post_json(
            "api/v1/dev/telemetry",
            br#"{"temperature":21,"humidity":45}"#,
        )
    }

    fn assert_idle(e: &ExchangeEngine<ScriptedTransport>) {
        assert_eq!(e.state(), ExchangeState::Idle);
        assert_eq!(e.outstanding(), None);
    }

    #[test]
    fn matching_reply_completes() {
        let mut e = engine(vec![Step::Echo(Code::CHANGED, b"")]);
        let outcome = e.exchange(&telemetry());
        let reply = outcome.reply().expect("completed");
        assert_eq!(reply.code, Code::CHANGED);
        assert!(reply.payload.is_empty());
        assert_eq!(outcome.state(), ExchangeState::Completed);
        assert_idle(&e);
    }

    #[test]
    fn reply_payload_is_returned() {
        let mut e = engine(vec![Step::Echo(Code::CONTENT, b"accepted")]);
        let outcome = e.exchange(&telemetry());
        assert_eq!(outcome.reply().unwrap().payload, b"accepted");
    }

    #[test]
    fn request_is_non_confirmable_post_with_json() {
        let mut e = engine(vec![Step::Echo(Code::CHANGED, b"")]);
        e.exchange(&telemetry());
        let sent = &e.transport().sent[0];
        let msg = Message::decode(sent).unwrap();
        assert_eq!(msg.kind, MessageType::NonConfirmable);
        assert_eq!(msg.code, Method::Post.code());
        assert_eq!(msg.uri_path(), "api/v1/dev/telemetry");
        assert_eq!(msg.payload, br#"{"temperature":21,"humidity":45}"#);
    }

    #[test]
    fn foreign_token_fails_without_second_receive() {
        let mut e = engine(vec![Step::Foreign, Step::Echo(Code::CHANGED, b"")]);
        let outcome = e.exchange(&telemetry());
        assert!(matches!(
            outcome,
            ExchangeOutcome::Failed(ExchangeError::TokenMismatch { .. })
        ));
        assert_eq!(e.transport().receives, 1);
        assert_idle(&e);
    }

    #[test]
    fn timeout_is_its_own_outcome() {
        let mut e = engine(vec![Step::Silence]);
        let outcome = e.exchange(&telemetry());
        assert!(matches!(outcome, ExchangeOutcome::TimedOut));
        assert!(!outcome.is_success());
        assert_eq!(outcome.state(), ExchangeState::TimedOut);
        assert_idle(&e);
    }

    #[test]
    fn empty_datagram_is_distinct() {
        let mut e = engine(vec![Step::Raw(vec![])]);
        let outcome = e.exchange(&telemetry());
        assert!(matches!(outcome, ExchangeOutcome::EmptyDatagram));
        assert!(outcome.is_success());
        assert_idle(&e);
    }

    #[test]
    fn malformed_reply_fails() {
        let mut e = engine(vec![Step::Raw(vec![0x50])]);
        let outcome = e.exchange(&telemetry());
        assert!(matches!(
            outcome,
            ExchangeOutcome::Failed(ExchangeError::Decode(DecodeError::Malformed(_)))
        ));
        assert_eq!(e.transport().receives, 1);
        assert_idle(&e);
    }

    #[test]
    fn token_matched_but_malformed_reply_fails_closed() {
        // Same seed as `engine`, so this is the token the engine will issue.
        let expected = Correlator::seeded(11).new_token();
        // Correct header and token, then a marker with nothing after it.
        let mut raw = vec![0x52, 0x44, 0x00, 0x01];
        raw.extend_from_slice(expected.as_bytes());
        raw.push(PAYLOAD_MARKER);
        let mut e = engine(vec![Step::Raw(raw)]);
        assert!(matches!(
            e.exchange(&telemetry()),
            ExchangeOutcome::Failed(ExchangeError::Decode(_))
        ));
    }

    #[test]
    fn oversized_datagram_is_rejected() {
        let mut e = engine(vec![Step::Raw(vec![0x50; MAX_MESSAGE_LEN + 100])]);
        assert!(matches!(
            e.exchange(&telemetry()),
            ExchangeOutcome::Failed(ExchangeError::Decode(_))
        ));
    }

    #[test]
    fn encode_failure_skips_send_and_receive() {
        let mut e = engine(vec![]);
        let request = Request::post_json("a//b", b"{}");
        let outcome = e.exchange(&request);
        assert!(matches!(
            outcome,
            ExchangeOutcome::Failed(ExchangeError::Encode(EncodeError::InvalidPath { .. }))
        ));
        assert!(e.transport().sent.is_empty());
        assert_eq!(e.transport().receives, 0);
        assert_idle(&e);
    }

    #[test]
    fn oversized_payload_fails_with_overflow() {
        let mut e = engine(vec![]);
        let payload = vec![b'x'; MAX_MESSAGE_LEN];
        let outcome = e.exchange(&Request::post_json("t", &payload));
        assert!(matches!(
            outcome,
            ExchangeOutcome::Failed(ExchangeError::Encode(EncodeError::Overflow { .. }))
        ));
        assert!(e.transport().sent.is_empty());
    }

    #[test]
    fn send_failure_skips_receive() {
        let mut e = engine(vec![Step::SendError(io::ErrorKind::NetworkUnreachable)]);
        let outcome = e.exchange(&telemetry());
        assert!(matches!(
            outcome,
            ExchangeOutcome::Failed(ExchangeError::Transport(TransportError::Io(_)))
        ));
        assert_eq!(e.transport().receives, 0);
        assert_idle(&e);
    }

    #[test]
    fn receive_error_is_a_transport_failure() {
        let mut e = engine(vec![Step::RecvError(io::ErrorKind::ConnectionRefused)]);
        let outcome = e.exchange(&telemetry());
        assert!(matches!(
            outcome,
            ExchangeOutcome::Failed(ExchangeError::Transport(_))
        ));
        assert_idle(&e);
    }

    #[test]
    fn outstanding_exchange_blocks_a_new_one() {
        let mut e = engine(vec![]);
        let held = e.correlator.begin().unwrap();

        let outcome = e.exchange(&telemetry());
        assert!(matches!(outcome, ExchangeOutcome::Failed(ExchangeError::Busy)));
        assert_eq!(e.outstanding(), Some(held), "first exchange's token must survive");
        assert!(e.transport().sent.is_empty());

        e.reset();
        assert_idle(&e);
    }

    #[test]
    fn each_exchange_uses_fresh_token_and_message_id() {
        let mut e = engine(vec![
            Step::Echo(Code::CHANGED, b""),
            Step::Echo(Code::CHANGED, b""),
        ]);
        e.exchange(&telemetry());
        e.exchange(&telemetry());
        let a = Message::decode(&e.transport().sent[0]).unwrap();
        let b = Message::decode(&e.transport().sent[1]).unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(b.message_id, a.message_id.wrapping_add(1));
    }

    #[test]
    fn stale_token_from_previous_exchange_is_rejected() {
        let mut e = engine(vec![Step::Echo(Code::CHANGED, b"")]);
        e.exchange(&telemetry());
        let stale = Message::decode(&e.transport().sent[0]).unwrap().token;

        let late = Message {
            kind: MessageType::NonConfirmable,
            code: Code::CHANGED,
            message_id: 1,
            token: stale,
            options: vec![MessageOption::uint(crate::packet::option::CONTENT_FORMAT, 0)],
            payload: b"late",
        }
        .encode()
        .unwrap();
        e.transport_mut().steps.push_back(Step::Raw(late));
        assert!(matches!(
            e.exchange(&telemetry()),
            ExchangeOutcome::Failed(ExchangeError::TokenMismatch { .. })
        ));
    }
}

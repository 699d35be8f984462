//! Exchange tokens and reply correlation.
//!
//! A [`Token`] is the opaque value that binds a reply to the request that
//! caused it.  The [`Correlator`] owns the single "expected token" slot of an
//! exchange engine:
//! - [`Correlator::begin`] issues a fresh token and records it as expected,
//!   refusing to do so while another exchange is still outstanding.
//! - [`Correlator::accepts`] checks an inbound token against the slot.
//! - [`Correlator::finish`] clears the slot on every terminal outcome.
//!
//! Tokens are drawn from a userspace RNG and are not secret.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

/// Largest token length the wire format can carry (TKL 0–8).
pub const MAX_TOKEN_LEN: usize = 8;

/// Length of the tokens this crate generates (a 16-bit token).
pub const TOKEN_LEN: usize = 2;

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// A request/reply correlation token of 0–8 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token {
    bytes: [u8; MAX_TOKEN_LEN],
    len: u8,
}

impl Token {
    /// The zero-length token.
    pub const EMPTY: Token = Token {
        bytes: [0; MAX_TOKEN_LEN],
        len: 0,
    };

    /// Copy a token out of `bytes`; `None` if longer than [`MAX_TOKEN_LEN`].
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_TOKEN_LEN {
            return None;
        }
        let mut token = Token::EMPTY;
        token.bytes[..bytes.len()].copy_from_slice(bytes);
        token.len = bytes.len() as u8;
        Some(token)
    }

    /// Draw a [`TOKEN_LEN`]-byte token from `rng`.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let mut token = Token::EMPTY;
        rng.fill(&mut token.bytes[..TOKEN_LEN]);
        token.len = TOKEN_LEN as u8;
        token
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl From<u16> for Token {
    fn from(value: u16) -> Self {
        let mut token = Token::EMPTY;
        token.bytes[..2].copy_from_slice(&value.to_be_bytes());
        token.len = 2;
        token
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "<empty>");
        }
        write!(f, "0x")?;
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({self})")
    }
}

/// Exact comparison over the full token length.
///
/// A length mismatch is a non-match, never an error.
pub fn matches(expected: &Token, received: &[u8]) -> bool {
    expected.as_bytes() == received
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

/// Returned by [`Correlator::begin`] while a token is still expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exchange with token {0} is still outstanding")]
pub struct Outstanding(pub Token);

/// Single-slot correlation state for one exchange engine.
#[derive(Debug)]
pub struct Correlator {
    rng: StdRng,
    /// Token of the outstanding exchange, `None` when idle.
    expected: Option<Token>,
    /// Most recently issued token; the next one must differ from it.
    last_issued: Option<Token>,
    next_message_id: u16,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Correlator seeded from OS entropy.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Deterministic correlator, for reproducible tests.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(mut rng: StdRng) -> Self {
        // Message IDs start at a random point.
        let next_message_id = rng.random();
        Self {
            rng,
            expected: None,
            last_issued: None,
            next_message_id,
        }
    }

    /// Generate a fresh token without touching the expected slot.
    ///
    /// Two consecutive calls never return the same token.
    pub fn new_token(&mut self) -> Token {
        loop {
            let token = Token::random(&mut self.rng);
            if self.last_issued != Some(token) {
                self.last_issued = Some(token);
                return token;
            }
        }
    }

    /// Issue a token for a new exchange and record it as expected.
    ///
    /// Fails, leaving the slot untouched, if an exchange is outstanding.
    pub fn begin(&mut self) -> Result<Token, Outstanding> {
        if let Some(token) = self.expected {
            return Err(Outstanding(token));
        }
        let token = self.new_token();
        self.expected = Some(token);
        Ok(token)
    }

    /// Token of the outstanding exchange, if any.
    pub fn expected(&self) -> Option<Token> {
        self.expected
    }

    /// Whether `received` correlates with the outstanding exchange.
    pub fn accepts(&self, received: &Token) -> bool {
        self.expected
            .is_some_and(|expected| matches(&expected, received.as_bytes()))
    }

    /// Clear the expected slot, returning the token it held.
    pub fn finish(&mut self) -> Option<Token> {
        self.expected.take()
    }

    /// Next message identifier (wraps at `u16::MAX`).
    pub fn next_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = id.wrapping_add(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_have_fixed_width() {
        let mut c = Correlator::seeded(7);
        for _ in 0..100 {
            assert_eq!(c.new_token().len(), TOKEN_LEN);
        }
    }

    #[test]
    fn consecutive_tokens_always_differ() {
        let mut c = Correlator::seeded(1);
        let mut prev = c.new_token();
        for _ in 0..50_000 {
            let next = c.new_token();
            assert_ne!(prev, next);
            prev = next;
        }
    }

    #[test]
    fn seeded_correlators_are_reproducible() {
        let mut a = Correlator::seeded(42);
        let mut b = Correlator::seeded(42);
        assert_eq!(a.next_message_id(), b.next_message_id());
        assert_eq!(a.new_token(), b.new_token());
    }

    #[test]
    fn matches_requires_exact_bytes() {
        let t = Token::from(0xbeef);
        assert!(matches(&t, &[0xbe, 0xef]));
        assert!(!matches(&t, &[0xbe, 0xee]));
    }

    #[test]
    fn length_mismatch_is_not_a_match() {
        let t = Token::from(0xbeef);
        assert!(!matches(&t, &[0xbe]));
        assert!(!matches(&t, &[0xbe, 0xef, 0x00]));
        assert!(!matches(&t, &[]));
    }

    #[test]
    fn from_slice_rejects_oversized_tokens() {
        assert!(Token::from_slice(&[0u8; MAX_TOKEN_LEN]).is_some());
        assert!(Token::from_slice(&[0u8; MAX_TOKEN_LEN + 1]).is_none());
        assert!(Token::from_slice(&[]).unwrap().is_empty());
    }

    #[test]
    fn begin_records_expected_token() {
        let mut c = Correlator::seeded(3);
        let t = c.begin().unwrap();
        assert_eq!(c.expected(), Some(t));
        assert!(c.accepts(&t));
        assert!(!c.accepts(&Token::EMPTY));
    }

    #[test]
    fn second_begin_is_rejected_and_keeps_slot() {
        let mut c = Correlator::seeded(3);
        let first = c.begin().unwrap();
        assert_eq!(c.begin(), Err(Outstanding(first)));
        assert_eq!(c.expected(), Some(first));
    }

    #[test]
    fn finish_clears_slot() {
        let mut c = Correlator::seeded(3);
        let t = c.begin().unwrap();
        assert_eq!(c.finish(), Some(t));
        assert_eq!(c.expected(), None);
        assert!(!c.accepts(&t), "stale token must not match after finish");
        assert!(c.begin().is_ok());
    }

    #[test]
    fn message_ids_increment_and_wrap() {
        let mut c = Correlator::seeded(9);
        c.next_message_id = u16::MAX;
        assert_eq!(c.next_message_id(), u16::MAX);
        assert_eq!(c.next_message_id(), 0);
        assert_eq!(c.next_message_id(), 1);
    }

    #[test]
    fn token_display_is_hex() {
        assert_eq!(Token::from(0x0a0b).to_string(), "0x0a0b");
        assert_eq!(Token::EMPTY.to_string(), "<empty>");
    }
}
